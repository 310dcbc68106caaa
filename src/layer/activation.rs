use serde::{Serialize, Deserialize};

use crate::{
  tensor::Tensor,
  variable::{ UnaryOp, Sigmoid, Tanh, ReLU, Softplus, GELU },
  layer::{ Layer, not_run },
  error::{ Error, Result },
};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
  Sigmoid,
  Tanh,
  ReLU,
  Softplus,
  GELU,
}

impl ActivationKind {
  pub const ALL: [Self; 5] = [Self::Sigmoid, Self::Tanh, Self::ReLU, Self::Softplus, Self::GELU];

  pub fn class(self) -> &'static str {
    match self {
      Self::Sigmoid => "sigmoid",
      Self::Tanh => "tanh",
      Self::ReLU => "relu",
      Self::Softplus => "softplus",
      Self::GELU => "gelu",
    }
  }

  pub fn from_class(class: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|kind| kind.class() == class )
  }

  fn op(self) -> &'static dyn UnaryOp {
    match self {
      Self::Sigmoid => &Sigmoid,
      Self::Tanh => &Tanh,
      Self::ReLU => &ReLU,
      Self::Softplus => &Softplus,
      Self::GELU => &GELU,
    }
  }
}


/// Elementwise nonlinearity.
///
/// The input and output of the last forward pass are cached,
/// since derivatives are evaluated at those values.

#[derive(Debug, Clone)]
pub struct Activation {
  name: String,
  kind: ActivationKind,
  cache: Option<(Tensor, Tensor)>,
}

impl Activation {
  pub fn new(kind: ActivationKind) -> Self {
    Self { name: kind.class().to_string(), kind, cache: None }
  }

  pub fn sigmoid() -> Self {
    Self::new(ActivationKind::Sigmoid)
  }

  pub fn tanh() -> Self {
    Self::new(ActivationKind::Tanh)
  }

  pub fn relu() -> Self {
    Self::new(ActivationKind::ReLU)
  }

  pub fn softplus() -> Self {
    Self::new(ActivationKind::Softplus)
  }

  pub fn gelu() -> Self {
    Self::new(ActivationKind::GELU)
  }

  pub fn kind(&self) -> ActivationKind {
    self.kind
  }
}

impl Layer for Activation {
  fn class(&self) -> &'static str {
    self.kind.class()
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn rename(&mut self, name: &str) {
    self.name = name.to_string();
  }

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    let output = self.kind.op().run(x);
    self.cache = Some((x.clone(), output.clone()));
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    let (input, output) = self.cache.as_ref().ok_or_else(|| not_run(self.kind.class()) )?;
    if grad.dims() != input.dims() {
      return Err(Error::shape(self.kind.class(), grad.dims(), input.dims()))
    }
    Ok(self.kind.op().derive(input, output, grad))
  }
}
