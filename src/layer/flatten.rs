use crate::{
  tensor::Tensor,
  layer::{ Layer, named },
  error::Result,
};


/// Marks the transition from image or sequence rows to plain features.
/// Batches are already two-dimensional, so values pass through unchanged.

#[derive(Debug, Clone)]
pub struct Flatten {
  name: String,
}

impl Flatten {
  pub fn new() -> Self {
    Self { name: "flatten".to_string() }
  }

  pub fn from_parts(name: &str) -> Self {
    Self { name: name.to_string() }
  }
}

impl Default for Flatten {
  fn default() -> Self {
    Self::new()
  }
}

impl Layer for Flatten {
  named!("flatten");

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    Ok(x.clone())
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    Ok(grad.clone())
  }
}
