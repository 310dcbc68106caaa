use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Serialize, Deserialize};

use crate::{
  internal::*,
  tensor::Tensor,
  variable::{ Graph, Variable },
  error::{ Error, Result },
};

mod activation;
mod attention;
mod conv;
mod dense;
mod dropout;
mod embedding;
mod flatten;
mod linear;
mod norm;
mod pool;
mod recurrent;

pub use activation::{ Activation, ActivationKind };
pub use attention::{ Attention, SelfAttention };
pub use conv::{ Conv2D, ConvTranspose2D, ConvTranspose1D };
pub use dense::Dense;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use flatten::Flatten;
pub use linear::Linear;
pub use norm::{ LayerNorm, RMSNorm, ReZero };
pub use pool::MaxPool;
pub use recurrent::{ Rnn, Lstm };


/// Free-form numeric layer arguments, as persisted in model files.

pub type Args = BTreeMap<String, f32>;


/// Named trainable tensor, owned by its layer.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
  pub name: String,
  pub value: Tensor,
  pub grad: Tensor,
}

impl Param {
  pub fn new(name: &str, value: Tensor) -> Self {
    let grad = Tensor::zeros(value.rows(), value.cols());
    Self { name: name.to_string(), value, grad }
  }

  pub fn dims(&self) -> Dims {
    self.value.dims()
  }

  pub fn zero_grad(&mut self) {
    self.grad.refill(0.0);
  }
}


/// Snapshot of a layer's parameter gradients, keyed by parameter name.
///
/// Frozen and parameterless layers report an empty context.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
  grads: Vec<(String, Tensor)>,
}

impl Context {
  pub fn new(grads: Vec<(String, Tensor)>) -> Self {
    Self { grads }
  }

  pub fn len(&self) -> usize {
    self.grads.len()
  }

  pub fn is_empty(&self) -> bool {
    self.grads.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&Tensor> {
    self.grads.iter().find(|(n, _)| n == name ).map(|(_, grad)| grad )
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
    self.grads.iter().map(|(name, grad)| (name.as_str(), grad) )
  }

  /// Add `weight` times another snapshot of the same layer into this one.

  pub(crate) fn accumulate(&mut self, other: &Context, weight: f64) {
    if self.grads.is_empty() {
      self.grads = other.grads.iter().map(|(name, grad)| (name.clone(), grad * weight) ).collect();
      return
    }
    for ((_, acc), (_, grad)) in self.grads.iter_mut().zip(&other.grads) {
      acc.add_assign(&(grad * weight));
    }
  }
}


/// Building block of a [Network](crate::Network).
///
/// Layers own their parameters. A forward pass caches whatever the
/// matching backward pass needs, so every `backward` has to follow
/// the `forward` it belongs to before the next `forward` runs.

pub trait Layer: Debug + Send + Sync + LayerClone {
  /// Registry tag this layer gets persisted under.

  fn class(&self) -> &'static str;

  fn name(&self) -> &str;
  fn rename(&mut self, name: &str);

  fn forward(&mut self, x: &Tensor, training: bool) -> Result<Tensor>;

  /// Add parameter gradients into [Param::grad] and return
  /// the gradient with respect to the last forward input.

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor>;

  fn params(&self) -> Vec<&Param> {
    Vec::new()
  }

  fn params_mut(&mut self) -> Vec<&mut Param> {
    Vec::new()
  }

  fn args(&self) -> Args {
    Args::new()
  }

  fn freeze(&mut self) {}
  fn unfreeze(&mut self) {}

  fn is_frozen(&self) -> bool {
    false
  }

  /// Reinitialize all parameters, discarding trained values.

  fn reset(&mut self) {}

  fn context(&self) -> Context {
    if self.is_frozen() { return Context::default() }
    Context::new(self.params().into_iter().map(|p| (p.name.clone(), p.grad.clone()) ).collect())
  }

  fn zero_grad(&mut self) {
    for param in self.params_mut() {
      param.zero_grad();
    }
  }

  fn param_count(&self) -> usize {
    self.params().iter().map(|p| p.value.size() ).sum()
  }

  fn print(&self) -> String {
    let frozen = if self.is_frozen() { " [frozen]" } else { "" };
    format!("{} ({}): {} params{frozen}", self.name(), self.class(), self.param_count())
  }
}


pub trait LayerClone {
  fn clone_box(&self) -> Box<dyn Layer>;
}

impl<T: 'static + Layer + Clone> LayerClone for T {
  fn clone_box(&self) -> Box<dyn Layer> {
    Box::new(self.clone())
  }
}

impl Clone for Box<dyn Layer> {
  fn clone(&self) -> Self {
    self.clone_box()
  }
}


macro_rules! named {
  ($class:literal) => {
    fn class(&self) -> &'static str {
      $class
    }

    fn name(&self) -> &str {
      &self.name
    }

    fn rename(&mut self, name: &str) {
      self.name = name.to_string();
    }
  };
}

macro_rules! parameterized {
  () => {
    fn params(&self) -> Vec<&Param> {
      self.params.iter().collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
      self.params.iter_mut().collect()
    }

    fn freeze(&mut self) {
      self.frozen = true;
    }

    fn unfreeze(&mut self) {
      self.frozen = false;
    }

    fn is_frozen(&self) -> bool {
      self.frozen
    }
  };
}

pub(crate) use named;
pub(crate) use parameterized;


/// Graph recorded by a layer's forward pass, kept for replaying backward.

#[derive(Debug, Clone)]
pub(crate) struct Trace {
  graph: Graph,
  input: Variable,
  params: Vec<Variable>,
  output: Variable,
}

impl Trace {
  /// Record a forward pass. Frozen parameters enter the graph as constants.

  pub fn record<F>(x: &Tensor, params: &[Param], frozen: bool, body: F) -> Result<Self>
  where
    F: FnOnce(&mut Graph, Variable, &[Variable]) -> Result<Variable>
  {
    let mut graph = Graph::new();
    let input = graph.tracked(x.clone());
    let vars: Vec<_> = params.iter().map(|p| {
      if frozen { graph.input(p.value.clone()) } else { graph.param(p.value.clone()) }
    }).collect();
    let output = body(&mut graph, input, &vars)?;
    Ok(Self { graph, input, params: vars, output })
  }

  pub fn output(&self) -> Tensor {
    self.graph.value(self.output).clone()
  }

  pub fn value(&self, var: Variable) -> &Tensor {
    self.graph.value(var)
  }

  pub fn backward(&mut self, grad: &Tensor, params: &mut [Param]) -> Result<Tensor> {
    self.graph.zero_grad();
    self.graph.backward(self.output, grad)?;
    for (param, &var) in params.iter_mut().zip(&self.params) {
      if let Some(change) = self.graph.grad(var) {
        param.grad.add_assign(change);
      }
    }
    let (rows, cols) = self.graph.dims(self.input);
    Ok(self.graph.grad(self.input).cloned().unwrap_or_else(|| Tensor::zeros(rows, cols) ))
  }
}

/// Replay the trace of the last forward pass.

pub(crate) fn replay(trace: &mut Option<Trace>, class: &str, grad: &Tensor, params: &mut [Param]) -> Result<Tensor> {
  trace.as_mut()
    .ok_or_else(|| not_run(class) )?
    .backward(grad, params)
}

pub(crate) fn not_run(class: &str) -> Error {
  Error::InvalidArgument(format!("{class} backward called without a matching forward"))
}


/// Remove a named parameter from a loaded list, checking its shape.

pub(crate) fn take_param(params: &mut Vec<Param>, name: &str, dims: Option<Dims>) -> Result<Param> {
  let pos = params.iter()
    .position(|p| p.name == name )
    .ok_or_else(|| Error::InvalidArgument(format!("missing parameter \"{name}\"")) )?;
  let param = params.remove(pos);
  if let Some(dims) = dims {
    if param.dims() != dims { return Err(Error::shape("load", dims, param.dims())) }
  }
  Ok(param)
}

pub(crate) fn flag(args: &Args, key: &str) -> bool {
  arg_or(args, key, 0.0) != 0.0
}

pub(crate) fn bool_arg(value: bool) -> f32 {
  if value { 1.0 } else { 0.0 }
}

/// Join a list of equally tall variables side by side.

pub(crate) fn hstack(graph: &mut Graph, parts: &[Variable]) -> Result<Variable> {
  let (first, rest) = parts.split_first()
    .ok_or_else(|| Error::InvalidArgument("nothing to stack".to_string()) )?;
  rest.iter().try_fold(*first, |acc, &part| graph.concat(acc, part, 1) )
}

/// Stack a list of equally wide variables on top of each other.

pub(crate) fn vstack(graph: &mut Graph, parts: &[Variable]) -> Result<Variable> {
  let (first, rest) = parts.split_first()
    .ok_or_else(|| Error::InvalidArgument("nothing to stack".to_string()) )?;
  rest.iter().try_fold(*first, |acc, &part| graph.concat(acc, part, 0) )
}


/// Mean absolute difference between a layer's input gradient and
/// central differences of the sum of its outputs.

#[cfg(test)]
pub(crate) fn numeric_diff(layer: &mut dyn Layer, x: &Tensor) -> f64 {
  let eps = 1e-6;
  let out = layer.forward(x, false).unwrap();
  let grad = layer.backward(&Tensor::ones(out.rows(), out.cols())).unwrap();
  let mut diff = 0.0;
  for i in 0..x.size() {
    let mut perturb = |delta: f64| {
      let mut shifted = x.clone();
      shifted.raw_mut()[i] += delta;
      layer.forward(&shifted, false).unwrap().raw().iter().sum::<f64>()
    };
    let numeric = (perturb(eps) - perturb(-eps)) / (2.0 * eps);
    diff += (numeric - grad.raw()[i]).abs();
  }
  diff / x.size() as f64
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn context_accumulates_weighted() {
    let mut acc = Context::default();
    let ctx = Context::new(vec![("w".to_string(), Tensor::row(&[1.0, 2.0]))]);
    acc.accumulate(&ctx, 0.5);
    acc.accumulate(&ctx, 0.25);
    assert_eq!(acc.get("w"), Some(&Tensor::row(&[0.75, 1.5])));
    assert_eq!(acc.get("b"), None);
  }

  #[test]
  fn trace_skips_frozen_params() {
    let mut params = vec![Param::new("w", Tensor::scalar(3.0))];
    let x = Tensor::scalar(2.0);
    for frozen in [false, true] {
      let mut trace = Trace::record(&x, &params, frozen, |graph, x, p| graph.mul(x, p[0]) ).unwrap();
      let dx = trace.backward(&Tensor::scalar(1.0), &mut params).unwrap();
      assert_eq!(dx.item(), 3.0);
    }
    assert_eq!(params[0].grad.item(), 2.0);
  }

  #[test]
  fn missing_param() {
    let mut params = vec![Param::new("w", Tensor::zeros(2, 2))];
    assert!(take_param(&mut params, "b", None).is_err());
    assert!(take_param(&mut params, "w", Some((2, 1))).is_err());
  }
}
