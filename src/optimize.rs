use std::fmt::Debug;

use serde::{Serialize, Deserialize};

use crate::{
  tensor::Tensor,
  layer::{ Param, Context },
  error::{ Error, Result },
};


/// Strategy for applying gradient snapshots to a network's parameters.
///
/// Gradients come as one [Context] per layer, parameters as one list
/// per layer, in the same order. Layers with an empty context are
/// frozen and left alone.

pub trait Optimizer: Debug + Send + Sync {
  /// Tag the optimizer gets persisted under.

  fn class(&self) -> &'static str;

  fn update(&mut self, grads: &[Context], params: Vec<Vec<&mut Param>>) -> Result<()>;

  /// Number of updates applied so far.

  fn step_count(&self) -> usize;

  /// Hyperparameters and step count, serialized.

  fn options(&self) -> Vec<u8>;

  /// Per-parameter state tensors, flattened over all layers.

  fn state(&self) -> Vec<Vec<Tensor>>;

  /// Adopt previously saved state, if it fits the given parameters.

  fn restore(&mut self, state: Vec<Vec<Tensor>>, params: &[Vec<&Param>]) -> Result<()>;
}


/// Instantiate a persisted optimizer from its class tag and options.

pub fn from_options(class: &str, options: &[u8]) -> Result<Box<dyn Optimizer>> {
  match class {
    "sgd" => Ok(Box::new(postcard::from_bytes::<Sgd>(options)?)),
    "adam" => Ok(Box::new(postcard::from_bytes::<Adam>(options)?)),
    _ => Err(Error::UnsupportedOptimizerClass(class.to_string())),
  }
}


// Check that gradients and parameters describe the same layers
fn align(grads: &[Context], params: &[Vec<&mut Param>]) -> Result<()> {
  if grads.len() != params.len() {
    return Err(Error::shape("optimizer", (grads.len(), 0), (params.len(), 0)))
  }
  for (ctx, layer) in grads.iter().zip(params) {
    if ctx.is_empty() { continue }
    let names_match = ctx.len() == layer.len()
      && ctx.iter().zip(layer.iter()).all(|((name, _), param)| name == param.name );
    if !names_match {
      return Err(Error::shape("optimizer", (grads.len(), ctx.len()), (params.len(), layer.len())))
    }
  }
  Ok(())
}


/// State tensors for every parameter of every layer, created lazily
/// once the parameter layout is known.

#[derive(Debug, Clone, Default)]
struct Slots {
  groups: Vec<Vec<Vec<Tensor>>>,
}

impl Slots {
  fn fits(&self, params: &[Vec<&mut Param>], width: usize) -> bool {
    self.groups.len() == params.len() && self.groups.iter().zip(params).all(|(layer, params)| {
      layer.len() == params.len() && layer.iter().zip(params.iter()).all(|(group, param)| {
        group.len() == width && group.iter().all(|t| t.dims() == param.dims() )
      })
    })
  }

  fn prepare(&mut self, params: &[Vec<&mut Param>], width: usize) {
    if self.fits(params, width) { return }
    self.groups = params.iter().map(|layer| {
      layer.iter().map(|param| {
        let (rows, cols) = param.dims();
        vec![Tensor::zeros(rows, cols); width]
      }).collect()
    }).collect();
  }

  fn flatten(&self) -> Vec<Vec<Tensor>> {
    self.groups.iter().flatten().cloned().collect()
  }

  fn restore(&mut self, state: Vec<Vec<Tensor>>, params: &[Vec<&Param>], width: usize) -> Result<()> {
    let expected: usize = params.iter().map(Vec::len).sum();
    if state.is_empty() {
      self.groups.clear();
      return Ok(())
    }
    if state.len() != expected {
      return Err(Error::StateMismatch { expected, actual: state.len() })
    }
    let flat_params = params.iter().flatten();
    for (group, param) in state.iter().zip(flat_params) {
      if group.len() != width {
        return Err(Error::StateMismatch { expected: width, actual: group.len() })
      }
      if let Some(t) = group.iter().find(|t| t.dims() != param.dims() ) {
        return Err(Error::shape("optimizer state", t.dims(), param.dims()))
      }
    }
    let mut state = state.into_iter();
    self.groups = params.iter()
      .map(|layer| state.by_ref().take(layer.len()).collect() )
      .collect();
    Ok(())
  }
}


/// Stochastic gradient descent with optional momentum and L2 weight decay.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
  pub lr: f64,
  pub momentum: f64,
  pub weight_decay: f64,
  step: usize,
  #[serde(skip)]
  slots: Slots,
}

impl Sgd {
  pub fn new(lr: f64) -> Self {
    Self { lr, momentum: 0.0, weight_decay: 0.0, step: 0, slots: Slots::default() }
  }

  pub fn with_momentum(mut self, momentum: f64) -> Self {
    self.momentum = momentum;
    self
  }

  pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
    self.weight_decay = weight_decay;
    self
  }

  fn width(&self) -> usize {
    if self.momentum > 0.0 { 1 } else { 0 }
  }
}

impl Default for Sgd {
  fn default() -> Self {
    Self::new(0.01)
  }
}

impl Optimizer for Sgd {
  fn class(&self) -> &'static str {
    "sgd"
  }

  fn update(&mut self, grads: &[Context], mut params: Vec<Vec<&mut Param>>) -> Result<()> {
    align(grads, &params)?;
    let width = self.width();
    self.slots.prepare(&params, width);
    for ((ctx, layer), slots) in grads.iter().zip(params.iter_mut()).zip(self.slots.groups.iter_mut()) {
      if ctx.is_empty() { continue }
      for (((_, grad), param), slot) in ctx.iter().zip(layer.iter_mut()).zip(slots.iter_mut()) {
        let grad = grad + &(&param.value * self.weight_decay);
        let change = match slot.first_mut() {
          Some(v) => {
            *v = &*v * self.momentum + &grad;
            v.clone()
          },
          None => grad,
        };
        param.value = &param.value - &(change * self.lr);
      }
    }
    self.step += 1;
    Ok(())
  }

  fn step_count(&self) -> usize {
    self.step
  }

  fn options(&self) -> Vec<u8> {
    postcard::to_allocvec(self).unwrap_or_default()
  }

  fn state(&self) -> Vec<Vec<Tensor>> {
    self.slots.flatten()
  }

  fn restore(&mut self, state: Vec<Vec<Tensor>>, params: &[Vec<&Param>]) -> Result<()> {
    let width = self.width();
    self.slots.restore(state, params, width)
  }
}


/// Adaptive Moment Estimation (ADAM) with bias correction
/// and optional L2 weight decay.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
  pub lr: f64,
  pub beta1: f64,
  pub beta2: f64,
  pub eps: f64,
  pub weight_decay: f64,
  step: usize,
  #[serde(skip)]
  slots: Slots,
}

impl Adam {
  pub fn new(lr: f64) -> Self {
    Self {
      lr,
      beta1: 0.9,
      beta2: 0.999,
      eps: 1e-8,
      weight_decay: 0.0,
      step: 0,
      slots: Slots::default(),
    }
  }

  pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
    self.beta1 = beta1;
    self.beta2 = beta2;
    self
  }

  pub fn with_eps(mut self, eps: f64) -> Self {
    self.eps = eps;
    self
  }

  pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
    self.weight_decay = weight_decay;
    self
  }
}

impl Default for Adam {
  fn default() -> Self {
    Self::new(0.001)
  }
}

impl Optimizer for Adam {
  fn class(&self) -> &'static str {
    "adam"
  }

  fn update(&mut self, grads: &[Context], mut params: Vec<Vec<&mut Param>>) -> Result<()> {
    align(grads, &params)?;
    self.slots.prepare(&params, 2);
    self.step += 1;
    let t = self.step as i32;
    let correction1 = 1.0 - self.beta1.powi(t);
    let correction2 = 1.0 - self.beta2.powi(t);
    for ((ctx, layer), slots) in grads.iter().zip(params.iter_mut()).zip(self.slots.groups.iter_mut()) {
      if ctx.is_empty() { continue }
      for (((_, grad), param), slot) in ctx.iter().zip(layer.iter_mut()).zip(slots.iter_mut()) {
        let grad = grad + &(&param.value * self.weight_decay);
        slot[0] = &slot[0] * self.beta1 + &grad * (1.0 - self.beta1);
        slot[1] = &slot[1] * self.beta2 + grad.sqr() * (1.0 - self.beta2);
        let m = &slot[0] / correction1;
        let v = &slot[1] / correction2;
        let change = m.zip(&v, |m, v| m / (v.sqrt() + self.eps) );
        param.value = &param.value - &(change * self.lr);
      }
    }
    Ok(())
  }

  fn step_count(&self) -> usize {
    self.step
  }

  fn options(&self) -> Vec<u8> {
    postcard::to_allocvec(self).unwrap_or_default()
  }

  fn state(&self) -> Vec<Vec<Tensor>> {
    self.slots.flatten()
  }

  fn restore(&mut self, state: Vec<Vec<Tensor>>, params: &[Vec<&Param>]) -> Result<()> {
    self.slots.restore(state, params, 2)
  }
}
