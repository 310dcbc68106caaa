use log::debug;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
  tensor::Tensor,
  layer::{ Layer, Param, Context },
  error::{ Error, Result },
};


/// Ordered stack of layers, each feeding the next.

#[derive(Debug, Clone, Default)]
pub struct Network {
  layers: Vec<Box<dyn Layer>>,
}

impl Network {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, layer: impl Layer + 'static) -> &mut Self {
    self.push(Box::new(layer));
    self
  }

  pub fn push(&mut self, layer: Box<dyn Layer>) {
    self.layers.push(layer);
  }

  /// Replace the layer at `index`.

  pub fn set(&mut self, index: usize, layer: impl Layer + 'static) -> Result<()> {
    let len = self.layers.len();
    let slot = self.layers.get_mut(index)
      .ok_or_else(|| Error::InvalidArgument(format!("layer index {index} out of range for {len} layers")) )?;
    *slot = Box::new(layer);
    Ok(())
  }

  pub fn layers(&self) -> &[Box<dyn Layer>] {
    &self.layers
  }

  pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
    &mut self.layers
  }

  pub fn len(&self) -> usize {
    self.layers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.layers.is_empty()
  }

  pub fn forward(&mut self, x: &Tensor, training: bool) -> Result<Tensor> {
    self.layers.iter_mut().try_fold(x.clone(), |x, layer| layer.forward(&x, training) )
  }

  /// Propagate the loss gradient through all layers in reverse order, then
  /// collect every layer's parameter gradients, aligned with [Network::layers].

  pub fn backward(&mut self, grad: &Tensor) -> Result<Vec<Context>> {
    self.layers.iter_mut().rev().try_fold(grad.clone(), |grad, layer| layer.backward(&grad) )?;
    Ok(self.contexts())
  }

  #[cfg(feature = "rayon")]
  fn contexts(&self) -> Vec<Context> {
    self.layers.par_iter().map(|layer| layer.context() ).collect()
  }

  #[cfg(not(feature = "rayon"))]
  fn contexts(&self) -> Vec<Context> {
    self.layers.iter().map(|layer| layer.context() ).collect()
  }

  pub fn params(&self) -> Vec<Vec<&Param>> {
    self.layers.iter().map(|layer| layer.params() ).collect()
  }

  pub fn params_mut(&mut self) -> Vec<Vec<&mut Param>> {
    self.layers.iter_mut().map(|layer| layer.params_mut() ).collect()
  }

  pub fn param_count(&self) -> usize {
    self.layers.iter().map(|layer| layer.param_count() ).sum()
  }

  pub fn zero_grad(&mut self) {
    for layer in &mut self.layers {
      layer.zero_grad();
    }
  }

  pub fn freeze(&mut self) {
    for layer in &mut self.layers {
      layer.freeze();
    }
  }

  pub fn unfreeze(&mut self) {
    for layer in &mut self.layers {
      layer.unfreeze();
    }
  }

  pub fn reset(&mut self) {
    debug!("Resetting {} layers", self.layers.len());
    for layer in &mut self.layers {
      layer.reset();
    }
  }

  pub fn print(&self) -> String {
    let mut out: String = self.layers.iter()
      .enumerate()
      .map(|(i, layer)| format!("{i:>3}  {}\n", layer.print()) )
      .collect();
    out.push_str(&format!("Total: {} params", self.param_count()));
    out
  }
}
