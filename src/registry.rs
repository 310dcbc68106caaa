use std::collections::HashMap;
use std::sync::OnceLock;

use log::debug;

use crate::{
  layer::*,
  error::{ Error, Result },
};


/// Rebuilds a layer from its persisted name, parameters and arguments.

pub type Constructor = fn(&str, Vec<Param>, &Args) -> Result<Box<dyn Layer>>;


/// Maps layer class tags to constructors, for loading saved networks.
///
/// [Registry::default] knows every layer in this crate. Custom layers
/// can be registered on top and passed to
/// [Network::load_with](crate::Network::load_with).

#[derive(Debug, Clone)]
pub struct Registry {
  constructors: HashMap<String, Constructor>,
}

impl Registry {
  /// Registry without any classes.

  pub fn new() -> Self {
    Self { constructors: HashMap::new() }
  }

  /// Process-wide registry of the built-in layers.

  pub fn global() -> &'static Self {
    static GLOBAL: OnceLock<Registry> = OnceLock::new();
    GLOBAL.get_or_init(Self::default)
  }

  pub fn register(&mut self, class: &str, constructor: Constructor) -> &mut Self {
    self.constructors.insert(class.to_string(), constructor);
    self
  }

  pub fn contains(&self, class: &str) -> bool {
    self.constructors.contains_key(class)
  }

  pub fn classes(&self) -> Vec<&str> {
    let mut classes: Vec<_> = self.constructors.keys().map(String::as_str).collect();
    classes.sort_unstable();
    classes
  }

  pub fn build(&self, class: &str, name: &str, params: Vec<Param>, args: &Args) -> Result<Box<dyn Layer>> {
    let constructor = self.constructors.get(class)
      .ok_or_else(|| Error::UnsupportedLayerClass(class.to_string()) )?;
    debug!("Building {class} layer {name}");
    constructor(name, params, args)
  }
}

fn named(mut layer: impl Layer + 'static, name: &str) -> Box<dyn Layer> {
  layer.rename(name);
  Box::new(layer)
}

impl Default for Registry {
  fn default() -> Self {
    let mut registry = Self::new();
    registry
      .register("dense", |name, params, args| Ok(Box::new(Dense::from_parts(name, params, args)?)) )
      .register("linear", |name, params, args| Ok(Box::new(Linear::from_parts(name, params, args)?)) )
      .register("conv2d", |name, params, args| Ok(Box::new(Conv2D::from_parts(name, params, args)?)) )
      .register("conv_transpose2d", |name, params, args| Ok(Box::new(ConvTranspose2D::from_parts(name, params, args)?)) )
      .register("conv_transpose1d", |name, params, args| Ok(Box::new(ConvTranspose1D::from_parts(name, params, args)?)) )
      .register("maxpool", |name, _, args| Ok(Box::new(MaxPool::from_parts(name, args)?)) )
      .register("dropout", |name, _, args| Ok(Box::new(Dropout::from_parts(name, args)?)) )
      .register("rnn", |name, params, args| Ok(Box::new(Rnn::from_parts(name, params, args)?)) )
      .register("lstm", |name, params, args| Ok(Box::new(Lstm::from_parts(name, params, args)?)) )
      .register("attention", |name, params, args| Ok(Box::new(Attention::from_parts(name, params, args)?)) )
      .register("self_attention", |name, params, args| Ok(Box::new(SelfAttention::from_parts(name, params, args)?)) )
      .register("layer_norm", |name, params, args| Ok(Box::new(LayerNorm::from_parts(name, params, args)?)) )
      .register("rms_norm", |name, params, args| Ok(Box::new(RMSNorm::from_parts(name, params, args)?)) )
      .register("rezero", |name, params, _| Ok(Box::new(ReZero::from_parts(name, params)?)) )
      .register("flatten", |name, _, _| Ok(Box::new(Flatten::from_parts(name))) )
      .register("embedding", |name, params, args| Ok(Box::new(Embedding::from_parts(name, params, args)?)) )
      .register("sigmoid", |name, _, _| Ok(named(Activation::sigmoid(), name)) )
      .register("tanh", |name, _, _| Ok(named(Activation::tanh(), name)) )
      .register("relu", |name, _, _| Ok(named(Activation::relu(), name)) )
      .register("softplus", |name, _, _| Ok(named(Activation::softplus(), name)) )
      .register("gelu", |name, _, _| Ok(named(Activation::gelu(), name)) );
    registry
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::tensor::Tensor;

  #[test]
  fn knows_all_builtin_classes() {
    let registry = Registry::default();
    let layers: Vec<Box<dyn Layer>> = vec![
      Box::new(Dense::new(2)),
      Box::new(Linear::new(2, 3)),
      Box::new(Conv2D::new(1, 2, [3, 3], 5, 5)),
      Box::new(ConvTranspose2D::new(2, 4, [3, 3], 3, 3).with_stride([2, 2]).with_output_padding([1, 0]).with_groups(2)),
      Box::new(ConvTranspose1D::new(2, 1, 3, 5).with_stride(2).with_padding(1)),
      Box::new(MaxPool::new(1, 4, 4, [2, 2], [2, 2]).unwrap()),
      Box::new(Dropout::new(0.5).unwrap()),
      Box::new(Rnn::new(2, 3, 4)),
      Box::new(Lstm::new(2, 3, 4)),
      Box::new(Attention::new(4, 2).unwrap()),
      Box::new(SelfAttention::new(4, 2, 3).unwrap()),
      Box::new(LayerNorm::new(3)),
      Box::new(RMSNorm::new(3)),
      Box::new(ReZero::new()),
      Box::new(Flatten::new()),
      Box::new(Embedding::new(5, 2)),
    ];
    for layer in layers.iter().chain(ActivationKind::ALL.map(|kind| Box::new(Activation::new(kind)) as Box<dyn Layer> ).iter()) {
      let params = layer.params().into_iter().cloned().collect();
      let rebuilt = registry.build(layer.class(), "copy", params, &layer.args()).unwrap();
      assert_eq!(rebuilt.class(), layer.class());
      assert_eq!(rebuilt.name(), "copy");
      assert_eq!(rebuilt.args(), layer.args());
      assert_eq!(rebuilt.param_count(), layer.param_count());
    }
    assert_eq!(registry.classes().len(), 21);
  }

  #[test]
  fn transposed_convolutions_round_trip() {
    let x = Tensor::randn(2, 18);
    let mut layer = ConvTranspose2D::new(2, 2, [2, 2], 3, 3).with_stride([2, 2]).with_output_padding([1, 1]);
    let params = layer.params().into_iter().cloned().collect();
    let mut rebuilt = Registry::global().build("conv_transpose2d", "up", params, &layer.args()).unwrap();
    assert_eq!(rebuilt.forward(&x, false).unwrap(), layer.forward(&x, false).unwrap());

    let mut layer = ConvTranspose1D::new(3, 2, 2, 6).with_stride(2).with_dilation(2);
    let params = layer.params().into_iter().cloned().collect();
    let mut rebuilt = Registry::global().build("conv_transpose1d", "up", params, &layer.args()).unwrap();
    assert_eq!(rebuilt.forward(&x, false).unwrap(), layer.forward(&x, false).unwrap());
    assert!(Registry::global().build("conv_transpose1d", "up", Vec::new(), &layer.args()).is_err());
  }

  #[test]
  fn unknown_class() {
    let result = Registry::global().build("capsule", "x", Vec::new(), &Args::new());
    assert!(matches!(result, Err(Error::UnsupportedLayerClass(class)) if class == "capsule"));
  }

  #[test]
  fn custom_classes() {
    let mut registry = Registry::new();
    registry.register("identity", |name, _, _| Ok(named(Flatten::new(), name)) );
    let mut layer = registry.build("identity", "id", Vec::new(), &Args::new()).unwrap();
    assert_eq!(layer.forward(&Tensor::scalar(2.0), false).unwrap().item(), 2.0);
    assert!(!registry.contains("dense"));
  }
}
