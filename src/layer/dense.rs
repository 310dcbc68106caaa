use log::debug;

use crate::{
  internal::*,
  tensor::Tensor,
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param },
  error::{ Error, Result },
};


/// Fully connected layer computing `x·W + b`.
///
/// The input width is taken from the first forward pass. After that,
/// inputs of any other width are rejected.

#[derive(Debug, Clone)]
pub struct Dense {
  name: String,
  output: usize,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl Dense {
  pub fn new(output: usize) -> Self {
    Self {
      name: "dense".to_string(),
      output,
      params: Vec::new(),
      frozen: false,
      trace: None,
    }
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let mut layer = Self::new(arg(args, "output")?);
    layer.name = name.to_string();
    if !params.is_empty() {
      let w = take_param(&mut params, "w", None)?;
      let b = take_param(&mut params, "b", Some((1, layer.output)))?;
      if w.value.cols() != layer.output { return Err(Error::shape("dense", w.dims(), b.dims())) }
      layer.params = vec![w, b];
    }
    Ok(layer)
  }

  /// Input width, once bound.

  pub fn input(&self) -> Option<usize> {
    self.params.first().map(|w| w.value.rows() )
  }

  fn init(input: usize, output: usize) -> Vec<Param> {
    vec![
      Param::new("w", Tensor::glorot_uniform(input, output)),
      Param::new("b", Tensor::zeros(1, output)),
    ]
  }

  fn bind(&mut self, x: &Tensor) -> Result<()> {
    match self.input() {
      Some(input) if input != x.cols() => Err(Error::shape("dense", x.dims(), (input, self.output))),
      Some(_) => Ok(()),
      None => {
        debug!("Binding {} to input width {}", self.name, x.cols());
        self.params = Self::init(x.cols(), self.output);
        Ok(())
      },
    }
  }
}

impl Layer for Dense {
  named!("dense");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    self.bind(x)?;
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, params| {
      let y = graph.mm(x, params[0])?;
      graph.broadcast_add(y, params[1])
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "dense", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([("output".to_string(), self.output as f32)])
  }

  fn reset(&mut self) {
    if let Some(input) = self.input() {
      self.params = Self::init(input, self.output);
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn binds_lazily() {
    let mut dense = Dense::new(3);
    assert!(dense.params().is_empty());
    let y = dense.forward(&Tensor::randn(4, 5), true).unwrap();
    assert_eq!(y.dims(), (4, 3));
    assert_eq!(dense.input(), Some(5));
    assert_eq!(dense.param_count(), 5 * 3 + 3);
    assert!(matches!(
      dense.forward(&Tensor::randn(4, 6), true),
      Err(Error::ShapeMismatch { op: "dense", .. })
    ));
    assert_eq!(dense.input(), Some(5));
  }

  #[test]
  fn gradients() {
    let mut dense = Dense::new(2);
    let x = Tensor::randn(3, 4);
    dense.forward(&x, true).unwrap();
    let dx = dense.backward(&Tensor::ones(3, 2)).unwrap();
    let w = dense.params()[0].value.clone();
    assert_eq!(dx, Tensor::ones(3, 2).mm(&w.transpose()).unwrap());
    let ctx = dense.context();
    assert_eq!(ctx.get("w"), Some(&x.transpose().mm(&Tensor::ones(3, 2)).unwrap()));
    // Bias sees the mean over the batch
    assert_eq!(ctx.get("b"), Some(&Tensor::ones(1, 2)));
  }

  #[test]
  fn frozen() {
    let mut dense = Dense::new(2);
    dense.forward(&Tensor::randn(3, 4), true).unwrap();
    dense.freeze();
    dense.forward(&Tensor::randn(3, 4), true).unwrap();
    let dx = dense.backward(&Tensor::ones(3, 2)).unwrap();
    assert_eq!(dx.dims(), (3, 4));
    assert!(dense.context().is_empty());
    assert_eq!(dense.params()[0].grad, Tensor::zeros(4, 2));
  }

  #[test]
  fn backward_before_forward() {
    assert!(Dense::new(2).backward(&Tensor::ones(1, 2)).is_err());
  }
}
