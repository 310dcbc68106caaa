use crate::{
  internal::*,
  tensor::Tensor,
  layer::{ Layer, Args, named },
  error::{ Error, Result },
};


/// Inverted dropout mask, scaling kept entries by `1 / keep`.

pub(crate) fn mask(rows: usize, cols: usize, keep: f64) -> Tensor {
  Tensor::init(rows, cols, |_, _| if uniform(0.0, 1.0) < keep { 1.0 / keep } else { 0.0 } )
}


/// Randomly zeroes inputs during training, keeping each
/// with probability `keep`. Passes through at inference time.

#[derive(Debug, Clone)]
pub struct Dropout {
  name: String,
  keep: f64,
  mask: Option<Tensor>,
}

impl Dropout {
  pub fn new(keep: f64) -> Result<Self> {
    if !(keep > 0.0 && keep <= 1.0) {
      return Err(Error::InvalidArgument(format!("keep probability {keep} outside (0, 1]")))
    }
    Ok(Self { name: "dropout".to_string(), keep, mask: None })
  }

  pub fn from_parts(name: &str, args: &Args) -> Result<Self> {
    let mut layer = Self::new(arg_or(args, "keep", 1.0) as f64)?;
    layer.name = name.to_string();
    Ok(layer)
  }
}

impl Layer for Dropout {
  named!("dropout");

  fn forward(&mut self, x: &Tensor, training: bool) -> Result<Tensor> {
    if !training || self.keep >= 1.0 {
      self.mask = None;
      return Ok(x.clone())
    }
    let mask = mask(x.rows(), x.cols(), self.keep);
    let output = x * &mask;
    self.mask = Some(mask);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    match &self.mask {
      Some(mask) if mask.dims() != grad.dims() => Err(Error::shape("dropout", grad.dims(), mask.dims())),
      Some(mask) => Ok(grad * mask),
      None => Ok(grad.clone()),
    }
  }

  fn args(&self) -> Args {
    Args::from([("keep".to_string(), self.keep as f32)])
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keep_all_is_identity() {
    let mut dropout = Dropout::new(1.0).unwrap();
    let x = Tensor::randn(4, 5);
    assert_eq!(dropout.forward(&x, true).unwrap(), x);
    assert_eq!(dropout.backward(&x).unwrap(), x);
  }

  #[test]
  fn inverted_scaling() {
    let mut dropout = Dropout::new(0.5).unwrap();
    let y = dropout.forward(&Tensor::ones(10, 10), true).unwrap();
    assert!(y.raw().iter().all(|&a| a == 0.0 || a == 2.0 ));
    let dy = dropout.backward(&Tensor::ones(10, 10)).unwrap();
    assert_eq!(y, dy);
    let x = Tensor::randn(3, 3);
    assert_eq!(dropout.forward(&x, false).unwrap(), x);
  }

  #[test]
  fn invalid_keep() {
    assert!(Dropout::new(0.0).is_err());
    assert!(Dropout::new(1.5).is_err());
  }
}
