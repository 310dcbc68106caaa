use std::fmt::Debug;

use crate::{
  tensor::Tensor,
  error::{ Error, Result },
};


/// Objective comparing a batch of predictions against its targets.

pub trait Loss: Debug + Send + Sync {
  /// Tag the loss gets persisted under.

  fn class(&self) -> &'static str;

  /// Loss of every row, as a column.

  fn per_row(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor>;

  /// Gradient of [Loss::loss] with respect to the predictions.

  fn grad(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor>;

  fn loss(&self, pred: &Tensor, target: &Tensor) -> Result<f64> {
    Ok(self.per_row(pred, target)?.mean(0)?.item())
  }
}


fn check(class: &'static str, pred: &Tensor, target: &Tensor) -> Result<()> {
  if pred.dims() != target.dims() || pred.size() == 0 {
    return Err(Error::shape(class, pred.dims(), target.dims()))
  }
  Ok(())
}


/// Mean squared error over all elements.

#[derive(Debug, Clone, Copy, Default)]
pub struct Mse;

impl Loss for Mse {
  fn class(&self) -> &'static str {
    "mse"
  }

  fn per_row(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    check("mse", pred, target)?;
    (pred - target).sqr().mean(1)
  }

  fn grad(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    check("mse", pred, target)?;
    Ok((pred - target) * (2.0 / pred.size() as f64))
  }
}


/// Cross entropy between the softmax of raw scores and
/// one-hot or probability targets, averaged over rows.

#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxCrossEntropy;

impl Loss for SoftmaxCrossEntropy {
  fn class(&self) -> &'static str {
    "softmax_cross_entropy"
  }

  fn per_row(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    check("softmax_cross_entropy", pred, target)?;
    Ok(-(target * &pred.log_softmax(1)?).sum(1)?)
  }

  fn grad(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    check("softmax_cross_entropy", pred, target)?;
    Ok((pred.softmax(1)? - target) / pred.rows() as f64)
  }
}


/// Instantiate a persisted loss.

pub fn from_class(class: &str) -> Result<Box<dyn Loss>> {
  match class {
    "mse" => Ok(Box::new(Mse)),
    "softmax_cross_entropy" => Ok(Box::new(SoftmaxCrossEntropy)),
    _ => Err(Error::UnsupportedLossClass(class.to_string())),
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;

  #[test]
  fn mse() {
    let pred = Tensor::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]);
    let target = Tensor::from_rows(&[&[1.0, 0.0], &[0.0, 4.0]]);
    assert_eq!(Mse.loss(&pred, &target).unwrap(), 13.0 / 4.0);
    assert_eq!(Mse.per_row(&pred, &target).unwrap(), Tensor::column(&[2.0, 4.5]));
    assert_eq!(Mse.grad(&pred, &target).unwrap(), Tensor::from_rows(&[&[0.0, 1.0], &[1.5, 0.0]]));
    assert!(Mse.loss(&pred, &Tensor::zeros(2, 3)).is_err());
  }

  #[test]
  fn cross_entropy() {
    let pred = Tensor::from_rows(&[&[0.0, 0.0], &[1000.0, 0.0]]);
    let target = Tensor::from_rows(&[&[1.0, 0.0], &[1.0, 0.0]]);
    let per_row = SoftmaxCrossEntropy.per_row(&pred, &target).unwrap();
    assert_abs_diff_eq!(per_row.at(0, 0), 2f64.ln(), epsilon = 1e-12);
    assert_abs_diff_eq!(per_row.at(1, 0), 0.0, epsilon = 1e-12);
    let grad = SoftmaxCrossEntropy.grad(&pred, &target).unwrap();
    assert_abs_diff_eq!(grad.at(0, 0), -0.25, epsilon = 1e-12);
    assert_abs_diff_eq!(grad.at(0, 1), 0.25, epsilon = 1e-12);
  }

  #[test]
  fn gradient_matches_loss() {
    let pred = Tensor::randn(3, 4);
    let target = Tensor::randn(3, 4).softmax(1).unwrap();
    for loss in [from_class("mse").unwrap(), from_class("softmax_cross_entropy").unwrap()] {
      let grad = loss.grad(&pred, &target).unwrap();
      for i in 0..pred.size() {
        let perturb = |delta: f64| {
          let mut shifted = pred.clone();
          shifted.raw_mut()[i] += delta;
          loss.loss(&shifted, &target).unwrap()
        };
        let numeric = (perturb(1e-6) - perturb(-1e-6)) / 2e-6;
        assert_abs_diff_eq!(numeric, grad.raw()[i], epsilon = 1e-6);
      }
    }
    assert!(matches!(from_class("hinge"), Err(Error::UnsupportedLossClass(_))));
  }
}
