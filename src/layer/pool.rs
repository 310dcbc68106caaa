use crate::{
  internal::*,
  tensor::{ Tensor, lops::Window },
  layer::{ Layer, Args, named, not_run },
  error::{ Error, Result },
};


/// Max pooling over flattened channel-major images, in ceil mode.
///
/// Windows hanging over the bottom or right edge only consider
/// the pixels inside the image.

#[derive(Debug, Clone)]
pub struct MaxPool {
  name: String,
  window: Window,
  cache: Option<(Dims, Vec<Vec<usize>>)>,
}

impl MaxPool {
  pub fn new(channels: usize, height: usize, width: usize, kernel: [usize; 2], stride: [usize; 2]) -> Result<Self> {
    if kernel.contains(&0) || stride.contains(&0) {
      return Err(Error::InvalidArgument(format!("maxpool kernel {kernel:?} and stride {stride:?} must be positive")))
    }
    Ok(Self {
      name: "maxpool".to_string(),
      window: Window {
        channels,
        height,
        width,
        kernel,
        stride,
        padding: [0, 0],
        dilation: 1,
      },
      cache: None,
    })
  }

  pub fn from_parts(name: &str, args: &Args) -> Result<Self> {
    let mut layer = Self::new(
      arg(args, "channels")?,
      arg(args, "height")?,
      arg(args, "width")?,
      [arg(args, "kernel1")?, arg(args, "kernel2")?],
      [arg(args, "stride1")?, arg(args, "stride2")?],
    )?;
    layer.name = name.to_string();
    Ok(layer)
  }

  pub fn output_dims(&self) -> Option<Dims> {
    self.window.pool_output()
  }
}

impl Layer for MaxPool {
  named!("maxpool");

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    let (out_h, out_w) = self.output_dims()
      .ok_or_else(|| Error::shape("maxpool", (self.window.height, self.window.width), (self.window.kernel[0], self.window.kernel[1])) )?;
    if x.cols() != self.window.image_size() {
      return Err(Error::shape("maxpool", x.dims(), (1, self.window.image_size())))
    }
    let cols = self.window.channels * out_h * out_w;
    let mut data = Vec::with_capacity(x.rows() * cols);
    let mut indices = Vec::with_capacity(x.rows());
    for r in 0..x.rows() {
      let (values, idx) = self.window.pool_max(x.row_slice(r));
      data.extend(values);
      indices.push(idx);
    }
    self.cache = Some((x.dims(), indices));
    Ok(Tensor::new(x.rows(), cols, data))
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    let ((rows, cols), indices) = self.cache.as_ref().ok_or_else(|| not_run("maxpool") )?;
    let width = indices.first().map(|idx| idx.len() ).unwrap_or(0);
    if grad.dims() != (*rows, width) {
      return Err(Error::shape("maxpool", grad.dims(), (*rows, width)))
    }
    let mut out = Tensor::zeros(*rows, *cols);
    for (r, idx) in indices.iter().enumerate() {
      for (o, &i) in idx.iter().enumerate() {
        let value = out.at(r, i) + grad.at(r, o);
        out.set(r, i, value);
      }
    }
    Ok(out)
  }

  fn args(&self) -> Args {
    let w = &self.window;
    [
      ("channels", w.channels),
      ("height", w.height),
      ("width", w.width),
      ("kernel1", w.kernel[0]),
      ("kernel2", w.kernel[1]),
      ("stride1", w.stride[0]),
      ("stride2", w.stride[1]),
    ].into_iter().map(|(key, value)| (key.to_string(), value as f32) ).collect()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn routes_gradient_to_argmax() {
    let mut pool = MaxPool::new(1, 3, 3, [2, 2], [2, 2]).unwrap();
    assert_eq!(pool.output_dims(), Some((2, 2)));
    let x = Tensor::row(&[9., 1., 2., 3., 4., 8., 5., 7., 6.]);
    let y = pool.forward(&x, true).unwrap();
    assert_eq!(y, Tensor::row(&[9., 8., 7., 6.]));
    let dx = pool.backward(&Tensor::row(&[1., 2., 3., 4.])).unwrap();
    assert_eq!(dx, Tensor::row(&[1., 0., 0., 0., 0., 2., 0., 3., 4.]));
  }

  #[test]
  fn backward_needs_forward() {
    let mut pool = MaxPool::new(1, 2, 2, [2, 2], [2, 2]).unwrap();
    assert!(pool.backward(&Tensor::ones(1, 1)).is_err());
  }

  #[test]
  fn rejects_empty_windows() {
    assert!(matches!(MaxPool::new(1, 4, 4, [0, 0], [2, 2]), Err(Error::InvalidArgument(_))));
    assert!(matches!(MaxPool::new(1, 4, 4, [2, 2], [0, 1]), Err(Error::InvalidArgument(_))));
    let args = Args::from([
      ("channels".to_string(), 1.0),
      ("height".to_string(), 4.0),
      ("width".to_string(), 4.0),
      ("kernel1".to_string(), 0.0),
      ("kernel2".to_string(), 0.0),
      ("stride1".to_string(), 1.0),
      ("stride2".to_string(), 1.0),
    ]);
    assert!(MaxPool::from_parts("pool", &args).is_err());
  }

  #[test]
  fn channels() {
    let mut pool = MaxPool::new(2, 4, 4, [2, 2], [2, 2]).unwrap();
    let y = pool.forward(&Tensor::randn(3, 32), false).unwrap();
    assert_eq!(y.dims(), (3, 8));
    assert!(pool.forward(&Tensor::randn(3, 16), false).is_err());
  }
}
