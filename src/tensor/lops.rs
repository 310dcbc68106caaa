//! Sliding-window geometry for convolution and pooling over
//! channel-major image rows (`channels × height × width` flattened).

use std::ops::Range;

use serde::{Serialize, Deserialize};

use crate::tensor::Tensor;


#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
  pub channels: usize,
  pub height: usize,
  pub width: usize,
  pub kernel: [usize; 2],
  pub stride: [usize; 2],
  pub padding: [usize; 2],
  pub dilation: usize,
}

impl Window {
  pub fn image_size(&self) -> usize {
    self.channels * self.height * self.width
  }

  /// Output size of a convolution, `None` if the kernel doesn't fit.

  pub fn conv_output(&self) -> Option<(usize, usize)> {
    let extent = |size: usize, pad: usize, kernel: usize, stride: usize| {
      let span = self.dilation * (kernel.max(1) - 1) + 1;
      let padded = size + 2 * pad;
      (padded >= span && stride > 0).then(|| (padded - span) / stride + 1 )
    };
    Some((
      extent(self.height, self.padding[0], self.kernel[0], self.stride[0])?,
      extent(self.width, self.padding[1], self.kernel[1], self.stride[1])?,
    ))
  }

  /// Output size of a ceil-mode pooling window.

  pub fn pool_output(&self) -> Option<(usize, usize)> {
    let extent = |size: usize, kernel: usize, stride: usize| {
      (size >= kernel && stride > 0).then(|| (size - kernel + stride - 1) / stride + 1 )
    };
    Some((
      extent(self.height, self.kernel[0], self.stride[0])?,
      extent(self.width, self.kernel[1], self.stride[1])?,
    ))
  }

  // Image coordinates of a kernel tap, None when it falls into padding
  fn tap(&self, out_y: usize, out_x: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
    let y = (out_y * self.stride[0] + ky * self.dilation) as isize - self.padding[0] as isize;
    let x = (out_x * self.stride[1] + kx * self.dilation) as isize - self.padding[1] as isize;
    (y >= 0 && x >= 0 && (y as usize) < self.height && (x as usize) < self.width)
      .then(|| (y as usize, x as usize) )
  }

  /// Unfold one image into a `(out_h·out_w) × (channels·k1·k2)` patch matrix.

  pub fn im2col(&self, image: &[f64], channels: Range<usize>) -> Tensor {
    let (out_h, out_w) = self.conv_output().unwrap_or((0, 0));
    let [k1, k2] = self.kernel;
    let width = channels.len() * k1 * k2;
    let mut cols = Tensor::zeros(out_h * out_w, width);
    let raw = cols.raw_mut();
    for oy in 0..out_h {
      for ox in 0..out_w {
        let row = (oy * out_w + ox) * width;
        for (ci, c) in channels.clone().enumerate() {
          for ky in 0..k1 {
            for kx in 0..k2 {
              if let Some((y, x)) = self.tap(oy, ox, ky, kx) {
                raw[row + (ci * k1 + ky) * k2 + kx] = image[(c * self.height + y) * self.width + x];
              }
            }
          }
        }
      }
    }
    cols
  }

  /// Fold a patch matrix back onto an image, summing overlapping taps.

  pub fn col2im(&self, cols: &Tensor, channels: Range<usize>, image: &mut [f64]) {
    let (out_h, out_w) = self.conv_output().unwrap_or((0, 0));
    let [k1, k2] = self.kernel;
    let width = cols.cols();
    let raw = cols.raw();
    for oy in 0..out_h {
      for ox in 0..out_w {
        let row = (oy * out_w + ox) * width;
        for (ci, c) in channels.clone().enumerate() {
          for ky in 0..k1 {
            for kx in 0..k2 {
              if let Some((y, x)) = self.tap(oy, ox, ky, kx) {
                image[(c * self.height + y) * self.width + x] += raw[row + (ci * k1 + ky) * k2 + kx];
              }
            }
          }
        }
      }
    }
  }

  /// Maximum of every pooling window together with the
  /// flat image index it was taken from.

  pub fn pool_max(&self, image: &[f64]) -> (Vec<f64>, Vec<usize>) {
    let (out_h, out_w) = self.pool_output().unwrap_or((0, 0));
    let [k1, k2] = self.kernel;
    let mut values = Vec::with_capacity(self.channels * out_h * out_w);
    let mut indices = Vec::with_capacity(values.capacity());
    for c in 0..self.channels {
      for oy in 0..out_h {
        for ox in 0..out_w {
          let mut best = (f64::NEG_INFINITY, usize::MAX);
          for ky in 0..k1 {
            for kx in 0..k2 {
              let (y, x) = (oy * self.stride[0] + ky, ox * self.stride[1] + kx);
              if y >= self.height || x >= self.width { continue }
              let idx = (c * self.height + y) * self.width + x;
              if best.1 == usize::MAX || image[idx] > best.0 {
                best = (image[idx], idx);
              }
            }
          }
          values.push(best.0);
          indices.push(best.1);
        }
      }
    }
    (values, indices)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn window(height: usize, width: usize, kernel: usize, stride: usize, padding: usize) -> Window {
    Window {
      channels: 1,
      height,
      width,
      kernel: [kernel; 2],
      stride: [stride; 2],
      padding: [padding; 2],
      dilation: 1,
    }
  }

  #[test]
  fn output_sizes() {
    assert_eq!(window(5, 5, 3, 1, 0).conv_output(), Some((3, 3)));
    assert_eq!(window(5, 5, 3, 2, 1).conv_output(), Some((3, 3)));
    assert_eq!(window(5, 5, 2, 2, 0).pool_output(), Some((3, 3)));
    assert_eq!(window(2, 2, 3, 1, 0).conv_output(), None);
  }

  #[test]
  fn im2col_roundtrip_counts() {
    let w = window(3, 3, 2, 1, 0);
    let image: Vec<f64> = (0..9).map(|a| a as f64 ).collect();
    let cols = w.im2col(&image, 0..1);
    assert_eq!(cols.dims(), (4, 4));
    assert_eq!(cols.row_slice(0), &[0., 1., 3., 4.]);
    let mut folded = vec![0.0; 9];
    w.col2im(&Tensor::ones(4, 4), 0..1, &mut folded);
    // Center pixel is covered by all four windows
    assert_eq!(folded[4], 4.0);
    assert_eq!(folded[0], 1.0);
  }

  #[test]
  fn pool_ceil_mode() {
    let w = window(3, 3, 2, 2, 0);
    let image: Vec<f64> = (0..9).map(|a| a as f64 ).collect();
    let (values, indices) = w.pool_max(&image);
    assert_eq!(values, vec![4., 5., 7., 8.]);
    assert_eq!(indices, vec![4, 5, 7, 8]);
  }
}
