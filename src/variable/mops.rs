use std::ops::Range;

use serde::{Serialize, Deserialize};

use crate::{
  internal::*,
  tensor::{ Tensor, Axis, GELU_C, broadcast_dims, lops::Window },
  variable::{ Graph, Variable, BinaryOp, UnaryOp },
  error::{ Error, Result },
};


impl Graph {
  // Additive ops give row vectors broadcast over rows the mean
  // of the incoming gradient, like `broadcast_add` does for biases.
  fn elementwise(&mut self, op: impl BinaryOp + 'static, name: &'static str, additive: bool, lhs: Variable, rhs: Variable) -> Result<Variable> {
    let (dims_l, dims_r) = (self.dims(lhs), self.dims(rhs));
    if dims_l == dims_r { return self.binary_op(op, lhs, rhs) }
    let (rows, cols) = broadcast_dims(dims_l, dims_r)
      .ok_or_else(|| Error::shape(name, dims_l, dims_r) )?;
    let lhs = self.stretch(lhs, rows, cols, additive)?;
    let rhs = self.stretch(rhs, rows, cols, additive)?;
    self.binary_op(op, lhs, rhs)
  }

  fn stretch(&mut self, lhs: Variable, rows: usize, cols: usize, additive: bool) -> Result<Variable> {
    let dims = self.dims(lhs);
    if dims == (rows, cols) { return Ok(lhs) }
    let mean_rows = additive && dims == (1, cols);
    self.unary_op(Expand { rows, cols, mean_rows }, lhs)
  }

  pub fn add(&mut self, lhs: Variable, rhs: Variable) -> Result<Variable> {
    self.elementwise(Add, "add", true, lhs, rhs)
  }

  pub fn sub(&mut self, lhs: Variable, rhs: Variable) -> Result<Variable> {
    self.elementwise(Sub, "sub", true, lhs, rhs)
  }

  pub fn mul(&mut self, lhs: Variable, rhs: Variable) -> Result<Variable> {
    self.elementwise(Mul, "mul", false, lhs, rhs)
  }

  pub fn div(&mut self, lhs: Variable, rhs: Variable) -> Result<Variable> {
    self.elementwise(Div, "div", false, lhs, rhs)
  }

  pub fn mm(&mut self, lhs: Variable, rhs: Variable) -> Result<Variable> {
    self.binary_op(MatMul, lhs, rhs)
  }

  /// Add a `1×c` row vector to every row of an `r×c` matrix.

  pub fn broadcast_add(&mut self, lhs: Variable, row: Variable) -> Result<Variable> {
    self.binary_op(BroadcastAdd, lhs, row)
  }

  pub fn concat(&mut self, lhs: Variable, rhs: Variable, axis: usize) -> Result<Variable> {
    self.binary_op(Concat { axis: Axis::new(axis)? }, lhs, rhs)
  }

  pub fn expand(&mut self, lhs: Variable, rows: usize, cols: usize) -> Result<Variable> {
    self.stretch(lhs, rows, cols, false)
  }

  pub fn exp(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Exp, lhs)
  }

  pub fn log(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Log, lhs)
  }

  pub fn sqrt(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Sqrt, lhs)
  }

  pub fn powf(&mut self, lhs: Variable, exp: f64) -> Result<Variable> {
    self.unary_op(Pow { exp }, lhs)
  }

  pub fn inv(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Inv, lhs)
  }

  pub fn scale(&mut self, lhs: Variable, factor: f64) -> Result<Variable> {
    self.unary_op(Scale { factor }, lhs)
  }

  pub fn shift(&mut self, lhs: Variable, offset: f64) -> Result<Variable> {
    self.unary_op(Shift { offset }, lhs)
  }

  pub fn sum(&mut self, lhs: Variable, axis: usize) -> Result<Variable> {
    self.unary_op(Sum { axis: Axis::new(axis)? }, lhs)
  }

  pub fn mean(&mut self, lhs: Variable, axis: usize) -> Result<Variable> {
    self.unary_op(Mean { axis: Axis::new(axis)? }, lhs)
  }

  /// Variance along `axis`, dividing by `n - 1` when `unbiased` is set.

  pub fn variance(&mut self, lhs: Variable, axis: usize, unbiased: bool) -> Result<Variable> {
    self.unary_op(Variance { axis: Axis::new(axis)?, unbiased }, lhs)
  }

  pub fn transpose(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Transpose, lhs)
  }

  pub fn reshape(&mut self, lhs: Variable, rows: usize, cols: usize) -> Result<Variable> {
    self.unary_op(Reshape { rows, cols }, lhs)
  }

  pub fn rows(&mut self, lhs: Variable, range: Range<usize>) -> Result<Variable> {
    self.unary_op(Slice { axis: Axis::Rows, range }, lhs)
  }

  pub fn cols(&mut self, lhs: Variable, range: Range<usize>) -> Result<Variable> {
    self.unary_op(Slice { axis: Axis::Cols, range }, lhs)
  }

  /// Gather rows of an embedding table. Every group of `steps`
  /// indices becomes one output row.

  pub fn lookup(&mut self, table: Variable, indices: Vec<usize>, steps: usize, padding: Option<usize>) -> Result<Variable> {
    self.unary_op(Lookup { indices, steps, padding }, table)
  }

  pub fn softmax(&mut self, lhs: Variable, axis: usize) -> Result<Variable> {
    self.unary_op(Softmax { axis: Axis::new(axis)? }, lhs)
  }

  pub fn sigmoid(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Sigmoid, lhs)
  }

  pub fn tanh(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Tanh, lhs)
  }

  pub fn relu(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(ReLU, lhs)
  }

  pub fn softplus(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(Softplus, lhs)
  }

  pub fn gelu(&mut self, lhs: Variable) -> Result<Variable> {
    self.unary_op(GELU, lhs)
  }

  /// Rotate consecutive column pairs of a `steps × dims` matrix
  /// by per-position angles.

  pub fn rotary(&mut self, lhs: Variable, cos: Tensor, sin: Tensor) -> Result<Variable> {
    self.unary_op(Rotary { cos, sin }, lhs)
  }

  pub fn conv2d(&mut self, input: Variable, kernels: Variable, window: Window, groups: usize) -> Result<Variable> {
    self.binary_op(Conv2d { window, groups }, input, kernels)
  }

  /// Transposed convolution. `window` describes the output images,
  /// whose convolution output has to match the input images.

  pub fn conv_transpose2d(&mut self, input: Variable, kernels: Variable, window: Window, groups: usize) -> Result<Variable> {
    self.binary_op(ConvTranspose2d { window, groups }, input, kernels)
  }
}


fn same_dims(op: &'static str, lhs: Dims, rhs: Dims) -> Result<Dims> {
  if lhs != rhs { return Err(Error::shape(op, lhs, rhs)) }
  Ok(lhs)
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Add;

impl BinaryOp for Add {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    same_dims("add", lhs, rhs)
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    lhs + rhs
  }

  fn derive(&self, _lhs: &Tensor, _rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor)
  {(
    grad.clone(),
    grad.clone(),
  )}
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sub;

impl BinaryOp for Sub {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    same_dims("sub", lhs, rhs)
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    lhs - rhs
  }

  fn derive(&self, _lhs: &Tensor, _rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor)
  {(
    grad.clone(),
    -grad
  )}
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mul;

impl BinaryOp for Mul {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    same_dims("mul", lhs, rhs)
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    lhs * rhs
  }

  fn derive(&self, lhs: &Tensor, rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor)
  {(
    grad * rhs,
    grad * lhs,
  )}
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Div;

impl BinaryOp for Div {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    same_dims("div", lhs, rhs)
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    lhs / rhs
  }

  fn derive(&self, lhs: &Tensor, rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor)
  {(
    grad / rhs,
    -grad * lhs / rhs / rhs
  )}
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatMul;

impl BinaryOp for MatMul {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    if lhs.1 != rhs.0 { return Err(Error::shape("matmul", lhs, rhs)) }
    Ok((lhs.0, rhs.1))
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    Tensor::new(lhs.rows(), rhs.cols(), lhs.matmul(rhs))
  }

  fn derive(&self, lhs: &Tensor, rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor) {
    let grad_l = Tensor::new(lhs.rows(), lhs.cols(), grad.matmul(&rhs.transpose()));
    let grad_r = Tensor::new(rhs.rows(), rhs.cols(), lhs.transpose().matmul(grad));
    (grad_l, grad_r)
  }
}


/// Row-vector bias addition.
///
/// The bias receives the column-wise mean of the incoming gradient
/// rather than its sum, which keeps bias steps independent of batch size.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastAdd;

impl BinaryOp for BroadcastAdd {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    if rhs != (1, lhs.1) { return Err(Error::shape("broadcast_add", lhs, rhs)) }
    Ok(lhs)
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    lhs + rhs
  }

  fn derive(&self, _lhs: &Tensor, _rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor)
  {(
    grad.clone(),
    grad.mean_over(Axis::Rows),
  )}
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concat {
  axis: Axis,
}

impl BinaryOp for Concat {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    match self.axis {
      Axis::Rows if lhs.1 == rhs.1 => Ok((lhs.0 + rhs.0, lhs.1)),
      Axis::Cols if lhs.0 == rhs.0 => Ok((lhs.0, lhs.1 + rhs.1)),
      _ => Err(Error::shape("concat", lhs, rhs)),
    }
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    lhs.concat_along(rhs, self.axis).unwrap_or_else(|_| Tensor::zeros(0, 0) )
  }

  fn derive(&self, lhs: &Tensor, _rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor) {
    match self.axis {
      Axis::Rows => (grad.rows_range(0..lhs.rows()), grad.rows_range(lhs.rows()..grad.rows())),
      Axis::Cols => (grad.cols_range(0..lhs.cols()), grad.cols_range(lhs.cols()..grad.cols())),
    }
  }
}


/// Grouped 2-D convolution over batches of flattened images.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
  window: Window,
  groups: usize,
}

impl Conv2d {
  fn layout(&self, kernels: &Tensor) -> (usize, usize, usize) {
    let (out_h, out_w) = self.window.conv_output().unwrap_or((0, 0));
    let channels = self.window.channels / self.groups;
    let out_channels = kernels.rows() / self.groups;
    (out_h * out_w, channels, out_channels)
  }
}

impl BinaryOp for Conv2d {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    let w = &self.window;
    let fits = self.groups > 0
      && w.channels % self.groups == 0
      && rhs.0 % self.groups == 0
      && lhs.1 == w.image_size()
      && rhs.1 == w.channels / self.groups * w.kernel[0] * w.kernel[1];
    match w.conv_output() {
      Some((out_h, out_w)) if fits => Ok((lhs.0, rhs.0 * out_h * out_w)),
      _ => Err(Error::shape("conv2d", lhs, rhs)),
    }
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let (positions, channels, out_channels) = self.layout(rhs);
    let mut out = Tensor::zeros(lhs.rows(), rhs.rows() * positions);
    for b in 0..lhs.rows() {
      for g in 0..self.groups {
        let cols = self.window.im2col(lhs.row_slice(b), g * channels..(g + 1) * channels);
        let kernels = rhs.rows_range(g * out_channels..(g + 1) * out_channels);
        let y = cols.matmul(&kernels.transpose());
        for p in 0..positions {
          for o in 0..out_channels {
            out.set(b, (g * out_channels + o) * positions + p, y[p * out_channels + o]);
          }
        }
      }
    }
    out
  }

  fn derive(&self, lhs: &Tensor, rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor) {
    let (positions, channels, out_channels) = self.layout(rhs);
    let size = self.window.image_size();
    let mut grad_l = Tensor::zeros(lhs.rows(), lhs.cols());
    let mut grad_r = Tensor::zeros(rhs.rows(), rhs.cols());
    for b in 0..lhs.rows() {
      for g in 0..self.groups {
        let range = g * channels..(g + 1) * channels;
        let cols = self.window.im2col(lhs.row_slice(b), range.clone());
        let kernels = rhs.rows_range(g * out_channels..(g + 1) * out_channels);
        let local = Tensor::init(positions, out_channels, |p, o| {
          grad.at(b, (g * out_channels + o) * positions + p)
        });
        let change = local.transpose().matmul(&cols);
        let offset = g * out_channels * rhs.cols();
        for (a, c) in grad_r.raw_mut()[offset..offset + change.len()].iter_mut().zip(change) {
          *a += c;
        }
        let patches = Tensor::new(positions, cols.cols(), local.matmul(&kernels));
        self.window.col2im(&patches, range, &mut grad_l.raw_mut()[b * size..(b + 1) * size]);
      }
    }
    (grad_l, grad_r)
  }
}


/// Grouped 2-D transposed convolution, the adjoint of [Conv2d]
/// with kernels of shape `in_channels × (out_channels/groups·k1·k2)`.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvTranspose2d {
  window: Window,
  groups: usize,
}

impl ConvTranspose2d {
  fn layout(&self, kernels: &Tensor) -> (usize, usize, usize) {
    let (in_h, in_w) = self.window.conv_output().unwrap_or((0, 0));
    (in_h * in_w, kernels.rows() / self.groups, self.window.channels / self.groups)
  }

  // Input channels of group `g` as a `positions × channels` matrix
  fn gather(&self, lhs: &Tensor, b: usize, g: usize, positions: usize, channels: usize) -> Tensor {
    Tensor::init(positions, channels, |p, i| lhs.at(b, (g * channels + i) * positions + p) )
  }
}

impl BinaryOp for ConvTranspose2d {
  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims> {
    let w = &self.window;
    let fits = self.groups > 0
      && w.channels % self.groups == 0
      && rhs.0 % self.groups == 0
      && rhs.1 == w.channels / self.groups * w.kernel[0] * w.kernel[1];
    match w.conv_output() {
      Some((in_h, in_w)) if fits && lhs.1 == rhs.0 * in_h * in_w => Ok((lhs.0, w.image_size())),
      _ => Err(Error::shape("conv_transpose2d", lhs, rhs)),
    }
  }

  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor {
    let (positions, in_channels, out_channels) = self.layout(rhs);
    let size = self.window.image_size();
    let mut out = Tensor::zeros(lhs.rows(), size);
    for b in 0..lhs.rows() {
      for g in 0..self.groups {
        let local = self.gather(lhs, b, g, positions, in_channels);
        let kernels = rhs.rows_range(g * in_channels..(g + 1) * in_channels);
        let patches = Tensor::new(positions, kernels.cols(), local.matmul(&kernels));
        let image = &mut out.raw_mut()[b * size..(b + 1) * size];
        self.window.col2im(&patches, g * out_channels..(g + 1) * out_channels, image);
      }
    }
    out
  }

  fn derive(&self, lhs: &Tensor, rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor) {
    let (positions, in_channels, out_channels) = self.layout(rhs);
    let mut grad_l = Tensor::zeros(lhs.rows(), lhs.cols());
    let mut grad_r = Tensor::zeros(rhs.rows(), rhs.cols());
    for b in 0..lhs.rows() {
      for g in 0..self.groups {
        let cols = self.window.im2col(grad.row_slice(b), g * out_channels..(g + 1) * out_channels);
        let kernels = rhs.rows_range(g * in_channels..(g + 1) * in_channels);
        let local = self.gather(lhs, b, g, positions, in_channels);
        let change = local.transpose().matmul(&cols);
        let offset = g * in_channels * rhs.cols();
        for (a, c) in grad_r.raw_mut()[offset..offset + change.len()].iter_mut().zip(change) {
          *a += c;
        }
        let back = cols.matmul(&kernels.transpose());
        for p in 0..positions {
          for i in 0..in_channels {
            grad_l.set(b, (g * in_channels + i) * positions + p, back[p * in_channels + i]);
          }
        }
      }
    }
    (grad_l, grad_r)
  }
}


/// Broadcast to a larger shape. Gradients get summed back down, or
/// averaged over rows with `mean_rows`.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expand {
  rows: usize,
  cols: usize,
  mean_rows: bool,
}

impl UnaryOp for Expand {
  fn dims(&self, input: Dims) -> Result<Dims> {
    match broadcast_dims(input, (self.rows, self.cols)) {
      Some(dims) if dims == (self.rows, self.cols) => Ok(dims),
      _ => Err(Error::shape("expand", input, (self.rows, self.cols))),
    }
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.broadcast(self.rows, self.cols).unwrap_or_else(|_| lhs.clone() )
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    let mut grad = grad.clone();
    if lhs.rows() == 1 && self.rows != 1 {
      grad = if self.mean_rows { grad.mean_over(Axis::Rows) } else { grad.sum_over(Axis::Rows) };
    }
    if lhs.cols() == 1 && self.cols != 1 {
      grad = grad.sum_over(Axis::Cols);
    }
    grad
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exp;

impl UnaryOp for Exp {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.exp()
  }

  fn derive(&self, _lhs: &Tensor, out: &Tensor, grad: &Tensor) -> Tensor {
    grad * out
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log;

impl UnaryOp for Log {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.log()
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad / lhs
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sqrt;

impl UnaryOp for Sqrt {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.sqrt()
  }

  fn derive(&self, _lhs: &Tensor, out: &Tensor, grad: &Tensor) -> Tensor {
    grad / (out * 2.0)
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pow {
  exp: f64,
}

impl UnaryOp for Pow {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.powf(self.exp)
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad * lhs.powf(self.exp - 1.0) * self.exp
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inv;

impl UnaryOp for Inv {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.inv()
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    -grad / lhs.sqr()
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scale {
  factor: f64,
}

impl UnaryOp for Scale {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs * self.factor
  }

  fn derive(&self, _lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad * self.factor
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
  offset: f64,
}

impl UnaryOp for Shift {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs + self.offset
  }

  fn derive(&self, _lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad.clone()
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sum {
  axis: Axis,
}

impl UnaryOp for Sum {
  fn dims(&self, input: Dims) -> Result<Dims> {
    Ok(collapsed(input, self.axis))
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.sum_over(self.axis)
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    uncollapse(lhs, grad)
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mean {
  axis: Axis,
}

impl UnaryOp for Mean {
  fn dims(&self, input: Dims) -> Result<Dims> {
    Ok(collapsed(input, self.axis))
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.mean_over(self.axis)
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    uncollapse(lhs, grad) / lhs.axis_len(self.axis) as f64
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variance {
  axis: Axis,
  unbiased: bool,
}

impl UnaryOp for Variance {
  fn dims(&self, input: Dims) -> Result<Dims> {
    Ok(collapsed(input, self.axis))
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.variance_over(self.axis, self.unbiased)
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    let n = lhs.axis_len(self.axis);
    let div = if self.unbiased { n.saturating_sub(1).max(1) } else { n } as f64;
    let centered = lhs - &lhs.mean_over(self.axis);
    centered * grad * (2.0 / div)
  }
}

fn collapsed(dims: Dims, axis: Axis) -> Dims {
  match axis {
    Axis::Rows => (1, dims.1),
    Axis::Cols => (dims.0, 1),
  }
}

fn uncollapse(tensor: &Tensor, grad: &Tensor) -> Tensor {
  grad.broadcast(tensor.rows(), tensor.cols()).unwrap_or_else(|_| grad.clone() )
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transpose;

impl UnaryOp for Transpose {
  fn dims(&self, input: Dims) -> Result<Dims> {
    Ok((input.1, input.0))
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.transpose()
  }

  fn derive(&self, _lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad.transpose()
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reshape {
  rows: usize,
  cols: usize,
}

impl UnaryOp for Reshape {
  fn dims(&self, input: Dims) -> Result<Dims> {
    if input.0 * input.1 != self.rows * self.cols {
      return Err(Error::shape("reshape", input, (self.rows, self.cols)))
    }
    Ok((self.rows, self.cols))
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    Tensor::new(self.rows, self.cols, lhs.raw().to_vec())
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    Tensor::new(lhs.rows(), lhs.cols(), grad.raw().to_vec())
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
  axis: Axis,
  range: Range<usize>,
}

impl UnaryOp for Slice {
  fn dims(&self, input: Dims) -> Result<Dims> {
    let len = self.range.end.saturating_sub(self.range.start);
    match self.axis {
      Axis::Rows if self.range.end <= input.0 => Ok((len, input.1)),
      Axis::Cols if self.range.end <= input.1 => Ok((input.0, len)),
      _ => Err(Error::shape("slice", input, (self.range.start, self.range.end))),
    }
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    match self.axis {
      Axis::Rows => lhs.rows_range(self.range.clone()),
      Axis::Cols => lhs.cols_range(self.range.clone()),
    }
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    let start = self.range.start;
    Tensor::init(lhs.rows(), lhs.cols(), |r, c| match self.axis {
      Axis::Rows if self.range.contains(&r) => grad.at(r - start, c),
      Axis::Cols if self.range.contains(&c) => grad.at(r, c - start),
      _ => 0.0,
    })
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lookup {
  indices: Vec<usize>,
  steps: usize,
  padding: Option<usize>,
}

impl UnaryOp for Lookup {
  fn dims(&self, input: Dims) -> Result<Dims> {
    if let Some(&idx) = self.indices.iter().find(|&&idx| idx >= input.0 ) {
      return Err(Error::InvalidArgument(format!("token {idx} out of range for {} embeddings", input.0)))
    }
    if self.steps == 0 || self.indices.len() % self.steps != 0 {
      return Err(Error::shape("lookup", input, (self.indices.len(), self.steps)))
    }
    Ok((self.indices.len() / self.steps, self.steps * input.1))
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    let rows = self.indices.len() / self.steps.max(1);
    let data = self.indices.iter().flat_map(|&idx| lhs.row_slice(idx).iter().copied() ).collect();
    Tensor::new(rows, self.steps * lhs.cols(), data)
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    let dim = lhs.cols();
    let mut out = Tensor::zeros(lhs.rows(), dim);
    for (i, &idx) in self.indices.iter().enumerate() {
      if Some(idx) == self.padding { continue }
      let offset = i * dim;
      let raw = out.raw_mut();
      for (j, g) in grad.raw()[offset..offset + dim].iter().enumerate() {
        raw[idx * dim + j] += g;
      }
    }
    out
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Softmax {
  axis: Axis,
}

impl UnaryOp for Softmax {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.softmax_over(self.axis)
  }

  fn derive(&self, _lhs: &Tensor, out: &Tensor, grad: &Tensor) -> Tensor {
    let dot = (grad * out).sum_over(self.axis);
    out * (grad - &dot)
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sigmoid;

impl UnaryOp for Sigmoid {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.sigmoid()
  }

  fn derive(&self, _lhs: &Tensor, out: &Tensor, grad: &Tensor) -> Tensor {
    grad * out.vectorize(|y| y * (1.0 - y) )
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tanh;

impl UnaryOp for Tanh {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.tanh()
  }

  fn derive(&self, _lhs: &Tensor, out: &Tensor, grad: &Tensor) -> Tensor {
    grad * out.vectorize(|y| 1.0 - y * y )
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReLU;

impl UnaryOp for ReLU {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.relu()
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad * lhs.vectorize(|x| if x > 0.0 { 1.0 } else { 0.0 } )
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Softplus;

impl UnaryOp for Softplus {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.softplus()
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad * lhs.sigmoid()
  }
}


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GELU;

impl GELU {
  pub(crate) fn slope(x: f64) -> f64 {
    let t = (GELU_C * (x + 0.044715 * x.powi(3))).tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * GELU_C * (1.0 + 3.0 * 0.044715 * x * x)
  }
}

impl UnaryOp for GELU {
  fn run(&self, lhs: &Tensor) -> Tensor {
    lhs.gelu()
  }

  fn derive(&self, lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    grad * lhs.vectorize(Self::slope)
  }
}


/// Rotary position embedding over a single `steps × dims` sequence.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rotary {
  cos: Tensor,
  sin: Tensor,
}

impl Rotary {
  fn rotate(&self, lhs: &Tensor, direction: f64) -> Tensor {
    let mut out = lhs.clone();
    for p in 0..lhs.rows() {
      for i in 0..self.cos.cols() {
        let (cos, sin) = (self.cos.at(p, i), self.sin.at(p, i) * direction);
        let (a, b) = (lhs.at(p, 2 * i), lhs.at(p, 2 * i + 1));
        out.set(p, 2 * i, a * cos - b * sin);
        out.set(p, 2 * i + 1, a * sin + b * cos);
      }
    }
    out
  }
}

impl UnaryOp for Rotary {
  fn dims(&self, input: Dims) -> Result<Dims> {
    if input.0 != self.cos.rows() || input.1 != 2 * self.cos.cols() {
      return Err(Error::shape("rotary", input, self.cos.dims()))
    }
    Ok(input)
  }

  fn run(&self, lhs: &Tensor) -> Tensor {
    self.rotate(lhs, 1.0)
  }

  fn derive(&self, _lhs: &Tensor, _out: &Tensor, grad: &Tensor) -> Tensor {
    self.rotate(grad, -1.0)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  const TOLERANCE: f64 = 1e-5;

  fn check(rows: usize, cols: usize, generator: impl Fn(&mut Graph, Variable) -> Result<Variable>) {
    let diff = Graph::check_gradients(rows, cols, generator).unwrap();
    assert!(diff < TOLERANCE, "Gradient mismatch {diff}");
  }

  fn positive(rows: usize, cols: usize) -> Tensor {
    Tensor::uniform(rows, cols, 0.5, 2.0)
  }

  #[test]
  fn add_sub() {
    for (rows, cols) in [(1, 1), (2, 3), (4, 2)] {
      let other = Tensor::randn(rows, cols);
      check(rows, cols, |g, x| { let c = g.input(other.clone()); g.add(x, c) });
      check(rows, cols, |g, x| { let c = g.input(other.clone()); g.sub(c, x) });
    }
  }

  #[test]
  fn mul_elem() {
    for (rows, cols) in [(1, 4), (3, 3)] {
      let other = Tensor::randn(rows, cols);
      check(rows, cols, |g, x| { let c = g.input(other.clone()); g.mul(x, c) });
      check(rows, cols, |g, x| g.mul(x, x) );
    }
  }

  #[test]
  fn matmul() {
    let rhs = Tensor::randn(3, 4);
    let lhs = Tensor::randn(5, 2);
    check(2, 3, |g, x| { let r = g.input(rhs.clone()); g.mm(x, r) });
    check(2, 3, |g, x| { let l = g.input(lhs.clone()); g.mm(l, x) });
  }

  #[test]
  fn matmul_shape_mismatch() {
    let mut graph = Graph::new();
    let a = graph.param(Tensor::zeros(2, 3));
    let b = graph.param(Tensor::zeros(2, 3));
    let len = graph.len();
    assert!(matches!(graph.mm(a, b), Err(Error::ShapeMismatch { op: "matmul", .. })));
    assert_eq!(graph.len(), len);
  }

  #[test]
  fn unary() {
    check(3, 2, |g, x| g.exp(x) );
    check(2, 2, |g, x| g.powf(x, 3.0) );
    check(2, 3, |g, x| g.sigmoid(x) );
    check(2, 3, |g, x| g.tanh(x) );
    check(2, 3, |g, x| g.softplus(x) );
    check(2, 3, |g, x| g.gelu(x) );
    check(2, 3, |g, x| g.scale(x, -1.5) );
  }

  #[test]
  fn positive_domain() {
    for op in 0..4 {
      let diff = Graph::check_gradients_at(&positive(2, 3), |g, x| match op {
        0 => g.sqrt(x),
        1 => g.inv(x),
        2 => g.log(x),
        _ => g.powf(x, 0.5),
      }).unwrap();
      assert!(diff < TOLERANCE, "Gradient mismatch {diff} for op {op}");
    }
  }

  #[test]
  fn inv_gradient_is_negative() {
    let mut graph = Graph::new();
    let x = graph.param(Tensor::row(&[2.0, -4.0]));
    let y = graph.inv(x).unwrap();
    graph.backward(y, &Tensor::ones(1, 2)).unwrap();
    assert_eq!(graph.grad(x), Some(&Tensor::row(&[-0.25, -0.0625])));
  }

  #[test]
  fn reductions() {
    for axis in [0, 1] {
      check(3, 4, |g, x| g.sum(x, axis) );
      check(3, 4, |g, x| g.mean(x, axis) );
      check(3, 4, |g, x| { let v = g.variance(x, axis, true)?; g.powf(v, 2.0) });
      check(3, 4, |g, x| { let v = g.variance(x, axis, false)?; g.powf(v, 2.0) });
      check(2, 5, |g, x| { let s = g.softmax(x, axis)?; g.powf(s, 2.0) });
    }
    let mut graph = Graph::new();
    let x = graph.param(Tensor::zeros(2, 2));
    assert!(matches!(graph.sum(x, 2), Err(Error::InvalidAxis(2))));
  }

  #[test]
  fn broadcast_add_uses_mean() {
    let mut graph = Graph::new();
    let x = graph.param(Tensor::zeros(2, 3));
    let b = graph.param(Tensor::zeros(1, 3));
    let y = graph.broadcast_add(x, b).unwrap();
    graph.backward(y, &Tensor::new(2, 3, vec![1., 2., 3., 3., 4., 5.])).unwrap();
    assert_eq!(graph.grad(b), Some(&Tensor::row(&[2., 3., 4.])));
    assert_eq!(graph.grad(x).unwrap().at(1, 2), 5.0);
    assert!(graph.broadcast_add(x, x).is_err());
  }

  #[test]
  fn add_sub_average_row_vectors() {
    let seed = Tensor::new(2, 3, vec![1., 2., 3., 3., 4., 5.]);
    let mut graph = Graph::new();
    let x = graph.param(Tensor::zeros(2, 3));
    let b = graph.param(Tensor::zeros(1, 3));
    let y = graph.add(x, b).unwrap();
    graph.backward(y, &seed).unwrap();
    assert_eq!(graph.grad(b), Some(&Tensor::row(&[2., 3., 4.])));
    assert_eq!(graph.grad(x), Some(&seed));

    let mut graph = Graph::new();
    let x = graph.param(Tensor::zeros(2, 3));
    let b = graph.param(Tensor::zeros(1, 3));
    let y = graph.sub(x, b).unwrap();
    graph.backward(y, &seed).unwrap();
    assert_eq!(graph.grad(b), Some(&Tensor::row(&[-2., -3., -4.])));

    let mut graph = Graph::new();
    let x = graph.param(Tensor::zeros(2, 3));
    let c = graph.param(Tensor::zeros(2, 1));
    let y = graph.sub(x, c).unwrap();
    graph.backward(y, &seed).unwrap();
    assert_eq!(graph.grad(c), Some(&Tensor::column(&[-6., -12.])));
  }

  #[test]
  fn broadcast_elementwise() {
    let row = Tensor::randn(1, 4);
    check(3, 1, |g, x| { let r = g.input(row.clone()); g.mul(x, r) });
    let matrix = Tensor::randn(3, 4);
    let diff = Graph::check_gradients_at(&positive(1, 4), |g, x| {
      let m = g.input(matrix.clone());
      g.div(m, x)
    }).unwrap();
    assert!(diff < TOLERANCE, "Gradient mismatch {diff}");
    let mut graph = Graph::new();
    let a = graph.param(Tensor::zeros(2, 3));
    let b = graph.param(Tensor::zeros(3, 2));
    assert!(graph.add(a, b).is_err());
  }

  #[test]
  fn layout() {
    check(3, 4, |g, x| { let t = g.transpose(x)?; g.powf(t, 2.0) });
    check(3, 4, |g, x| { let t = g.reshape(x, 2, 6)?; g.powf(t, 2.0) });
    check(4, 4, |g, x| { let t = g.rows(x, 1..3)?; g.powf(t, 2.0) });
    check(4, 4, |g, x| { let t = g.cols(x, 2..4)?; g.powf(t, 2.0) });
    let other = Tensor::randn(3, 2);
    check(3, 4, |g, x| { let o = g.input(other.clone()); let c = g.concat(x, o, 1)?; g.powf(c, 2.0) });
    check(2, 2, |g, x| { let c = g.concat(x, x, 0)?; g.powf(c, 3.0) });
  }

  #[test]
  fn lookup() {
    let mut graph = Graph::new();
    let table = graph.param(Tensor::new(3, 2, vec![1., 2., 3., 4., 5., 6.]));
    let out = graph.lookup(table, vec![2, 0, 0, 1], 2, Some(0)).unwrap();
    assert_eq!(graph.value(out), &Tensor::new(2, 4, vec![5., 6., 1., 2., 1., 2., 3., 4.]));
    graph.backward(out, &Tensor::ones(2, 4)).unwrap();
    assert_eq!(graph.grad(table), Some(&Tensor::new(3, 2, vec![0., 0., 1., 1., 1., 1.])));
    assert!(graph.lookup(table, vec![3], 1, None).is_err());
  }

  #[test]
  fn rotary() {
    let angles = Tensor::randn(3, 2);
    let (cos, sin) = (angles.vectorize(f64::cos), angles.vectorize(f64::sin));
    check(3, 4, |g, x| { let r = g.rotary(x, cos.clone(), sin.clone())?; g.powf(r, 3.0) });
  }

  #[test]
  fn conv2d() {
    let window = Window {
      channels: 2,
      height: 4,
      width: 4,
      kernel: [3, 2],
      stride: [1, 2],
      padding: [1, 0],
      dilation: 1,
    };
    let kernels = Tensor::randn(4, 6);
    check(2, 32, |g, x| { let k = g.input(kernels.clone()); let y = g.conv2d(x, k, window, 2)?; g.powf(y, 2.0) });
    let images = Tensor::randn(2, 32);
    check(4, 6, |g, k| { let x = g.input(images.clone()); let y = g.conv2d(x, k, window, 2)?; g.powf(y, 2.0) });
  }

  #[test]
  fn conv_transpose2d() {
    // 2 channels of 3×3 grow into 4 channels of 6×6
    let window = Window {
      channels: 4,
      height: 6,
      width: 6,
      kernel: [3, 3],
      stride: [2, 2],
      padding: [1, 1],
      dilation: 1,
    };
    let kernels = Tensor::randn(2, 18);
    check(2, 18, |g, x| { let k = g.input(kernels.clone()); let y = g.conv_transpose2d(x, k, window, 2)?; g.powf(y, 2.0) });
    let images = Tensor::randn(3, 18);
    check(2, 18, |g, k| { let x = g.input(images.clone()); let y = g.conv_transpose2d(x, k, window, 2)?; g.powf(y, 2.0) });

    let mut graph = Graph::new();
    let x = graph.input(images);
    let k = graph.param(kernels);
    let y = graph.conv_transpose2d(x, k, window, 2).unwrap();
    assert_eq!(graph.dims(y), (3, 144));
    let narrow = graph.input(Tensor::zeros(3, 17));
    assert!(graph.conv_transpose2d(narrow, k, window, 2).is_err());
  }
}
