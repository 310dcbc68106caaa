use std::ops::Range;

use itertools::Itertools;
use serde::{Serialize, Deserialize};

mod cops;
pub(crate) mod lops;

use crate::{
  internal::*,
  error::{ Error, Result },
};


/// Reduction direction of a 2-D [Tensor].
///
/// `Rows` (axis 0) collapses all rows into a single `1×c` row,
/// `Cols` (axis 1) collapses all columns into a single `r×1` column.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
  Rows,
  Cols,
}

impl Axis {
  pub fn new(axis: usize) -> Result<Self> {
    check_axis(axis)?;
    Ok(if axis == 0 { Self::Rows } else { Self::Cols })
  }

  pub fn index(self) -> usize {
    match self {
      Self::Rows => 0,
      Self::Cols => 1,
    }
  }
}


/// Dense, row-major matrix of 64 bit floats.
///
/// Tensors are plain values. Gradient tracking happens in a
/// [Graph](crate::Graph), which stores tensors as its leaves and
/// produces new ones from its operations.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
  rows: usize,
  cols: usize,
  data: Vec<f64>,
}

/// Output dimensions when broadcasting `lhs` and `rhs` against each other.

pub fn broadcast_dims(lhs: Dims, rhs: Dims) -> Option<Dims> {
  let dim = |a: usize, b: usize| {
    if a == b { Some(a) } else if a == 1 { Some(b) } else if b == 1 { Some(a) } else { None }
  };
  Some((dim(lhs.0, rhs.0)?, dim(lhs.1, rhs.1)?))
}

impl Tensor {
  pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
    assert_eq!(rows * cols, data.len(),
      "{rows}x{cols} doesn't match data length {}", data.len());
    Self { rows, cols, data }
  }

  pub fn scalar(item: f64) -> Self {
    Self::new(1, 1, vec![item])
  }

  pub fn row(row: &[f64]) -> Self {
    Self::new(1, row.len(), row.to_vec())
  }

  pub fn column(column: &[f64]) -> Self {
    Self::new(column.len(), 1, column.to_vec())
  }

  pub fn from_rows(rows: &[&[f64]]) -> Self {
    let cols = rows.first().map(|row| row.len() ).unwrap_or(0);
    assert!(rows.iter().all(|row| row.len() == cols ), "Rows must have equal length");
    Self::new(rows.len(), cols, rows.concat())
  }

  pub fn fill(rows: usize, cols: usize, filler: f64) -> Self {
    Self::new(rows, cols, vec![filler; rows * cols])
  }

  pub fn zeros(rows: usize, cols: usize) -> Self {
    Self::fill(rows, cols, 0.0)
  }

  pub fn ones(rows: usize, cols: usize) -> Self {
    Self::fill(rows, cols, 1.0)
  }

  pub fn init(rows: usize, cols: usize, mut cb: impl FnMut(usize, usize) -> f64) -> Self {
    let data = (0..rows).cartesian_product(0..cols).map(|(r, c)| cb(r, c) ).collect();
    Self::new(rows, cols, data)
  }

  pub fn hot_encode(idx: usize, rows: usize, cols: usize) -> Self {
    let mut out = Self::zeros(rows, cols);
    out.data[idx] = 1.0;
    out
  }

  pub fn randn(rows: usize, cols: usize) -> Self {
    let mut data: Vec<f64> = (0..(rows * cols + 1) / 2)
      .flat_map(|_| { let (a, b) = randn(); [a, b] } )
      .collect();
    data.truncate(rows * cols);
    Self::new(rows, cols, data)
  }

  pub fn uniform(rows: usize, cols: usize, low: f64, high: f64) -> Self {
    Self::init(rows, cols, |_, _| uniform(low, high) )
  }

  pub fn glorot_uniform(rows: usize, cols: usize) -> Self {
    let limit = (6.0 / (rows + cols) as f64).sqrt();
    Self::uniform(rows, cols, -limit, limit)
  }

  pub fn dims(&self) -> Dims {
    (self.rows, self.cols)
  }

  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn size(&self) -> usize {
    self.data.len()
  }

  pub fn raw(&self) -> &[f64] {
    &self.data
  }

  pub fn raw_mut(&mut self) -> &mut [f64] {
    &mut self.data
  }

  pub fn into_raw(self) -> Vec<f64> {
    self.data
  }

  pub fn at(&self, row: usize, col: usize) -> f64 {
    self.data[row * self.cols + col]
  }

  pub fn set(&mut self, row: usize, col: usize, value: f64) {
    self.data[row * self.cols + col] = value;
  }

  pub fn row_slice(&self, row: usize) -> &[f64] {
    &self.data[row * self.cols..(row + 1) * self.cols]
  }

  pub fn item(&self) -> f64 {
    assert!(self.size() == 1,
      "Can't extract item from non-scalar {}x{}", self.rows, self.cols);
    self.data[0]
  }

  pub fn refill(&mut self, filler: f64) {
    self.data.iter_mut().for_each(|a| *a = filler );
  }

  pub fn vectorize<F: FnMut(f64) -> f64>(&self, cb: F) -> Self {
    Self::new(self.rows, self.cols, self.data.iter().copied().map(cb).collect())
  }

  /// Combine two tensors elementwise, broadcasting
  /// rows or columns of size one where needed.
  ///
  /// # Panics
  ///
  /// If the shapes cannot be broadcast against each other. The
  /// arithmetic operators share this behaviour; [Tensor::try_zip]
  /// reports the mismatch as an error instead.

  pub fn zip<F: Fn(f64, f64) -> f64>(&self, rhs: &Self, cb: F) -> Self {
    self.try_zip(rhs, cb)
      .unwrap_or_else(|_| panic!("Cannot broadcast {:?} & {:?} tensors", self.dims(), rhs.dims()) )
  }

  pub fn try_zip<F: Fn(f64, f64) -> f64>(&self, rhs: &Self, cb: F) -> Result<Self> {
    if self.dims() == rhs.dims() {
      let data = self.data.iter().zip(&rhs.data).map(|(&a, &b)| cb(a, b) ).collect();
      return Ok(Self::new(self.rows, self.cols, data))
    }
    let (rows, cols) = broadcast_dims(self.dims(), rhs.dims())
      .ok_or_else(|| Error::shape("zip", self.dims(), rhs.dims()) )?;
    Ok(Self::init(rows, cols, |r, c| cb(self.broadcast_at(r, c), rhs.broadcast_at(r, c)) ))
  }

  fn broadcast_at(&self, row: usize, col: usize) -> f64 {
    let row = if self.rows == 1 { 0 } else { row };
    let col = if self.cols == 1 { 0 } else { col };
    self.at(row, col)
  }

  pub fn broadcast(&self, rows: usize, cols: usize) -> Result<Self> {
    if broadcast_dims(self.dims(), (rows, cols)) != Some((rows, cols)) {
      return Err(Error::shape("broadcast", self.dims(), (rows, cols)))
    }
    Ok(Self::init(rows, cols, |r, c| self.broadcast_at(r, c) ))
  }

  pub fn add_assign(&mut self, rhs: &Self) {
    assert_eq!(self.dims(), rhs.dims(), "Cannot accumulate mismatched tensors");
    self.data.iter_mut().zip(&rhs.data).for_each(|(a, b)| *a += b );
  }

  pub fn mm(&self, rhs: &Self) -> Result<Self> {
    if self.cols != rhs.rows { return Err(Error::shape("matmul", self.dims(), rhs.dims())) }
    Ok(Self::new(self.rows, rhs.cols, self.matmul(rhs)))
  }

  pub fn transpose(&self) -> Self {
    Self::init(self.cols, self.rows, |r, c| self.at(c, r) )
  }

  pub fn reshape(&self, rows: usize, cols: usize) -> Result<Self> {
    if rows * cols != self.size() { return Err(Error::shape("reshape", self.dims(), (rows, cols))) }
    Ok(Self::new(rows, cols, self.data.clone()))
  }

  pub fn add_row(&self, row: &Self) -> Result<Self> {
    if row.rows != 1 || row.cols != self.cols {
      return Err(Error::shape("add_row", self.dims(), row.dims()))
    }
    Ok(self.zip(row, |a, b| a + b ))
  }

  pub fn rows_range(&self, range: Range<usize>) -> Self {
    assert!(range.end <= self.rows, "Row range {range:?} out of bounds for {} rows", self.rows);
    let data = self.data[range.start * self.cols..range.end * self.cols].to_vec();
    Self::new(range.len(), self.cols, data)
  }

  pub fn cols_range(&self, range: Range<usize>) -> Self {
    assert!(range.end <= self.cols, "Column range {range:?} out of bounds for {} columns", self.cols);
    let width = range.len();
    Self::init(self.rows, width, |r, c| self.at(r, range.start + c) )
  }

  pub fn concat(&self, rhs: &Self, axis: usize) -> Result<Self> {
    self.concat_along(rhs, Axis::new(axis)?)
  }

  pub(crate) fn concat_along(&self, rhs: &Self, axis: Axis) -> Result<Self> {
    match axis {
      Axis::Rows => {
        if self.cols != rhs.cols { return Err(Error::shape("concat", self.dims(), rhs.dims())) }
        Ok(Self::new(self.rows + rhs.rows, self.cols, [&self.data[..], &rhs.data[..]].concat()))
      },
      Axis::Cols => {
        if self.rows != rhs.rows { return Err(Error::shape("concat", self.dims(), rhs.dims())) }
        let data = (0..self.rows)
          .flat_map(|r| self.row_slice(r).iter().chain(rhs.row_slice(r)).copied() )
          .collect();
        Ok(Self::new(self.rows, self.cols + rhs.cols, data))
      },
    }
  }

  pub fn exp(&self) -> Self {
    self.vectorize(f64::exp)
  }

  pub fn log(&self) -> Self {
    self.vectorize(f64::ln)
  }

  pub fn sqrt(&self) -> Self {
    self.vectorize(f64::sqrt)
  }

  pub fn powf(&self, exp: f64) -> Self {
    self.vectorize(|a| a.powf(exp) )
  }

  pub fn inv(&self) -> Self {
    self.vectorize(|a| 1.0 / a )
  }

  pub fn sqr(&self) -> Self {
    self.vectorize(|a| a * a )
  }

  pub fn sigmoid(&self) -> Self {
    self.vectorize(|a| 1.0 / (1.0 + (-a).exp()) )
  }

  pub fn tanh(&self) -> Self {
    self.vectorize(f64::tanh)
  }

  pub fn relu(&self) -> Self {
    self.vectorize(|a| a.max(0.0) )
  }

  pub fn softplus(&self) -> Self {
    // log(1 + e^x) without overflow for large x
    self.vectorize(|a| a.max(0.0) + (-a.abs()).exp().ln_1p() )
  }

  pub fn gelu(&self) -> Self {
    self.vectorize(|a| 0.5 * a * (1.0 + (GELU_C * (a + 0.044715 * a.powi(3))).tanh()) )
  }

  pub fn sum(&self, axis: usize) -> Result<Self> {
    Ok(self.sum_over(Axis::new(axis)?))
  }

  pub fn mean(&self, axis: usize) -> Result<Self> {
    Ok(self.mean_over(Axis::new(axis)?))
  }

  pub fn variance(&self, axis: usize, unbiased: bool) -> Result<Self> {
    Ok(self.variance_over(Axis::new(axis)?, unbiased))
  }

  pub fn max(&self, axis: usize) -> Result<Self> {
    Ok(self.max_over(Axis::new(axis)?))
  }

  pub fn softmax(&self, axis: usize) -> Result<Self> {
    Ok(self.softmax_over(Axis::new(axis)?))
  }

  pub fn log_softmax(&self, axis: usize) -> Result<Self> {
    Ok(self.log_softmax_over(Axis::new(axis)?))
  }

  pub(crate) fn collapse(&self, axis: Axis, cb: impl Fn(&mut dyn Iterator<Item = f64>) -> f64) -> Self {
    match axis {
      Axis::Rows => Self::init(1, self.cols, |_, c| cb(&mut (0..self.rows).map(|r| self.at(r, c) )) ),
      Axis::Cols => Self::init(self.rows, 1, |r, _| cb(&mut self.row_slice(r).iter().copied()) ),
    }
  }

  pub(crate) fn axis_len(&self, axis: Axis) -> usize {
    match axis {
      Axis::Rows => self.rows,
      Axis::Cols => self.cols,
    }
  }

  pub(crate) fn sum_over(&self, axis: Axis) -> Self {
    self.collapse(axis, |iter| iter.sum() )
  }

  pub(crate) fn mean_over(&self, axis: Axis) -> Self {
    let n = self.axis_len(axis) as f64;
    self.sum_over(axis).vectorize(|a| a / n )
  }

  pub(crate) fn variance_over(&self, axis: Axis, unbiased: bool) -> Self {
    let n = self.axis_len(axis);
    let div = if unbiased { n.saturating_sub(1).max(1) } else { n } as f64;
    let centered = self - &self.mean_over(axis);
    centered.sqr().sum_over(axis).vectorize(|a| a / div )
  }

  pub(crate) fn max_over(&self, axis: Axis) -> Self {
    self.collapse(axis, |iter| iter.fold(f64::NEG_INFINITY, f64::max) )
  }

  pub(crate) fn softmax_over(&self, axis: Axis) -> Self {
    let exp = (self - &self.max_over(axis)).exp();
    &exp / &exp.sum_over(axis)
  }

  pub(crate) fn log_softmax_over(&self, axis: Axis) -> Self {
    let shifted = self - &self.max_over(axis);
    let norm = shifted.exp().sum_over(axis).log();
    &shifted - &norm
  }

  /// Index of the largest element in every row.

  pub fn argmax(&self) -> Vec<usize> {
    (0..self.rows).map(|r| {
      self.row_slice(r).iter()
        .position_max_by(|a, b| a.total_cmp(b) )
        .unwrap_or(0)
    }).collect()
  }
}

pub(crate) const GELU_C: f64 = 0.7978845608028654; // sqrt(2 / pi)


macro_rules! add_operator {
  ($op:ident, $meth:ident, $symbol:tt) => {
    impl std::ops::$op for &Tensor { // &tensor * &other
      type Output = Tensor;

      fn $meth(self, rhs: Self) -> Tensor {
        self.zip(rhs, |a, b| a $symbol b )
      }
    }

    impl std::ops::$op for Tensor { // tensor * other
      type Output = Tensor;

      fn $meth(self, rhs: Self) -> Tensor {
        &self $symbol &rhs
      }
    }

    impl std::ops::$op<Tensor> for &Tensor { // &tensor * other
      type Output = Tensor;

      fn $meth(self, rhs: Tensor) -> Tensor {
        self $symbol &rhs
      }
    }

    impl std::ops::$op<&Tensor> for Tensor { // tensor * &other
      type Output = Tensor;

      fn $meth(self, rhs: &Tensor) -> Tensor {
        &self $symbol rhs
      }
    }

    impl std::ops::$op<f64> for &Tensor { // &tensor * f64
      type Output = Tensor;

      fn $meth(self, rhs: f64) -> Tensor {
        self.vectorize(|a| a $symbol rhs )
      }
    }

    impl std::ops::$op<f64> for Tensor { // tensor * f64
      type Output = Tensor;

      fn $meth(self, rhs: f64) -> Tensor {
        &self $symbol rhs
      }
    }
  };
}

// Tensor-tensor operators panic on shapes that cannot broadcast
add_operator!(Add, add, +);
add_operator!(Sub, sub, -);
add_operator!(Mul, mul, *);
add_operator!(Div, div, /);

impl std::ops::Neg for &Tensor {
  type Output = Tensor;

  fn neg(self) -> Tensor {
    self.vectorize(|a| -a )
  }
}

impl std::ops::Neg for Tensor {
  type Output = Tensor;

  fn neg(self) -> Tensor {
    -&self
  }
}

impl std::fmt::Display for Tensor {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    writeln!(f, "Tensor {}x{}", self.rows, self.cols)?;
    for r in 0..self.rows {
      let row = self.row_slice(r).iter().map(|a| format!("{a:.4}") ).join(", ");
      writeln!(f, "  [{row}]")?;
    }
    Ok(())
  }
}
