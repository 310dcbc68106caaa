use crate::tensor::Tensor;


impl Tensor {
  /// Raw matrix product. Callers check that inner dimensions agree.

  #[cfg(not(feature = "unsafe"))]
  pub(crate) fn matmul(&self, rhs: &Self) -> Vec<f64> {
    let (rows_l, cols_l) = self.dims();
    let cols_r = rhs.cols();

    let data_l = self.raw();
    let data_r = rhs.raw();

    let mut data = vec![0.0; rows_l * cols_r];
    for i in 0..rows_l {
      for k in 0..cols_l {
        let a = data_l[i * cols_l + k];
        for j in 0..cols_r {
          data[i * cols_r + j] += a * data_r[k * cols_r + j];
        }
      }
    }

    data
  }

  #[cfg(feature = "unsafe")]
  pub(crate) fn matmul(&self, rhs: &Self) -> Vec<f64> {
    let (rows_l, cols_l) = self.dims();
    let cols_r = rhs.cols();

    let mut data = vec![0.0; rows_l * cols_r];
    if data.is_empty() || cols_l == 0 { return data }

    // Both operands are dense and row-major
    unsafe {
      matrixmultiply::dgemm(
        rows_l,
        cols_l,
        cols_r,
        1.0,
        self.raw().as_ptr(),
        cols_l as isize,
        1,
        rhs.raw().as_ptr(),
        cols_r as isize,
        1,
        0.0,
        data.as_mut_ptr(),
        cols_r as isize,
        1,
      );
    }

    data
  }
}
