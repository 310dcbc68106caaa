use std::path::PathBuf;

use thiserror::Error;


/// Everything that can go wrong while building graphs, running layers
/// or reading and writing model files.

#[derive(Debug, Error)]
pub enum Error {
  #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
  ShapeMismatch {
    op: &'static str,
    lhs: (usize, usize),
    rhs: (usize, usize),
  },

  #[error("invalid axis {0}, expected 0 or 1")]
  InvalidAxis(usize),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("unsupported layer class \"{0}\"")]
  UnsupportedLayerClass(String),

  #[error("unsupported optimizer class \"{0}\"")]
  UnsupportedOptimizerClass(String),

  #[error("unsupported loss class \"{0}\"")]
  UnsupportedLossClass(String),

  #[error("unsupported scalar type tag {0}")]
  UnsupportedScalarType(u8),

  #[error("missing archive entry \"{0}\"")]
  MissingFile(String),

  #[error("model file {0} not found")]
  ModelNotFound(PathBuf),

  #[error("optimizer state has {actual} groups, parameters need {expected}")]
  StateMismatch {
    expected: usize,
    actual: usize,
  },

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("malformed record: {0}")]
  Format(#[from] postcard::Error),
}

impl Error {
  pub(crate) fn shape(op: &'static str, lhs: (usize, usize), rhs: (usize, usize)) -> Self {
    Self::ShapeMismatch { op, lhs, rhs }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
