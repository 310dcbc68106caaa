use crate::{
  internal::*,
  tensor::Tensor,
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param },
  error::{ Error, Result },
};


fn token_ids(x: &Tensor, num: usize) -> Result<Vec<usize>> {
  x.raw().iter().map(|&id| {
    if id < 0.0 || id.fract() != 0.0 || id >= num as f64 {
      return Err(Error::InvalidArgument(format!("invalid token id {id} for {num} embeddings")))
    }
    Ok(id as usize)
  }).collect()
}


/// Learned lookup table mapping token ids to dense vectors.
///
/// Every input row holds `steps` ids. The embeddings of a row are
/// placed side by side. The optional padding row never gets updated.

#[derive(Debug, Clone)]
pub struct Embedding {
  name: String,
  padding: Option<usize>,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl Embedding {
  pub fn new(num: usize, dim: usize) -> Self {
    Self {
      name: "embedding".to_string(),
      padding: None,
      params: vec![Param::new("w", Tensor::randn(num, dim))],
      frozen: false,
      trace: None,
    }
  }

  pub fn with_padding(mut self, padding: usize) -> Self {
    self.padding = Some(padding);
    let dim = self.dim();
    if padding < self.num() {
      for j in 0..dim {
        self.params[0].value.set(padding, j, 0.0);
      }
    }
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let (num, dim) = (arg(args, "num")?, arg(args, "dim")?);
    let padding = arg_or(args, "padding", -1.0);
    Ok(Self {
      name: name.to_string(),
      padding: if padding < 0.0 { None } else { Some(padding as usize) },
      params: vec![take_param(&mut params, "w", Some((num, dim)))?],
      frozen: false,
      trace: None,
    })
  }

  pub fn num(&self) -> usize {
    self.params[0].value.rows()
  }

  pub fn dim(&self) -> usize {
    self.params[0].value.cols()
  }

  pub fn padding(&self) -> Option<usize> {
    self.padding
  }
}

impl Layer for Embedding {
  named!("embedding");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    let indices = token_ids(x, self.num())?;
    let (steps, padding) = (x.cols(), self.padding);
    // Ids are constants, so the table is the only operand that needs a gradient
    let trace = Trace::record(x, &self.params, self.frozen, |graph, _, p| {
      graph.lookup(p[0], indices, steps, padding)
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "embedding", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([
      ("num".to_string(), self.num() as f32),
      ("dim".to_string(), self.dim() as f32),
      ("padding".to_string(), self.padding.map(|p| p as f32 ).unwrap_or(-1.0)),
    ])
  }

  fn reset(&mut self) {
    let (num, dim) = (self.num(), self.dim());
    self.params[0].value = Tensor::randn(num, dim);
    if let Some(padding) = self.padding.filter(|&p| p < num ) {
      for j in 0..dim {
        self.params[0].value.set(padding, j, 0.0);
      }
    }
  }
}
