use crate::{
  internal::*,
  tensor::Tensor,
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param },
  error::{ Error, Result },
};

const EPSILON: f64 = 1e-9;


fn check_dims(class: &'static str, x: &Tensor, dims: usize) -> Result<()> {
  if x.cols() != dims { return Err(Error::shape(class, x.dims(), (1, dims))) }
  Ok(())
}


/// Normalizes every row to zero mean and unit (population)
/// variance, followed by a learned elementwise scale.

#[derive(Debug, Clone)]
pub struct LayerNorm {
  name: String,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl LayerNorm {
  pub fn new(dims: usize) -> Self {
    Self {
      name: "layer_norm".to_string(),
      params: vec![Param::new("a", Tensor::ones(1, dims))],
      frozen: false,
      trace: None,
    }
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let dims = arg(args, "dims")?;
    Ok(Self {
      name: name.to_string(),
      params: vec![take_param(&mut params, "a", Some((1, dims)))?],
      frozen: false,
      trace: None,
    })
  }

  pub fn dims(&self) -> usize {
    self.params[0].value.cols()
  }
}

impl Layer for LayerNorm {
  named!("layer_norm");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    check_dims("layer_norm", x, self.dims())?;
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| {
      let mean = graph.mean(x, 1)?;
      let centered = graph.sub(x, mean)?;
      let variance = graph.variance(x, 1, false)?;
      let variance = graph.shift(variance, EPSILON)?;
      let deviation = graph.sqrt(variance)?;
      let normalized = graph.div(centered, deviation)?;
      graph.mul(normalized, p[0])
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "layer_norm", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([("dims".to_string(), self.dims() as f32)])
  }

  fn reset(&mut self) {
    self.params[0].value.refill(1.0);
  }
}


/// Scales every row by the inverse of its root mean square,
/// followed by a learned elementwise scale. No bias.

#[derive(Debug, Clone)]
pub struct RMSNorm {
  name: String,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl RMSNorm {
  pub fn new(dims: usize) -> Self {
    Self {
      name: "rms_norm".to_string(),
      params: vec![Param::new("a", Tensor::ones(1, dims))],
      frozen: false,
      trace: None,
    }
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let dims = arg(args, "dims")?;
    Ok(Self {
      name: name.to_string(),
      params: vec![take_param(&mut params, "a", Some((1, dims)))?],
      frozen: false,
      trace: None,
    })
  }

  pub fn dims(&self) -> usize {
    self.params[0].value.cols()
  }
}

impl Layer for RMSNorm {
  named!("rms_norm");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    check_dims("rms_norm", x, self.dims())?;
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| {
      let squares = graph.powf(x, 2.0)?;
      let mean = graph.mean(squares, 1)?;
      let mean = graph.shift(mean, EPSILON)?;
      let factor = graph.powf(mean, -0.5)?;
      let normalized = graph.mul(x, factor)?;
      graph.mul(normalized, p[0])
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "rms_norm", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([("dims".to_string(), self.dims() as f32)])
  }

  fn reset(&mut self) {
    self.params[0].value.refill(1.0);
  }
}


/// Residual gate multiplying its input by a single
/// learned scalar, which starts out at zero.

#[derive(Debug, Clone)]
pub struct ReZero {
  name: String,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl ReZero {
  pub fn new() -> Self {
    Self {
      name: "rezero".to_string(),
      params: vec![Param::new("scale", Tensor::scalar(0.0))],
      frozen: false,
      trace: None,
    }
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>) -> Result<Self> {
    Ok(Self {
      name: name.to_string(),
      params: vec![take_param(&mut params, "scale", Some((1, 1)))?],
      frozen: false,
      trace: None,
    })
  }
}

impl Default for ReZero {
  fn default() -> Self {
    Self::new()
  }
}

impl Layer for ReZero {
  named!("rezero");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| graph.mul(x, p[0]) )?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "rezero", grad, &mut self.params)
  }

  fn reset(&mut self) {
    self.params[0].value.refill(0.0);
  }
}
