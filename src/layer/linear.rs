use crate::{
  internal::*,
  tensor::Tensor,
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param, flag, bool_arg },
  error::{ Error, Result },
};


/// Fully connected layer with fixed dimensions, computing `x·Wᵗ + b`.

#[derive(Debug, Clone)]
pub struct Linear {
  name: String,
  input: usize,
  output: usize,
  bias: bool,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl Linear {
  pub fn new(input: usize, output: usize) -> Self {
    Self {
      name: "linear".to_string(),
      input,
      output,
      bias: true,
      params: Self::init(input, output, true),
      frozen: false,
      trace: None,
    }
  }

  pub fn without_bias(mut self) -> Self {
    self.bias = false;
    self.params.truncate(1);
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let (input, output) = (arg(args, "input")?, arg(args, "output")?);
    let bias = flag(args, "bias");
    let mut loaded = vec![take_param(&mut params, "w", Some((output, input)))?];
    if bias {
      loaded.push(take_param(&mut params, "b", Some((1, output)))?);
    }
    Ok(Self {
      name: name.to_string(),
      input,
      output,
      bias,
      params: loaded,
      frozen: false,
      trace: None,
    })
  }

  fn init(input: usize, output: usize, bias: bool) -> Vec<Param> {
    let mut params = vec![Param::new("w", Tensor::glorot_uniform(output, input))];
    if bias {
      params.push(Param::new("b", Tensor::zeros(1, output)));
    }
    params
  }
}

impl Layer for Linear {
  named!("linear");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    if x.cols() != self.input {
      return Err(Error::shape("linear", x.dims(), (self.output, self.input)))
    }
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, params| {
      let w = graph.transpose(params[0])?;
      let y = graph.mm(x, w)?;
      match params.get(1) {
        Some(&b) => graph.broadcast_add(y, b),
        None => Ok(y),
      }
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "linear", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([
      ("input".to_string(), self.input as f32),
      ("output".to_string(), self.output as f32),
      ("bias".to_string(), bool_arg(self.bias)),
    ])
  }

  fn reset(&mut self) {
    self.params = Self::init(self.input, self.output, self.bias);
  }
}
