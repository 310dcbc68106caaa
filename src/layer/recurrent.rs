use crate::{
  internal::*,
  tensor::Tensor,
  variable::{ Graph, Variable },
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param, hstack },
  error::{ Error, Result },
};


fn sequence_args(feature_size: usize, steps: usize, hidden: usize) -> Args {
  Args::from([
    ("feature_size".to_string(), feature_size as f32),
    ("steps".to_string(), steps as f32),
    ("hidden".to_string(), hidden as f32),
  ])
}

fn check_input(class: &'static str, x: &Tensor, feature_size: usize, steps: usize) -> Result<()> {
  if x.cols() != feature_size * steps {
    return Err(Error::shape(class, x.dims(), (steps, feature_size)))
  }
  Ok(())
}

// x·W + b
fn affine(graph: &mut Graph, x: Variable, w: Variable, b: Variable) -> Result<Variable> {
  let y = graph.mm(x, w)?;
  graph.broadcast_add(y, b)
}


/// Elman recurrent layer.
///
/// Input rows hold `steps` consecutive feature vectors. Each step computes
/// `h = tanh(x·Wih + Bih + h·Whh + Bhh)` with the same weights, and
/// the hidden states of all steps are returned side by side.

#[derive(Debug, Clone)]
pub struct Rnn {
  name: String,
  feature_size: usize,
  steps: usize,
  hidden: usize,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl Rnn {
  pub fn new(feature_size: usize, steps: usize, hidden: usize) -> Self {
    Self {
      name: "rnn".to_string(),
      feature_size,
      steps,
      hidden,
      params: Self::init(feature_size, hidden),
      frozen: false,
      trace: None,
    }
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let (feature_size, hidden) = (arg(args, "feature_size")?, arg(args, "hidden")?);
    let shapes = Self::shapes(feature_size, hidden);
    let params = shapes.iter()
      .map(|&(name, dims)| take_param(&mut params, name, Some(dims)) )
      .collect::<Result<_>>()?;
    Ok(Self {
      name: name.to_string(),
      feature_size,
      steps: arg(args, "steps")?,
      hidden,
      params,
      frozen: false,
      trace: None,
    })
  }

  fn shapes(feature_size: usize, hidden: usize) -> [(&'static str, Dims); 4] {
    [
      ("Wih", (feature_size, hidden)),
      ("Bih", (1, hidden)),
      ("Whh", (hidden, hidden)),
      ("Bhh", (1, hidden)),
    ]
  }

  fn init(feature_size: usize, hidden: usize) -> Vec<Param> {
    Self::shapes(feature_size, hidden).iter().map(|&(name, (rows, cols))| {
      let value = if rows == 1 { Tensor::zeros(rows, cols) } else { Tensor::glorot_uniform(rows, cols) };
      Param::new(name, value)
    }).collect()
  }
}

impl Layer for Rnn {
  named!("rnn");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    check_input("rnn", x, self.feature_size, self.steps)?;
    let (size, steps, hidden) = (self.feature_size, self.steps, self.hidden);
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| {
      let batch = graph.dims(x).0;
      let mut h = graph.input(Tensor::zeros(batch, hidden));
      let mut outputs = Vec::with_capacity(steps);
      for t in 0..steps {
        let xt = graph.cols(x, t * size..(t + 1) * size)?;
        let l1 = affine(graph, xt, p[0], p[1])?;
        let l2 = affine(graph, h, p[2], p[3])?;
        let sum = graph.add(l1, l2)?;
        h = graph.tanh(sum)?;
        outputs.push(h);
      }
      hstack(graph, &outputs)
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "rnn", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    sequence_args(self.feature_size, self.steps, self.hidden)
  }

  fn reset(&mut self) {
    self.params = Self::init(self.feature_size, self.hidden);
  }
}


/// Long short-term memory layer.
///
/// Gates see the current features concatenated with the previous hidden
/// state. Like [Rnn], weights are shared by all steps and the hidden
/// states of all steps make up the output.

#[derive(Debug, Clone)]
pub struct Lstm {
  name: String,
  feature_size: usize,
  steps: usize,
  hidden: usize,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

const GATES: [&str; 4] = ["i", "f", "g", "o"];

impl Lstm {
  pub fn new(feature_size: usize, steps: usize, hidden: usize) -> Self {
    Self {
      name: "lstm".to_string(),
      feature_size,
      steps,
      hidden,
      params: Self::init(feature_size, hidden),
      frozen: false,
      trace: None,
    }
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let (feature_size, hidden) = (arg(args, "feature_size")?, arg(args, "hidden")?);
    let params = Self::shapes(feature_size, hidden).into_iter()
      .map(|(name, dims)| take_param(&mut params, &name, Some(dims)) )
      .collect::<Result<_>>()?;
    Ok(Self {
      name: name.to_string(),
      feature_size,
      steps: arg(args, "steps")?,
      hidden,
      params,
      frozen: false,
      trace: None,
    })
  }

  // Wi, Wf, Wg, Wo followed by Bi, Bf, Bg, Bo
  fn shapes(feature_size: usize, hidden: usize) -> Vec<(String, Dims)> {
    let weights = GATES.iter().map(|gate| (format!("W{gate}"), (feature_size + hidden, hidden)) );
    let biases = GATES.iter().map(|gate| (format!("B{gate}"), (1, hidden)) );
    weights.chain(biases).collect()
  }

  fn init(feature_size: usize, hidden: usize) -> Vec<Param> {
    Self::shapes(feature_size, hidden).into_iter().map(|(name, (rows, cols))| {
      let value = if rows == 1 { Tensor::zeros(rows, cols) } else { Tensor::glorot_uniform(rows, cols) };
      Param::new(&name, value)
    }).collect()
  }
}

impl Layer for Lstm {
  named!("lstm");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    check_input("lstm", x, self.feature_size, self.steps)?;
    let (size, steps, hidden) = (self.feature_size, self.steps, self.hidden);
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| {
      let batch = graph.dims(x).0;
      let zeros = Tensor::zeros(batch, hidden);
      let mut h = graph.input(zeros.clone());
      let mut c = graph.input(zeros);
      let mut outputs = Vec::with_capacity(steps);
      for t in 0..steps {
        let xt = graph.cols(x, t * size..(t + 1) * size)?;
        let z = graph.concat(xt, h, 1)?;
        let i = affine(graph, z, p[0], p[4])?;
        let i = graph.sigmoid(i)?;
        let f = affine(graph, z, p[1], p[5])?;
        let f = graph.sigmoid(f)?;
        let g = affine(graph, z, p[2], p[6])?;
        let g = graph.tanh(g)?;
        let o = affine(graph, z, p[3], p[7])?;
        let o = graph.sigmoid(o)?;
        let kept = graph.mul(f, c)?;
        let added = graph.mul(i, g)?;
        c = graph.add(kept, added)?;
        let squashed = graph.tanh(c)?;
        h = graph.mul(o, squashed)?;
        outputs.push(h);
      }
      hstack(graph, &outputs)
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "lstm", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    sequence_args(self.feature_size, self.steps, self.hidden)
  }

  fn reset(&mut self) {
    self.params = Self::init(self.feature_size, self.hidden);
  }
}
