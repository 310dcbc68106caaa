use log::debug;

use crate::{
  internal::*,
  tensor::Tensor,
  variable::{ Graph, Variable },
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param, flag, bool_arg, hstack, vstack },
  error::{ Error, Result },
};

use super::dropout;

const ROPE_BASE: f64 = 10000.0;


/// Per-pass settings shared by both attention layers.

struct Heads {
  heads: usize,
  steps: usize,
  mask: Option<Tensor>,
  rope: Option<(Tensor, Tensor)>,
  keep: Option<f64>,
}

impl Heads {
  fn new(heads: usize, steps: usize, causal: bool, mask: Option<&Tensor>, dropout: f64, training: bool) -> Result<Self> {
    if !(0.0..1.0).contains(&dropout) {
      return Err(Error::InvalidArgument(format!("attention dropout {dropout} outside [0, 1)")))
    }
    let mask = match (causal, mask) {
      (true, Some(_)) => return Err(Error::InvalidArgument("causal attention does not take an explicit mask".to_string())),
      (true, None) => Some(causal_mask(steps)),
      (false, Some(mask)) if mask.dims() != (steps, steps) => return Err(Error::shape("attention", mask.dims(), (steps, steps))),
      (false, mask) => mask.cloned(),
    };
    let keep = if training && dropout > 0.0 { Some(1.0 - dropout) } else { None };
    Ok(Self { heads, steps, mask, rope: None, keep })
  }

  /// Scaled dot-product attention over a single `steps × width` sequence.
  /// Returns the merged heads along with every head's attention weights.

  fn attend(&self, graph: &mut Graph, q: Variable, k: Variable, v: Variable) -> Result<(Variable, Vec<Variable>)> {
    let head_dim = graph.dims(q).1 / self.heads;
    let mut outputs = Vec::with_capacity(self.heads);
    let mut weights = Vec::with_capacity(self.heads);
    for h in 0..self.heads {
      let range = h * head_dim..(h + 1) * head_dim;
      let mut qh = graph.cols(q, range.clone())?;
      let mut kh = graph.cols(k, range.clone())?;
      let vh = graph.cols(v, range)?;
      if let Some((cos, sin)) = &self.rope {
        qh = graph.rotary(qh, cos.clone(), sin.clone())?;
        kh = graph.rotary(kh, cos.clone(), sin.clone())?;
      }
      let kt = graph.transpose(kh)?;
      let scores = graph.mm(qh, kt)?;
      let mut scores = graph.scale(scores, 1.0 / (head_dim as f64).sqrt())?;
      if let Some(mask) = &self.mask {
        let mask = graph.input(mask.clone());
        scores = graph.add(scores, mask)?;
      }
      let probs = graph.softmax(scores, 1)?;
      weights.push(probs);
      let probs = match self.keep {
        Some(keep) => {
          let mask = graph.input(dropout::mask(self.steps, self.steps, keep));
          graph.mul(probs, mask)?
        },
        None => probs,
      };
      outputs.push(graph.mm(probs, vh)?);
    }
    Ok((hstack(graph, &outputs)?, weights))
  }
}

fn causal_mask(steps: usize) -> Tensor {
  Tensor::init(steps, steps, |r, c| if c > r { f64::NEG_INFINITY } else { 0.0 } )
}

fn check_steps(class: &'static str, x: &Tensor, dims: usize) -> Result<usize> {
  if dims == 0 || x.cols() % dims != 0 || x.cols() == 0 {
    return Err(Error::shape(class, x.dims(), (1, dims)))
  }
  Ok(x.cols() / dims)
}

fn check_heads(width: usize, heads: usize) -> Result<()> {
  if heads == 0 || width % heads != 0 {
    return Err(Error::InvalidArgument(format!("{width} dimensions can not be split into {heads} heads")))
  }
  Ok(())
}

fn affine(graph: &mut Graph, x: Variable, w: Variable, b: Variable) -> Result<Variable> {
  let y = graph.mm(x, w)?;
  graph.broadcast_add(y, b)
}


/// Multi-head attention with square query, key and value projections.
///
/// Every input row holds a sequence of `steps` vectors of size `dims`,
/// where `steps` is inferred from the row width. Scores are scaled by
/// the square root of the head size and can be masked, either causally
/// or by an additive `steps × steps` mask. Rotary position embeddings
/// are optional.

#[derive(Debug, Clone)]
pub struct Attention {
  name: String,
  dims: usize,
  heads: usize,
  dropout: f64,
  rope: bool,
  rope_base: f64,
  causal: bool,
  mask: Option<Tensor>,
  rope_cache: Option<(Tensor, Tensor)>,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl Attention {
  pub fn new(dims: usize, heads: usize) -> Result<Self> {
    check_heads(dims, heads)?;
    Ok(Self {
      name: "attention".to_string(),
      dims,
      heads,
      dropout: 0.0,
      rope: false,
      rope_base: ROPE_BASE,
      causal: false,
      mask: None,
      rope_cache: None,
      params: Self::init(dims),
      frozen: false,
      trace: None,
    })
  }

  pub fn with_dropout(mut self, dropout: f64) -> Self {
    self.dropout = dropout;
    self
  }

  pub fn with_rope(mut self) -> Self {
    self.rope = true;
    self
  }

  pub fn with_rope_base(mut self, base: f64) -> Self {
    self.rope_base = base;
    self.rope_cache = None;
    self
  }

  pub fn causal(mut self) -> Self {
    self.causal = true;
    self
  }

  /// Additive mask applied to the scores of every head.

  pub fn with_mask(mut self, mask: Tensor) -> Self {
    self.mask = Some(mask);
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let dims = arg(args, "dims")?;
    let mut layer = Self::new(dims, arg(args, "heads")?)?;
    layer.name = name.to_string();
    layer.dropout = arg_or(args, "dropout", 0.0) as f64;
    layer.rope = flag(args, "rope");
    layer.rope_base = arg_or(args, "rope_base", ROPE_BASE as f32) as f64;
    layer.causal = flag(args, "is_causal");
    layer.params = ["q", "k", "v"].iter()
      .map(|name| take_param(&mut params, name, Some((dims, dims))) )
      .collect::<Result<_>>()?;
    Ok(layer)
  }

  fn init(dims: usize) -> Vec<Param> {
    ["q", "k", "v"].iter().map(|name| Param::new(name, Tensor::glorot_uniform(dims, dims)) ).collect()
  }

  // Cosine and sine tables for the first `steps` positions,
  // rebuilt only when longer sequences come along.
  fn rope_tables(&mut self, steps: usize) -> Result<Option<(Tensor, Tensor)>> {
    if !self.rope { return Ok(None) }
    let head_dim = self.dims / self.heads;
    if head_dim % 2 != 0 {
      return Err(Error::InvalidArgument(format!("rotary embeddings need an even head size, got {head_dim}")))
    }
    let cached = self.rope_cache.as_ref().map(|(cos, _)| cos.rows() ).unwrap_or(0);
    if cached < steps {
      debug!("Regenerating rotary tables of {} for {steps} positions", self.name);
      let half = head_dim / 2;
      let base = self.rope_base;
      let angle = |p: usize, i: usize| p as f64 * base.powf(-2.0 * i as f64 / head_dim as f64);
      self.rope_cache = Some((
        Tensor::init(steps, half, |p, i| angle(p, i).cos() ),
        Tensor::init(steps, half, |p, i| angle(p, i).sin() ),
      ));
    }
    Ok(self.rope_cache.as_ref().map(|(cos, sin)| (cos.rows_range(0..steps), sin.rows_range(0..steps)) ))
  }

  fn heads(&mut self, x: &Tensor, training: bool) -> Result<Heads> {
    let steps = check_steps("attention", x, self.dims)?;
    let mut heads = Heads::new(self.heads, steps, self.causal, self.mask.as_ref(), self.dropout, training)?;
    heads.rope = self.rope_tables(steps)?;
    Ok(heads)
  }

  fn run(&self, graph: &mut Graph, x: Variable, p: &[Variable], heads: &Heads) -> Result<(Variable, Vec<Vec<Variable>>)> {
    let batch = graph.dims(x).0;
    let projections = p.iter()
      .map(|&w| graph.transpose(w) )
      .collect::<Result<Vec<_>>>()?;
    let mut rows = Vec::with_capacity(batch);
    let mut weights = Vec::with_capacity(batch);
    for b in 0..batch {
      let row = graph.rows(x, b..b + 1)?;
      let seq = graph.reshape(row, heads.steps, self.dims)?;
      let q = graph.mm(seq, projections[0])?;
      let k = graph.mm(seq, projections[1])?;
      let v = graph.mm(seq, projections[2])?;
      let (out, w) = heads.attend(graph, q, k, v)?;
      rows.push(graph.reshape(out, 1, heads.steps * self.dims)?);
      weights.push(w);
    }
    Ok((vstack(graph, &rows)?, weights))
  }

  /// Attention weights of every batch row and head, without dropout.

  pub fn score(&mut self, x: &Tensor) -> Result<Vec<Vec<Tensor>>> {
    let heads = self.heads(x, false)?;
    let mut graph = Graph::new();
    let input = graph.input(x.clone());
    let params: Vec<_> = self.params.iter().map(|p| graph.input(p.value.clone()) ).collect();
    let (_, weights) = self.run(&mut graph, input, &params, &heads)?;
    Ok(weights.iter()
      .map(|row| row.iter().map(|&w| graph.value(w).clone() ).collect() )
      .collect())
  }
}

impl Layer for Attention {
  named!("attention");
  parameterized!();

  fn forward(&mut self, x: &Tensor, training: bool) -> Result<Tensor> {
    let heads = self.heads(x, training)?;
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| {
      self.run(graph, x, p, &heads).map(|(out, _)| out )
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "attention", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([
      ("dims".to_string(), self.dims as f32),
      ("heads".to_string(), self.heads as f32),
      ("dropout".to_string(), self.dropout as f32),
      ("rope".to_string(), bool_arg(self.rope)),
      ("rope_base".to_string(), self.rope_base as f32),
      ("is_causal".to_string(), bool_arg(self.causal)),
    ])
  }

  fn reset(&mut self) {
    self.params = Self::init(self.dims);
  }
}


/// Multi-head self attention with biased projections into a
/// `hidden`-wide space and an output projection back.
///
/// Inputs hold `steps` vectors per row. Their size is taken
/// from the first forward pass.

#[derive(Debug, Clone)]
pub struct SelfAttention {
  name: String,
  hidden: usize,
  heads: usize,
  steps: usize,
  dropout: f64,
  causal: bool,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

const PROJECTIONS: [&str; 7] = ["Wq", "Wk", "Wv", "Bq", "Bk", "Bv", "Wo"];

impl SelfAttention {
  pub fn new(hidden: usize, heads: usize, steps: usize) -> Result<Self> {
    check_heads(hidden, heads)?;
    if steps == 0 { return Err(Error::InvalidArgument("self attention needs at least one step".to_string())) }
    Ok(Self {
      name: "self_attention".to_string(),
      hidden,
      heads,
      steps,
      dropout: 0.0,
      causal: false,
      params: Vec::new(),
      frozen: false,
      trace: None,
    })
  }

  pub fn with_dropout(mut self, dropout: f64) -> Self {
    self.dropout = dropout;
    self
  }

  pub fn causal(mut self) -> Self {
    self.causal = true;
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let mut layer = Self::new(arg(args, "hidden")?, arg(args, "heads")?, arg(args, "steps")?)?;
    layer.name = name.to_string();
    layer.dropout = arg_or(args, "dropout", 0.0) as f64;
    layer.causal = flag(args, "is_causal");
    if !params.is_empty() {
      let dims = params.iter()
        .find(|p| p.name == "Wq" )
        .map(|p| p.value.rows() )
        .ok_or_else(|| Error::InvalidArgument("missing parameter \"Wq\"".to_string()) )?;
      layer.params = Self::shapes(dims, layer.hidden).into_iter()
        .map(|(name, dims)| take_param(&mut params, name, Some(dims)) )
        .collect::<Result<_>>()?;
    }
    Ok(layer)
  }

  /// Size of the vectors making up a sequence, once bound.

  pub fn dims(&self) -> Option<usize> {
    self.params.first().map(|w| w.value.rows() )
  }

  fn shapes(dims: usize, hidden: usize) -> Vec<(&'static str, Dims)> {
    PROJECTIONS.iter().map(|&name| {
      let shape = match name {
        "Wo" => (hidden, dims),
        _ if name.starts_with('B') => (1, hidden),
        _ => (dims, hidden),
      };
      (name, shape)
    }).collect()
  }

  fn init(dims: usize, hidden: usize) -> Vec<Param> {
    Self::shapes(dims, hidden).into_iter().map(|(name, (rows, cols))| {
      let value = if rows == 1 { Tensor::zeros(rows, cols) } else { Tensor::glorot_uniform(rows, cols) };
      Param::new(name, value)
    }).collect()
  }

  fn bind(&mut self, x: &Tensor) -> Result<usize> {
    if x.cols() % self.steps != 0 || x.cols() == 0 {
      return Err(Error::shape("self_attention", x.dims(), (self.steps, self.dims().unwrap_or(0))))
    }
    let dims = x.cols() / self.steps;
    match self.dims() {
      Some(bound) if bound != dims => Err(Error::shape("self_attention", x.dims(), (self.steps, bound))),
      Some(_) => Ok(dims),
      None => {
        debug!("Binding {} to sequences of {} x {dims}", self.name, self.steps);
        self.params = Self::init(dims, self.hidden);
        Ok(dims)
      },
    }
  }
}

impl Layer for SelfAttention {
  named!("self_attention");
  parameterized!();

  fn forward(&mut self, x: &Tensor, training: bool) -> Result<Tensor> {
    let dims = self.bind(x)?;
    let (steps, hidden) = (self.steps, self.hidden);
    let heads = Heads::new(self.heads, steps, self.causal, None, self.dropout, training)?;
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, p| {
      let batch = graph.dims(x).0;
      let mut rows = Vec::with_capacity(batch);
      for b in 0..batch {
        let row = graph.rows(x, b..b + 1)?;
        let seq = graph.reshape(row, steps, dims)?;
        let q = affine(graph, seq, p[0], p[3])?;
        let k = affine(graph, seq, p[1], p[4])?;
        let v = affine(graph, seq, p[2], p[5])?;
        let (merged, _) = heads.attend(graph, q, k, v)?;
        debug_assert_eq!(graph.dims(merged), (steps, hidden));
        let out = graph.mm(merged, p[6])?;
        rows.push(graph.reshape(out, 1, steps * dims)?);
      }
      vstack(graph, &rows)
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "self_attention", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    Args::from([
      ("hidden".to_string(), self.hidden as f32),
      ("heads".to_string(), self.heads as f32),
      ("steps".to_string(), self.steps as f32),
      ("dropout".to_string(), self.dropout as f32),
      ("is_causal".to_string(), bool_arg(self.causal)),
    ])
  }

  fn reset(&mut self) {
    if let Some(dims) = self.dims() {
      self.params = Self::init(dims, self.hidden);
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use crate::layer::numeric_diff;

  #[test]
  fn shapes() {
    let mut attention = Attention::new(4, 2).unwrap();
    let y = attention.forward(&Tensor::randn(3, 20), true).unwrap();
    assert_eq!(y.dims(), (3, 20));
    assert_eq!(attention.backward(&Tensor::ones(3, 20)).unwrap().dims(), (3, 20));
    assert_eq!(attention.context().len(), 3);
    assert!(attention.forward(&Tensor::randn(3, 18), true).is_err());
    assert!(Attention::new(5, 2).is_err());
  }

  #[test]
  fn causal_weights() {
    let mut attention = Attention::new(4, 2).unwrap().causal();
    let weights = attention.score(&Tensor::randn(2, 12)).unwrap();
    assert_eq!(weights.len(), 2);
    assert_eq!(weights[0].len(), 2);
    for head in weights.iter().flatten() {
      assert_eq!(head.dims(), (3, 3));
      for r in 0..3 {
        assert_abs_diff_eq!(head.row_slice(r).iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for c in r + 1..3 {
          assert_eq!(head.at(r, c), 0.0);
        }
      }
    }
  }

  #[test]
  fn additive_mask() {
    let mask = Tensor::from_rows(&[&[0.0, f64::NEG_INFINITY], &[0.0, 0.0]]);
    let mut attention = Attention::new(2, 1).unwrap().with_mask(mask.clone());
    let weights = attention.score(&Tensor::randn(1, 4)).unwrap();
    assert_eq!(weights[0][0].at(0, 1), 0.0);
    let mut conflicting = Attention::new(2, 1).unwrap().with_mask(mask).causal();
    assert!(matches!(conflicting.forward(&Tensor::randn(1, 4), false), Err(Error::InvalidArgument(_))));
    let mut wrong_size = Attention::new(2, 1).unwrap().with_mask(Tensor::zeros(3, 3));
    assert!(wrong_size.forward(&Tensor::randn(1, 4), false).is_err());
  }

  #[test]
  fn rope_cache_grows_only() {
    let mut attention = Attention::new(4, 1).unwrap().with_rope();
    attention.forward(&Tensor::randn(1, 12), false).unwrap();
    assert_eq!(attention.rope_cache.as_ref().unwrap().0.dims(), (3, 2));
    attention.forward(&Tensor::randn(1, 8), false).unwrap();
    assert_eq!(attention.rope_cache.as_ref().unwrap().0.rows(), 3);
    attention.forward(&Tensor::randn(1, 20), false).unwrap();
    assert_eq!(attention.rope_cache.as_ref().unwrap().0.rows(), 5);
    let mut odd = Attention::new(6, 2).unwrap().with_rope();
    assert!(odd.forward(&Tensor::randn(1, 12), false).is_err());
  }

  #[test]
  fn attention_gradients() {
    let mut attention = Attention::new(4, 2).unwrap().with_rope().causal();
    let diff = numeric_diff(&mut attention, &Tensor::randn(2, 12));
    assert!(diff < 1e-5, "{diff}");
  }

  #[test]
  fn self_attention_binds_lazily() {
    let mut attention = SelfAttention::new(6, 3, 4).unwrap();
    assert!(attention.params().is_empty());
    let y = attention.forward(&Tensor::randn(2, 20), true).unwrap();
    assert_eq!(y.dims(), (2, 20));
    assert_eq!(attention.dims(), Some(5));
    let names: Vec<_> = attention.params().iter().map(|p| p.name.as_str() ).collect();
    assert_eq!(names, PROJECTIONS);
    assert!(attention.forward(&Tensor::randn(2, 24), true).is_err());
    let diff = numeric_diff(&mut attention, &Tensor::randn(2, 20));
    assert!(diff < 1e-5, "{diff}");
  }

  #[test]
  fn dropout_only_while_training() {
    let mut attention = Attention::new(2, 1).unwrap().with_dropout(0.5);
    let x = Tensor::randn(1, 6);
    let a = attention.forward(&x, false).unwrap();
    let b = attention.forward(&x, false).unwrap();
    assert_eq!(a, b);
    assert!(Attention::new(2, 1).unwrap().with_dropout(1.0).forward(&x, true).is_err());
  }
}
