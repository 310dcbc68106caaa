use std::sync::Arc;
use std::fmt::Debug;

use log::debug;

mod mops;

pub use mops::*;

use crate::{
  internal::*,
  tensor::Tensor,
  error::{ Error, Result },
};


/// Unary computational operation that can also compute its derivative.

pub trait UnaryOp: Debug + Send + Sync {
  /// Validate the operand shape and return the output shape.

  fn dims(&self, input: Dims) -> Result<Dims> {
    Ok(input)
  }

  fn run(&self, lhs: &Tensor) -> Tensor;
  fn derive(&self, lhs: &Tensor, out: &Tensor, grad: &Tensor) -> Tensor;
}


/// Binary computational operation that can also compute its derivative.

pub trait BinaryOp: Debug + Send + Sync {
  /// Validate both operand shapes and return the output shape.
  /// Gets called before any numeric work is done.

  fn dims(&self, lhs: Dims, rhs: Dims) -> Result<Dims>;
  fn run(&self, lhs: &Tensor, rhs: &Tensor) -> Tensor;
  fn derive(&self, lhs: &Tensor, rhs: &Tensor, grad: &Tensor) -> (Tensor, Tensor);
}


#[derive(Debug, Clone)]
enum Op {
  Unary(Arc<dyn UnaryOp>, Variable),
  Binary(Arc<dyn BinaryOp>, Variable, Variable),
}

impl Op {
  fn operands(&self) -> Vec<Variable> {
    match self {
      Self::Unary(_, a) => vec![*a],
      Self::Binary(_, a, b) => vec![*a, *b],
    }
  }
}


/// Node in a computation graph, containing a tensor's data and gradient,
/// as well as the operation used to create it.

#[derive(Debug, Clone)]
struct Node {
  data: Tensor,
  grad: Option<Tensor>,
  op: Option<Op>,
  tracked: bool,
  trainable: bool,
}

impl Node {
  fn add_grad(&mut self, change: &Tensor) {
    match &mut self.grad {
      Some(grad) => grad.add_assign(change),
      None => self.grad = Some(change.clone()),
    }
  }
}


/// Handle to a value stored in a [Graph].
///
/// Handles are plain indices and only meaningful for
/// the graph that created them.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(usize);

impl Variable {
  pub fn id(&self) -> usize {
    self.0
  }
}


/// Arena holding a dynamically built computation graph.
///
/// Operations always reference nodes created before them, so
/// insertion order is a valid topological order. Backward passes
/// walk the arena in reverse, accumulating each node's gradient
/// completely before pushing it on to the node's operands.

#[derive(Debug, Clone, Default)]
pub struct Graph {
  nodes: Vec<Node>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  fn leaf(&mut self, data: Tensor, tracked: bool, trainable: bool) -> Variable {
    self.nodes.push(Node { data, grad: None, op: None, tracked, trainable });
    Variable(self.nodes.len() - 1)
  }

  /// Constant leaf that receives no gradient.

  pub fn input(&mut self, data: Tensor) -> Variable {
    self.leaf(data, false, false)
  }

  /// Leaf that receives gradients, without being a parameter.

  pub fn tracked(&mut self, data: Tensor) -> Variable {
    self.leaf(data, true, false)
  }

  /// Trainable leaf.

  pub fn param(&mut self, data: Tensor) -> Variable {
    self.leaf(data, true, true)
  }

  pub fn value(&self, var: Variable) -> &Tensor {
    &self.nodes[var.0].data
  }

  pub fn dims(&self, var: Variable) -> Dims {
    self.nodes[var.0].data.dims()
  }

  pub fn grad(&self, var: Variable) -> Option<&Tensor> {
    self.nodes[var.0].grad.as_ref()
  }

  pub fn is_tracked(&self, var: Variable) -> bool {
    self.nodes[var.0].tracked
  }

  /// Replace the value of a node. Call [forward](Self::forward)
  /// afterwards to propagate the change.

  pub fn assign(&mut self, var: Variable, data: Tensor) -> Result<()> {
    let node = &mut self.nodes[var.0];
    if node.data.dims() != data.dims() {
      return Err(Error::shape("assign", node.data.dims(), data.dims()))
    }
    node.data = data;
    Ok(())
  }

  /// Add a change into a node's gradient, creating it if necessary.

  pub fn add_grad(&mut self, var: Variable, change: &Tensor) -> Result<()> {
    let node = &mut self.nodes[var.0];
    if node.data.dims() != change.dims() {
      return Err(Error::shape("add_grad", node.data.dims(), change.dims()))
    }
    node.add_grad(change);
    Ok(())
  }

  pub fn unary_op(&mut self, op: impl UnaryOp + 'static, lhs: Variable) -> Result<Variable> {
    op.dims(self.dims(lhs))?;
    let data = op.run(self.value(lhs));
    let tracked = self.is_tracked(lhs);
    self.nodes.push(Node {
      data,
      grad: None,
      op: Some(Op::Unary(Arc::new(op), lhs)),
      tracked,
      trainable: false,
    });
    Ok(Variable(self.nodes.len() - 1))
  }

  pub fn binary_op(&mut self, op: impl BinaryOp + 'static, lhs: Variable, rhs: Variable) -> Result<Variable> {
    op.dims(self.dims(lhs), self.dims(rhs))?;
    let data = op.run(self.value(lhs), self.value(rhs));
    let tracked = self.is_tracked(lhs) || self.is_tracked(rhs);
    self.nodes.push(Node {
      data,
      grad: None,
      op: Some(Op::Binary(Arc::new(op), lhs, rhs)),
      tracked,
      trainable: false,
    });
    Ok(Variable(self.nodes.len() - 1))
  }

  /// Reevaluate every operation from the current leaf values.

  pub fn forward(&mut self) {
    for i in 0..self.nodes.len() {
      let value = match &self.nodes[i].op {
        None => continue,
        Some(Op::Unary(op, lhs)) => op.run(&self.nodes[lhs.0].data),
        Some(Op::Binary(op, lhs, rhs)) => op.run(&self.nodes[lhs.0].data, &self.nodes[rhs.0].data),
      };
      self.nodes[i].data = value;
    }
  }

  /// Propagate `seed` from `root` to every tracked node it depends on.
  ///
  /// Gradients add up across calls. Use [zero_grad](Self::zero_grad)
  /// between independent passes.

  pub fn backward(&mut self, root: Variable, seed: &Tensor) -> Result<()> {
    if self.dims(root) != seed.dims() {
      return Err(Error::shape("backward", self.dims(root), seed.dims()))
    }
    if !self.is_tracked(root) {
      debug!("Skipping backward pass from untracked node {}", root.0);
      return Ok(())
    }
    let mut pending: Vec<Option<Tensor>> = vec![None; root.0 + 1];
    pending[root.0] = Some(seed.clone());
    for i in (0..=root.0).rev() {
      let Some(grad) = pending[i].take() else { continue };
      self.nodes[i].add_grad(&grad);
      let Some(op) = &self.nodes[i].op else { continue };
      let changes = match op {
        Op::Unary(op, lhs) => {
          vec![op.derive(&self.nodes[lhs.0].data, &self.nodes[i].data, &grad)]
        },
        Op::Binary(op, lhs, rhs) => {
          let (l, r) = op.derive(&self.nodes[lhs.0].data, &self.nodes[rhs.0].data, &grad);
          vec![l, r]
        },
      };
      for (change, prev) in changes.into_iter().zip(op.operands()) {
        if !self.nodes[prev.0].tracked { continue }
        match &mut pending[prev.0] {
          Some(acc) => acc.add_assign(&change),
          slot => *slot = Some(change),
        }
      }
    }
    Ok(())
  }

  /// Set all gradients in this graph to zero.

  pub fn zero_grad(&mut self) {
    for node in &mut self.nodes {
      if let Some(grad) = &mut node.grad {
        grad.refill(0.0);
      }
    }
  }

  /// List all trainable parameters in this graph.

  pub fn parameters(&self) -> Vec<Variable> {
    self.nodes.iter()
      .enumerate()
      .filter(|(_, node)| node.trainable )
      .map(|(i, _)| Variable(i) )
      .collect()
  }

  pub fn inputs(&self) -> Vec<Variable> {
    self.nodes.iter()
      .enumerate()
      .filter(|(_, node)| node.op.is_none() && !node.trainable )
      .map(|(i, _)| Variable(i) )
      .collect()
  }

  /// Compute a function's gradient with respect to a generated
  /// input numerically and compare it to the automatically derived
  /// solution.
  ///
  /// Returns the mean absolute difference between both gradients
  /// of the sum over all outputs.

  pub fn check_gradients<F>(rows: usize, cols: usize, generator: F) -> Result<f64>
  where
    F: Fn(&mut Graph, Variable) -> Result<Variable>
  {
    Self::check_gradients_at(&Tensor::randn(rows, cols), generator)
  }

  pub fn check_gradients_at<F>(input: &Tensor, generator: F) -> Result<f64>
  where
    F: Fn(&mut Graph, Variable) -> Result<Variable>
  {
    let eps = 1e-6;
    let mut graph = Graph::new();
    let x = graph.param(input.clone());
    let y = generator(&mut graph, x)?;
    let (rows, cols) = graph.dims(y);
    graph.backward(y, &Tensor::ones(rows, cols))?;
    let grad = graph.grad(x).cloned().unwrap_or_else(|| Tensor::zeros(input.rows(), input.cols()) );

    // Central differences, re-running the recorded graph
    let perturb = |graph: &mut Graph, i: usize, delta: f64| -> Result<f64> {
      let mut shifted = input.clone();
      shifted.raw_mut()[i] += delta;
      graph.assign(x, shifted)?;
      graph.forward();
      Ok(graph.value(y).raw().iter().sum())
    };
    let mut diff = 0.0;
    for i in 0..input.size() {
      let next = perturb(&mut graph, i, eps)?;
      let prev = perturb(&mut graph, i, -eps)?;
      diff += ((next - prev) / (2.0 * eps) - grad.raw()[i]).abs();
    }
    Ok(diff / input.size().max(1) as f64)
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;

  #[test]
  fn x_squared() {
    let mut graph = Graph::new();
    let x = graph.param(Tensor::row(&[3.0, 5.0]));
    let sq = graph.mul(x, x).unwrap();
    let z = graph.shift(sq, 2.0).unwrap();
    graph.backward(z, &Tensor::ones(1, 2)).unwrap();
    assert_eq!(graph.value(z), &Tensor::row(&[11.0, 27.0]));
    assert_eq!(graph.grad(x), Some(&Tensor::row(&[6.0, 10.0])));
  }

  #[test]
  fn diamond_counts_each_edge_once() {
    // y = (x * 2) + (x * 3), dy/dx = 5
    let mut graph = Graph::new();
    let x = graph.param(Tensor::scalar(1.5));
    let a = graph.scale(x, 2.0).unwrap();
    let b = graph.scale(x, 3.0).unwrap();
    let c = graph.add(a, b).unwrap();
    let d = graph.mul(c, c).unwrap();
    graph.backward(d, &Tensor::scalar(1.0)).unwrap();
    // d = 25 x^2, dd/dx = 50 x
    assert_abs_diff_eq!(graph.grad(x).unwrap().item(), 75.0, epsilon = 1e-12);
  }

  #[test]
  fn gradients_accumulate_until_zeroed() {
    let mut graph = Graph::new();
    let w = graph.param(Tensor::new(2, 2, vec![1., 2., 3., 4.]));
    let x = graph.input(Tensor::new(1, 2, vec![0.5, -1.0]));
    let y = graph.mm(x, w).unwrap();
    let seed = Tensor::row(&[1.0, 2.0]);

    graph.zero_grad();
    graph.backward(y, &seed).unwrap();
    let first = graph.grad(w).cloned().unwrap();

    graph.zero_grad();
    graph.backward(y, &seed).unwrap();
    assert_eq!(graph.grad(w), Some(&first));

    graph.backward(y, &seed).unwrap();
    assert_eq!(graph.grad(w), Some(&(&first * 2.0)));

    graph.zero_grad();
    graph.zero_grad();
    assert_eq!(graph.grad(w), Some(&Tensor::zeros(2, 2)));
    assert_eq!(graph.grad(x), None);
  }

  #[test]
  fn forward_reevaluates() {
    let mut graph = Graph::new();
    let x = graph.input(Tensor::scalar(2.0));
    let y = graph.powf(x, 3.0).unwrap();
    assert_eq!(graph.value(y).item(), 8.0);
    graph.assign(x, Tensor::scalar(3.0)).unwrap();
    graph.forward();
    assert_eq!(graph.value(y).item(), 27.0);
    assert!(graph.assign(x, Tensor::zeros(2, 1)).is_err());
  }

  #[test]
  fn constants_get_no_gradient() {
    let mut graph = Graph::new();
    let x = graph.input(Tensor::scalar(2.0));
    let w = graph.param(Tensor::scalar(3.0));
    let y = graph.mul(x, w).unwrap();
    graph.backward(y, &Tensor::scalar(1.0)).unwrap();
    assert_eq!(graph.grad(x), None);
    assert_eq!(graph.grad(w).unwrap().item(), 2.0);
    assert_eq!(graph.parameters(), vec![w]);
  }
}
