use std::path::Path;

use log::{ info, warn };

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::{
  tensor::Tensor,
  scalar::ScalarType,
  layer::Context,
  net::Network,
  loss::{ self, Loss },
  optimize::{ self, Optimizer },
  persist::{ Archive, ModelSpec, OptimizerSpec, OptimizerParamSpec, SPEC_ENTRY },
  registry::Registry,
  error::{ Error, Result },
};


/// Network bundled with the loss it minimizes and the optimizer doing so.
///
/// Models persist everything needed to resume training, including
/// optimizer state.

#[derive(Debug)]
pub struct Model {
  pub name: String,
  pub net: Network,
  loss: Box<dyn Loss>,
  optimizer: Option<Box<dyn Optimizer>>,
  train_count: usize,
}

impl Model {
  pub fn new(name: &str, net: Network, loss: impl Loss + 'static, optimizer: impl Optimizer + 'static) -> Self {
    Self {
      name: name.to_string(),
      net,
      loss: Box::new(loss),
      optimizer: Some(Box::new(optimizer)),
      train_count: 0,
    }
  }

  pub fn loss_fn(&self) -> &dyn Loss {
    self.loss.as_ref()
  }

  pub fn optimizer(&self) -> Option<&dyn Optimizer> {
    self.optimizer.as_deref()
  }

  pub fn set_optimizer(&mut self, optimizer: impl Optimizer + 'static) {
    self.optimizer = Some(Box::new(optimizer));
  }

  /// Number of training steps taken so far.

  pub fn train_count(&self) -> usize {
    self.train_count
  }

  pub fn param_count(&self) -> usize {
    self.net.param_count()
  }

  pub fn predict(&mut self, x: &Tensor) -> Result<Tensor> {
    self.net.forward(x, false)
  }

  pub fn loss(&mut self, x: &Tensor, y: &Tensor) -> Result<f64> {
    let pred = self.net.forward(x, false)?;
    self.loss.loss(&pred, y)
  }

  /// Take a single optimization step on a batch, returning its loss.

  pub fn train(&mut self, x: &Tensor, y: &Tensor) -> Result<f64> {
    let pred = self.net.forward(x, true)?;
    let loss = self.loss.loss(&pred, y)?;
    let grads = self.net.backward(&self.loss.grad(&pred, y)?)?;
    self.apply(&grads)?;
    Ok(loss)
  }

  /// Take a single optimization step on a batch, spreading
  /// its rows over up to `workers` copies of the network.

  pub fn train_parallel(&mut self, x: &Tensor, y: &Tensor, workers: usize) -> Result<f64> {
    if x.rows() == 0 { return Err(Error::shape("train_parallel", x.dims(), y.dims())) }
    // Lazy layers have to bind before the network gets cloned
    self.net.forward(&x.rows_range(0..1), false)?;
    let (loss, grads) = self.parallel_gradients(x, y, workers)?;
    self.apply(&grads)?;
    Ok(loss)
  }

  fn apply(&mut self, grads: &[Context]) -> Result<()> {
    let optimizer = self.optimizer.as_mut()
      .ok_or_else(|| Error::InvalidArgument(format!("model {} has no optimizer", self.name)) )?;
    optimizer.update(grads, self.net.params_mut())?;
    self.net.zero_grad();
    self.train_count += 1;
    Ok(())
  }

  // Loss and gradients of the whole batch, as the row-weighted
  // average of independently computed shards
  fn parallel_gradients(&self, x: &Tensor, y: &Tensor, workers: usize) -> Result<(f64, Vec<Context>)> {
    if x.rows() != y.rows() || x.rows() == 0 {
      return Err(Error::shape("train_parallel", x.dims(), y.dims()))
    }
    let total = x.rows();
    let shard_size = (total + workers.clamp(1, total) - 1) / workers.clamp(1, total);
    let shards: Vec<_> = (0..total).step_by(shard_size).map(|start| start..(start + shard_size).min(total) ).collect();

    let run = |rows: &std::ops::Range<usize>| -> Result<(f64, f64, Vec<Context>)> {
      let mut net = self.net.clone();
      net.zero_grad();
      let (x, y) = (x.rows_range(rows.clone()), y.rows_range(rows.clone()));
      let pred = net.forward(&x, true)?;
      let loss = self.loss.loss(&pred, &y)?;
      let grads = net.backward(&self.loss.grad(&pred, &y)?)?;
      Ok((rows.len() as f64 / total as f64, loss, grads))
    };

    #[cfg(feature = "rayon")]
    let results = shards.par_iter().map(run).collect::<Result<Vec<_>>>()?;
    #[cfg(not(feature = "rayon"))]
    let results = shards.iter().map(run).collect::<Result<Vec<_>>>()?;

    let mut loss = 0.0;
    let mut grads = vec![Context::default(); self.net.len()];
    for (weight, shard_loss, shard_grads) in &results {
      loss += weight * shard_loss;
      for (acc, ctx) in grads.iter_mut().zip(shard_grads) {
        acc.accumulate(ctx, *weight);
      }
    }
    Ok((loss, grads))
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut archive = Archive::new();
    let net = self.net.to_spec(&mut archive, ScalarType::F64);
    let optimizer = self.optimizer.as_ref().map(|optimizer| {
      let params = optimizer.state().iter().enumerate().map(|(i, group)| OptimizerParamSpec {
        params: group.iter().enumerate()
          .map(|(j, tensor)| archive.put_tensor(&format!("optimizer_{i}_param_{j}.bin"), &format!("state_{j}"), tensor, ScalarType::F64) )
          .collect(),
      }).collect();
      OptimizerSpec {
        class: optimizer.class().to_string(),
        options: optimizer.options(),
        params,
      }
    });
    let spec = ModelSpec {
      name: self.name.clone(),
      train_count: self.train_count as u64,
      param_count: self.param_count() as u64,
      net,
      loss: self.loss.class().to_string(),
      optimizer,
    };
    archive.put_record(SPEC_ENTRY, &spec)?;
    archive.write(&path)?;
    info!("Saved model {} after {} training steps to {}", self.name, self.train_count, path.as_ref().display());
    Ok(())
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    Self::load_with(path, Registry::global())
  }

  pub fn load_with(path: impl AsRef<Path>, registry: &Registry) -> Result<Self> {
    let archive = Archive::read(&path)?;
    let spec: ModelSpec = archive.record(SPEC_ENTRY)?;
    let net = Network::from_spec(&spec.net, &archive, registry)?;
    if net.param_count() as u64 != spec.param_count {
      warn!("Model {} declares {} params but holds {}", spec.name, spec.param_count, net.param_count());
    }
    let optimizer = spec.optimizer.as_ref()
      .map(|optimizer| load_optimizer(optimizer, &archive, &net) )
      .transpose()?;
    info!("Loaded model {} with {} params from {}", spec.name, net.param_count(), path.as_ref().display());
    Ok(Self {
      name: spec.name,
      net,
      loss: loss::from_class(&spec.loss)?,
      optimizer,
      train_count: spec.train_count as usize,
    })
  }

  pub fn print(&self) -> String {
    let optimizer = self.optimizer.as_ref().map(|o| o.class() ).unwrap_or("none");
    format!(
      "Model {} ({} steps, loss {}, optimizer {})\n{}",
      self.name, self.train_count, self.loss.class(), optimizer, self.net.print()
    )
  }
}

// Optimizer state only survives if it still fits the network.
// Unknown classes and unreadable tensors are errors.
fn load_optimizer(spec: &OptimizerSpec, archive: &Archive, net: &Network) -> Result<Box<dyn Optimizer>> {
  let mut optimizer = optimize::from_options(&spec.class, &spec.options)?;
  let state = spec.params.iter()
    .map(|group| group.params.iter().map(|p| archive.tensor(p) ).collect::<Result<Vec<_>>>() )
    .collect::<Result<Vec<_>>>()?;
  if let Err(err) = optimizer.restore(state, &net.params()) {
    warn!("Discarding {} optimizer state: {err}", spec.class);
  }
  Ok(optimizer)
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use approx::assert_abs_diff_eq;
  use crate::{
    layer::{ Dense, Linear, Activation },
    loss::Mse,
    optimize::{ Adam, Sgd },
  };

  fn xor() -> (Tensor, Tensor) {
    let x = Tensor::from_rows(&[&[0., 0.], &[0., 1.], &[1., 0.], &[1., 1.]]);
    let y = Tensor::column(&[0., 1., 1., 0.]);
    (x, y)
  }

  fn xor_model() -> Model {
    let mut net = Network::new();
    net.add(Dense::new(12)).add(Activation::tanh()).add(Dense::new(1));
    Model::new("xor", net, Mse, Adam::new(0.01))
  }

  fn temp_file(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("micronet_{}_{name}", std::process::id()))
  }

  #[test]
  fn learns_xor() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (x, y) = xor();
    let mut model = xor_model();
    let mut loss = f64::INFINITY;
    for _ in 0..5000 {
      loss = model.train(&x, &y).unwrap();
      if loss < 1e-4 { break }
    }
    assert!(loss < 1e-3, "loss {loss}");
    let pred = model.predict(&x).unwrap();
    for (p, t) in pred.raw().iter().zip(y.raw()) {
      assert!((p - t).abs() < 0.1, "{p} vs {t}");
    }
    assert_eq!(model.train_count(), model.optimizer().unwrap().step_count());
  }

  #[test]
  fn save_and_resume() {
    let (x, y) = xor();
    let mut model = xor_model();
    for _ in 0..10 {
      model.train(&x, &y).unwrap();
    }
    let path = temp_file("resume.model");
    model.save(&path).unwrap();
    let mut loaded = Model::load(&path).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!(loaded.train_count(), 10);
    assert_eq!(loaded.name, "xor");
    assert_eq!(loaded.loss_fn().class(), "mse");
    assert_eq!(loaded.predict(&x).unwrap(), model.predict(&x).unwrap());
    let optimizer = loaded.optimizer().unwrap();
    assert_eq!(optimizer.class(), "adam");
    assert_eq!(optimizer.step_count(), 10);
    assert_eq!(optimizer.state(), model.optimizer().unwrap().state());
    // Both copies continue identically
    assert_eq!(loaded.train(&x, &y).unwrap(), model.train(&x, &y).unwrap());
    assert_eq!(loaded.predict(&x).unwrap(), model.predict(&x).unwrap());
  }

  #[test]
  fn mismatched_state_is_dropped() {
    let (x, y) = xor();
    let mut model = xor_model();
    model.train(&x, &y).unwrap();
    let mut archive = Archive::new();
    let net = model.net.to_spec(&mut archive, ScalarType::F64);
    let spec = OptimizerSpec {
      class: "adam".to_string(),
      options: model.optimizer().unwrap().options(),
      params: vec![OptimizerParamSpec { params: vec![archive.put_tensor("s.bin", "m", &Tensor::zeros(3, 3), ScalarType::F64)] }],
    };
    let loaded = Network::from_spec(&net, &archive, Registry::global()).unwrap();
    let optimizer = load_optimizer(&spec, &archive, &loaded).unwrap();
    assert_eq!(optimizer.step_count(), 1);
    assert!(optimizer.state().is_empty());
  }

  #[test]
  fn unreadable_optimizers_fail_to_load() {
    let (x, y) = xor();
    let mut model = xor_model();
    model.train(&x, &y).unwrap();
    let path = temp_file("unreadable.model");
    model.save(&path).unwrap();
    let archive = Archive::read(&path).unwrap();
    let spec: ModelSpec = archive.record(SPEC_ENTRY).unwrap();

    let mut unknown = spec.clone();
    if let Some(optimizer) = unknown.optimizer.as_mut() {
      optimizer.class = "rmsprop".to_string();
    }
    let mut renamed = archive.clone();
    renamed.put_record(SPEC_ENTRY, &unknown).unwrap();
    renamed.write(&path).unwrap();
    assert!(matches!(Model::load(&path), Err(Error::UnsupportedOptimizerClass(class)) if class == "rmsprop"));

    let mut garbled = spec;
    if let Some(optimizer) = garbled.optimizer.as_mut() {
      optimizer.params[0].params[0].scalar_type = 42;
    }
    let mut retagged = archive;
    retagged.put_record(SPEC_ENTRY, &garbled).unwrap();
    retagged.write(&path).unwrap();
    let result = Model::load(&path);
    fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(Error::UnsupportedScalarType(42))));
  }

  #[test]
  fn parallel_matches_serial_gradient() {
    let mut net = Network::new();
    net.add(Linear::new(3, 5).without_bias()).add(Activation::tanh()).add(Linear::new(5, 2).without_bias());
    let model = Model::new("parallel", net, Mse, Sgd::new(0.1));
    let x = Tensor::randn(7, 3);
    let y = Tensor::randn(7, 2);

    let mut serial = model.net.clone();
    let pred = serial.forward(&x, true).unwrap();
    let expected = serial.backward(&Mse.grad(&pred, &y).unwrap()).unwrap();
    let expected_loss = Mse.loss(&pred, &y).unwrap();

    for workers in [1, 2, 3, 7, 20] {
      let (loss, grads) = model.parallel_gradients(&x, &y, workers).unwrap();
      assert_abs_diff_eq!(loss, expected_loss, epsilon = 1e-12);
      for (ctx, expected) in grads.iter().zip(&expected) {
        assert_eq!(ctx.len(), expected.len());
        for ((_, a), (_, b)) in ctx.iter().zip(expected.iter()) {
          for (a, b) in a.raw().iter().zip(b.raw()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
          }
        }
      }
    }
  }

  #[test]
  fn parallel_training_step() {
    let (x, y) = xor();
    let mut model = xor_model();
    let before = model.loss(&x, &y).unwrap();
    for _ in 0..200 {
      model.train_parallel(&x, &y, 2).unwrap();
    }
    assert!(model.loss(&x, &y).unwrap() < before);
    assert_eq!(model.train_count(), 200);
    assert!(model.print().starts_with("Model xor (200 steps, loss mse, optimizer adam)"));
  }

  #[test]
  fn parallel_training_binds_lazy_layers() {
    let x = Tensor::randn(6, 3);
    let y = Tensor::randn(6, 1);
    let mut net = Network::new();
    net.add(Dense::new(4)).add(Activation::tanh()).add(Dense::new(1));
    let mut model = Model::new("lazy", net, Mse, Sgd::new(0.1));
    assert_eq!(model.param_count(), 0);
    model.train_parallel(&x, &y, 2).unwrap();
    assert_eq!(model.param_count(), 3 * 4 + 4 + 4 + 1);
    assert_eq!(model.train_count(), 1);

    // Shards now differentiate the same weights as a serial pass
    let mut serial = model.net.clone();
    let pred = serial.forward(&x, true).unwrap();
    let expected_loss = Mse.loss(&pred, &y).unwrap();
    let (loss, _) = model.parallel_gradients(&x, &y, 2).unwrap();
    assert_abs_diff_eq!(loss, expected_loss, epsilon = 1e-12);
  }

  #[test]
  fn missing_model() {
    assert!(matches!(Model::load(temp_file("missing.model")), Err(Error::ModelNotFound(_))));
  }
}
