// This example trains a small perceptron on the XOR problem and keeps
// the result in `xor.model`. Running it again resumes from the saved
// model, including the optimizer's state.

use log::info;

use micronet::{ Tensor, Network, Model, Error, layer::{ Dense, Activation }, loss::Mse, optimize::Adam };

const PATH: &str = "xor.model";

fn main() -> micronet::Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let x = Tensor::from_rows(&[&[0., 0.], &[0., 1.], &[1., 0.], &[1., 1.]]);
  let y = Tensor::column(&[0., 1., 1., 0.]);

  // Resume or start from scratch
  let mut model = match Model::load(PATH) {
    Ok(model) => model,
    Err(Error::ModelNotFound(_)) => {
      info!("No saved model found, training a new one");
      let mut net = Network::new();
      net.add(Dense::new(12)).add(Activation::tanh()).add(Dense::new(1));
      Model::new("xor", net, Mse, Adam::new(0.01))
    },
    Err(err) => return Err(err),
  };

  // Train on the full batch until the fit is good enough
  for _ in 0..5000 {
    let loss = model.train(&x, &y)?;
    if model.train_count() % 500 == 0 {
      info!("Step {} loss {loss:.6}", model.train_count());
    }
    if loss < 1e-4 { break }
  }

  println!("{}", model.print());
  println!("{}", model.predict(&x)?);

  model.save(PATH)
}
