//! Small neural network toolkit on 2-D `f64` matrices.
//! CPU only. Few dependencies. Stable Rust.
//!
//! # Features
//!
//! - **Graph-based auto-grad** — Operations recorded in a [Graph] arena can be
//! back-propagated any number of times. Gradients accumulate until reset.
//!
//! - **Broadcasting** — Elementwise operations broadcast rows and columns of
//! size one, reducing gradients back down to the original shapes.
//!
//! - **Layers** — Dense and linear layers, plain and transposed convolution,
//! pooling, recurrent layers, attention with rotary embeddings, normalization,
//! embeddings and the usual activations. Layers own their parameters and
//! bind lazily to the input size where possible.
//!
//! - **Optimization** — SGD with momentum and ADAM, both with weight decay.
//! Batches can be split across threads for data-parallel training.
//!
//! - **Portable model files** — Networks and models, including optimizer state,
//! are saved as a single archive of typed, big-endian parameter files.
//!
//! # Examples
//!
//! Fitting XOR:
//! ```
//! use micronet::{ Tensor, Network, Model, layer::{ Dense, Activation }, loss::Mse, optimize::Adam };
//!
//! let x = Tensor::from_rows(&[&[0., 0.], &[0., 1.], &[1., 0.], &[1., 1.]]);
//! let y = Tensor::column(&[0., 1., 1., 0.]);
//!
//! let mut net = Network::new();
//! net.add(Dense::new(12)).add(Activation::tanh()).add(Dense::new(1));
//!
//! let mut model = Model::new("xor", net, Mse, Adam::new(0.01));
//! for _ in 0..100 {
//!   model.train(&x, &y).unwrap();
//! }
//! assert_eq!(model.predict(&x).unwrap().dims(), (4, 1));
//! ```
//!
//! Differentiating by hand:
//! ```
//! use micronet::{ Tensor, Graph };
//!
//! let mut graph = Graph::new();
//! let w = graph.param(Tensor::row(&[1.0, 2.0]));
//! let x = graph.input(Tensor::row(&[3.0, 4.0]));
//! let y = graph.mul(w, x).unwrap();
//! let loss = graph.sum(y, 1).unwrap();
//! graph.backward(loss, &Tensor::scalar(1.0)).unwrap();
//! assert_eq!(graph.grad(w), Some(&Tensor::row(&[3.0, 4.0])));
//! ```
//!
//! ## More examples
//! Check the `/demos` folder for more example code.
//!
//!
//! # Optional features
//!
//! Some features can be toggled in your `Cargo.toml`.
//!
//! - `unsafe` *(default)* — Accelerated matrix math using [matrixmultiply] crate.
//! - `rayon` *(default)* — Multi-threaded gradient collection and data-parallel training.

mod internal;
mod tensor;
mod variable;
mod error;
mod net;
mod model;

pub mod scalar;
pub mod layer;
pub mod loss;
pub mod optimize;
pub mod persist;
pub mod registry;

pub use internal::Dims;
pub use tensor::{ Tensor, Axis, broadcast_dims, lops::Window };
pub use variable::{ Graph, Variable, UnaryOp, BinaryOp };
pub use error::{ Error, Result };
pub use net::Network;
pub use model::Model;
pub use registry::Registry;
pub use scalar::ScalarType;
