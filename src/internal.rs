use rand::Rng;

use crate::error::{ Error, Result };


pub type Dims = (usize, usize);


#[inline]
pub fn check_axis(axis: usize) -> Result<()> {
  if axis > 1 { return Err(Error::InvalidAxis(axis)) }
  Ok(())
}


// Polar Box-Muller transformation

pub fn randn() -> (f64, f64) {
  let mut rng = rand::thread_rng();
  let u: f64 = rng.gen_range(-1.0, 1.0);
  let v: f64 = rng.gen_range(-1.0, 1.0);
  let r = u * u + v * v;
  // Try again if outside interval
  if r == 0.0 || r >= 1.0 { return randn() }
  let c = (-2.0 * r.ln() / r).sqrt();
  (u * c, v * c)
}


pub fn uniform(low: f64, high: f64) -> f64 {
  rand::thread_rng().gen_range(low, high)
}


/// Read an integer argument stored as a float.

pub fn arg(args: &crate::layer::Args, key: &str) -> Result<usize> {
  args.get(key)
    .map(|&v| v.max(0.0) as usize )
    .ok_or_else(|| Error::InvalidArgument(format!("missing argument \"{key}\"")) )
}


pub fn arg_or(args: &crate::layer::Args, key: &str, default: f32) -> f32 {
  args.get(key).copied().unwrap_or(default)
}
