use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{ debug, info };
use serde::{Serialize, Deserialize};

use crate::{
  tensor::Tensor,
  scalar::ScalarType,
  layer::{ Param, Args },
  net::Network,
  registry::Registry,
  error::{ Error, Result },
};

/// Archive entry holding the postcard-encoded model description.
pub const SPEC_ENTRY: &str = "SPEC";


/// Named blob inside an [Archive].

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
  pub name: String,
  pub data: Vec<u8>,
}


/// Single-file container for a model description and its tensors.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Archive {
  pub entries: Vec<Entry>,
}

impl Archive {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, name: &str, data: Vec<u8>) {
    match self.entries.iter_mut().find(|entry| entry.name == name ) {
      Some(entry) => entry.data = data,
      None => self.entries.push(Entry { name: name.to_string(), data }),
    }
  }

  pub fn get(&self, name: &str) -> Result<&[u8]> {
    self.entries.iter()
      .find(|entry| entry.name == name )
      .map(|entry| entry.data.as_slice() )
      .ok_or_else(|| Error::MissingFile(name.to_string()) )
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(self)?)
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    Ok(postcard::from_bytes(bytes)?)
  }

  pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
    let bytes = self.to_bytes()?;
    debug!("Writing {} entries ({} bytes) to {}", self.entries.len(), bytes.len(), path.as_ref().display());
    fs::write(path, bytes)?;
    Ok(())
  }

  /// Read an archive, reporting a missing file as [Error::ModelNotFound].

  pub fn read(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|err| match err.kind() {
      ErrorKind::NotFound => Error::ModelNotFound(path.to_path_buf()),
      _ => Error::Io(err),
    })?;
    Self::from_bytes(&bytes)
  }

  pub(crate) fn put_record<T: Serialize>(&mut self, name: &str, record: &T) -> Result<()> {
    let data = postcard::to_allocvec(record)?;
    self.insert(name, data);
    Ok(())
  }

  pub(crate) fn record<'a, T: Deserialize<'a>>(&'a self, name: &str) -> Result<T> {
    Ok(postcard::from_bytes(self.get(name)?)?)
  }

  /// Store a tensor's elements as `file` and describe it.

  pub fn put_tensor(&mut self, file: &str, name: &str, tensor: &Tensor, scalar_type: ScalarType) -> ParamSpec {
    self.insert(file, scalar_type.encode(tensor.raw()));
    ParamSpec {
      name: name.to_string(),
      scalar_type: scalar_type.tag(),
      elem_count: tensor.size() as u64,
      shapes: vec![tensor.rows() as u64, tensor.cols() as u64],
      file: file.to_string(),
    }
  }

  pub fn tensor(&self, spec: &ParamSpec) -> Result<Tensor> {
    let scalar_type = ScalarType::from_tag(spec.scalar_type)?;
    let count = spec.elem_count as usize;
    let (rows, cols) = match spec.shapes.as_slice() {
      [] => (1, 1),
      [cols] => (1, *cols as usize),
      [rows, cols] => (*rows as usize, *cols as usize),
      shapes => return Err(Error::InvalidArgument(format!("{}: expected at most two dimensions, got {shapes:?}", spec.name))),
    };
    if rows * cols != count {
      return Err(Error::shape("load", (rows, cols), (count, 1)))
    }
    let data = scalar_type.decode(self.get(&spec.file)?, count)?;
    Ok(Tensor::new(rows, cols, data))
  }
}


/// Description of a persisted tensor.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
  pub name: String,
  pub scalar_type: u8,
  pub elem_count: u64,
  pub shapes: Vec<u64>,
  pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
  pub class: String,
  pub name: String,
  pub params: Vec<ParamSpec>,
  pub args: Args,
}

/// State tensors of a single parameter.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerParamSpec {
  pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
  pub class: String,
  pub options: Vec<u8>,
  pub params: Vec<OptimizerParamSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetSpec {
  pub layers: Vec<LayerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
  pub name: String,
  pub train_count: u64,
  pub param_count: u64,
  pub net: NetSpec,
  pub loss: String,
  pub optimizer: Option<OptimizerSpec>,
}


impl Network {
  /// Describe all layers, storing their parameters in `archive`.

  pub fn to_spec(&self, archive: &mut Archive, scalar_type: ScalarType) -> NetSpec {
    let layers = self.layers().iter().enumerate().map(|(i, layer)| {
      let params = layer.params().iter().enumerate()
        .map(|(j, param)| archive.put_tensor(&format!("layer_{i}_param_{j}.bin"), &param.name, &param.value, scalar_type) )
        .collect();
      LayerSpec {
        class: layer.class().to_string(),
        name: layer.name().to_string(),
        params,
        args: layer.args(),
      }
    }).collect();
    NetSpec { layers }
  }

  pub fn from_spec(spec: &NetSpec, archive: &Archive, registry: &Registry) -> Result<Self> {
    let mut net = Self::new();
    for layer in &spec.layers {
      let params = layer.params.iter()
        .map(|p| Ok(Param::new(&p.name, archive.tensor(p)?)) )
        .collect::<Result<Vec<_>>>()?;
      net.push(registry.build(&layer.class, &layer.name, params, &layer.args)?);
    }
    Ok(net)
  }

  /// Save with full precision.

  pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    self.save_as(path, ScalarType::F64)
  }

  /// Save with parameters converted to `scalar_type`, which may lose precision.

  pub fn save_as(&self, path: impl AsRef<Path>, scalar_type: ScalarType) -> Result<()> {
    let mut archive = Archive::new();
    let spec = self.to_spec(&mut archive, scalar_type);
    archive.put_record(SPEC_ENTRY, &spec)?;
    archive.write(&path)?;
    info!("Saved network of {} layers to {}", self.len(), path.as_ref().display());
    Ok(())
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    Self::load_with(path, Registry::global())
  }

  pub fn load_with(path: impl AsRef<Path>, registry: &Registry) -> Result<Self> {
    let archive = Archive::read(&path)?;
    let spec: NetSpec = archive.record(SPEC_ENTRY)?;
    let net = Self::from_spec(&spec, &archive, registry)?;
    info!("Loaded network of {} layers from {}", net.len(), path.as_ref().display());
    Ok(net)
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;
  use crate::layer::*;

  fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("micronet_{}_{name}", std::process::id()))
  }

  fn network() -> Network {
    let mut net = Network::new();
    net
      .add(Conv2D::new(1, 2, [2, 2], 4, 4))
      .add(Activation::relu())
      .add(MaxPool::new(2, 3, 3, [2, 2], [2, 2]).unwrap())
      .add(Flatten::new())
      .add(Dense::new(6))
      .add(LayerNorm::new(6))
      .add(Dropout::new(0.8).unwrap())
      .add(Linear::new(6, 3));
    net
  }

  #[test]
  fn round_trip_is_bit_exact() {
    let mut net = network();
    let x = Tensor::randn(3, 16);
    let expected = net.forward(&x, false).unwrap();
    let path = temp_file("round_trip.net");
    net.save(&path).unwrap();
    let mut loaded = Network::load(&path).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!(loaded.forward(&x, false).unwrap(), expected);
    let classes: Vec<_> = loaded.layers().iter().map(|l| l.class() ).collect();
    assert_eq!(classes, ["conv2d", "relu", "maxpool", "flatten", "dense", "layer_norm", "dropout", "linear"]);
    assert_eq!(loaded.param_count(), net.param_count());
  }

  #[test]
  fn narrow_types_approximate() {
    let mut net = Network::new();
    net.add(Linear::new(4, 4));
    let x = Tensor::randn(2, 4);
    let expected = net.forward(&x, false).unwrap();
    let path = temp_file("narrow.net");
    net.save_as(&path, ScalarType::F32).unwrap();
    let mut loaded = Network::load(&path).unwrap();
    fs::remove_file(&path).unwrap();
    let actual = loaded.forward(&x, false).unwrap();
    for (a, b) in actual.raw().iter().zip(expected.raw()) {
      assert!((a - b).abs() < 1e-5);
    }
  }

  #[test]
  fn archive_layout() {
    let mut net = Network::new();
    net.add(Linear::new(2, 3)).add(Activation::gelu()).add(RMSNorm::new(3));
    let mut archive = Archive::new();
    let spec = net.to_spec(&mut archive, ScalarType::F64);
    assert_eq!(spec.layers[0].params[1], ParamSpec {
      name: "b".to_string(),
      scalar_type: 7,
      elem_count: 3,
      shapes: vec![1, 3],
      file: "layer_0_param_1.bin".to_string(),
    });
    assert_eq!(archive.get("layer_2_param_0.bin").unwrap().len(), 3 * 8);
    assert!(matches!(archive.get("layer_1_param_0.bin"), Err(Error::MissingFile(_))));
    let rebuilt = Network::from_spec(&spec, &archive, Registry::global()).unwrap();
    assert_eq!(rebuilt.params()[0][0].value, net.params()[0][0].value);
  }

  #[test]
  fn unknown_tags() {
    let mut archive = Archive::new();
    let mut spec = NetSpec {
      layers: vec![LayerSpec { class: "capsule".to_string(), name: "c".to_string(), params: Vec::new(), args: Args::new() }],
    };
    assert!(matches!(Network::from_spec(&spec, &archive, &Registry::default()), Err(Error::UnsupportedLayerClass(_))));
    let mut param = archive.put_tensor("t.bin", "a", &Tensor::ones(1, 3), ScalarType::F64);
    param.scalar_type = 42;
    spec.layers[0] = LayerSpec { class: "rms_norm".to_string(), name: "n".to_string(), params: vec![param], args: Args::from([("dims".to_string(), 3.0)]) };
    assert!(matches!(Network::from_spec(&spec, &archive, &Registry::default()), Err(Error::UnsupportedScalarType(42))));
  }

  #[test]
  fn missing_model() {
    let result = Network::load(temp_file("does_not_exist.net"));
    assert!(matches!(result, Err(Error::ModelNotFound(_))));
  }
}
