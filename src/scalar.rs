use num_traits::{ Bounded, NumCast, ToPrimitive };
use serde::{Serialize, Deserialize};

use crate::error::{ Error, Result };


/// Element type of a persisted parameter file.
///
/// Elements are always stored big-endian. Values get converted
/// from and to `f64` on the way in and out, saturating for
/// integer types and rounding to nearest for narrow floats.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalarType {
  Byte = 0,
  I8 = 1,
  I16 = 2,
  I32 = 3,
  I64 = 4,
  F16 = 5,
  F32 = 6,
  F64 = 7,
  Bool = 8,
  BF16 = 9,
}

impl ScalarType {
  pub const ALL: [Self; 10] = [
    Self::Byte, Self::I8, Self::I16, Self::I32, Self::I64,
    Self::F16, Self::F32, Self::F64, Self::Bool, Self::BF16,
  ];

  pub fn from_tag(tag: u8) -> Result<Self> {
    Self::ALL.get(tag as usize).copied().ok_or(Error::UnsupportedScalarType(tag))
  }

  pub fn tag(self) -> u8 {
    self as u8
  }

  /// Bytes per element.

  pub fn size(self) -> usize {
    match self {
      Self::Byte | Self::I8 | Self::Bool => 1,
      Self::I16 | Self::F16 | Self::BF16 => 2,
      Self::I32 | Self::F32 => 4,
      Self::I64 | Self::F64 => 8,
    }
  }

  pub fn encode(self, values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * self.size());
    for &value in values {
      match self {
        Self::Byte => out.push(saturate::<u8>(value)),
        Self::I8 => out.extend(saturate::<i8>(value).to_be_bytes()),
        Self::I16 => out.extend(saturate::<i16>(value).to_be_bytes()),
        Self::I32 => out.extend(saturate::<i32>(value).to_be_bytes()),
        Self::I64 => out.extend(saturate::<i64>(value).to_be_bytes()),
        Self::F16 => out.extend(f16_bits(value).to_be_bytes()),
        Self::F32 => out.extend((value as f32).to_be_bytes()),
        Self::F64 => out.extend(value.to_be_bytes()),
        Self::Bool => out.push((value != 0.0) as u8),
        Self::BF16 => out.extend(bf16_bits(value).to_be_bytes()),
      }
    }
    out
  }

  pub fn decode(self, bytes: &[u8], count: usize) -> Result<Vec<f64>> {
    let size = self.size();
    if bytes.len() != count * size {
      return Err(Error::InvalidArgument(format!(
        "{} bytes don't hold {count} elements of {self:?}", bytes.len())))
    }
    let values = bytes.chunks_exact(size).map(|chunk| match self {
      Self::Byte => chunk[0] as f64,
      Self::I8 => widen(i8::from_be_bytes([chunk[0]])),
      Self::I16 => widen(i16::from_be_bytes([chunk[0], chunk[1]])),
      Self::I32 => widen(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
      Self::I64 => widen(i64::from_be_bytes(eight(chunk))),
      Self::F16 => from_f16_bits(u16::from_be_bytes([chunk[0], chunk[1]])),
      Self::F32 => f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
      Self::F64 => f64::from_be_bytes(eight(chunk)),
      Self::Bool => if chunk[0] != 0 { 1.0 } else { 0.0 },
      Self::BF16 => f32::from_bits((u16::from_be_bytes([chunk[0], chunk[1]]) as u32) << 16) as f64,
    }).collect();
    Ok(values)
  }
}

impl Default for ScalarType {
  fn default() -> Self {
    Self::F64
  }
}


fn saturate<T: NumCast + Bounded>(value: f64) -> T {
  let value = if value.is_nan() { 0.0 } else { value.round() };
  T::from(value).unwrap_or_else(|| if value < 0.0 { T::min_value() } else { T::max_value() } )
}

fn widen<T: ToPrimitive>(value: T) -> f64 {
  value.to_f64().unwrap_or(0.0)
}

fn eight(chunk: &[u8]) -> [u8; 8] {
  let mut bytes = [0; 8];
  bytes.copy_from_slice(chunk);
  bytes
}

// IEEE 754 binary16, rounding to nearest even

fn f16_bits(value: f64) -> u16 {
  let bits = (value as f32).to_bits();
  let sign = ((bits >> 16) & 0x8000) as u16;
  let exp = ((bits >> 23) & 0xff) as i32;
  let mut mant = bits & 0x7f_ffff;

  if exp == 0xff {
    return sign | 0x7c00 | if mant != 0 { 0x200 } else { 0 }
  }
  let exp = exp - 127 + 15;
  if exp >= 0x1f { return sign | 0x7c00 }

  let round = |half: u32, rest: u32, halfway: u32| {
    if rest > halfway || (rest == halfway && half & 1 == 1) { half + 1 } else { half }
  };

  if exp <= 0 {
    // Subnormal or zero
    if exp < -10 { return sign }
    mant |= 0x80_0000;
    let shift = (14 - exp) as u32;
    let half = round(mant >> shift, mant & ((1 << shift) - 1), 1 << (shift - 1));
    return sign | half as u16
  }

  // A carry out of the mantissa correctly bumps the exponent
  let half = round(((exp as u32) << 10) | (mant >> 13), mant & 0x1fff, 0x1000);
  sign | half as u16
}

fn from_f16_bits(bits: u16) -> f64 {
  let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
  let exp = ((bits >> 10) & 0x1f) as i32;
  let mant = (bits & 0x3ff) as f64;
  sign * match exp {
    0 => mant * 2f64.powi(-24),
    0x1f => if mant == 0.0 { f64::INFINITY } else { f64::NAN },
    _ => (1.0 + mant / 1024.0) * 2f64.powi(exp - 15),
  }
}

fn bf16_bits(value: f64) -> u16 {
  let value = value as f32;
  let bits = value.to_bits();
  if value.is_nan() { return ((bits >> 16) | 0x40) as u16 }
  let round = 0x7fff + ((bits >> 16) & 1);
  (bits.wrapping_add(round) >> 16) as u16
}


#[cfg(test)]
mod tests {
  use super::*;

  fn roundtrip(scalar_type: ScalarType, values: &[f64]) -> Vec<f64> {
    let bytes = scalar_type.encode(values);
    assert_eq!(bytes.len(), values.len() * scalar_type.size());
    scalar_type.decode(&bytes, values.len()).unwrap()
  }

  #[test]
  fn tags() {
    for (i, scalar_type) in ScalarType::ALL.iter().enumerate() {
      assert_eq!(scalar_type.tag() as usize, i);
      assert_eq!(ScalarType::from_tag(i as u8).unwrap(), *scalar_type);
    }
    assert!(matches!(ScalarType::from_tag(10), Err(Error::UnsupportedScalarType(10))));
  }

  #[test]
  fn lossless_for_representable_values() {
    let cases: [(ScalarType, &[f64]); 10] = [
      (ScalarType::Byte, &[0., 1., 127., 255.]),
      (ScalarType::I8, &[-128., -1., 0., 127.]),
      (ScalarType::I16, &[-32768., -7., 300., 32767.]),
      (ScalarType::I32, &[-2147483648., 0., 65536., 2147483647.]),
      (ScalarType::I64, &[-9007199254740992., -3., 0., 9007199254740992.]),
      (ScalarType::F16, &[0., -2., 0.5, 1024., 65504., 6.103515625e-5, 5.960464477539063e-8]),
      (ScalarType::F32, &[0., -1.5, 3.25, 1e-3f32 as f64]),
      (ScalarType::F64, &[0., -1.5, std::f64::consts::PI, 1e-300]),
      (ScalarType::Bool, &[0., 1.]),
      (ScalarType::BF16, &[0., -256., 1.5, 0.15625]),
    ];
    for (scalar_type, values) in cases {
      assert_eq!(roundtrip(scalar_type, values), values, "{scalar_type:?}");
    }
  }

  #[test]
  fn big_endian() {
    assert_eq!(ScalarType::F32.encode(&[1.0]), vec![0x3f, 0x80, 0, 0]);
    assert_eq!(ScalarType::I16.encode(&[258.0]), vec![1, 2]);
    assert_eq!(ScalarType::F16.encode(&[1.0]), vec![0x3c, 0]);
    assert_eq!(ScalarType::BF16.encode(&[1.0]), vec![0x3f, 0x80]);
  }

  #[test]
  fn narrowing() {
    assert_eq!(roundtrip(ScalarType::Byte, &[-5., 300.]), vec![0., 255.]);
    assert_eq!(roundtrip(ScalarType::I8, &[1.6, -1000.]), vec![2., -128.]);
    assert_eq!(roundtrip(ScalarType::Bool, &[0.3, 0.]), vec![1., 0.]);
    // Halfway between 1 and the next half float rounds to even
    assert_eq!(roundtrip(ScalarType::F16, &[1.0 + 2f64.powi(-11)]), vec![1.0]);
    assert_eq!(roundtrip(ScalarType::F16, &[1e6]), vec![f64::INFINITY]);
    assert!(roundtrip(ScalarType::F16, &[f64::NAN])[0].is_nan());
  }

  #[test]
  fn length_mismatch() {
    assert!(ScalarType::F32.decode(&[0, 0, 0], 1).is_err());
  }
}
