use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use half::{bf16, f16};

use crate::Error;

/// Storage precision of weights and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    #[default]
    F32,
    F16,
    BF16,
}

impl Precision {
    /// Rounds `v` to the nearest value representable in this precision.
    #[inline]
    pub fn round(self, v: f32) -> f32 {
        match self {
            Precision::F32 => v,
            Precision::F16 => f16::from_f32(v).to_f32(),
            Precision::BF16 => bf16::from_f32(v).to_f32(),
        }
    }

    pub fn round_slice(self, values: &mut [f32]) {
        if self == Precision::F32 {
            return;
        }
        for v in values.iter_mut() {
            *v = self.round(*v);
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::F32 => write!(f, "f32"),
            Precision::F16 => write!(f, "f16"),
            Precision::BF16 => write!(f, "bf16"),
        }
    }
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float" | "float32" => Ok(Precision::F32),
            "f16" | "half" | "float16" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::BF16),
            other => Err(Error::Config(format!("unknown precision '{other}'"))),
        }
    }
}

pub trait DataType: Default + Clone + Copy + PartialEq + Debug + Send + Sync + 'static {
    const FROM_F32_FN: fn(f32) -> Self;
    const TO_F32_FN: fn(Self) -> f32;

    #[inline]
    fn from_f32(v: f32) -> Self {
        Self::FROM_F32_FN(v)
    }

    #[inline]
    fn to_f32(self) -> f32 {
        Self::TO_F32_FN(self)
    }
}

macro_rules! datatype {
    ($dt:ident, $from_f32:expr, $to_f32:expr) => {
        impl DataType for $dt {
            const FROM_F32_FN: fn(f32) -> Self = $from_f32;
            const TO_F32_FN: fn(Self) -> f32 = $to_f32;
        }
    };
}

datatype!(f32, |v: f32| v, |v: f32| v);
datatype!(f16, |v: f32| f16::from_f32(v), |v: f16| v.to_f32());
datatype!(bf16, |v: f32| bf16::from_f32(v), |v: bf16| v.to_f32());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_rounding_loses_low_bits() {
        let v = 1.0 + 1.0 / 4096.0;
        assert_eq!(Precision::F32.round(v), v);
        assert_eq!(Precision::F16.round(v), 1.0);
        assert_eq!(Precision::BF16.round(v), 1.0);
    }

    #[test]
    fn parse_precision_names() {
        assert_eq!("half".parse::<Precision>().unwrap(), Precision::F16);
        assert_eq!("BF16".parse::<Precision>().unwrap(), Precision::BF16);
        assert!("f8".parse::<Precision>().is_err());
    }

    #[test]
    fn datatype_roundtrips_representable_values() {
        assert_eq!(f16::from_f32(0.5).to_f32(), 0.5);
        assert_eq!(<f16 as DataType>::from_f32(0.5).to_f32(), 0.5);
        assert_eq!(<bf16 as DataType>::from_f32(1.0 + 1.0 / 256.0).to_f32(), 1.0);
    }
}
