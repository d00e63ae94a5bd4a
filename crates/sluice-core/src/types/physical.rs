//! Byte-level representation of field types inside tuple buffers.
//!
//! All multi-byte values are little-endian. `Char` fields are zero-padded
//! UTF-8. Arrays are stored inline, element after element.

use super::{DataType, TypeError, Value};

/// Storage representation of a [`DataType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysicalType {
    /// One byte, 0 or 1.
    Bool,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// Zero-padded text of a fixed byte length.
    Char(usize),
    /// Inline array of a fixed number of elements.
    Array(usize, Box<PhysicalType>),
}

impl PhysicalType {
    /// Maps a logical type to its storage representation.
    ///
    /// An integer is stored unsigned when its lower bound is non-negative.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::NotPhysical`] for `Undefined` and unsupported
    /// bit widths.
    pub fn from_data_type(data_type: &DataType) -> Result<Self, TypeError> {
        let not_physical = || TypeError::NotPhysical(data_type.to_string());
        Ok(match data_type {
            DataType::Undefined => return Err(not_physical()),
            DataType::Boolean => Self::Bool,
            DataType::Char { length } => Self::Char(*length as usize),
            DataType::Integer { bits, lower, .. } => match (*bits, *lower < 0) {
                (8, true) => Self::Int8,
                (16, true) => Self::Int16,
                (32, true) => Self::Int32,
                (64, true) => Self::Int64,
                (8, false) => Self::UInt8,
                (16, false) => Self::UInt16,
                (32, false) => Self::UInt32,
                (64, false) => Self::UInt64,
                _ => return Err(not_physical()),
            },
            DataType::Float { bits: 32, .. } => Self::Float32,
            DataType::Float { bits: 64, .. } => Self::Float64,
            DataType::Float { .. } => return Err(not_physical()),
            DataType::Array { length, component } => {
                Self::Array(*length as usize, Box::new(Self::from_data_type(component)?))
            }
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
            Self::Char(len) => *len,
            Self::Array(len, component) => len * component.size(),
        }
    }

    /// Decodes a value from exactly [`size`](Self::size) bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidUtf8`] for malformed text.
    pub fn read(&self, bytes: &[u8]) -> Result<Value, TypeError> {
        Ok(match self {
            Self::Bool => Value::Bool(bytes[0] != 0),
            Self::Int8 => Value::Int(i64::from(i8::from_le_bytes([bytes[0]]))),
            Self::Int16 => Value::Int(i64::from(i16::from_le_bytes(array(bytes)))),
            Self::Int32 => Value::Int(i64::from(i32::from_le_bytes(array(bytes)))),
            Self::Int64 => Value::Int(i64::from_le_bytes(array(bytes))),
            Self::UInt8 => Value::UInt(u64::from(bytes[0])),
            Self::UInt16 => Value::UInt(u64::from(u16::from_le_bytes(array(bytes)))),
            Self::UInt32 => Value::UInt(u64::from(u32::from_le_bytes(array(bytes)))),
            Self::UInt64 => Value::UInt(u64::from_le_bytes(array(bytes))),
            Self::Float32 => Value::Float(f64::from(f32::from_le_bytes(array(bytes)))),
            Self::Float64 => Value::Float(f64::from_le_bytes(array(bytes))),
            Self::Char(len) => {
                let raw = &bytes[..*len];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                let text = std::str::from_utf8(&raw[..end]).map_err(|_| TypeError::InvalidUtf8)?;
                Value::Text(text.to_string())
            }
            Self::Array(len, component) => {
                let step = component.size();
                let items = (0..*len)
                    .map(|i| component.read(&bytes[i * step..(i + 1) * step]))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Array(items)
            }
        })
    }

    /// Encodes `value` into exactly [`size`](Self::size) bytes.
    ///
    /// Integers are range-checked; integers may be written to float fields.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::ValueOutOfRange`] or [`TypeError::ValueTypeMismatch`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&self, bytes: &mut [u8], value: &Value) -> Result<(), TypeError> {
        match self {
            Self::Bool => {
                let v = value.as_bool().ok_or_else(|| self.mismatch(value))?;
                bytes[0] = u8::from(v);
            }
            Self::Int8 => bytes[..1].copy_from_slice(&self.int::<i8>(value)?.to_le_bytes()),
            Self::Int16 => bytes[..2].copy_from_slice(&self.int::<i16>(value)?.to_le_bytes()),
            Self::Int32 => bytes[..4].copy_from_slice(&self.int::<i32>(value)?.to_le_bytes()),
            Self::Int64 => bytes[..8].copy_from_slice(&self.int::<i64>(value)?.to_le_bytes()),
            Self::UInt8 => bytes[..1].copy_from_slice(&self.int::<u8>(value)?.to_le_bytes()),
            Self::UInt16 => bytes[..2].copy_from_slice(&self.int::<u16>(value)?.to_le_bytes()),
            Self::UInt32 => bytes[..4].copy_from_slice(&self.int::<u32>(value)?.to_le_bytes()),
            Self::UInt64 => bytes[..8].copy_from_slice(&self.int::<u64>(value)?.to_le_bytes()),
            Self::Float32 => {
                let v = self.float(value)? as f32;
                bytes[..4].copy_from_slice(&v.to_le_bytes());
            }
            Self::Float64 => bytes[..8].copy_from_slice(&self.float(value)?.to_le_bytes()),
            Self::Char(len) => {
                let Value::Text(text) = value else {
                    return Err(self.mismatch(value));
                };
                if text.len() > *len {
                    return Err(self.out_of_range(value));
                }
                bytes[..text.len()].copy_from_slice(text.as_bytes());
                bytes[text.len()..*len].fill(0);
            }
            Self::Array(len, component) => {
                let Value::Array(items) = value else {
                    return Err(self.mismatch(value));
                };
                if items.len() != *len {
                    return Err(self.out_of_range(value));
                }
                let step = component.size();
                for (i, item) in items.iter().enumerate() {
                    component.write(&mut bytes[i * step..(i + 1) * step], item)?;
                }
            }
        }
        Ok(())
    }

    fn int<T>(&self, value: &Value) -> Result<T, TypeError>
    where
        T: TryFrom<i64> + TryFrom<u64>,
    {
        match value {
            Value::Int(v) => {
                <T as TryFrom<i64>>::try_from(*v).map_err(|_| self.out_of_range(value))
            }
            Value::UInt(v) => {
                <T as TryFrom<u64>>::try_from(*v).map_err(|_| self.out_of_range(value))
            }
            Value::Bool(b) => {
                <T as TryFrom<u64>>::try_from(u64::from(*b)).map_err(|_| self.out_of_range(value))
            }
            _ => Err(self.mismatch(value)),
        }
    }

    fn float(&self, value: &Value) -> Result<f64, TypeError> {
        value.as_f64().ok_or_else(|| self.mismatch(value))
    }

    fn mismatch(&self, value: &Value) -> TypeError {
        TypeError::ValueTypeMismatch {
            value: value.to_string(),
            target: format!("{self:?}"),
        }
    }

    fn out_of_range(&self, value: &Value) -> TypeError {
        TypeError::ValueOutOfRange {
            value: value.to_string(),
            target: format!("{self:?}"),
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
