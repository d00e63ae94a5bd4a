//! Field types, schemas and record values.
//!
//! Every operator in a plan carries an input and an output [`Schema`]. The
//! field types form a closed hierarchy ([`DataType`]) with a [`DataType::join`]
//! operation that widens two types to their common supertype. Physical sizes
//! and the byte-level codec used by tuple buffers live in [`physical`].

mod physical;
mod schema;
mod value;

pub use physical::PhysicalType;
pub use schema::{Field, Schema, SchemaRef};
pub use value::Value;

/// Errors raised by type inference, schema construction and the value codec.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TypeError {
    /// Two field names collide inside one schema.
    #[error("duplicate field name '{0}'")]
    DuplicateField(String),

    /// A field reference could not be resolved.
    #[error("field '{0}' not found in schema")]
    FieldNotFound(String),

    /// Two types have no common supertype.
    #[error("incompatible types: {left} and {right}")]
    Incompatible {
        /// Left-hand type.
        left: String,
        /// Right-hand type.
        right: String,
    },

    /// A type has no physical representation (e.g. `Undefined`, odd bit widths).
    #[error("type {0} has no physical representation")]
    NotPhysical(String),

    /// A value does not fit into the target physical type.
    #[error("value {value} out of range for {target}")]
    ValueOutOfRange {
        /// Rendered value.
        value: String,
        /// Target physical type.
        target: String,
    },

    /// A value of the wrong kind was written to a field.
    #[error("cannot store {value} in a {target} field")]
    ValueTypeMismatch {
        /// Rendered value.
        value: String,
        /// Target physical type.
        target: String,
    },

    /// A fixed-length text field held bytes that are not UTF-8.
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,
}

/// Logical field type.
///
/// Integer and float types carry the bounds of the values they may hold, so
/// that [`join`](Self::join) can widen without losing range information.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    /// Type inference failed or was never run.
    Undefined,
    /// A single boolean.
    Boolean,
    /// Fixed-length UTF-8 text, zero-padded.
    Char {
        /// Length in bytes.
        length: u32,
    },
    /// Integer with a bit width and an inclusive value range.
    Integer {
        /// Storage width (8, 16, 32 or 64).
        bits: u8,
        /// Smallest representable value.
        lower: i128,
        /// Largest representable value.
        upper: i128,
    },
    /// IEEE float with a bit width and an inclusive value range.
    Float {
        /// Storage width (32 or 64).
        bits: u8,
        /// Smallest representable value.
        lower: f64,
        /// Largest representable value.
        upper: f64,
    },
    /// Fixed-length array of a component type.
    Array {
        /// Number of elements.
        length: u32,
        /// Element type.
        component: Box<DataType>,
    },
}

impl DataType {
    /// 8-bit signed integer.
    #[must_use]
    pub fn int8() -> Self {
        Self::signed(8)
    }

    /// 16-bit signed integer.
    #[must_use]
    pub fn int16() -> Self {
        Self::signed(16)
    }

    /// 32-bit signed integer.
    #[must_use]
    pub fn int32() -> Self {
        Self::signed(32)
    }

    /// 64-bit signed integer.
    #[must_use]
    pub fn int64() -> Self {
        Self::signed(64)
    }

    /// 8-bit unsigned integer.
    #[must_use]
    pub fn uint8() -> Self {
        Self::unsigned(8)
    }

    /// 16-bit unsigned integer.
    #[must_use]
    pub fn uint16() -> Self {
        Self::unsigned(16)
    }

    /// 32-bit unsigned integer.
    #[must_use]
    pub fn uint32() -> Self {
        Self::unsigned(32)
    }

    /// 64-bit unsigned integer.
    #[must_use]
    pub fn uint64() -> Self {
        Self::unsigned(64)
    }

    /// 32-bit float.
    #[must_use]
    pub fn float32() -> Self {
        Self::Float {
            bits: 32,
            lower: f64::from(f32::MIN),
            upper: f64::from(f32::MAX),
        }
    }

    /// 64-bit float.
    #[must_use]
    pub fn float64() -> Self {
        Self::Float {
            bits: 64,
            lower: f64::MIN,
            upper: f64::MAX,
        }
    }

    /// Fixed-length text.
    #[must_use]
    pub fn char(length: u32) -> Self {
        Self::Char { length }
    }

    /// Fixed-length array.
    #[must_use]
    pub fn array(length: u32, component: DataType) -> Self {
        Self::Array {
            length,
            component: Box::new(component),
        }
    }

    fn signed(bits: u8) -> Self {
        let half = 1i128 << (bits - 1);
        Self::Integer {
            bits,
            lower: -half,
            upper: half - 1,
        }
    }

    fn unsigned(bits: u8) -> Self {
        Self::Integer {
            bits,
            lower: 0,
            upper: (1i128 << bits) - 1,
        }
    }

    /// Returns the widened common type of `self` and `other`.
    ///
    /// Returns [`DataType::Undefined`] when the two types are incompatible.
    /// The operation is commutative and idempotent.
    #[must_use]
    pub fn join(&self, other: &DataType) -> DataType {
        match (self, other) {
            (Self::Boolean, Self::Boolean) => Self::Boolean,
            (Self::Char { length: a }, Self::Char { length: b }) if a == b => {
                Self::Char { length: *a }
            }
            (
                Self::Integer {
                    bits: b1,
                    lower: l1,
                    upper: u1,
                },
                Self::Integer {
                    bits: b2,
                    lower: l2,
                    upper: u2,
                },
            ) => Self::Integer {
                bits: (*b1).max(*b2),
                lower: (*l1).min(*l2),
                upper: (*u1).max(*u2),
            },
            (
                Self::Float {
                    bits: b1,
                    lower: l1,
                    upper: u1,
                },
                Self::Float {
                    bits: b2,
                    lower: l2,
                    upper: u2,
                },
            ) => Self::Float {
                bits: (*b1).max(*b2),
                lower: l1.min(*l2),
                upper: u1.max(*u2),
            },
            (Self::Integer { lower, upper, .. }, Self::Float { bits, lower: fl, upper: fu })
            | (Self::Float { bits, lower: fl, upper: fu }, Self::Integer { lower, upper, .. }) => {
                #[allow(clippy::cast_precision_loss)]
                let (il, iu) = (*lower as f64, *upper as f64);
                Self::Float {
                    bits: *bits,
                    lower: fl.min(il),
                    upper: fu.max(iu),
                }
            }
            (
                Self::Array {
                    length: a,
                    component: ca,
                },
                Self::Array {
                    length: b,
                    component: cb,
                },
            ) if a == b => match ca.join(cb) {
                Self::Undefined => Self::Undefined,
                component => Self::Array {
                    length: *a,
                    component: Box::new(component),
                },
            },
            _ => Self::Undefined,
        }
    }

    /// Like [`join`](Self::join) but reports incompatibility as an error.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::Incompatible`] if the join is `Undefined`.
    pub fn try_join(&self, other: &DataType) -> Result<DataType, TypeError> {
        match self.join(other) {
            Self::Undefined => Err(TypeError::Incompatible {
                left: self.to_string(),
                right: other.to_string(),
            }),
            joined => Ok(joined),
        }
    }

    /// Returns `true` for `Undefined`, including nested array components.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        match self {
            Self::Undefined => true,
            Self::Array { component, .. } => component.is_undefined(),
            _ => false,
        }
    }

    /// Returns `true` for integer and float types.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer { .. } | Self::Float { .. })
    }

    /// Returns `true` for integer types.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Integer { .. })
    }

    /// Returns `true` for the boolean type.
    #[must_use]
    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::Boolean)
    }

    /// Size in bytes of the physical representation.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::NotPhysical`] if the type cannot be stored.
    pub fn physical_size(&self) -> Result<usize, TypeError> {
        PhysicalType::from_data_type(self).map(|p| p.size())
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined => write!(f, "Undefined"),
            Self::Boolean => write!(f, "Boolean"),
            Self::Char { length } => write!(f, "Char({length})"),
            Self::Integer { bits, lower, upper } => {
                write!(f, "Integer({bits}, {lower}..={upper})")
            }
            Self::Float { bits, lower, upper } => {
                write!(f, "Float({bits}, {lower:e}..={upper:e})")
            }
            Self::Array { length, component } => write!(f, "Array({length}, {component})"),
        }
    }
}
