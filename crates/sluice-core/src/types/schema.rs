use std::fmt;
use std::sync::Arc;

use super::{DataType, PhysicalType, TypeError};

/// Shared, immutable schema handle.
pub type SchemaRef = Arc<Schema>;

/// A named, typed field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    data_type: DataType,
}

impl Field {
    /// Creates a new field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field type.
    #[must_use]
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }
}

/// Ordered sequence of uniquely named fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a schema, rejecting duplicate field names.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::DuplicateField`] if two fields share a name.
    pub fn new(fields: Vec<Field>) -> Result<Self, TypeError> {
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(TypeError::DuplicateField(field.name.clone()));
            }
        }
        Ok(Self { fields })
    }

    /// A schema with no fields.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fields in order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the field called `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Looks up a field by name.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::FieldNotFound`] if no field has that name.
    pub fn field(&self, name: &str) -> Result<&Field, TypeError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| TypeError::FieldNotFound(name.to_string()))
    }

    /// Returns a copy with `name` set to `data_type`, appending it if new.
    #[must_use]
    pub fn with_field(&self, name: &str, data_type: DataType) -> Schema {
        let mut fields = self.fields.clone();
        match fields.iter_mut().find(|f| f.name == name) {
            Some(field) => field.data_type = data_type,
            None => fields.push(Field::new(name, data_type)),
        }
        Schema { fields }
    }

    /// Keeps only `names`, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::FieldNotFound`] or [`TypeError::DuplicateField`].
    pub fn project(&self, names: &[String]) -> Result<Schema, TypeError> {
        let fields = names
            .iter()
            .map(|n| self.field(n).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Schema::new(fields)
    }

    /// Appends all fields of `other`.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::DuplicateField`] if a name appears on both sides.
    pub fn concat(&self, other: &Schema) -> Result<Schema, TypeError> {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Schema::new(fields)
    }

    /// Merges two union-compatible schemas field by field.
    ///
    /// Both sides must have the same field names in the same order; each
    /// output type is the [`DataType::join`] of the two inputs.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::FieldNotFound`] if the names differ and
    /// [`TypeError::Incompatible`] if a pair of types does not join.
    pub fn union_merge(&self, other: &Schema) -> Result<Schema, TypeError> {
        if self.len() != other.len() {
            return Err(TypeError::Incompatible {
                left: self.to_string(),
                right: other.to_string(),
            });
        }
        let fields = self
            .fields
            .iter()
            .zip(&other.fields)
            .map(|(l, r)| {
                if l.name != r.name {
                    return Err(TypeError::FieldNotFound(r.name.clone()));
                }
                Ok(Field::new(l.name.clone(), l.data_type.try_join(&r.data_type)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Schema { fields })
    }

    /// First field whose type is (or contains) `Undefined`.
    #[must_use]
    pub fn first_undefined(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.data_type.is_undefined())
    }

    /// Physical types of all fields, in order.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::NotPhysical`] if any field cannot be stored.
    pub fn physical_types(&self) -> Result<Vec<PhysicalType>, TypeError> {
        self.fields
            .iter()
            .map(|f| PhysicalType::from_data_type(&f.data_type))
            .collect()
    }

    /// Record stride: the sum of all field sizes, without padding.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::NotPhysical`] if any field cannot be stored.
    pub fn tuple_size(&self) -> Result<usize, TypeError> {
        Ok(self.physical_types()?.iter().map(PhysicalType::size).sum())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", field.name, field.data_type)?;
        }
        write!(f, ")")
    }
}
