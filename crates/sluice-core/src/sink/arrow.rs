//! Bridge from tuple buffers to Arrow `RecordBatch`es.
//!
//! [`RecordBatchBridge`] accumulates decoded records into one Arrow column
//! builder per field and materializes them as a `RecordBatch`.

use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float32Builder, Float64Builder, Int16Builder, Int32Builder, Int64Builder,
    Int8Builder, StringBuilder, UInt16Builder, UInt32Builder, UInt64Builder, UInt8Builder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema};

use super::SinkError;
use crate::memory::{MemoryLayout, TupleBuffer};
use crate::types::{PhysicalType, Schema, Value};

/// Arrow type of a stored field.
///
/// # Errors
///
/// Returns [`SinkError::Format`] for array fields, which have no columnar
/// mapping.
pub fn arrow_type(ty: &PhysicalType) -> Result<ArrowType, SinkError> {
    Ok(match ty {
        PhysicalType::Bool => ArrowType::Boolean,
        PhysicalType::Int8 => ArrowType::Int8,
        PhysicalType::Int16 => ArrowType::Int16,
        PhysicalType::Int32 => ArrowType::Int32,
        PhysicalType::Int64 => ArrowType::Int64,
        PhysicalType::UInt8 => ArrowType::UInt8,
        PhysicalType::UInt16 => ArrowType::UInt16,
        PhysicalType::UInt32 => ArrowType::UInt32,
        PhysicalType::UInt64 => ArrowType::UInt64,
        PhysicalType::Float32 => ArrowType::Float32,
        PhysicalType::Float64 => ArrowType::Float64,
        PhysicalType::Char(_) => ArrowType::Utf8,
        PhysicalType::Array(..) => {
            return Err(SinkError::Format(format!("no Arrow mapping for {ty:?}")))
        }
    })
}

/// Arrow schema with one non-nullable field per schema field.
///
/// # Errors
///
/// See [`arrow_type`]; also fails for schemas with undefined fields.
pub fn to_arrow_schema(schema: &Schema) -> Result<ArrowSchema, SinkError> {
    let physical = schema.physical_types()?;
    let fields = schema
        .fields()
        .iter()
        .zip(&physical)
        .map(|(field, ty)| Ok(ArrowField::new(field.name(), arrow_type(ty)?, false)))
        .collect::<Result<Vec<_>, SinkError>>()?;
    Ok(ArrowSchema::new(fields))
}

enum ColumnBuilder {
    Bool(BooleanBuilder),
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Float32(Float32Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
}

fn signed<T: TryFrom<i64>>(value: &Value) -> Option<T> {
    value.as_i64().and_then(|v| T::try_from(v).ok())
}

fn unsigned<T: TryFrom<u64>>(value: &Value) -> Option<T> {
    let wide = match value {
        Value::UInt(v) => Some(*v),
        Value::Int(v) => u64::try_from(*v).ok(),
        _ => None,
    };
    wide.and_then(|v| T::try_from(v).ok())
}

impl ColumnBuilder {
    fn new(ty: &PhysicalType, capacity: usize) -> Result<Self, SinkError> {
        Ok(match ty {
            PhysicalType::Bool => Self::Bool(BooleanBuilder::with_capacity(capacity)),
            PhysicalType::Int8 => Self::Int8(Int8Builder::with_capacity(capacity)),
            PhysicalType::Int16 => Self::Int16(Int16Builder::with_capacity(capacity)),
            PhysicalType::Int32 => Self::Int32(Int32Builder::with_capacity(capacity)),
            PhysicalType::Int64 => Self::Int64(Int64Builder::with_capacity(capacity)),
            PhysicalType::UInt8 => Self::UInt8(UInt8Builder::with_capacity(capacity)),
            PhysicalType::UInt16 => Self::UInt16(UInt16Builder::with_capacity(capacity)),
            PhysicalType::UInt32 => Self::UInt32(UInt32Builder::with_capacity(capacity)),
            PhysicalType::UInt64 => Self::UInt64(UInt64Builder::with_capacity(capacity)),
            PhysicalType::Float32 => Self::Float32(Float32Builder::with_capacity(capacity)),
            PhysicalType::Float64 => Self::Float64(Float64Builder::with_capacity(capacity)),
            PhysicalType::Char(len) => {
                Self::Utf8(StringBuilder::with_capacity(capacity, capacity * len))
            }
            PhysicalType::Array(..) => {
                return Err(SinkError::Format(format!("no Arrow mapping for {ty:?}")))
            }
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn append(&mut self, value: &Value) -> Result<(), SinkError> {
        let mismatch = || SinkError::Format(format!("value {value} does not fit its column"));
        match self {
            Self::Bool(b) => b.append_value(value.as_bool().ok_or_else(mismatch)?),
            Self::Int8(b) => b.append_value(signed(value).ok_or_else(mismatch)?),
            Self::Int16(b) => b.append_value(signed(value).ok_or_else(mismatch)?),
            Self::Int32(b) => b.append_value(signed(value).ok_or_else(mismatch)?),
            Self::Int64(b) => b.append_value(signed(value).ok_or_else(mismatch)?),
            Self::UInt8(b) => b.append_value(unsigned(value).ok_or_else(mismatch)?),
            Self::UInt16(b) => b.append_value(unsigned(value).ok_or_else(mismatch)?),
            Self::UInt32(b) => b.append_value(unsigned(value).ok_or_else(mismatch)?),
            Self::UInt64(b) => b.append_value(unsigned(value).ok_or_else(mismatch)?),
            Self::Float32(b) => b.append_value(value.as_f64().ok_or_else(mismatch)? as f32),
            Self::Float64(b) => b.append_value(value.as_f64().ok_or_else(mismatch)?),
            Self::Utf8(b) => match value {
                Value::Text(s) => b.append_value(s),
                _ => return Err(mismatch()),
            },
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Bool(b) => Arc::new(b.finish()),
            Self::Int8(b) => Arc::new(b.finish()),
            Self::Int16(b) => Arc::new(b.finish()),
            Self::Int32(b) => Arc::new(b.finish()),
            Self::Int64(b) => Arc::new(b.finish()),
            Self::UInt8(b) => Arc::new(b.finish()),
            Self::UInt16(b) => Arc::new(b.finish()),
            Self::UInt32(b) => Arc::new(b.finish()),
            Self::UInt64(b) => Arc::new(b.finish()),
            Self::Float32(b) => Arc::new(b.finish()),
            Self::Float64(b) => Arc::new(b.finish()),
            Self::Utf8(b) => Arc::new(b.finish()),
        }
    }
}

/// Accumulates records column-wise for one schema.
pub struct RecordBatchBridge {
    schema: Arc<ArrowSchema>,
    columns: Vec<ColumnBuilder>,
    rows: usize,
}

impl std::fmt::Debug for RecordBatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBatchBridge")
            .field("schema", &self.schema)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl RecordBatchBridge {
    /// Creates a bridge for `schema`, sized for `capacity` rows.
    ///
    /// # Errors
    ///
    /// See [`to_arrow_schema`].
    pub fn new(schema: &Schema, capacity: usize) -> Result<Self, SinkError> {
        let arrow = to_arrow_schema(schema)?;
        let columns = schema
            .physical_types()?
            .iter()
            .map(|ty| ColumnBuilder::new(ty, capacity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema: Arc::new(arrow),
            columns,
            rows: 0,
        })
    }

    /// Appends one decoded record.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Format`] for a wrong value count or a value that
    /// does not fit its column. Columns may then be uneven; discard the
    /// bridge.
    pub fn append_row(&mut self, row: &[Value]) -> Result<(), SinkError> {
        if row.len() != self.columns.len() {
            return Err(SinkError::Format(format!(
                "expected {} values, got {}",
                self.columns.len(),
                row.len()
            )));
        }
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.append(value)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Appends every record of `buffer`, returning how many were added.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Buffer`] for undecodable records, otherwise see
    /// [`append_row`](Self::append_row).
    pub fn append_buffer(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<usize, SinkError> {
        let mut record = Vec::with_capacity(self.columns.len());
        for index in 0..buffer.number_of_tuples() {
            layout.read_record_into(buffer, index, &mut record)?;
            self.append_row(&record)?;
        }
        Ok(buffer.number_of_tuples())
    }

    /// Rows accumulated since the last [`finish`](Self::finish).
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Materializes the accumulated rows and resets the builders.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Arrow`] if the columns do not form a valid batch.
    pub fn finish(&mut self) -> Result<RecordBatch, SinkError> {
        let arrays: Vec<ArrayRef> = self.columns.iter_mut().map(ColumnBuilder::finish).collect();
        self.rows = 0;
        Ok(RecordBatch::try_new(Arc::clone(&self.schema), arrays)?)
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Float64Type, Int64Type, UInt8Type};

    use super::*;
    use crate::types::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::uint8()),
            Field::new("ts", DataType::int64()),
            Field::new("speed", DataType::float64()),
            Field::new("name", DataType::char(8)),
        ])
        .unwrap()
    }

    #[test]
    fn test_schema_mapping() {
        let arrow = to_arrow_schema(&schema()).unwrap();
        let types: Vec<_> = arrow.fields().iter().map(|f| f.data_type().clone()).collect();
        assert_eq!(
            types,
            vec![ArrowType::UInt8, ArrowType::Int64, ArrowType::Float64, ArrowType::Utf8]
        );
    }

    #[test]
    fn test_buffer_to_batch() {
        let schema = Arc::new(schema());
        let layout = MemoryLayout::columnar(Arc::clone(&schema), 256).unwrap();
        let mut buffer = TupleBuffer::unpooled(256);
        for (id, ts) in [(1u64, 100i64), (2, 200), (3, 300)] {
            let row = [
                Value::UInt(id),
                Value::Int(ts),
                Value::Float(0.5 * ts as f64),
                Value::from("car"),
            ];
            layout.push_record(&mut buffer, &row).unwrap();
        }

        let mut bridge = RecordBatchBridge::new(&schema, 8).unwrap();
        assert_eq!(bridge.append_buffer(&buffer, &layout).unwrap(), 3);
        let batch = bridge.finish().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.column(0).as_primitive::<UInt8Type>().value(2), 3);
        assert_eq!(batch.column(1).as_primitive::<Int64Type>().value(1), 200);
        assert!((batch.column(2).as_primitive::<Float64Type>().value(0) - 50.0).abs() < 1e-9);
        assert_eq!(batch.column(3).as_string::<i32>().value(0), "car");
        assert_eq!(bridge.row_count(), 0);
    }

    #[test]
    fn test_mismatched_value_is_rejected() {
        let mut bridge = RecordBatchBridge::new(&schema(), 1).unwrap();
        let row = [Value::Int(-1), Value::Int(0), Value::Float(0.0), Value::from("x")];
        assert!(matches!(bridge.append_row(&row), Err(SinkError::Format(_))));
        assert!(matches!(bridge.append_row(&row[..2]), Err(SinkError::Format(_))));
    }

    #[test]
    fn test_arrays_have_no_mapping() {
        let schema = Schema::new(vec![Field::new("xs", DataType::array(2, DataType::int32()))])
            .unwrap();
        assert!(to_arrow_schema(&schema).is_err());
    }
}
