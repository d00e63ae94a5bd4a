use std::ops::Range;

use crate::types::{PhysicalType, SchemaRef, Value};

use super::{BufferError, TupleBuffer};

/// Physical record order inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Records stored one after another, fields contiguous per record.
    #[default]
    Row,
    /// One contiguous column per field.
    Columnar,
}

/// Maps a schema onto the bytes of a fixed-size tuple buffer.
///
/// The record stride is the exact sum of the field sizes; there is no
/// alignment padding in either layout.
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    kind: LayoutKind,
    schema: SchemaRef,
    physical: Vec<PhysicalType>,
    /// Row: offset inside a record. Columnar: start of the column.
    offsets: Vec<usize>,
    tuple_size: usize,
    capacity: usize,
    buffer_size: usize,
}

impl MemoryLayout {
    /// Computes a layout for `schema` in buffers of `buffer_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfiguration`] for an empty schema,
    /// [`BufferError::TupleTooLarge`] if not even one record fits, and
    /// [`BufferError::Codec`] if a field has no physical type.
    pub fn new(kind: LayoutKind, schema: SchemaRef, buffer_size: usize) -> Result<Self, BufferError> {
        let physical = schema.physical_types()?;
        let sizes: Vec<usize> = physical.iter().map(PhysicalType::size).collect();
        let tuple_size: usize = sizes.iter().sum();
        if tuple_size == 0 {
            return Err(BufferError::InvalidConfiguration(format!(
                "schema {schema} has a zero-sized record"
            )));
        }
        let capacity = buffer_size / tuple_size;
        if capacity == 0 {
            return Err(BufferError::TupleTooLarge {
                tuple_size,
                buffer_size,
            });
        }
        let scale = match kind {
            LayoutKind::Row => 1,
            LayoutKind::Columnar => capacity,
        };
        let offsets = sizes
            .iter()
            .scan(0, |acc, size| {
                let offset = *acc;
                *acc += size * scale;
                Some(offset)
            })
            .collect();
        Ok(Self {
            kind,
            schema,
            physical,
            offsets,
            tuple_size,
            capacity,
            buffer_size,
        })
    }

    /// Row-major layout.
    ///
    /// # Errors
    ///
    /// See [`MemoryLayout::new`].
    pub fn row(schema: SchemaRef, buffer_size: usize) -> Result<Self, BufferError> {
        Self::new(LayoutKind::Row, schema, buffer_size)
    }

    /// Column-major layout.
    ///
    /// # Errors
    ///
    /// See [`MemoryLayout::new`].
    pub fn columnar(schema: SchemaRef, buffer_size: usize) -> Result<Self, BufferError> {
        Self::new(LayoutKind::Columnar, schema, buffer_size)
    }

    /// Layout kind.
    #[must_use]
    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    /// The schema this layout stores.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Record stride in bytes.
    #[must_use]
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Records per buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffer size the layout was computed for.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Physical type of field `field`.
    #[must_use]
    pub fn physical_type(&self, field: usize) -> &PhysicalType {
        &self.physical[field]
    }

    fn field_range(&self, record: usize, field: usize) -> Range<usize> {
        let size = self.physical[field].size();
        let start = match self.kind {
            LayoutKind::Row => record * self.tuple_size + self.offsets[field],
            LayoutKind::Columnar => self.offsets[field] + record * size,
        };
        start..start + size
    }

    fn check_buffer(&self, buffer: &TupleBuffer) -> Result<(), BufferError> {
        if buffer.buffer_size() < self.buffer_size {
            return Err(BufferError::LayoutMismatch {
                expected: self.buffer_size,
                actual: buffer.buffer_size(),
            });
        }
        Ok(())
    }

    fn check_record(&self, buffer: &TupleBuffer, record: usize) -> Result<(), BufferError> {
        self.check_buffer(buffer)?;
        if record >= buffer.number_of_tuples() {
            return Err(BufferError::RecordOutOfBounds {
                index: record,
                count: buffer.number_of_tuples(),
            });
        }
        Ok(())
    }

    /// Raw bytes of one field of one record.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::RecordOutOfBounds`] or [`BufferError::LayoutMismatch`].
    pub fn field_bytes<'a>(
        &self,
        buffer: &'a TupleBuffer,
        record: usize,
        field: usize,
    ) -> Result<&'a [u8], BufferError> {
        self.check_record(buffer, record)?;
        Ok(&buffer.data()[self.field_range(record, field)])
    }

    /// Decodes one field of one record.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::RecordOutOfBounds`], [`BufferError::LayoutMismatch`]
    /// or [`BufferError::Codec`] for malformed bytes.
    pub fn read_field(
        &self,
        buffer: &TupleBuffer,
        record: usize,
        field: usize,
    ) -> Result<Value, BufferError> {
        let bytes = self.field_bytes(buffer, record, field)?;
        Ok(self.physical[field].read(bytes)?)
    }

    /// Decodes a whole record into `out`, reusing its allocation.
    ///
    /// # Errors
    ///
    /// See [`MemoryLayout::read_field`].
    pub fn read_record_into(
        &self,
        buffer: &TupleBuffer,
        record: usize,
        out: &mut Vec<Value>,
    ) -> Result<(), BufferError> {
        self.check_record(buffer, record)?;
        out.clear();
        for (field, physical) in self.physical.iter().enumerate() {
            out.push(physical.read(&buffer.data()[self.field_range(record, field)])?);
        }
        Ok(())
    }

    /// Decodes a whole record.
    ///
    /// # Errors
    ///
    /// See [`MemoryLayout::read_field`].
    pub fn read_record(&self, buffer: &TupleBuffer, record: usize) -> Result<Vec<Value>, BufferError> {
        let mut out = Vec::with_capacity(self.physical.len());
        self.read_record_into(buffer, record, &mut out)?;
        Ok(out)
    }

    /// Appends a record after the last stored one.
    ///
    /// On any error the buffer's existing records and count are unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::CapacityExceeded`] when the buffer is full,
    /// [`BufferError::ArityMismatch`] for a wrong value count and
    /// [`BufferError::Codec`] if a value does not fit its field.
    pub fn push_record(&self, buffer: &mut TupleBuffer, values: &[Value]) -> Result<usize, BufferError> {
        self.check_buffer(buffer)?;
        let index = buffer.number_of_tuples();
        if index >= self.capacity {
            return Err(BufferError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        if values.len() != self.physical.len() {
            return Err(BufferError::ArityMismatch {
                expected: self.physical.len(),
                actual: values.len(),
            });
        }
        for (field, value) in values.iter().enumerate() {
            let range = self.field_range(index, field);
            self.physical[field].write(&mut buffer.data_mut()[range], value)?;
        }
        let header = buffer.header_mut();
        header.number_of_tuples = index + 1;
        header.tuple_size_bytes = self.tuple_size;
        Ok(index)
    }

    /// Returns `true` if the buffer cannot take another record.
    #[must_use]
    pub fn is_full(&self, buffer: &TupleBuffer) -> bool {
        buffer.number_of_tuples() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        Arc::new(
            Schema::new(vec![
                Field::new("id", DataType::uint32()),
                Field::new("value", DataType::int64()),
            ])
            .unwrap(),
        )
    }

    fn record(id: u64, value: i64) -> Vec<Value> {
        vec![Value::UInt(id), Value::Int(value)]
    }

    #[test]
    fn test_capacity_from_stride() {
        let layout = MemoryLayout::row(schema(), 100).unwrap();
        assert_eq!(layout.tuple_size(), 12);
        assert_eq!(layout.capacity(), 8);
    }

    #[test]
    fn test_tuple_too_large() {
        assert!(matches!(
            MemoryLayout::row(schema(), 10),
            Err(BufferError::TupleTooLarge { tuple_size: 12, .. })
        ));
    }

    #[test]
    fn test_push_beyond_capacity_keeps_existing() {
        for layout in [
            MemoryLayout::row(schema(), 24).unwrap(),
            MemoryLayout::columnar(schema(), 24).unwrap(),
        ] {
            let mut buffer = TupleBuffer::unpooled(24);
            layout.push_record(&mut buffer, &record(1, 10)).unwrap();
            layout.push_record(&mut buffer, &record(2, 20)).unwrap();
            assert!(layout.is_full(&buffer));
            assert!(matches!(
                layout.push_record(&mut buffer, &record(3, 30)),
                Err(BufferError::CapacityExceeded { capacity: 2 })
            ));
            assert_eq!(buffer.number_of_tuples(), 2);
            assert_eq!(layout.read_record(&buffer, 0).unwrap(), record(1, 10));
            assert_eq!(layout.read_record(&buffer, 1).unwrap(), record(2, 20));
        }
    }

    #[test]
    fn test_failed_write_does_not_count() {
        let layout = MemoryLayout::row(schema(), 64).unwrap();
        let mut buffer = TupleBuffer::unpooled(64);
        let bad = vec![Value::Int(-5), Value::Int(1)];
        assert!(layout.push_record(&mut buffer, &bad).is_err());
        assert_eq!(buffer.number_of_tuples(), 0);
    }

    #[test]
    fn test_columnar_fields_are_contiguous() {
        let layout = MemoryLayout::columnar(schema(), 48).unwrap();
        let mut buffer = TupleBuffer::unpooled(48);
        layout.push_record(&mut buffer, &record(7, 1)).unwrap();
        layout.push_record(&mut buffer, &record(8, 2)).unwrap();
        // ids occupy the first 4 * capacity bytes
        assert_eq!(&buffer.data()[0..4], &7u32.to_le_bytes());
        assert_eq!(&buffer.data()[4..8], &8u32.to_le_bytes());
    }

    #[test]
    fn test_read_past_count() {
        let layout = MemoryLayout::row(schema(), 64).unwrap();
        let buffer = TupleBuffer::unpooled(64);
        assert!(matches!(
            layout.read_field(&buffer, 0, 0),
            Err(BufferError::RecordOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_small_buffer_rejected() {
        let layout = MemoryLayout::row(schema(), 64).unwrap();
        let mut buffer = TupleBuffer::unpooled(16);
        assert!(matches!(
            layout.push_record(&mut buffer, &record(1, 1)),
            Err(BufferError::LayoutMismatch { .. })
        ));
    }
}
