use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::manager::PoolInner;

/// A tuple buffer shared between several readers (e.g. fan-out successors).
///
/// The buffer returns to its pool when the last clone is dropped.
pub type SharedBuffer = Arc<TupleBuffer>;

/// Metadata travelling with every buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferHeader {
    /// Size of the data region in bytes.
    pub buffer_size: usize,
    /// Stride of one record; 0 until a layout writes to the buffer.
    pub tuple_size_bytes: usize,
    /// Records currently stored.
    pub number_of_tuples: usize,
    /// Milliseconds since the Unix epoch at checkout.
    pub creation_timestamp: i64,
    /// Per-origin sequence number, starting at 1. 0 means unsequenced.
    pub sequence_number: u64,
    /// Position of this buffer among the outputs produced for one input.
    pub chunk_number: u32,
    /// `true` on the final chunk for a sequence number.
    pub last_chunk: bool,
    /// Event-time watermark carried by the buffer.
    pub watermark: i64,
    /// Origin (source or emitting operator) the sequence number belongs to.
    pub origin_id: u64,
}

/// A fixed-size region of record memory.
///
/// Pooled buffers hand their memory back to the [`BufferManager`](super::BufferManager)
/// on drop.
pub struct TupleBuffer {
    data: Box<[u8]>,
    header: BufferHeader,
    recycler: Option<Arc<PoolInner>>,
}

impl TupleBuffer {
    pub(crate) fn pooled(data: Box<[u8]>, recycler: Arc<PoolInner>) -> Self {
        let mut buffer = Self::from_data(data);
        buffer.recycler = Some(recycler);
        buffer
    }

    /// Allocates a buffer that does not belong to any pool.
    #[must_use]
    pub fn unpooled(size: usize) -> Self {
        Self::from_data(vec![0u8; size].into_boxed_slice())
    }

    /// A zero-sized buffer that only carries progress metadata.
    #[must_use]
    pub fn control() -> Self {
        Self::unpooled(0)
    }

    fn from_data(data: Box<[u8]>) -> Self {
        let header = BufferHeader {
            buffer_size: data.len(),
            creation_timestamp: now_millis(),
            last_chunk: true,
            ..BufferHeader::default()
        };
        Self {
            data,
            header,
            recycler: None,
        }
    }

    /// Wraps the buffer for shared, reference-counted access.
    #[must_use]
    pub fn into_shared(self) -> SharedBuffer {
        Arc::new(self)
    }

    /// Buffer metadata.
    #[must_use]
    pub fn header(&self) -> &BufferHeader {
        &self.header
    }

    /// Mutable buffer metadata.
    pub fn header_mut(&mut self) -> &mut BufferHeader {
        &mut self.header
    }

    /// Raw record bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw record bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Size of the data region in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.data.len()
    }

    /// Records currently stored.
    #[must_use]
    pub fn number_of_tuples(&self) -> usize {
        self.header.number_of_tuples
    }

    /// Returns `true` if no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.number_of_tuples == 0
    }

    /// Event-time watermark carried by the buffer.
    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.header.watermark
    }

    /// Sets the carried watermark.
    pub fn set_watermark(&mut self, watermark: i64) {
        self.header.watermark = watermark;
    }

    /// Origin id.
    #[must_use]
    pub fn origin_id(&self) -> u64 {
        self.header.origin_id
    }

    /// Per-origin sequence number.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    /// Creation time in epoch milliseconds.
    #[must_use]
    pub fn creation_timestamp(&self) -> i64 {
        self.header.creation_timestamp
    }

    /// Returns `true` if the buffer belongs to a pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.recycler.is_some()
    }

    /// Copies the progress metadata of `other` (origin, sequence, watermark).
    pub fn inherit_progress(&mut self, other: &TupleBuffer) {
        self.header.origin_id = other.header.origin_id;
        self.header.sequence_number = other.header.sequence_number;
        self.header.watermark = other.header.watermark;
        self.header.creation_timestamp = other.header.creation_timestamp;
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("header", &self.header)
            .field("pooled", &self.is_pooled())
            .finish_non_exhaustive()
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.recycler.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

/// Wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
