//! Tuple buffers, the buffer pool and record layouts.
//!
//! All record data moves through fixed-size [`TupleBuffer`]s checked out of a
//! shared [`BufferManager`]. A buffer returns to its pool when the last
//! holder drops it, so sharing is expressed with [`SharedBuffer`] (`Arc`).
//! A [`MemoryLayout`] maps a schema onto the bytes of a buffer in either row
//! or columnar order.

mod buffer;
mod layout;
mod manager;

pub use buffer::{BufferHeader, SharedBuffer, TupleBuffer};
pub(crate) use buffer::now_millis;
pub use layout::{LayoutKind, MemoryLayout};
pub use manager::BufferManager;

use crate::types::TypeError;

/// Errors from buffers, the pool and layouts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    /// A record was pushed into a full buffer.
    #[error("buffer is full (capacity: {capacity})")]
    CapacityExceeded {
        /// Records per buffer.
        capacity: usize,
    },

    /// The pool was destroyed while the caller waited for a buffer.
    #[error("buffer pool destroyed")]
    PoolDestroyed,

    /// No buffer became free within the requested time.
    #[error("timed out waiting for a free buffer")]
    Timeout,

    /// Pool or layout parameters are unusable.
    #[error("invalid buffer configuration: {0}")]
    InvalidConfiguration(String),

    /// A single record does not fit into one buffer.
    #[error("tuple of {tuple_size} bytes does not fit into a {buffer_size} byte buffer")]
    TupleTooLarge {
        /// Record stride.
        tuple_size: usize,
        /// Buffer size.
        buffer_size: usize,
    },

    /// The buffer is smaller than the layout was computed for.
    #[error("layout expects {expected} byte buffers, got {actual}")]
    LayoutMismatch {
        /// Buffer size the layout was built for.
        expected: usize,
        /// Actual buffer size.
        actual: usize,
    },

    /// A record index past `number_of_tuples` was read.
    #[error("record {index} out of bounds ({count} records)")]
    RecordOutOfBounds {
        /// Requested record.
        index: usize,
        /// Records in the buffer.
        count: usize,
    },

    /// A record with the wrong number of values was written.
    #[error("expected {expected} values, got {actual}")]
    ArityMismatch {
        /// Fields in the schema.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },

    /// A field failed to encode or decode.
    #[error("field codec error: {0}")]
    Codec(#[from] TypeError),
}
