//! Result sinks.
//!
//! A [`SinkDescriptor`] names where a query's results go; at deployment it
//! is opened into a boxed [`SinkFormat`] that the sink pipeline feeds with
//! tuple buffers.

pub mod arrow;
mod format;

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::RecordBatch;
use parking_lot::Mutex;

pub use self::arrow::RecordBatchBridge;
pub use format::{CsvFormat, JsonFormat, SinkWriter, TextFormat};

use crate::memory::{BufferError, MemoryLayout, TupleBuffer};
use crate::types::{Schema, SchemaRef, TypeError, Value};

/// Errors raised while writing results.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The output target failed.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized.
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value or schema cannot be rendered by the format.
    #[error("format error: {0}")]
    Format(String),

    /// A record could not be read from its buffer.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// The schema has no physical representation.
    #[error("schema error: {0}")]
    Type(#[from] TypeError),

    /// Arrow rejected the assembled columns.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

/// Consumer of result buffers.
///
/// Implementations are owned by exactly one sink stage, which serializes
/// calls to them.
pub trait SinkFormat: Send {
    /// Short format name for logs.
    fn name(&self) -> &'static str;

    /// Called once before the first data buffer.
    ///
    /// Returns `false` if the format has no schema representation.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the target fails.
    fn write_schema(&mut self, schema: &Schema) -> Result<bool, SinkError>;

    /// Writes every record of `buffer`, decoded through `layout`.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if a record cannot be decoded or written.
    fn write_data(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<bool, SinkError>;

    /// Flushes buffered output.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the target fails.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Text format of a print or file sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatKind {
    /// [`CsvFormat`].
    #[default]
    Csv,
    /// [`JsonFormat`].
    Json,
    /// [`TextFormat`].
    Text,
}

impl FormatKind {
    /// Wraps `writer` in this format.
    #[must_use]
    pub fn writer(self, writer: SinkWriter) -> Box<dyn SinkFormat> {
        match self {
            Self::Csv => Box::new(CsvFormat::new(writer)),
            Self::Json => Box::new(JsonFormat::new(writer)),
            Self::Text => Box::new(TextFormat::new(writer)),
        }
    }
}

/// Where a query writes its results.
#[derive(Debug, Clone)]
pub enum SinkDescriptor {
    /// Standard output.
    Print(FormatKind),
    /// A file, truncated unless `append` is set.
    File {
        /// Target path.
        path: PathBuf,
        /// Output format.
        format: FormatKind,
        /// Append instead of truncating.
        append: bool,
    },
    /// In-memory collection.
    Collect(ResultCollector),
}

impl SinkDescriptor {
    /// Prints to stdout.
    #[must_use]
    pub fn print(format: FormatKind) -> Self {
        Self::Print(format)
    }

    /// Writes to `path`, truncating it.
    #[must_use]
    pub fn file(path: impl AsRef<Path>, format: FormatKind) -> Self {
        Self::File {
            path: path.as_ref().to_path_buf(),
            format,
            append: false,
        }
    }

    /// Collects into `collector`.
    #[must_use]
    pub fn collect(collector: ResultCollector) -> Self {
        Self::Collect(collector)
    }

    /// Short name for logs and plan dumps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Print(_) => "print",
            Self::File { .. } => "file",
            Self::Collect(_) => "collect",
        }
    }

    /// Opens the target.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if a file cannot be created.
    pub fn open(&self) -> Result<Box<dyn SinkFormat>, SinkError> {
        Ok(match self {
            Self::Print(format) => format.writer(Box::new(std::io::stdout())),
            Self::File {
                path,
                format,
                append,
            } => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(*append)
                    .truncate(!*append)
                    .open(path)?;
                format.writer(Box::new(BufWriter::new(file)))
            }
            Self::Collect(collector) => Box::new(collector.clone()),
        })
    }
}

#[derive(Debug, Default)]
struct Collected {
    schema: Option<SchemaRef>,
    rows: Vec<Vec<Value>>,
    buffers: u64,
}

/// Cloneable in-memory sink; every clone sees the same rows.
#[derive(Debug, Clone, Default)]
pub struct ResultCollector {
    inner: Arc<Mutex<Collected>>,
}

impl ResultCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected rows, in arrival order.
    #[must_use]
    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.inner.lock().rows.clone()
    }

    /// Rows collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    /// Returns `true` if no rows arrived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().rows.is_empty()
    }

    /// Data buffers written, not counting progress-only buffers.
    #[must_use]
    pub fn buffers(&self) -> u64 {
        self.inner.lock().buffers
    }

    /// Schema announced by the sink stage.
    #[must_use]
    pub fn schema(&self) -> Option<SchemaRef> {
        self.inner.lock().schema.clone()
    }

    /// Drops the collected rows, keeping the schema.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.rows.clear();
        inner.buffers = 0;
    }

    /// Collected rows as one Arrow batch; `None` before the schema is known.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the schema has no Arrow mapping.
    pub fn to_record_batch(&self) -> Result<Option<RecordBatch>, SinkError> {
        let inner = self.inner.lock();
        let Some(schema) = &inner.schema else {
            return Ok(None);
        };
        let mut bridge = RecordBatchBridge::new(schema, inner.rows.len())?;
        for row in &inner.rows {
            bridge.append_row(row)?;
        }
        bridge.finish().map(Some)
    }
}

impl SinkFormat for ResultCollector {
    fn name(&self) -> &'static str {
        "collect"
    }

    fn write_schema(&mut self, schema: &Schema) -> Result<bool, SinkError> {
        self.inner.lock().schema = Some(Arc::new(schema.clone()));
        Ok(true)
    }

    fn write_data(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<bool, SinkError> {
        let rows = (0..buffer.number_of_tuples())
            .map(|index| layout.read_record(buffer, index))
            .collect::<Result<Vec<_>, _>>()?;
        let mut inner = self.inner.lock();
        inner.rows.extend(rows);
        inner.buffers += 1;
        Ok(true)
    }
}
