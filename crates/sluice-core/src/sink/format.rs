//! Text output formats over any `Write` target.

use std::fmt::Write as _;
use std::io::Write;

use serde_json::{Map, Value as JsonValue};

use super::{SinkError, SinkFormat};
use crate::memory::{MemoryLayout, TupleBuffer};
use crate::types::{Schema, Value};

/// Boxed output target shared by the formats.
pub type SinkWriter = Box<dyn Write + Send>;

fn for_each_record<F>(
    buffer: &TupleBuffer,
    layout: &MemoryLayout,
    mut f: F,
) -> Result<(), SinkError>
where
    F: FnMut(&[Value]) -> Result<(), SinkError>,
{
    let mut record = Vec::with_capacity(layout.schema().len());
    for index in 0..buffer.number_of_tuples() {
        layout.read_record_into(buffer, index, &mut record)?;
        f(&record)?;
    }
    Ok(())
}

// ── CSV ────────────────────────────────────────────────────────────────

/// Comma-separated values with a header line.
///
/// Fields containing a comma, quote or line break are quoted, with quotes
/// doubled.
pub struct CsvFormat {
    writer: SinkWriter,
    line: String,
}

impl CsvFormat {
    /// Writes CSV to `writer`.
    #[must_use]
    pub fn new(writer: SinkWriter) -> Self {
        Self {
            writer,
            line: String::new(),
        }
    }

    fn push_field(line: &mut String, text: &str) {
        if text.contains([',', '"', '\n', '\r']) {
            line.push('"');
            line.push_str(&text.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(text);
        }
    }

    fn write_line<I, S>(&mut self, fields: I) -> Result<(), SinkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.line.clear();
        for (i, field) in fields.into_iter().enumerate() {
            if i > 0 {
                self.line.push(',');
            }
            Self::push_field(&mut self.line, field.as_ref());
        }
        self.line.push('\n');
        self.writer.write_all(self.line.as_bytes())?;
        Ok(())
    }
}

impl SinkFormat for CsvFormat {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write_schema(&mut self, schema: &Schema) -> Result<bool, SinkError> {
        self.write_line(schema.fields().iter().map(|f| f.name()))?;
        Ok(true)
    }

    fn write_data(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<bool, SinkError> {
        let mut rendered: Vec<String> = Vec::new();
        for_each_record(buffer, layout, |record| {
            rendered.clear();
            rendered.extend(record.iter().map(ToString::to_string));
            self.write_line(&rendered)
        })?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(self.writer.flush()?)
    }
}

impl std::fmt::Debug for CsvFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvFormat").finish_non_exhaustive()
    }
}

// ── JSON lines ─────────────────────────────────────────────────────────

/// One JSON object per record, keyed by field name.
pub struct JsonFormat {
    writer: SinkWriter,
    names: Vec<String>,
}

impl JsonFormat {
    /// Writes JSON lines to `writer`.
    #[must_use]
    pub fn new(writer: SinkWriter) -> Self {
        Self {
            writer,
            names: Vec::new(),
        }
    }
}

impl SinkFormat for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    /// Remembers the field names; JSON lines carry no header.
    fn write_schema(&mut self, schema: &Schema) -> Result<bool, SinkError> {
        self.names = schema.fields().iter().map(|f| f.name().to_string()).collect();
        Ok(false)
    }

    fn write_data(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<bool, SinkError> {
        if self.names.len() != layout.schema().len() {
            self.names = layout.schema().fields().iter().map(|f| f.name().to_string()).collect();
        }
        let Self { writer, names } = self;
        for_each_record(buffer, layout, |record| {
            let object: Map<String, JsonValue> = names
                .iter()
                .zip(record)
                .map(|(name, value)| serde_json::to_value(value).map(|v| (name.clone(), v)))
                .collect::<Result<_, _>>()?;
            serde_json::to_writer(&mut *writer, &object)?;
            writer.write_all(b"\n")?;
            Ok(())
        })?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(self.writer.flush()?)
    }
}

impl std::fmt::Debug for JsonFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFormat")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

// ── Text ───────────────────────────────────────────────────────────────

/// Human-readable dump: the schema, then one line per buffer and record.
pub struct TextFormat {
    writer: SinkWriter,
}

impl TextFormat {
    /// Writes text to `writer`.
    #[must_use]
    pub fn new(writer: SinkWriter) -> Self {
        Self { writer }
    }
}

impl SinkFormat for TextFormat {
    fn name(&self) -> &'static str {
        "text"
    }

    fn write_schema(&mut self, schema: &Schema) -> Result<bool, SinkError> {
        writeln!(self.writer, "schema {schema}")?;
        Ok(true)
    }

    fn write_data(
        &mut self,
        buffer: &TupleBuffer,
        layout: &MemoryLayout,
    ) -> Result<bool, SinkError> {
        let header = buffer.header();
        writeln!(
            self.writer,
            "buffer origin={} seq={} chunk={} watermark={} tuples={}",
            header.origin_id,
            header.sequence_number,
            header.chunk_number,
            header.watermark,
            header.number_of_tuples
        )?;
        let mut line = String::new();
        let writer = &mut self.writer;
        for_each_record(buffer, layout, |record| {
            line.clear();
            line.push_str("  |");
            for value in record {
                // Formatting into a String cannot fail.
                let _ = write!(line, " {value} |");
            }
            line.push('\n');
            writer.write_all(line.as_bytes())?;
            Ok(())
        })?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(self.writer.flush()?)
    }
}

impl std::fmt::Debug for TextFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextFormat").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::types::{DataType, Field};

    /// `Write` target that stays readable after being boxed.
    #[derive(Clone, Default)]
    struct SharedOutput(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedOutput {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedOutput {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn fixture() -> (Schema, MemoryLayout, TupleBuffer) {
        let schema = Schema::new(vec![
            Field::new("id", DataType::int64()),
            Field::new("name", DataType::char(8)),
        ])
        .unwrap();
        let layout = MemoryLayout::row(Arc::new(schema.clone()), 128).unwrap();
        let mut buffer = TupleBuffer::unpooled(128);
        layout
            .push_record(&mut buffer, &[Value::Int(1), Value::from("a,b")])
            .unwrap();
        layout
            .push_record(&mut buffer, &[Value::Int(2), Value::from("plain")])
            .unwrap();
        (schema, layout, buffer)
    }

    #[test]
    fn test_csv_header_and_quoting() {
        let (schema, layout, buffer) = fixture();
        let out = SharedOutput::default();
        let mut format = CsvFormat::new(Box::new(out.clone()));
        assert!(format.write_schema(&schema).unwrap());
        assert!(format.write_data(&buffer, &layout).unwrap());
        format.flush().unwrap();
        assert_eq!(out.text(), "id,name\n1,\"a,b\"\n2,plain\n");
    }

    #[test]
    fn test_json_lines() {
        let (schema, layout, buffer) = fixture();
        let out = SharedOutput::default();
        let mut format = JsonFormat::new(Box::new(out.clone()));
        assert!(!format.write_schema(&schema).unwrap());
        format.write_data(&buffer, &layout).unwrap();

        let lines: Vec<serde_json::Value> = out
            .text()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["name"], "a,b");
        assert_eq!(lines[1]["name"], "plain");
    }

    #[test]
    fn test_text_dump_includes_progress() {
        let (schema, layout, mut buffer) = fixture();
        buffer.header_mut().sequence_number = 7;
        let out = SharedOutput::default();
        let mut format = TextFormat::new(Box::new(out.clone()));
        format.write_schema(&schema).unwrap();
        format.write_data(&buffer, &layout).unwrap();
        let text = out.text();
        assert!(text.contains("seq=7"));
        assert!(text.contains("| 2 | plain |"));
    }
}
