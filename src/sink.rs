//! COPY FROM STDIN write path.
//!
//! Encodes validated records as COPY text rows and streams them into one
//! bulk channel. Flushes at a byte threshold to bound memory usage.

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use pg_escape::quote_identifier;

use crate::config::TargetSchema;
use crate::filter::{FieldValue, ValidatedRecord};
use crate::store::{CopyChannel, Store};
use crate::{IngestError, IngestResult};

/// Open bulk load into one table.
///
/// `write` returns once the row sits in the transport buffer; when the buffer
/// crosses the flush threshold it waits for the channel to take it. Dropping
/// the sink without `finalize` abandons the load.
pub struct BulkSink {
    channel: Box<dyn CopyChannel>,
    table: String,
    buf: Vec<u8>,
    flush_bytes: usize,
    timeout: Duration,
    streamed: u64,
}

impl BulkSink {
    pub async fn begin<S>(
        store: &S,
        schema: &TargetSchema,
        flush_bytes: usize,
        timeout: Duration,
    ) -> IngestResult<Self>
    where
        S: Store + ?Sized,
    {
        let statement = copy_statement(schema);
        let channel = tokio::time::timeout(timeout, store.copy_in(&statement))
            .await
            .map_err(|_| IngestError::SinkRejected(format!("COPY start timed out after {timeout:?}")))?
            .map_err(|e| IngestError::SinkRejected(format!("COPY start failed: {e}")))?;
        tracing::debug!(%statement, "bulk channel open");

        let flush_bytes = flush_bytes.max(1);
        Ok(Self {
            channel,
            table: schema.table.clone(),
            buf: Vec::with_capacity(flush_bytes),
            flush_bytes,
            timeout,
            streamed: 0,
        })
    }

    /// Rows handed to the transport so far. Nothing is committed before `finalize`.
    pub fn streamed(&self) -> u64 {
        self.streamed
    }

    pub async fn write(&mut self, record: ValidatedRecord) -> IngestResult<()> {
        encode_row(&mut self.buf, &record.values);
        self.streamed += 1;

        if self.buf.len() >= self.flush_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> IngestResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(self.flush_bytes),
        ));
        tokio::time::timeout(self.timeout, self.channel.send(chunk))
            .await
            .map_err(|_| IngestError::SinkRejected(format!("COPY send timed out after {:?}", self.timeout)))?
            .map_err(|e| IngestError::SinkRejected(format!("COPY send failed: {e}")))
    }

    /// Flush what is left and close the channel. Returns the committed row count.
    pub async fn finalize(mut self) -> IngestResult<u64> {
        self.flush().await?;

        let committed = tokio::time::timeout(self.timeout, self.channel.finish())
            .await
            .map_err(|_| IngestError::SinkRejected(format!("COPY finish timed out after {:?}", self.timeout)))?
            .map_err(|e| IngestError::SinkRejected(format!("COPY finish failed: {e}")))?;

        if committed != self.streamed {
            tracing::warn!(
                table = %self.table,
                streamed = self.streamed,
                committed,
                "store committed a different row count than streamed"
            );
        }
        tracing::info!(table = %self.table, rows = committed, "COPY committed");
        Ok(committed)
    }
}

/// `COPY <table> (<cols>) FROM STDIN WITH (FORMAT text)`
pub fn copy_statement(schema: &TargetSchema) -> String {
    let col_list = schema
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        quote_identifier(&schema.table),
        col_list
    )
}

/// Append one COPY text row: tab separated, newline terminated.
pub(crate) fn encode_row(buf: &mut Vec<u8>, values: &[FieldValue]) {
    for (pos, value) in values.iter().enumerate() {
        if pos > 0 {
            buf.push(b'\t');
        }
        encode_value(buf, value);
    }
    buf.push(b'\n');
}

/// COPY text format rules:
/// - NULL: `\N`
/// - Strings: backslash-escape `\`, tab, newline, carriage return; strip null bytes
fn encode_value(buf: &mut Vec<u8>, value: &FieldValue) {
    match value {
        FieldValue::Null => buf.extend_from_slice(b"\\N"),
        FieldValue::Integer(v) => {
            let _ = write!(buf, "{v}");
        }
        FieldValue::Identifier(id) => {
            let _ = write!(buf, "{id}");
        }
        FieldValue::Text(text) => {
            for byte in text.bytes() {
                match byte {
                    b'\\' => buf.extend_from_slice(b"\\\\"),
                    b'\t' => buf.extend_from_slice(b"\\t"),
                    b'\n' => buf.extend_from_slice(b"\\n"),
                    b'\r' => buf.extend_from_slice(b"\\r"),
                    0 => {}
                    _ => buf.push(byte),
                }
            }
        }
    }
}
