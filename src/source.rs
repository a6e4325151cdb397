//! Incremental CSV decoding into [`RawRecord`]s.

use std::sync::Arc;

use csv_async::{AsyncReader, ByteRecord, ErrorKind};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::config::CsvFormat;
use crate::{IngestError, IngestResult};

/// One malformed data row. Recoverable unless the run aborts on row errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowDecodeError {
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: field `{column}` is not valid UTF-8")]
    InvalidUtf8 { line: u64, column: String },
    #[error("line {line}: {message}")]
    Malformed { line: u64, message: String },
}

impl RowDecodeError {
    pub fn line(&self) -> u64 {
        match self {
            RowDecodeError::FieldCount { line, .. }
            | RowDecodeError::InvalidUtf8 { line, .. }
            | RowDecodeError::Malformed { line, .. } => *line,
        }
    }
}

/// One decoded row: ordered column name -> raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Line in the source where the row starts (header is line 1).
    pub line: u64,
    columns: Arc<[String]>,
    fields: Vec<String>,
}

impl RawRecord {
    pub fn new(line: u64, columns: Arc<[String]>, fields: Vec<String>) -> Self {
        Self {
            line,
            columns,
            fields,
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.fields.get(idx))
            .map(String::as_str)
    }

    pub fn field(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.fields.iter().map(String::as_str))
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }
}

/// Pull-based CSV record source over any byte stream.
///
/// The header is checked in [`RecordSource::open`]; afterwards each call to
/// [`RecordSource::next_record`] decodes at most one row. Finite, not
/// restartable.
pub struct RecordSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    reader: AsyncReader<R>,
    columns: Arc<[String]>,
    record: ByteRecord,
    rows: u64,
}

impl<R> std::fmt::Debug for RecordSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSource")
            .field("columns", &self.columns)
            .field("rows", &self.rows)
            .finish()
    }
}

impl<R> RecordSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Read and validate the header row.
    ///
    /// Names and order must equal `format.columns` exactly, otherwise
    /// `SchemaMismatch` is returned before any data row is decoded.
    pub async fn open(reader: R, format: &CsvFormat) -> IngestResult<Self> {
        let mut rdr = format.reader_builder().create_reader(reader);

        let headers = rdr.byte_headers().await.map_err(csv_fatal)?.clone();
        let found: Vec<String> = headers
            .iter()
            .map(|h| String::from_utf8_lossy(h).into_owned())
            .collect();
        if found != format.columns {
            return Err(IngestError::SchemaMismatch {
                expected: format.columns.clone(),
                found,
            });
        }
        tracing::debug!(columns = ?found, "source header accepted");

        Ok(Self {
            reader: rdr,
            columns: found.into(),
            record: ByteRecord::new(),
            rows: 0,
        })
    }

    /// Data rows decoded so far, malformed ones included.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Decode the next row.
    ///
    /// `Ok(None)` is end of input. `Ok(Some(Err(_)))` is a malformed row the
    /// caller may skip. `Err(_)` is a transport failure, the source is done.
    pub async fn next_record(&mut self) -> IngestResult<Option<Result<RawRecord, RowDecodeError>>> {
        let more = match self.reader.read_byte_record(&mut self.record).await {
            Ok(more) => more,
            Err(err) if matches!(err.kind(), ErrorKind::Io(_)) => return Err(csv_fatal(err)),
            Err(err) => {
                self.rows += 1;
                return Ok(Some(Err(RowDecodeError::Malformed {
                    line: self.rows + 1,
                    message: err.to_string(),
                })));
            }
        };
        if !more {
            return Ok(None);
        }
        self.rows += 1;

        let line = self
            .record
            .position()
            .map(|p| p.line())
            .unwrap_or(self.rows + 1);
        Ok(Some(self.decode_current(line)))
    }

    fn decode_current(&self, line: u64) -> Result<RawRecord, RowDecodeError> {
        if self.record.len() != self.columns.len() {
            return Err(RowDecodeError::FieldCount {
                line,
                expected: self.columns.len(),
                found: self.record.len(),
            });
        }

        let fields = self
            .record
            .iter()
            .zip(self.columns.iter())
            .map(|(raw, column)| {
                std::str::from_utf8(raw)
                    .map(str::to_owned)
                    .map_err(|_| RowDecodeError::InvalidUtf8 {
                        line,
                        column: column.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RawRecord::new(line, Arc::clone(&self.columns), fields))
    }
}

fn csv_fatal(err: csv_async::Error) -> IngestError {
    match err.kind() {
        ErrorKind::Io(io) => IngestError::Transport(io.to_string()),
        _ => IngestError::Transport(err.to_string()),
    }
}
