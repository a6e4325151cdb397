//! Streaming CSV ingestion into PostgreSQL with a referential filter.
//!
//! - Source: HTTP(S) or local file, gzip/zstd and charset handled on the fly.
//! - Filter: rows whose foreign key is missing from a snapshot of parent ids are dropped.
//! - Sink: one `COPY ... FROM STDIN` per run, all-or-nothing.
//!
//! Data shape:
//! - `RawRecord` (column name -> text) out of the source
//! - `ValidatedRecord` (typed values, parent `Identifier`) into the sink
//! - `LoadResult { read, accepted, rejected, inserted, status, error }` at the end
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
pub mod ddl;
pub mod filter;
pub mod identity;
mod io;
pub mod logging;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod store;

pub use crate::config::{ColumnSpec, ColumnType, CsvFormat, IngestConfig, TargetSchema};
pub use crate::filter::{FieldValue, ReferentialFilter, Rejection, ValidatedRecord};
pub use crate::identity::{IdentitySet, Identifier};
pub use crate::io::{
    build_csv_reader, reader_from_path, reader_from_url, BoxedReader, Compression, CsvMeta,
    SourceLocation,
};
pub use crate::pipeline::{LoadResult, Pipeline, PipelineState, STAGE_COUNT};
pub use crate::sink::BulkSink;
pub use crate::source::{RawRecord, RecordSource, RowDecodeError};
pub use crate::store::{CopyChannel, PgStore, Store, StoreError};

use thiserror::Error;

/// Fatal errors of an ingest run.
///
/// Per-row problems are not in here unless `abort_on_row_error` promotes a
/// [`RowDecodeError`]; ordinary rejections are counted, see [`Rejection`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IngestError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("schema mismatch: expected header {expected:?}, found {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("row decode error: {0}")]
    RowDecode(#[from] RowDecodeError),
    #[error("bulk load rejected: {0}")]
    SinkRejected(String),
    #[error("pipeline stage fault: {0}")]
    StageFault(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl IngestError {
    /// Stable short name, used in logs and the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::StoreUnavailable(_) => "StoreUnavailable",
            IngestError::SchemaMismatch { .. } => "SchemaMismatch",
            IngestError::Transport(_) => "TransportError",
            IngestError::RowDecode(_) => "RowDecodeError",
            IngestError::SinkRejected(_) => "SinkRejected",
            IngestError::StageFault(_) => "StageFault",
            IngestError::Cancelled => "Cancelled",
            IngestError::Config(_) => "ConfigError",
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Transport(err.to_string())
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
