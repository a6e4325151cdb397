//! Run configuration: CSV dialect, target table layout, flow-control knobs.

use std::time::Duration;

use csv_async::{AsyncReaderBuilder, Terminator};

use crate::{IngestError, IngestResult};

/// Default bounded queue capacity between stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
/// Default COPY flush buffer size (4 MB).
pub const DEFAULT_FLUSH_BYTES: usize = 4 * 1024 * 1024;
/// Default deadline for store round trips.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for establishing the HTTP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default longest silence tolerated while reading the HTTP response.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Fixed CSV dialect. No sniffing: the header must match `columns` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvFormat {
    pub delimiter: u8,
    pub quote: u8,
    /// `None` means quotes are escaped by doubling (`""`).
    pub escape: Option<u8>,
    /// Expected header, in order.
    pub columns: Vec<String>,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
            escape: None,
            columns: ["orderId", "customerId", "item", "quantity"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl CsvFormat {
    /// Reader builder for this dialect.
    ///
    /// `flexible(true)` so a short or long row comes back as a record and the
    /// arity check stays ours (recoverable) instead of a hard reader error.
    pub(crate) fn reader_builder(&self) -> AsyncReaderBuilder {
        let mut builder = AsyncReaderBuilder::new();
        builder
            .has_headers(true)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .double_quote(self.escape.is_none())
            .escape(self.escape)
            .terminator(Terminator::CRLF)
            // Larger internal buffer reduces syscalls and allocator churn
            .buffer_capacity(1 << 20); // 1 MiB
        builder
    }
}

/// Target column type, after coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// UUID
    Identifier,
    /// 32-bit INTEGER
    Integer,
    Text,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Identifier => "UUID",
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name in the target table.
    pub name: String,
    pub ty: ColumnType,
    /// Empty field becomes NULL instead of a coercion failure.
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }
}

/// Target table layout. `columns[i]` receives CSV column `format.columns[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSchema {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    /// Index into `columns` of the foreign key.
    pub foreign_key: usize,
    /// Index into `columns` of the primary key, used by table provisioning only.
    pub primary_key: Option<usize>,
    pub parent_table: String,
    pub parent_key: String,
    /// Extra NOT NULL text columns of the parent table, used by provisioning only.
    pub parent_columns: Vec<String>,
}

impl Default for TargetSchema {
    fn default() -> Self {
        Self {
            table: "orders".into(),
            columns: vec![
                ColumnSpec::new("order_id", ColumnType::Identifier),
                ColumnSpec::new("customer_id", ColumnType::Identifier),
                ColumnSpec::new("item", ColumnType::Text),
                ColumnSpec::new("quantity", ColumnType::Integer),
            ],
            foreign_key: 1,
            primary_key: Some(0),
            parent_table: "customers".into(),
            parent_key: "customer_id".into(),
            parent_columns: vec!["first_name".into(), "last_name".into()],
        }
    }
}

impl TargetSchema {
    pub fn foreign_key_column(&self) -> &ColumnSpec {
        &self.columns[self.foreign_key]
    }

    /// Query returning every parent identifier.
    pub fn identifier_query(&self) -> String {
        format!(
            "SELECT {} FROM {}",
            pg_escape::quote_identifier(&self.parent_key),
            pg_escape::quote_identifier(&self.parent_table)
        )
    }
}

/// Everything a run needs besides the store and the source location.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub format: CsvFormat,
    pub schema: TargetSchema,
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
    pub abort_on_row_error: bool,
    pub channel_capacity: usize,
    pub flush_bytes: usize,
    pub store_timeout: Duration,
    pub connect_timeout: Duration,
    /// A source that goes quiet this long fails with a transport error.
    pub read_timeout: Duration,
    /// Whole-request deadline for the HTTP fetch, body included.
    pub fetch_timeout: Option<Duration>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            format: CsvFormat::default(),
            schema: TargetSchema::default(),
            charset: encoding_rs::UTF_8,
            abort_on_row_error: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            flush_bytes: DEFAULT_FLUSH_BYTES,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            fetch_timeout: None,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> IngestResult<()> {
        let invalid = |msg: String| Err(IngestError::Config(msg));

        if self.format.columns.is_empty() {
            return invalid("no columns configured".into());
        }
        if self.format.columns.len() != self.schema.columns.len() {
            return invalid(format!(
                "{} CSV columns but {} target columns",
                self.format.columns.len(),
                self.schema.columns.len()
            ));
        }
        if self.format.delimiter == self.format.quote {
            return invalid("delimiter and quote must differ".into());
        }
        let Some(fk) = self.schema.columns.get(self.schema.foreign_key) else {
            return invalid(format!(
                "foreign key index {} out of range",
                self.schema.foreign_key
            ));
        };
        if fk.ty != ColumnType::Identifier || fk.nullable {
            return invalid(format!(
                "foreign key column `{}` must be a non-null identifier",
                fk.name
            ));
        }
        if let Some(pk) = self.schema.primary_key {
            if pk >= self.schema.columns.len() {
                return invalid(format!("primary key index {pk} out of range"));
            }
        }
        if self.channel_capacity == 0 {
            return invalid("channel capacity must be at least 1".into());
        }
        if self.flush_bytes == 0 {
            return invalid("flush threshold must be at least 1 byte".into());
        }
        if self.read_timeout.is_zero() {
            return invalid("read timeout must be non-zero".into());
        }
        Ok(())
    }
}
