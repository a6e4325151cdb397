use crate::{IngestError, IngestResult};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use futures::TryStreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::Utf8Transcoder;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Debug, Clone)]
pub struct CsvMeta {
    /// e.g. "application/gzip" or "text/csv"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// last path segment or file name (used for extension fallback)
    pub name_hint: String,
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for CsvMeta {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
        }
    }
}

/// Where the CSV comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Http(Url),
    File(PathBuf),
}

impl FromStr for SourceLocation {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("http://") || s.starts_with("https://") {
            let url = Url::parse(s)
                .map_err(|e| IngestError::Config(format!("invalid source url `{s}`: {e}")))?;
            Ok(SourceLocation::Http(url))
        } else if s.is_empty() {
            Err(IngestError::Config("empty source location".into()))
        } else {
            Ok(SourceLocation::File(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Http(url) => write!(f, "{url}"),
            SourceLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Decompression applied to the raw byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Identity,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Identity => "identity",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

impl CsvMeta {
    /// Meta for a local file; the extension stands in for the HTTP headers.
    pub fn for_path(path: &Path, charset: &'static encoding_rs::Encoding) -> Self {
        let name_hint = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let (content_type, content_encoding) =
            match path.extension().and_then(|s| s.to_str()).unwrap_or_default() {
                "gz" => ("application/gzip", "gzip"),
                "zst" => ("application/zstd", "zstd"),
                _ => ("text/csv", ""),
            };
        Self {
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            name_hint,
            charset,
        }
    }

    /// Content-Encoding wins, then Content-Type, then the name's extension.
    pub fn compression(&self) -> Compression {
        let encoding = self.content_encoding.to_ascii_lowercase();
        let listed = |token: &str| encoding.split(',').any(|s| s.trim() == token);
        let ty = self.content_type.to_ascii_lowercase();

        if listed("gzip") {
            Compression::Gzip
        } else if listed("zstd") {
            Compression::Zstd
        } else if matches!(ty.as_str(), "application/gzip" | "application/x-gzip") {
            Compression::Gzip
        } else if ty == "application/zstd" {
            Compression::Zstd
        } else if self.name_hint.ends_with(".gz") {
            Compression::Gzip
        } else if self.name_hint.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::Identity
        }
    }
}

/// Layer decompression and UTF-8 transcoding over a raw byte stream.
pub fn build_csv_reader<R>(raw: R, meta: &CsvMeta) -> BoxedReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = BufReader::with_capacity(1 << 20, raw);
    let decompressed: BoxedReader = match meta.compression() {
        Compression::Gzip => Box::new(GzipDecoder::new(buf)),
        Compression::Zstd => Box::new(ZstdDecoder::new(buf)),
        Compression::Identity => Box::new(buf),
    };

    if meta.charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let framed = FramedRead::new(decompressed, Utf8Transcoder::new(meta.charset));
        Box::new(StreamReader::new(framed))
    }
}

/// Open a local file as a decoded byte stream.
pub async fn reader_from_path(
    path: &Path,
    charset: &'static encoding_rs::Encoding,
) -> IngestResult<(BoxedReader, CsvMeta)> {
    let file = File::open(path)
        .await
        .map_err(|e| IngestError::Transport(format!("open {}: {e}", path.display())))?;
    let meta = CsvMeta::for_path(path, charset);
    Ok((build_csv_reader(file, &meta), meta))
}

/// Issue the GET and hand back the body as a chunked `AsyncRead`.
///
/// Only the status line and headers are awaited here; the body is pulled by
/// the CSV reader as it goes. Non-2xx is a transport failure.
pub async fn reader_from_url(
    client: &reqwest::Client,
    url: &Url,
    charset: &'static encoding_rs::Encoding,
) -> IngestResult<(BoxedReader, CsvMeta)> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| IngestError::Transport(format!("GET {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(IngestError::Transport(format!(
            "GET {url}: unexpected status {status}"
        )));
    }

    let header = |name: reqwest::header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let meta = CsvMeta {
        content_type: header(CONTENT_TYPE),
        content_encoding: header(CONTENT_ENCODING),
        name_hint: url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string(),
        charset,
    };
    tracing::info!(
        %url,
        %status,
        content_length = response.content_length(),
        "source response received"
    );

    let body = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    Ok((build_csv_reader(StreamReader::new(body), &meta), meta))
}

/// Deadlines for the HTTP source.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchDeadlines {
    pub connect: Duration,
    /// Longest silence between two reads of the response.
    pub read: Duration,
    /// Cap on the whole request, body included.
    pub total: Option<Duration>,
}

/// HTTP client honoring the configured deadlines.
pub(crate) fn http_client(deadlines: FetchDeadlines) -> IngestResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(deadlines.connect)
        .read_timeout(deadlines.read);
    if let Some(timeout) = deadlines.total {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| IngestError::Config(format!("http client: {e}")))
}

/// Open any supported location as a decoded byte stream.
pub(crate) async fn open_location(
    location: &SourceLocation,
    charset: &'static encoding_rs::Encoding,
    deadlines: FetchDeadlines,
) -> IngestResult<BoxedReader> {
    let (reader, meta) = match location {
        SourceLocation::Http(url) => {
            let client = http_client(deadlines)?;
            reader_from_url(&client, url, charset).await?
        }
        SourceLocation::File(path) => reader_from_path(path, charset).await?,
    };
    tracing::info!(
        source = %location,
        content_type = %meta.content_type,
        compression = %meta.compression(),
        charset = meta.charset.name(),
        "source opened"
    );
    Ok(reader)
}
