//! Run orchestration: identifier snapshot, then source -> filter -> sink.
//!
//! Stages run as tokio tasks joined by bounded `mpsc` channels, so a slow
//! COPY channel stalls the filter, which stalls the CSV reader, which stops
//! pulling bytes off the socket. One cancellation token is shared by every
//! stage; the first fatal error is recorded and then the token is cancelled.

use std::fmt;
use std::future::Future;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::filter::{ReferentialFilter, Rejection, ValidatedRecord};
use crate::identity::IdentitySet;
use crate::io::{open_location, FetchDeadlines, SourceLocation};
use crate::sink::BulkSink;
use crate::source::{RawRecord, RecordSource, RowDecodeError};
use crate::store::Store;
use crate::{IngestError, IngestResult};

/// Number of concurrently running stages (source, filter, sink).
pub const STAGE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    LoadingIdentitySet,
    Streaming,
    Draining,
    Succeeded,
    Failed,
}

impl PipelineState {
    fn can_become(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, LoadingIdentitySet)
                | (LoadingIdentitySet, Streaming)
                | (LoadingIdentitySet, Failed)
                | (Streaming, Draining)
                | (Streaming, Failed)
                | (Draining, Succeeded)
                | (Draining, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal outcome of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub status: PipelineState,
    /// Records taken off the source queue by the filter, malformed ones included.
    pub read: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub decode_errors: u64,
    pub coercion_errors: u64,
    pub missing_parent: u64,
    /// Rows handed to the bulk channel.
    pub streamed: u64,
    /// Rows the store committed; zero unless the run succeeded.
    pub inserted: u64,
    /// Highest number of records between decode and sink acknowledgement.
    pub peak_in_flight: u64,
    pub elapsed: Duration,
    pub error: Option<IngestError>,
}

impl LoadResult {
    /// A run that failed before any stage started.
    pub fn failed(error: IngestError) -> Self {
        Self {
            status: PipelineState::Failed,
            read: 0,
            accepted: 0,
            rejected: 0,
            decode_errors: 0,
            coercion_errors: 0,
            missing_parent: 0,
            streamed: 0,
            inserted: 0,
            peak_in_flight: 0,
            elapsed: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineState::Succeeded
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={} read={} accepted={} rejected={} (decode={} coercion={} missing_parent={}) inserted={} elapsed={:.1}s",
            self.status,
            self.read,
            self.accepted,
            self.rejected,
            self.decode_errors,
            self.coercion_errors,
            self.missing_parent,
            self.inserted,
            self.elapsed.as_secs_f64(),
        )?;
        if let Some(err) = &self.error {
            write!(f, " error={}: {err}", err.kind())?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    read: AtomicU64,
    accepted: AtomicU64,
    decode_errors: AtomicU64,
    coercion_errors: AtomicU64,
    missing_parent: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl Counters {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn reject(&self, rejection: &Rejection) {
        let counter = match rejection {
            Rejection::Decode(_) => &self.decode_errors,
            Rejection::Coercion { .. } => &self.coercion_errors,
            Rejection::MissingParent { .. } => &self.missing_parent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.leave();
    }
}

/// State shared by the stages of one run.
#[derive(Debug)]
struct RunShared {
    counters: Counters,
    first_error: Mutex<Option<IngestError>>,
    cancel: CancellationToken,
}

impl RunShared {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            counters: Counters::default(),
            first_error: Mutex::new(None),
            cancel,
        }
    }

    /// Record `err` if nothing failed before, then stop every stage.
    fn fail(&self, err: IngestError) {
        {
            let mut slot = self
                .first_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                tracing::error!(kind = err.kind(), error = %err, "pipeline failed");
                *slot = Some(err);
            }
        }
        self.cancel.cancel();
    }

    fn has_failed(&self) -> bool {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take_error(&self) -> Option<IngestError> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// One ingest run against a store.
///
/// Owns the store for the duration of the run; get it back with
/// [`Pipeline::into_store`] to release the connection.
pub struct Pipeline<S> {
    config: IngestConfig,
    store: S,
    state: PipelineState,
    cancel: CancellationToken,
}

impl<S> Pipeline<S>
where
    S: Store,
{
    pub fn new(config: IngestConfig, store: S) -> IngestResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            state: PipelineState::Idle,
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Cancelling this token stops a running pipeline with `Cancelled`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Load identifiers, then fetch and load `location`.
    pub async fn run(&mut self, location: &SourceLocation) -> LoadResult {
        let charset = self.config.charset;
        let deadlines = FetchDeadlines {
            connect: self.config.connect_timeout,
            read: self.config.read_timeout,
            total: self.config.fetch_timeout,
        };
        tracing::info!(source = %location, "ingest run starting");
        self.execute(|| open_location(location, charset, deadlines))
            .await
    }

    /// Same as [`Pipeline::run`] with an already opened byte stream.
    pub async fn run_reader<R>(&mut self, reader: R) -> LoadResult
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.execute(|| async move { Ok(reader) }).await
    }

    async fn execute<F, Fut, R>(&mut self, open: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IngestResult<R>>,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let started = Instant::now();
        if self.state.is_terminal() {
            self.state = PipelineState::Idle;
        }
        let cancel = self.cancel.child_token();
        let shared = Arc::new(RunShared::new(cancel.clone()));

        self.transition(PipelineState::LoadingIdentitySet);
        let loaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            loaded = IdentitySet::load(&self.store, &self.config.schema, self.config.store_timeout) => loaded,
        };
        let identities = match loaded {
            Ok(set) => Arc::new(set),
            Err(err) => {
                shared.fail(err);
                return self.finish(&shared, 0, None, started);
            }
        };

        self.transition(PipelineState::Streaming);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            opened = open() => opened,
        };
        let reader = match opened {
            Ok(reader) => reader,
            Err(err) => {
                shared.fail(err);
                return self.finish(&shared, 0, None, started);
            }
        };

        let (streamed, sink) = self.stream(reader, identities, &shared).await;
        // no sink means the failure is already recorded
        let Some(sink) = sink.filter(|_| !shared.has_failed()) else {
            return self.finish(&shared, streamed, None, started);
        };

        self.transition(PipelineState::Draining);
        let finalized = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            committed = sink.finalize() => committed,
        };
        match finalized {
            Ok(inserted) => self.finish(&shared, streamed, Some(inserted), started),
            Err(err) => {
                shared.fail(err);
                self.finish(&shared, streamed, None, started)
            }
        }
    }

    /// Run the three stages to completion. Returns rows streamed and, when
    /// the input ended cleanly, the still-open sink.
    async fn stream<R>(
        &self,
        reader: R,
        identities: Arc<IdentitySet>,
        shared: &Arc<RunShared>,
    ) -> (u64, Option<BulkSink>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capacity = self.config.channel_capacity;
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (valid_tx, valid_rx) = mpsc::channel(capacity);

        let source_task = spawn_stage(
            "source",
            Arc::clone(shared),
            source_stage(
                reader,
                self.config.format.clone(),
                raw_tx,
                Arc::clone(shared),
            ),
        );
        let filter = ReferentialFilter::new(identities, Arc::new(self.config.schema.clone()));
        let filter_task = spawn_stage(
            "filter",
            Arc::clone(shared),
            filter_stage(
                filter,
                self.config.abort_on_row_error,
                raw_rx,
                valid_tx,
                Arc::clone(shared),
            ),
        );

        let mut streamed = 0;
        let sink = match self.sink_stage(valid_rx, shared, &mut streamed).await {
            Ok(sink) => Some(sink),
            Err(err) => {
                shared.fail(err);
                None
            }
        };

        for (name, task) in [("source", source_task), ("filter", filter_task)] {
            if let Err(e) = task.await {
                shared.fail(IngestError::StageFault(format!("{name} stage aborted: {e}")));
            }
        }
        (streamed, sink)
    }

    async fn sink_stage(
        &self,
        mut rx: mpsc::Receiver<ValidatedRecord>,
        shared: &RunShared,
        streamed: &mut u64,
    ) -> IngestResult<BulkSink> {
        let cancel = &shared.cancel;
        let mut sink = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            sink = BulkSink::begin(
                &self.store,
                &self.config.schema,
                self.config.flush_bytes,
                self.config.store_timeout,
            ) => sink?,
        };

        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                record = rx.recv() => record,
            };
            let Some(record) = record else { break };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                written = sink.write(record) => written?,
            }
            *streamed = sink.streamed();
            shared.counters.leave();
        }
        tracing::debug!(streamed = *streamed, "sink stage reached end of input");
        Ok(sink)
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_become(next),
            "invalid pipeline transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }

    fn finish(
        &mut self,
        shared: &RunShared,
        streamed: u64,
        inserted: Option<u64>,
        started: Instant,
    ) -> LoadResult {
        let error = shared.take_error();
        let (status, inserted) = match (&error, inserted) {
            (None, Some(inserted)) => (PipelineState::Succeeded, inserted),
            _ => (PipelineState::Failed, 0),
        };
        self.transition(status);

        let c = &shared.counters;
        let decode_errors = c.decode_errors.load(Ordering::Relaxed);
        let coercion_errors = c.coercion_errors.load(Ordering::Relaxed);
        let missing_parent = c.missing_parent.load(Ordering::Relaxed);
        let result = LoadResult {
            status,
            read: c.read.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: decode_errors + coercion_errors + missing_parent,
            decode_errors,
            coercion_errors,
            missing_parent,
            streamed,
            inserted,
            peak_in_flight: c.peak_in_flight.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
            error,
        };

        if result.is_success() {
            tracing::info!(summary = %result, "ingest run finished");
        } else {
            tracing::error!(summary = %result, "ingest run failed");
        }
        result
    }
}

/// Spawn a stage; a stage error is routed into `shared`.
fn spawn_stage<F>(name: &'static str, shared: Arc<RunShared>, stage: F) -> JoinHandle<()>
where
    F: Future<Output = IngestResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::debug!(stage = name, "stage started");
        match stage.await {
            Ok(()) => tracing::debug!(stage = name, "stage finished"),
            Err(err) => shared.fail(err),
        }
    })
}

async fn source_stage<R>(
    reader: R,
    format: crate::config::CsvFormat,
    tx: mpsc::Sender<Result<RawRecord, RowDecodeError>>,
    shared: Arc<RunShared>,
) -> IngestResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = &shared.cancel;
    let mut source = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        source = RecordSource::open(reader, &format) => source?,
    };

    // A slot is reserved before decoding, so a decoded row never waits
    // outside the queue.
    loop {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            // receiver gone: downstream already failed and recorded why
            slot = tx.reserve() => slot.map_err(|_| IngestError::Cancelled)?,
        };
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            item = source.next_record() => item?,
        };
        let Some(item) = item else { break };

        shared.counters.enter();
        slot.send(item);
    }
    tracing::debug!(rows = source.rows(), "source reached end of input");
    Ok(())
}

async fn filter_stage(
    filter: ReferentialFilter,
    abort_on_row_error: bool,
    mut rx: mpsc::Receiver<Result<RawRecord, RowDecodeError>>,
    tx: mpsc::Sender<ValidatedRecord>,
    shared: Arc<RunShared>,
) -> IngestResult<()> {
    let cancel = &shared.cancel;
    let counters = &shared.counters;

    // Same as the source: hold a downstream slot before taking a row, and keep
    // it across rejections.
    let mut spare = None;
    loop {
        let slot = match spare.take() {
            Some(slot) => slot,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                slot = tx.reserve() => slot.map_err(|_| IngestError::Cancelled)?,
            },
        };
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            item = rx.recv() => item,
        };
        let Some(item) = item else { break };
        counters.read.fetch_add(1, Ordering::Relaxed);

        let checked = match item {
            Ok(raw) => filter.check(raw),
            Err(decode) if abort_on_row_error => {
                counters.reject(&Rejection::Decode(decode.clone()));
                return Err(IngestError::RowDecode(decode));
            }
            Err(decode) => Err(Rejection::Decode(decode)),
        };

        match checked {
            Ok(record) => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                slot.send(record);
            }
            Err(rejection) => {
                tracing::debug!(line = rejection.line(), reason = %rejection, "row rejected");
                counters.reject(&rejection);
                spare = Some(slot);
            }
        }
    }
    Ok(())
}
