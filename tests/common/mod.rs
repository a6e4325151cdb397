#![allow(dead_code)]

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use csv_fk_ingest::{CopyChannel, Identifier, Store, StoreError};
use tokio::io::{AsyncRead, ReadBuf};

/// How the in-memory COPY channel behaves on `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Immediate,
    /// Yield to the scheduler this many times before taking the chunk.
    Slow(usize),
    /// Never complete.
    Stall,
}

#[derive(Debug)]
struct Inner {
    ids: Vec<Identifier>,
    identifiers_unavailable: bool,
    reject_finish: bool,
    send_mode: SendMode,
    identifier_queries: AtomicUsize,
    statements: Mutex<Vec<String>>,
    committed: Mutex<Vec<u8>>,
    sends: AtomicUsize,
}

/// Store double: identifiers from a list, COPY data kept in memory and only
/// published on a successful `finish`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(ids: impl IntoIterator<Item = Identifier>) -> Self {
        Self::build(ids.into_iter().collect(), false, false, SendMode::Immediate)
    }

    pub fn unavailable() -> Self {
        Self::build(Vec::new(), true, false, SendMode::Immediate)
    }

    pub fn rejecting_commit(ids: impl IntoIterator<Item = Identifier>) -> Self {
        Self::build(ids.into_iter().collect(), false, true, SendMode::Immediate)
    }

    pub fn with_send_mode(ids: impl IntoIterator<Item = Identifier>, mode: SendMode) -> Self {
        Self::build(ids.into_iter().collect(), false, false, mode)
    }

    fn build(
        ids: Vec<Identifier>,
        identifiers_unavailable: bool,
        reject_finish: bool,
        send_mode: SendMode,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ids,
                identifiers_unavailable,
                reject_finish,
                send_mode,
                identifier_queries: AtomicUsize::new(0),
                statements: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
                sends: AtomicUsize::new(0),
            }),
        }
    }

    pub fn identifier_queries(&self) -> usize {
        self.inner.identifier_queries.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock().unwrap().clone()
    }

    pub fn sends(&self) -> usize {
        self.inner.sends.load(Ordering::SeqCst)
    }

    /// Committed COPY rows, split into fields.
    pub fn committed_rows(&self) -> Vec<Vec<String>> {
        let data = self.inner.committed.lock().unwrap();
        String::from_utf8(data.clone())
            .unwrap()
            .lines()
            .map(|line| line.split('\t').map(String::from).collect())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_identifiers(&self, _query: &str) -> Result<Vec<Identifier>, StoreError> {
        self.inner.identifier_queries.fetch_add(1, Ordering::SeqCst);
        if self.inner.identifiers_unavailable {
            return Err(StoreError::Other("connection refused".into()));
        }
        Ok(self.inner.ids.clone())
    }

    async fn copy_in(&self, statement: &str) -> Result<Box<dyn CopyChannel>, StoreError> {
        self.inner
            .statements
            .lock()
            .unwrap()
            .push(statement.to_string());
        Ok(Box::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    staged: Vec<u8>,
}

#[async_trait]
impl CopyChannel for MemoryChannel {
    async fn send(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        match self.inner.send_mode {
            SendMode::Immediate => {}
            SendMode::Slow(yields) => {
                for _ in 0..yields {
                    tokio::task::yield_now().await;
                }
            }
            SendMode::Stall => std::future::pending::<()>().await,
        }
        self.inner.sends.fetch_add(1, Ordering::SeqCst);
        self.staged.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64, StoreError> {
        if self.inner.reject_finish {
            return Err(StoreError::Other(
                "duplicate key value violates unique constraint".into(),
            ));
        }
        let rows = self.staged.iter().filter(|b| **b == b'\n').count() as u64;
        self.inner
            .committed
            .lock()
            .unwrap()
            .extend_from_slice(&self.staged);
        Ok(rows)
    }
}

/// Reader that flags when it is first polled, then reports EOF.
pub struct ProbeReader {
    pub polled: Arc<AtomicBool>,
}

impl AsyncRead for ProbeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.polled.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Serves `data` until `limit` bytes have gone out, then the connection resets.
pub struct ResetAfter {
    data: Vec<u8>,
    pos: usize,
    limit: usize,
}

impl ResetAfter {
    pub fn new(data: Vec<u8>, limit: usize) -> Self {
        Self {
            data,
            pos: 0,
            limit,
        }
    }
}

impl AsyncRead for ResetAfter {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let end = self.limit.min(self.data.len());
        if self.pos >= end {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        let n = buf.remaining().min(end - self.pos).min(512);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Orders CSV in the default layout.
pub fn orders_csv(rows: &[(Identifier, Identifier, &str, i32)]) -> Vec<u8> {
    let mut out = String::from("orderId,customerId,item,quantity\n");
    for (order, customer, item, qty) in rows {
        out.push_str(&format!("{order},{customer},{item},{qty}\n"));
    }
    out.into_bytes()
}

pub fn ids(n: usize) -> Vec<Identifier> {
    (0..n).map(|_| Identifier::new_random()).collect()
}
