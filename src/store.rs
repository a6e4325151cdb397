//! Backing store seam: identifier query and bulk COPY channel.
//!
//! [`PgStore`] is the PostgreSQL implementation. The connection is acquired
//! explicitly and released with [`PgStore::close`]; a COPY channel dropped
//! before [`CopyChannel::finish`] aborts the COPY on the server.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, CopyInSink, NoTls};
use uuid::Uuid;

use crate::identity::Identifier;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Store operations the pipeline needs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run `query` and return the first column of every row as an identifier.
    async fn fetch_identifiers(&self, query: &str) -> Result<Vec<Identifier>, StoreError>;

    /// Start a `COPY ... FROM STDIN` and return the open channel.
    async fn copy_in(&self, statement: &str) -> Result<Box<dyn CopyChannel>, StoreError>;
}

/// One open bulk-load stream.
#[async_trait]
pub trait CopyChannel: Send {
    /// Hand a chunk to the transport. Resolves once the transport accepted it.
    async fn send(&mut self, chunk: Bytes) -> Result<(), StoreError>;

    /// Close the stream and return the row count the store committed.
    async fn finish(&mut self) -> Result<u64, StoreError>;
}

/// PostgreSQL store over a single dedicated connection.
pub struct PgStore {
    client: Client,
    connection: JoinHandle<()>,
}

impl PgStore {
    /// Connect using a libpq-style connection string (`DATABASE_URL`).
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let (client, connection) = tokio::time::timeout(timeout, tokio_postgres::connect(url, NoTls))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection error");
            }
        });
        tracing::debug!("connected to postgres");

        Ok(Self { client, connection })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Drop the client and wait for the connection task to wind down.
    pub async fn close(self) {
        drop(self.client);
        if let Err(e) = self.connection.await {
            tracing::warn!(error = %e, "postgres connection task ended abnormally");
        }
        tracing::debug!("postgres connection closed");
    }
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_identifiers(&self, query: &str) -> Result<Vec<Identifier>, StoreError> {
        let rows = self.client.query(query, &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, Uuid>(0).map(Identifier::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn copy_in(&self, statement: &str) -> Result<Box<dyn CopyChannel>, StoreError> {
        let sink = self.client.copy_in::<_, Bytes>(statement).await?;
        Ok(Box::new(PgCopyChannel {
            sink: Box::pin(sink),
        }))
    }
}

struct PgCopyChannel {
    sink: Pin<Box<CopyInSink<Bytes>>>,
}

#[async_trait]
impl CopyChannel for PgCopyChannel {
    async fn send(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        self.sink.send(chunk).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64, StoreError> {
        Ok(self.sink.as_mut().finish().await?)
    }
}
