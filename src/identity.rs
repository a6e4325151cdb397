//! Snapshot of valid parent identifiers.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::config::TargetSchema;
use crate::store::Store;
use crate::{IngestError, IngestResult};

/// Parent entity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Uuid);

impl Identifier {
    pub fn new_random() -> Self {
        Identifier(Uuid::new_v4())
    }
}

impl From<Uuid> for Identifier {
    fn from(id: Uuid) -> Self {
        Identifier(id)
    }
}

impl FromStr for Identifier {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Identifier)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // hyphenated lowercase, which is also what COPY text expects
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Point-in-time set of parent identifiers.
///
/// Read once before streaming starts and never mutated afterwards; parents
/// created by other writers during the run count as unknown.
#[derive(Debug, Clone, Default)]
pub struct IdentitySet {
    ids: HashSet<Identifier>,
}

impl IdentitySet {
    /// Run the parent-key query once, bounded by `timeout`.
    pub async fn load<S>(store: &S, schema: &TargetSchema, timeout: Duration) -> IngestResult<Self>
    where
        S: Store + ?Sized,
    {
        let query = schema.identifier_query();
        let started = std::time::Instant::now();

        let ids = tokio::time::timeout(timeout, store.fetch_identifiers(&query))
            .await
            .map_err(|_| {
                IngestError::StoreUnavailable(format!(
                    "identifier query timed out after {timeout:?}"
                ))
            })?
            .map_err(|e| IngestError::StoreUnavailable(e.to_string()))?;

        let set: IdentitySet = ids.into_iter().collect();
        tracing::info!(
            table = %schema.parent_table,
            identifiers = set.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "identifier snapshot loaded"
        );
        Ok(set)
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<Identifier> for IdentitySet {
    fn from_iter<I: IntoIterator<Item = Identifier>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
