//! Result storage.
//!
//! A store is an append-only record of item outcomes. Its read path
//! (`existing_identifiers`) is consulted once when a run starts; its write
//! path (`append`) is called by workers as results arrive. Both must be safe
//! to call from many workers at once.

pub mod jsonl;
pub mod sqlite;

pub use jsonl::JsonlStore;
pub use sqlite::SqliteStore;

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{ItemId, ResultRecord};

/// Persistent record of item outcomes.
pub trait ResultStore: Send + Sync {
    /// Identifiers that already have a recorded result, successful or not.
    fn existing_identifiers(&self) -> Result<HashSet<ItemId>>;

    /// Durably record one result. Each record is written atomically; a second
    /// record for the same identifier is refused with
    /// [`Error::DuplicateResult`].
    fn append(&self, record: &ResultRecord) -> Result<()>;

    /// Every readable record, in storage order.
    fn records(&self) -> Result<Vec<ResultRecord>>;
}

/// Counts of recorded outcomes, as reported by `evalq status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub succeeded: usize,
    pub failed: usize,
}

impl StoreStats {
    pub fn collect(store: &dyn ResultStore) -> Result<Self> {
        let mut stats = Self::default();
        for record in store.records()? {
            if record.outcome.is_success() {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
        }
        Ok(stats)
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store that keeps records in memory. For tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ResultRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds the given records.
    pub fn with_records(records: Vec<ResultRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ResultRecord>> {
        // A panic while holding the lock cannot leave a half-pushed record.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ResultStore for MemoryStore {
    fn existing_identifiers(&self) -> Result<HashSet<ItemId>> {
        Ok(self.lock().iter().map(|r| r.id.clone()).collect())
    }

    fn append(&self, record: &ResultRecord) -> Result<()> {
        let mut records = self.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::DuplicateResult(record.id.to_string()));
        }
        records.push(record.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<ResultRecord>> {
        Ok(self.lock().clone())
    }
}
