//! Durable term history collaborator.
//!
//! Persistence of `(term, start_lsn)` across proposer restarts is delegated
//! to an external store consulted only at election time: the coordinator
//! loads the last persisted record to pick a candidate term strictly above
//! everything this proposer has ever proposed, and persists the outcome
//! before streaming begins.

use std::sync::Mutex;

use thiserror::Error;

use lodestone_types::{ElectionOutcome, Lsn, Term};

/// The record a proposer persists per successful election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedTerm {
    pub term: Term,
    pub start_lsn: Lsn,
}

impl From<ElectionOutcome> for PersistedTerm {
    fn from(outcome: ElectionOutcome) -> Self {
        Self {
            term: outcome.term,
            start_lsn: outcome.start_lsn,
        }
    }
}

/// Errors from the durable term store.
#[derive(Debug, Error)]
pub enum TermStoreError {
    /// Underlying storage failed.
    #[error("term store io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record could not be interpreted.
    #[error("term store corrupt: {0}")]
    Corrupt(String),
}

/// Durable store for the proposer's election history.
///
/// Implementations must never return a record older than the last
/// successfully persisted one.
pub trait TermStore: Send + Sync + std::fmt::Debug {
    /// Loads the most recently persisted record, if any.
    fn load(&self) -> Result<Option<PersistedTerm>, TermStoreError>;

    /// Persists a record. Must be durable before returning.
    fn persist(&self, record: PersistedTerm) -> Result<(), TermStoreError>;
}

/// Volatile term store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryTermStore {
    inner: Mutex<Option<PersistedTerm>>,
}

impl MemoryTermStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TermStore for MemoryTermStore {
    fn load(&self) -> Result<Option<PersistedTerm>, TermStoreError> {
        Ok(*self.inner.lock().expect("term store poisoned"))
    }

    fn persist(&self, record: PersistedTerm) -> Result<(), TermStoreError> {
        *self.inner.lock().expect("term store poisoned") = Some(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryTermStore::new();
        assert_eq!(store.load().unwrap(), None);

        let record = PersistedTerm {
            term: Term::new(4),
            start_lsn: Lsn::new(128),
        };
        store.persist(record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
    }
}
