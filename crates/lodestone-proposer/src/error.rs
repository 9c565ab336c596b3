//! Proposer error types.
//!
//! Recovery policy: reconnects and election retries stay inside the links
//! and the election coordinator; only term loss and quorum unavailability
//! reach the proposer state machine. Committed-LSN regression, an
//! invariant violation that correct quorum arithmetic can never produce,
//! is the one fault that propagates as fatal.

use thiserror::Error;

use lodestone_types::{Lsn, NodeId, Term};

use crate::term_store::TermStoreError;

/// Errors from one election attempt.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Fewer than quorum members answered within the election timeout.
    /// Recoverable: retried with backoff and a higher candidate term.
    #[error("election timed out with {acceptances} of {needed} acceptances")]
    Timeout { acceptances: usize, needed: usize },

    /// A member holds a strictly higher term than the candidate.
    /// Recoverable: the next attempt proposes above the observed term.
    #[error("election superseded by term {higher_term}")]
    Superseded { higher_term: Term },

    /// The durable term store failed.
    #[error(transparent)]
    Store(#[from] TermStoreError),
}

/// Errors from quorum tracking.
#[derive(Debug, Error)]
pub enum QuorumError {
    /// An acknowledgment arrived for a node outside the member set.
    #[error("acknowledgment from unknown member {0}")]
    UnknownMember(NodeId),

    /// The recomputed committed LSN fell below the published one.
    /// Fatal: surfaced as a consistency fault, never silently corrected.
    #[error("committed LSN regression: published {published}, recomputed {recomputed}")]
    CommittedLsnRegression { published: Lsn, recomputed: Lsn },
}

/// Errors surfaced by the proposer's external interface.
#[derive(Debug, Error)]
pub enum ProposerError {
    /// A WAL chunk did not continue the stream where it left off.
    #[error("WAL gap: expected chunk at {expected}, got {got}")]
    WalGap { expected: Lsn, got: Lsn },

    /// WAL was offered while the proposer held no elected term.
    #[error("proposer is not streaming")]
    NotStreaming,

    /// Fatal quorum arithmetic fault.
    #[error(transparent)]
    Quorum(#[from] QuorumError),

    /// The proposer task has shut down.
    #[error("proposer shut down")]
    ShutDown,
}
