//! Protocol messages.
//!
//! Two directions, one enum each:
//!
//! - [`ProposerMessage`]: proposer to safekeeper. Term proposals, WAL
//!   chunks, keep-alives.
//! - [`SafekeeperMessage`]: safekeeper to proposer. Term votes, flush
//!   acknowledgments, higher-term rejections.
//!
//! Every streaming-phase message carries the proposer's current term; a
//! safekeeper that holds a higher term answers with it instead of an ack,
//! which is the proposer's signal to abdicate and re-elect.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use lodestone_types::{Lsn, NodeId, Term, TermHistory};

/// Messages sent by the proposer to a safekeeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposerMessage {
    /// Ask the safekeeper to adopt `term`.
    ///
    /// The safekeeper persists the term before answering
    /// [`SafekeeperMessage::TermAccepted`], or rejects with the higher term
    /// it already holds.
    ProposeTerm { term: Term, proposer_id: NodeId },

    /// A gap-free run of WAL bytes starting at `begin_lsn`.
    ///
    /// Chunks form a strictly ordered byte stream per safekeeper; the
    /// safekeeper acknowledges durable positions with
    /// [`SafekeeperMessage::ChunkAck`].
    StreamChunk {
        term: Term,
        begin_lsn: Lsn,
        data: Bytes,
    },

    /// Liveness probe, also disseminating the commit watermark.
    KeepAlive { term: Term, committed_lsn: Lsn },
}

impl ProposerMessage {
    /// The term this message was sent under.
    pub fn term(&self) -> Term {
        match self {
            Self::ProposeTerm { term, .. }
            | Self::StreamChunk { term, .. }
            | Self::KeepAlive { term, .. } => *term,
        }
    }
}

/// Messages sent by a safekeeper to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafekeeperMessage {
    /// The safekeeper persisted the proposed term.
    ///
    /// `last_flushed_lsn` is its durable flush position; `term_history`
    /// lists the epochs it has accepted WAL under.
    TermAccepted {
        term: Term,
        last_flushed_lsn: Lsn,
        term_history: TermHistory,
    },

    /// The safekeeper already holds a strictly higher term.
    TermRejected { higher_term: Term },

    /// All WAL up to `flushed_lsn` is durable under `term`.
    ChunkAck { term: Term, flushed_lsn: Lsn },

    /// Stream-time rejection: the safekeeper moved to a higher term.
    Rejected { higher_term: Term },
}

impl SafekeeperMessage {
    /// The higher term carried by a rejection, if this is one.
    pub fn rejection_term(&self) -> Option<Term> {
        match self {
            Self::TermRejected { higher_term } | Self::Rejected { higher_term } => {
                Some(*higher_term)
            }
            _ => None,
        }
    }
}
