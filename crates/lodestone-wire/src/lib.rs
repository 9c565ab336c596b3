//! # lodestone-wire: Proposer ⇄ safekeeper protocol
//!
//! Message types exchanged between a proposer and its safekeepers, plus
//! their binary framing.
//!
//! The message *semantics* are the contract the consensus core depends on:
//! per-session FIFO delivery of term proposals, WAL chunks, keep-alives and
//! their acknowledgments. The byte layout lives entirely in [`frame`] so
//! transports can swap it out without touching the core.

mod error;
mod messages;

pub mod frame;

pub use error::WireError;
pub use messages::{ProposerMessage, SafekeeperMessage};

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
