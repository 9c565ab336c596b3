//! Transport layer for proposer ⇄ safekeeper sessions.
//!
//! The proposer core never touches sockets directly. It opens sessions
//! through the [`Connector`] capability and exchanges protocol messages over
//! a [`Session`], which guarantees per-session FIFO delivery in both
//! directions. Two implementations ship with the crate:
//!
//! - [`TcpConnector`]: TCP with length-prefixed frames, for production.
//! - [`MemoryConnector`]: channel-backed in-process safekeepers with
//!   partition injection, for deterministic tests.

mod memory;
mod tcp;

pub use memory::{MemoryConnector, MemoryNetwork, SafekeeperSim};
pub use tcp::TcpConnector;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;

use lodestone_types::NodeId;
use lodestone_wire::{ProposerMessage, SafekeeperMessage, WireError};

/// Boxed future used to keep [`Connector`] object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur in transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to a safekeeper failed.
    #[error("connection failed to {node_id}: {reason}")]
    ConnectionFailed {
        /// The target safekeeper.
        node_id: NodeId,
        /// The reason for failure.
        reason: String,
    },

    /// The target safekeeper is not configured.
    #[error("unknown safekeeper: {0}")]
    UnknownNode(NodeId),

    /// The session (or the whole transport) has been closed.
    #[error("session closed")]
    Closed,

    /// Framing or encoding error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for a connection or a response.
    #[error("timeout")]
    Timeout,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Capability for opening sessions to safekeepers.
///
/// Implementations map a [`NodeId`] to whatever the concrete medium needs
/// (a socket address, an in-process channel) and return a connected
/// [`Session`]. Object safe so the proposer can be configured with either a
/// real network or a test double.
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Opens a session to the given safekeeper.
    fn connect(&self, node_id: NodeId) -> BoxFuture<'_, TransportResult<Session>>;
}

/// One established proposer → safekeeper session.
///
/// Both directions are ordered: messages sent through [`Session::send`]
/// arrive in order, and [`Session::recv`] yields the peer's replies in
/// order. A session that loses its medium fails both operations with
/// [`TransportError::Closed`]; the owner reconnects through the
/// [`Connector`].
#[derive(Debug)]
pub struct Session {
    peer: NodeId,
    tx: mpsc::Sender<ProposerMessage>,
    rx: mpsc::Receiver<SafekeeperMessage>,
}

impl Session {
    /// Wraps a channel pair into a session. Used by connector
    /// implementations.
    pub fn new(
        peer: NodeId,
        tx: mpsc::Sender<ProposerMessage>,
        rx: mpsc::Receiver<SafekeeperMessage>,
    ) -> Self {
        Self { peer, tx, rx }
    }

    /// The safekeeper this session is connected to.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Sends a message to the safekeeper.
    pub async fn send(&self, message: ProposerMessage) -> TransportResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Receives the next message from the safekeeper.
    pub async fn recv(&mut self) -> TransportResult<SafekeeperMessage> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    /// Closes the session. Dropping has the same effect; this makes the
    /// intent explicit at call sites.
    pub fn close(self) {
        drop(self);
    }
}

/// Channel capacity for session pipes.
pub(crate) const SESSION_CHANNEL_CAPACITY: usize = 256;
