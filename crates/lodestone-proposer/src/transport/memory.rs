//! In-memory transport for testing.
//!
//! [`MemoryNetwork`] hosts a set of [`SafekeeperSim`] acceptors and hands
//! out channel-backed sessions to them. Partitions can be injected per
//! node ([`MemoryNetwork::isolate`]) and healed again, which lets tests
//! drive disconnects, reconnects, and lagging members deterministically.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use lodestone_types::{Lsn, NodeId, Term, TermHistory, TermSwitchEntry};
use lodestone_wire::{ProposerMessage, SafekeeperMessage};

use super::{
    BoxFuture, Connector, SESSION_CHANNEL_CAPACITY, Session, TransportError, TransportResult,
};

// ============================================================================
// Safekeeper Simulation
// ============================================================================

/// In-process safekeeper acceptor state machine.
///
/// Implements the acceptor side of the protocol: term persistence on
/// `ProposeTerm`, flush acknowledgment for WAL chunks, and higher-term
/// rejection of anything sent under a stale term. WAL bytes themselves are
/// not retained, only the positions, which is all the proposer observes.
#[derive(Debug)]
pub struct SafekeeperSim {
    node_id: NodeId,
    term: Term,
    flushed_lsn: Lsn,
    wal_end: Lsn,
    term_history: TermHistory,
    /// Last commit watermark announced by the proposer.
    committed_lsn: Lsn,
}

impl SafekeeperSim {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            term: Term::default(),
            flushed_lsn: Lsn::INVALID,
            wal_end: Lsn::INVALID,
            term_history: TermHistory::new(),
            committed_lsn: Lsn::INVALID,
        }
    }

    /// The safekeeper this simulation stands in for.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The term this safekeeper currently holds.
    pub fn term(&self) -> Term {
        self.term
    }

    /// The position this safekeeper reports as durably flushed.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    /// The commit watermark last announced by the proposer.
    pub fn committed_lsn(&self) -> Lsn {
        self.committed_lsn
    }

    /// Seeds the durable position, as if earlier WAL had been streamed by a
    /// previous proposer. Test setup only.
    pub fn seed(&mut self, term: Term, flushed_lsn: Lsn) {
        self.term = term;
        self.flushed_lsn = flushed_lsn;
        self.wal_end = flushed_lsn;
        self.term_history.add(TermSwitchEntry {
            term,
            start_lsn: flushed_lsn,
        });
    }

    /// Forces the safekeeper onto a higher term, as if another proposer had
    /// been elected through it. Subsequent messages under the old term are
    /// rejected with this term.
    pub fn bump_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.term_history.add(TermSwitchEntry {
                term,
                start_lsn: self.wal_end,
            });
        }
    }

    /// Processes one proposer message, returning the reply.
    pub fn handle(&mut self, message: ProposerMessage) -> SafekeeperMessage {
        match message {
            ProposerMessage::ProposeTerm { term, .. } => {
                if term < self.term {
                    return SafekeeperMessage::TermRejected {
                        higher_term: self.term,
                    };
                }
                self.adopt(term);
                SafekeeperMessage::TermAccepted {
                    term,
                    last_flushed_lsn: self.flushed_lsn,
                    term_history: self.term_history.clone(),
                }
            }
            ProposerMessage::StreamChunk {
                term,
                begin_lsn,
                data,
            } => {
                if term < self.term {
                    return SafekeeperMessage::Rejected {
                        higher_term: self.term,
                    };
                }
                self.adopt(term);
                // A chunk beyond our tail starts a fresh epoch: the gap
                // belongs to WAL this safekeeper never held, and the new
                // epoch's stream overwrites from its start position.
                if begin_lsn > self.wal_end {
                    self.wal_end = begin_lsn;
                }
                let end = begin_lsn + data.len() as u64;
                if end > self.wal_end {
                    self.wal_end = end;
                }
                // Flush is immediate in the simulation.
                self.flushed_lsn = self.wal_end;
                SafekeeperMessage::ChunkAck {
                    term,
                    flushed_lsn: self.flushed_lsn,
                }
            }
            ProposerMessage::KeepAlive {
                term,
                committed_lsn,
            } => {
                if term < self.term {
                    return SafekeeperMessage::Rejected {
                        higher_term: self.term,
                    };
                }
                self.adopt(term);
                self.committed_lsn = self.committed_lsn.max(committed_lsn);
                SafekeeperMessage::ChunkAck {
                    term,
                    flushed_lsn: self.flushed_lsn,
                }
            }
        }
    }

    fn adopt(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.term_history.add(TermSwitchEntry {
                term,
                start_lsn: self.wal_end,
            });
        }
    }
}

// ============================================================================
// Memory Network
// ============================================================================

/// A shared in-process network of safekeeper simulations.
#[derive(Debug)]
pub struct MemoryNetwork {
    safekeepers: Mutex<HashMap<NodeId, Arc<Mutex<SafekeeperSim>>>>,
    isolated: Mutex<HashSet<NodeId>>,
    /// Bumped whenever partition state changes; open sessions watch this
    /// and close themselves when their node becomes isolated.
    epoch_tx: watch::Sender<u64>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            safekeepers: Mutex::new(HashMap::new()),
            isolated: Mutex::new(HashSet::new()),
            epoch_tx,
        }
    }

    /// Creates a new network wrapped in `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registers a safekeeper and returns a handle to its state.
    pub fn add_safekeeper(&self, node_id: NodeId) -> Arc<Mutex<SafekeeperSim>> {
        let sim = Arc::new(Mutex::new(SafekeeperSim::new(node_id)));
        self.safekeepers
            .lock()
            .expect("safekeeper registry poisoned")
            .insert(node_id, Arc::clone(&sim));
        sim
    }

    /// Returns the simulation handle for a registered safekeeper.
    pub fn safekeeper(&self, node_id: NodeId) -> Option<Arc<Mutex<SafekeeperSim>>> {
        self.safekeepers
            .lock()
            .expect("safekeeper registry poisoned")
            .get(&node_id)
            .cloned()
    }

    /// Cuts the node off: open sessions close, new connections fail.
    pub fn isolate(&self, node_id: NodeId) {
        self.isolated
            .lock()
            .expect("partition set poisoned")
            .insert(node_id);
        self.bump_epoch();
    }

    /// Heals the node: new connections succeed again.
    pub fn heal(&self, node_id: NodeId) {
        self.isolated
            .lock()
            .expect("partition set poisoned")
            .remove(&node_id);
        self.bump_epoch();
    }

    /// Returns true if the node is currently partitioned away.
    pub fn is_isolated(&self, node_id: NodeId) -> bool {
        self.isolated
            .lock()
            .expect("partition set poisoned")
            .contains(&node_id)
    }

    fn bump_epoch(&self) {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Creates a connector bound to this network.
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            network: Arc::clone(self),
        }
    }
}

/// Connector over a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: Arc<MemoryNetwork>,
}

impl Connector for MemoryConnector {
    fn connect(&self, node_id: NodeId) -> BoxFuture<'_, TransportResult<Session>> {
        Box::pin(async move {
            let sim = self
                .network
                .safekeeper(node_id)
                .ok_or(TransportError::UnknownNode(node_id))?;

            if self.network.is_isolated(node_id) {
                return Err(TransportError::ConnectionFailed {
                    node_id,
                    reason: "partitioned".to_string(),
                });
            }

            let (to_sk_tx, mut to_sk_rx) =
                mpsc::channel::<ProposerMessage>(SESSION_CHANNEL_CAPACITY);
            let (from_sk_tx, from_sk_rx) =
                mpsc::channel::<SafekeeperMessage>(SESSION_CHANNEL_CAPACITY);

            let network = Arc::clone(&self.network);
            let mut epoch_rx = network.epoch_tx.subscribe();

            // Session pump: applies proposer messages to the simulation and
            // routes the replies back. Dies when either side hangs up or
            // the node is isolated.
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = to_sk_rx.recv() => {
                            let Some(message) = message else { break };
                            if network.is_isolated(node_id) {
                                break;
                            }
                            let reply = {
                                let mut sim = sim.lock().expect("safekeeper sim poisoned");
                                sim.handle(message)
                            };
                            if from_sk_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        result = epoch_rx.changed() => {
                            if result.is_err() || network.is_isolated(node_id) {
                                break;
                            }
                        }
                    }
                }
            });

            Ok(Session::new(node_id, to_sk_tx, from_sk_rx))
        })
    }
}
