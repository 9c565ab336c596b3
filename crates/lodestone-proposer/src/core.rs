//! Proposer state machine and coordinator event loop.
//!
//! `Idle -> Electing -> Streaming -> (Electing on term loss | Idle on
//! demotion)`. The coordinator task is the single writer for the current
//! term, the committed LSN, and the WAL tail: links deliver their
//! acknowledgments as an ordered event stream, and no two tasks ever race
//! on commit arithmetic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use lodestone_types::{ConnectionStatus, ElectionOutcome, Lsn, MemberState, NodeId, Term};

use crate::config::ProposerConfig;
use crate::election::ElectionCoordinator;
use crate::error::{ProposerError, QuorumError};
use crate::link::{LinkContext, LinkEvent, LinkHandle, spawn_link};
use crate::quorum::QuorumTracker;
use crate::term_store::TermStore;
use crate::transport::Connector;
use crate::wal::{WalChunk, WalTail};

/// Capacity of the ordered link-event stream into the coordinator.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the control channel from the handle.
const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// Grace period for links to exit after the shutdown signal.
const LINK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Externally visible proposer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposerStatus {
    /// No active term; waiting for promotion.
    Idle,
    /// Establishing a term. An un-elected proposer never claims readiness,
    /// so exhausted retries stay here rather than falling back to `Idle`.
    Electing,
    /// Holding a term and fanning out WAL.
    Streaming,
}

/// Snapshot published on every state or term change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: ProposerStatus,
    /// The held term while streaming, `None` otherwise.
    pub term: Option<Term>,
}

enum Control {
    Promote,
    Demote,
    Append(WalChunk, oneshot::Sender<Result<(), ProposerError>>),
    MemberStates(oneshot::Sender<Vec<MemberState>>),
    Shutdown,
}

// ============================================================================
// Handle
// ============================================================================

/// External interface to a running proposer.
///
/// This is the surface the WAL source (the primary) drives: an ordered,
/// gap-free stream of chunks in, the committed watermark and lifecycle
/// state out, plus promotion and demotion signals.
#[derive(Debug)]
pub struct ProposerHandle {
    control_tx: mpsc::Sender<Control>,
    committed_rx: watch::Receiver<Lsn>,
    status_rx: watch::Receiver<StatusSnapshot>,
    task: JoinHandle<Result<(), ProposerError>>,
}

impl ProposerHandle {
    /// Signals promotion: an idle proposer starts electing.
    pub async fn promote(&self) -> Result<(), ProposerError> {
        self.send(Control::Promote).await
    }

    /// Signals demotion: the proposer tears down links and goes idle.
    pub async fn demote(&self) -> Result<(), ProposerError> {
        self.send(Control::Demote).await
    }

    /// Appends the next WAL chunk from the source.
    ///
    /// Chunks must arrive in order without gaps; the first chunk of an
    /// epoch begins at the elected start LSN.
    pub async fn append(&self, chunk: WalChunk) -> Result<(), ProposerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Control::Append(chunk, reply_tx)).await?;
        reply_rx.await.map_err(|_| ProposerError::ShutDown)?
    }

    /// The current committed LSN.
    pub fn committed(&self) -> Lsn {
        *self.committed_rx.borrow()
    }

    /// Subscribes to committed LSN advancement.
    pub fn subscribe_committed(&self) -> watch::Receiver<Lsn> {
        self.committed_rx.clone()
    }

    /// The current lifecycle state and term.
    pub fn status(&self) -> StatusSnapshot {
        *self.status_rx.borrow()
    }

    /// Subscribes to lifecycle changes.
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    /// Latest progress snapshots for all members.
    pub async fn member_states(&self) -> Result<Vec<MemberState>, ProposerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Control::MemberStates(reply_tx)).await?;
        reply_rx.await.map_err(|_| ProposerError::ShutDown)
    }

    /// Stops the proposer and waits for the coordinator to exit.
    ///
    /// Returns the coordinator's result; a fatal consistency fault
    /// (committed-LSN regression) surfaces here.
    pub async fn shutdown(self) -> Result<(), ProposerError> {
        let _ = self.control_tx.send(Control::Shutdown).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "proposer task panicked");
                Err(ProposerError::ShutDown)
            }
        }
    }

    async fn send(&self, control: Control) -> Result<(), ProposerError> {
        self.control_tx
            .send(control)
            .await
            .map_err(|_| ProposerError::ShutDown)
    }
}

// ============================================================================
// Proposer
// ============================================================================

/// The quorum WAL proposer.
pub struct Proposer;

impl Proposer {
    /// Spawns the coordinator task and returns its handle.
    pub fn spawn(
        config: ProposerConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn TermStore>,
    ) -> ProposerHandle {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (committed_tx, committed_rx) = watch::channel(Lsn::INVALID);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot {
            status: ProposerStatus::Idle,
            term: None,
        });

        let coordinator = ElectionCoordinator::new(
            config.proposer_id,
            config.quorum.clone(),
            Arc::clone(&connector),
            store,
            config.election_timeout,
        );

        let core = ProposerCore {
            config,
            connector,
            coordinator,
            control_rx,
            committed_tx,
            status_tx,
            last_states: HashMap::new(),
        };
        let task = tokio::spawn(core.run());

        ProposerHandle {
            control_tx,
            committed_rx,
            status_rx,
            task,
        }
    }
}

enum IdleEnd {
    Promoted,
    Shutdown,
}

enum ElectingEnd {
    Elected(ElectionOutcome),
    Demoted,
    Shutdown,
}

enum StreamEnd {
    TermLoss,
    Demoted,
    Shutdown,
}

struct ProposerCore {
    config: ProposerConfig,
    connector: Arc<dyn Connector>,
    coordinator: ElectionCoordinator,
    control_rx: mpsc::Receiver<Control>,
    committed_tx: watch::Sender<Lsn>,
    status_tx: watch::Sender<StatusSnapshot>,
    /// Last known snapshots, kept across epochs so progress is visible
    /// while electing.
    last_states: HashMap<NodeId, MemberState>,
}

impl ProposerCore {
    async fn run(mut self) -> Result<(), ProposerError> {
        loop {
            self.publish_status(ProposerStatus::Idle, None);
            match self.run_idle().await {
                IdleEnd::Promoted => {}
                IdleEnd::Shutdown => return Ok(()),
            }

            'epoch: loop {
                self.publish_status(ProposerStatus::Electing, None);
                let outcome = match self.run_electing().await {
                    ElectingEnd::Elected(outcome) => outcome,
                    ElectingEnd::Demoted => break 'epoch,
                    ElectingEnd::Shutdown => return Ok(()),
                };

                self.publish_status(ProposerStatus::Streaming, Some(outcome.term));
                match self.run_streaming(outcome).await? {
                    StreamEnd::TermLoss => {}
                    StreamEnd::Demoted => break 'epoch,
                    StreamEnd::Shutdown => return Ok(()),
                }
            }
        }
    }

    async fn run_idle(&mut self) -> IdleEnd {
        loop {
            match self.control_rx.recv().await {
                Some(Control::Promote) => return IdleEnd::Promoted,
                Some(Control::Demote) => {}
                Some(Control::Append(_, reply)) => {
                    let _ = reply.send(Err(ProposerError::NotStreaming));
                }
                Some(Control::MemberStates(reply)) => {
                    let _ = reply.send(self.last_states.values().copied().collect());
                }
                Some(Control::Shutdown) | None => return IdleEnd::Shutdown,
            }
        }
    }

    /// Runs elections with backoff until one succeeds or the operator
    /// intervenes. Never falls back to `Idle` on its own.
    async fn run_electing(&mut self) -> ElectingEnd {
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                result = self.coordinator.run() => match result {
                    Ok(outcome) => return ElectingEnd::Elected(outcome),
                    Err(e) => {
                        warn!(error = %e, attempt, "election attempt failed");
                        let delay = self.config.backoff.delay(attempt);
                        attempt = attempt.saturating_add(1);
                        if let Some(end) = self.wait_or_control(delay).await {
                            return end;
                        }
                    }
                },
                control = self.control_rx.recv() => {
                    if let Some(end) = self.handle_control_while_electing(control) {
                        return end;
                    }
                }
            }
        }
    }

    /// Sleeps between election attempts while staying responsive to
    /// control traffic. Returns `Some` if the electing phase must end.
    async fn wait_or_control(&mut self, delay: Duration) -> Option<ElectingEnd> {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return None,
                control = self.control_rx.recv() => {
                    if let Some(end) = self.handle_control_while_electing(control) {
                        return Some(end);
                    }
                }
            }
        }
    }

    fn handle_control_while_electing(&mut self, control: Option<Control>) -> Option<ElectingEnd> {
        match control {
            Some(Control::Promote) => None,
            Some(Control::Demote) => Some(ElectingEnd::Demoted),
            Some(Control::Append(_, reply)) => {
                let _ = reply.send(Err(ProposerError::NotStreaming));
                None
            }
            Some(Control::MemberStates(reply)) => {
                let _ = reply.send(self.last_states.values().copied().collect());
                None
            }
            Some(Control::Shutdown) | None => Some(ElectingEnd::Shutdown),
        }
    }

    async fn run_streaming(&mut self, outcome: ElectionOutcome) -> Result<StreamEnd, ProposerError> {
        let term = outcome.term;
        info!(%term, start_lsn = %outcome.start_lsn, "streaming under elected term");

        // Reseed commit tracking from the election outcome. The externally
        // visible watermark must never move backwards across terms; if the
        // arithmetic says otherwise, previously certified data is gone and
        // that is a fault, not a transition.
        let mut tracker =
            QuorumTracker::new(self.config.quorum.clone(), term, outcome.start_lsn);
        let published = *self.committed_tx.borrow();
        if tracker.committed() < published {
            return Err(ProposerError::from(QuorumError::CommittedLsnRegression {
                published,
                recomputed: tracker.committed(),
            }));
        }
        self.committed_tx.send_replace(tracker.committed());

        let wal = Arc::new(RwLock::new(WalTail::new(outcome.start_lsn)));
        let (wal_end_tx, wal_end_rx) = watch::channel(outcome.start_lsn);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let links: Vec<LinkHandle> = self
            .config
            .quorum
            .members()
            .iter()
            .map(|&node_id| {
                spawn_link(LinkContext {
                    node_id,
                    proposer_id: self.config.proposer_id,
                    term,
                    connector: Arc::clone(&self.connector),
                    wal: Arc::clone(&wal),
                    wal_end_rx: wal_end_rx.clone(),
                    committed_rx: self.committed_tx.subscribe(),
                    events_tx: events_tx.clone(),
                    shutdown_rx: shutdown_rx.clone(),
                    ack_timeout: self.config.ack_timeout,
                    keepalive_interval: self.config.keepalive_interval,
                    max_chunk_bytes: self.config.max_chunk_bytes,
                    backoff: self.config.backoff,
                })
            })
            .collect();
        drop(events_tx);

        let end = loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else {
                        // All links gone without a supersession; should not
                        // happen outside shutdown.
                        break StreamEnd::Shutdown;
                    };
                    match event {
                        LinkEvent::Ack { node_id, term: ack_term, flushed_lsn } => {
                            match tracker.observe(node_id, ack_term, flushed_lsn) {
                                Ok(Some(committed)) => {
                                    self.committed_tx.send_replace(committed);
                                    let everyone_has = tracker.min_flushed();
                                    if everyone_has.is_valid() {
                                        wal.write()
                                            .expect("wal tail lock poisoned")
                                            .trim(everyone_has);
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!(error = %e, "fatal quorum fault");
                                    self.teardown(&shutdown_tx, links).await;
                                    return Err(e.into());
                                }
                            }
                        }
                        LinkEvent::TermSuperseded { node_id, higher_term } => {
                            info!(%node_id, %higher_term, held = %term,
                                "term lost, re-electing");
                            self.coordinator.observe_term(higher_term);
                            break StreamEnd::TermLoss;
                        }
                    }
                }

                control = self.control_rx.recv() => {
                    match control {
                        Some(Control::Promote) => {}
                        Some(Control::Demote) => break StreamEnd::Demoted,
                        Some(Control::Append(chunk, reply)) => {
                            let result = wal
                                .write()
                                .expect("wal tail lock poisoned")
                                .append(chunk);
                            if result.is_ok() {
                                let end_lsn = wal
                                    .read()
                                    .expect("wal tail lock poisoned")
                                    .end_lsn();
                                wal_end_tx.send_replace(end_lsn);
                            }
                            let _ = reply.send(result);
                        }
                        Some(Control::MemberStates(reply)) => {
                            let _ = reply.send(links.iter().map(LinkHandle::state).collect());
                        }
                        Some(Control::Shutdown) | None => break StreamEnd::Shutdown,
                    }
                }
            }
        };

        self.teardown(&shutdown_tx, links).await;
        Ok(end)
    }

    /// Signals all links to stop and waits for them, remembering their
    /// final snapshots.
    async fn teardown(&mut self, shutdown_tx: &watch::Sender<bool>, links: Vec<LinkHandle>) {
        shutdown_tx.send_replace(true);
        for link in links {
            let mut state = link.state();
            state.status = ConnectionStatus::Stale;
            self.last_states.insert(link.node_id(), state);

            if tokio::time::timeout(LINK_JOIN_TIMEOUT, link.join())
                .await
                .is_err()
            {
                warn!("link did not stop within the grace period");
            }
        }
    }

    fn publish_status(&self, status: ProposerStatus, term: Option<Term>) {
        self.status_tx.send_replace(StatusSnapshot { status, term });
    }
}

#[cfg(test)]
mod tests {
    use lodestone_types::{NodeId, QuorumConfig};

    use crate::term_store::MemoryTermStore;
    use crate::transport::MemoryNetwork;

    use super::*;

    #[tokio::test]
    async fn append_is_rejected_while_idle() {
        let network = MemoryNetwork::shared();
        network.add_safekeeper(NodeId::new(1));
        let config = ProposerConfig::new(
            NodeId::new(0),
            QuorumConfig::new(vec![NodeId::new(1)]).unwrap(),
        );

        let handle = Proposer::spawn(
            config,
            Arc::new(network.connector()),
            Arc::new(MemoryTermStore::new()),
        );

        let err = handle
            .append(WalChunk::new(Lsn::new(0), bytes::Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProposerError::NotStreaming));

        assert_eq!(handle.status().status, ProposerStatus::Idle);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_from_any_state_is_clean() {
        let network = MemoryNetwork::shared();
        // No safekeepers registered: the proposer stays in Electing.
        let config = ProposerConfig::new(
            NodeId::new(0),
            QuorumConfig::new(vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]).unwrap(),
        );

        let handle = Proposer::spawn(
            config,
            Arc::new(network.connector()),
            Arc::new(MemoryTermStore::new()),
        );
        handle.promote().await.unwrap();

        let mut status_rx = handle.subscribe_status();
        while status_rx.borrow().status != ProposerStatus::Electing {
            status_rx.changed().await.unwrap();
        }

        handle.shutdown().await.unwrap();
    }
}
