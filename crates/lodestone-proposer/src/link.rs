//! Per-safekeeper streaming link.
//!
//! One link per quorum member, each running as its own tokio task so a
//! slow or unreachable member never blocks delivery to the others. A link
//! owns its member's [`MemberState`] and publishes it as snapshots;
//! everything the coordinator needs to know arrives as [`LinkEvent`]s on a
//! single ordered stream.
//!
//! Session lifecycle: connect, handshake the held term, resume streaming
//! from the member's acknowledged position, forward flush acknowledgments.
//! Transport failures reconnect with jittered exponential backoff; a
//! higher term from the peer ends the link for good and tells the
//! coordinator to re-elect.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use lodestone_types::{ConnectionStatus, Lsn, MemberState, NodeId, Term};
use lodestone_wire::{ProposerMessage, SafekeeperMessage};

use crate::config::BackoffPolicy;
use crate::transport::{Connector, TransportError};
use crate::wal::WalTail;

/// Chunks pushed per loop round before acknowledgments are drained again.
const MAX_CHUNKS_PER_ROUND: usize = 8;

/// Event from a link into the coordinator's ordered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The member durably flushed everything up to `flushed_lsn` under
    /// `term`.
    Ack {
        node_id: NodeId,
        term: Term,
        flushed_lsn: Lsn,
    },

    /// The member holds a strictly higher term; streaming under the
    /// current term must stop and the proposer must re-elect.
    TermSuperseded {
        node_id: NodeId,
        higher_term: Term,
    },
}

/// Everything a link needs to run, bundled for [`spawn_link`].
pub(crate) struct LinkContext {
    pub node_id: NodeId,
    pub proposer_id: NodeId,
    /// The elected term; every outbound message is tagged with it.
    pub term: Term,
    pub connector: Arc<dyn Connector>,
    /// Shared WAL tail, written only by the coordinator.
    pub wal: Arc<RwLock<WalTail>>,
    /// Wakes the link when the coordinator appends WAL.
    pub wal_end_rx: watch::Receiver<Lsn>,
    /// Commit watermark, piggybacked on keep-alives.
    pub committed_rx: watch::Receiver<Lsn>,
    pub events_tx: mpsc::Sender<LinkEvent>,
    /// Term bump / demotion signal; the only way a link is cancelled.
    pub shutdown_rx: watch::Receiver<bool>,
    pub ack_timeout: Duration,
    pub keepalive_interval: Duration,
    pub max_chunk_bytes: usize,
    pub backoff: BackoffPolicy,
}

/// Coordinator-side handle to a running link.
#[derive(Debug)]
pub struct LinkHandle {
    node_id: NodeId,
    state_rx: watch::Receiver<MemberState>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Latest published snapshot of the member's progress.
    pub fn state(&self) -> MemberState {
        *self.state_rx.borrow()
    }

    /// Waits for the link task to exit. Pair with the shutdown signal.
    pub(crate) async fn join(self) {
        let _ = self.task.await;
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns the link task for one member.
pub(crate) fn spawn_link(ctx: LinkContext) -> LinkHandle {
    let node_id = ctx.node_id;
    let (state_tx, state_rx) = watch::channel(MemberState::initial(node_id));
    let link = SafekeeperLink {
        ctx,
        state_tx,
        send_pos: Lsn::INVALID,
        reconnect_attempts: 0,
    };
    let task = tokio::spawn(link.run());
    LinkHandle {
        node_id,
        state_rx,
        task,
    }
}

/// How a session ended, as opposed to failing.
enum SessionEnd {
    Shutdown,
    Superseded,
}

struct SafekeeperLink {
    ctx: LinkContext,
    state_tx: watch::Sender<MemberState>,
    /// Next position to send to this member. Reset from the member's
    /// acknowledged position on every (re)connect.
    send_pos: Lsn,
    reconnect_attempts: u32,
}

impl SafekeeperLink {
    async fn run(mut self) {
        loop {
            if self.shutdown_requested() {
                break;
            }
            match self.run_session().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Superseded) => break,
                Err(e) => {
                    self.set_status(ConnectionStatus::Stale);
                    let delay = self.ctx.backoff.delay(self.reconnect_attempts);
                    self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                    warn!(
                        node_id = %self.ctx.node_id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "link failed, reconnecting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        changed = self.ctx.shutdown_rx.changed() => {
                            if changed.is_err() || self.shutdown_requested() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.set_status(ConnectionStatus::Stale);
    }

    async fn run_session(&mut self) -> Result<SessionEnd, TransportError> {
        self.set_status(ConnectionStatus::Connecting);
        let mut session = self.ctx.connector.connect(self.ctx.node_id).await?;

        // Handshake: establish our term on the member and learn where to
        // resume. Resuming from the member's acknowledged position rather
        // than our own send position makes retransmission after reconnect
        // automatic; WAL application is idempotent up to LSN.
        session
            .send(ProposerMessage::ProposeTerm {
                term: self.ctx.term,
                proposer_id: self.ctx.proposer_id,
            })
            .await?;

        let member_flushed = loop {
            let reply = tokio::time::timeout(self.ctx.ack_timeout, session.recv())
                .await
                .map_err(|_| TransportError::Timeout)??;
            match reply {
                SafekeeperMessage::TermAccepted {
                    term,
                    last_flushed_lsn,
                    ..
                } if term == self.ctx.term => break last_flushed_lsn,
                SafekeeperMessage::TermRejected { higher_term }
                | SafekeeperMessage::Rejected { higher_term } => {
                    self.surface_supersession(higher_term).await;
                    return Ok(SessionEnd::Superseded);
                }
                other => {
                    debug!(node_id = %self.ctx.node_id, message = ?other,
                        "ignoring message during handshake");
                }
            }
        };

        self.reconnect_attempts = 0;
        let floor = self
            .ctx
            .wal
            .read()
            .expect("wal tail lock poisoned")
            .start_lsn();
        self.send_pos = member_flushed.max(floor);

        self.state_tx.send_modify(|state| {
            state.term = self.ctx.term;
            state.status = ConnectionStatus::Active;
            state.last_flushed_lsn = state.last_flushed_lsn.max(member_flushed);
            state.last_received_lsn = state.last_received_lsn.max(self.send_pos);
        });
        info!(
            node_id = %self.ctx.node_id,
            term = %self.ctx.term,
            resume_from = %self.send_pos,
            "link established"
        );

        // The handshake acknowledgment seeds quorum accounting for this
        // member.
        if member_flushed.is_valid() && self.emit_ack(member_flushed).await.is_err() {
            return Ok(SessionEnd::Shutdown);
        }

        let mut keepalive = tokio::time::interval(self.ctx.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Push pending WAL, bounded per round so acknowledgments and
            // shutdown stay responsive even with a deep backlog.
            let mut sent = 0;
            while sent < MAX_CHUNKS_PER_ROUND {
                let chunk = {
                    let wal = self.ctx.wal.read().expect("wal tail lock poisoned");
                    wal.read_from(self.send_pos, self.ctx.max_chunk_bytes)
                };
                let Some(chunk) = chunk else { break };
                let end = chunk.end_lsn();
                session
                    .send(ProposerMessage::StreamChunk {
                        term: self.ctx.term,
                        begin_lsn: chunk.begin_lsn,
                        data: chunk.data,
                    })
                    .await?;
                self.send_pos = end;
                self.state_tx.send_modify(|state| {
                    state.last_received_lsn = state.last_received_lsn.max(end);
                });
                sent += 1;
            }
            if sent > 0 {
                // Traffic counts as liveness; push the next keep-alive out.
                keepalive.reset();
            }

            let backlog = {
                let wal = self.ctx.wal.read().expect("wal tail lock poisoned");
                wal.end_lsn() > self.send_pos
            };

            tokio::select! {
                biased;

                changed = self.ctx.shutdown_rx.changed() => {
                    if changed.is_err() || self.shutdown_requested() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                response = tokio::time::timeout(self.ctx.ack_timeout, session.recv()) => {
                    match response {
                        Err(_) => {
                            // Acknowledgment silence is only fatal while
                            // bytes are outstanding; an idle link is kept
                            // alive by keep-alives.
                            if self.send_pos > self.state_tx.borrow().last_flushed_lsn {
                                return Err(TransportError::Timeout);
                            }
                        }
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(message)) => {
                            if let Some(end) = self.handle_message(message).await? {
                                return Ok(end);
                            }
                        }
                    }
                }

                _ = keepalive.tick() => {
                    let committed_lsn = *self.ctx.committed_rx.borrow();
                    trace!(node_id = %self.ctx.node_id, %committed_lsn, "keep-alive");
                    session
                        .send(ProposerMessage::KeepAlive {
                            term: self.ctx.term,
                            committed_lsn,
                        })
                        .await?;
                }

                changed = self.ctx.wal_end_rx.changed(), if !backlog => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                // Backlog remains: fall through and keep sending.
                () = std::future::ready(()), if backlog => {}
            }
        }
    }

    /// Processes one message from the member. `Ok(Some(..))` ends the
    /// session cleanly.
    async fn handle_message(
        &mut self,
        message: SafekeeperMessage,
    ) -> Result<Option<SessionEnd>, TransportError> {
        match message {
            SafekeeperMessage::ChunkAck { term, flushed_lsn } => {
                if term > self.ctx.term {
                    self.surface_supersession(term).await;
                    return Ok(Some(SessionEnd::Superseded));
                }
                if term < self.ctx.term {
                    debug!(node_id = %self.ctx.node_id, ack_term = %term,
                        "ignoring acknowledgment for stale term");
                    return Ok(None);
                }

                let previous = self.state_tx.borrow().last_flushed_lsn;
                if flushed_lsn > previous {
                    self.state_tx.send_modify(|state| {
                        state.last_flushed_lsn = flushed_lsn;
                        state.last_received_lsn = state.last_received_lsn.max(flushed_lsn);
                    });
                    if self.emit_ack(flushed_lsn).await.is_err() {
                        return Ok(Some(SessionEnd::Shutdown));
                    }
                }
                Ok(None)
            }
            SafekeeperMessage::TermRejected { higher_term }
            | SafekeeperMessage::Rejected { higher_term } => {
                self.surface_supersession(higher_term).await;
                Ok(Some(SessionEnd::Superseded))
            }
            SafekeeperMessage::TermAccepted { .. } => {
                // Duplicate handshake reply; harmless.
                Ok(None)
            }
        }
    }

    async fn emit_ack(&self, flushed_lsn: Lsn) -> Result<(), ()> {
        self.ctx
            .events_tx
            .send(LinkEvent::Ack {
                node_id: self.ctx.node_id,
                term: self.ctx.term,
                flushed_lsn,
            })
            .await
            .map_err(|_| ())
    }

    async fn surface_supersession(&self, higher_term: Term) {
        info!(
            node_id = %self.ctx.node_id,
            held_term = %self.ctx.term,
            %higher_term,
            "member reports higher term, stopping link"
        );
        let _ = self
            .ctx
            .events_tx
            .send(LinkEvent::TermSuperseded {
                node_id: self.ctx.node_id,
                higher_term,
            })
            .await;
    }

    fn shutdown_requested(&self) -> bool {
        *self.ctx.shutdown_rx.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state_tx.send_modify(|state| state.status = status);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::transport::MemoryNetwork;
    use crate::wal::WalChunk;

    use super::*;

    struct Harness {
        network: Arc<MemoryNetwork>,
        wal: Arc<RwLock<WalTail>>,
        wal_end_tx: watch::Sender<Lsn>,
        committed_tx: watch::Sender<Lsn>,
        shutdown_tx: watch::Sender<bool>,
        events_rx: mpsc::Receiver<LinkEvent>,
        handle: LinkHandle,
    }

    fn start_link(network: &Arc<MemoryNetwork>, node: NodeId, term: Term, start: Lsn) -> Harness {
        let wal = Arc::new(RwLock::new(WalTail::new(start)));
        let (wal_end_tx, wal_end_rx) = watch::channel(start);
        let (committed_tx, committed_rx) = watch::channel(start);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(64);

        let handle = spawn_link(LinkContext {
            node_id: node,
            proposer_id: NodeId::new(0),
            term,
            connector: Arc::new(network.connector()),
            wal: Arc::clone(&wal),
            wal_end_rx,
            committed_rx,
            events_tx,
            shutdown_rx,
            ack_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(50),
            max_chunk_bytes: 1024,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
            },
        });

        Harness {
            network: Arc::clone(network),
            wal,
            wal_end_tx,
            committed_tx,
            shutdown_tx,
            events_rx,
            handle,
        }
    }

    fn append(harness: &Harness, begin: u64, data: &'static [u8]) {
        let chunk = WalChunk::new(Lsn::new(begin), Bytes::from_static(data));
        let end = chunk.end_lsn();
        harness
            .wal
            .write()
            .unwrap()
            .append(chunk)
            .expect("contiguous append");
        harness.wal_end_tx.send_replace(end);
    }

    async fn next_ack(harness: &mut Harness) -> (Term, Lsn) {
        loop {
            match harness.events_rx.recv().await.expect("events channel open") {
                LinkEvent::Ack {
                    term, flushed_lsn, ..
                } => return (term, flushed_lsn),
                LinkEvent::TermSuperseded { .. } => panic!("unexpected supersession"),
            }
        }
    }

    #[tokio::test]
    async fn streams_wal_and_forwards_acks() {
        let network = MemoryNetwork::shared();
        let node = NodeId::new(1);
        network.add_safekeeper(node);

        let mut harness = start_link(&network, node, Term::new(3), Lsn::new(100));

        append(&harness, 100, b"0123456789");
        let (term, flushed) = next_ack(&mut harness).await;
        assert_eq!(term, Term::new(3));
        assert_eq!(flushed, Lsn::new(110));

        let state = harness.handle.state();
        assert_eq!(state.status, ConnectionStatus::Active);
        assert_eq!(state.last_flushed_lsn, Lsn::new(110));
        assert_eq!(state.last_received_lsn, Lsn::new(110));

        harness.shutdown_tx.send_replace(true);
        harness.handle.join().await;
    }

    #[tokio::test]
    async fn reconnect_resumes_from_acknowledged_position() {
        let network = MemoryNetwork::shared();
        let node = NodeId::new(1);
        network.add_safekeeper(node);

        let mut harness = start_link(&network, node, Term::new(2), Lsn::new(0));

        append(&harness, 0, b"aaaa");
        let (_, flushed) = next_ack(&mut harness).await;
        assert_eq!(flushed, Lsn::new(4));

        // Cut the member off, append more WAL while it is away.
        harness.network.isolate(node);
        append(&harness, 4, b"bbbb");
        append(&harness, 8, b"cccc");
        harness.network.heal(node);

        // After reconnecting the link retransmits from the acknowledged
        // position and converges to the same flush point as an
        // uninterrupted member.
        loop {
            let (_, flushed) = next_ack(&mut harness).await;
            if flushed == Lsn::new(12) {
                break;
            }
        }
        let sim = harness.network.safekeeper(node).unwrap();
        assert_eq!(sim.lock().unwrap().flushed_lsn(), Lsn::new(12));

        harness.shutdown_tx.send_replace(true);
        harness.handle.join().await;
    }

    #[tokio::test]
    async fn higher_term_stops_the_link() {
        let network = MemoryNetwork::shared();
        let node = NodeId::new(1);
        network.add_safekeeper(node);

        let mut harness = start_link(&network, node, Term::new(2), Lsn::new(0));

        append(&harness, 0, b"xx");
        let (_, flushed) = next_ack(&mut harness).await;
        assert_eq!(flushed, Lsn::new(2));

        // Another proposer wins the member over; the next exchange under
        // our term is rejected.
        network
            .safekeeper(node)
            .unwrap()
            .lock()
            .unwrap()
            .bump_term(Term::new(9));

        // The keep-alive (or next chunk) triggers the rejection.
        loop {
            match harness.events_rx.recv().await.expect("events channel open") {
                LinkEvent::TermSuperseded { higher_term, .. } => {
                    assert_eq!(higher_term, Term::new(9));
                    break;
                }
                LinkEvent::Ack { .. } => {}
            }
        }

        // The link ends by itself after surfacing the supersession.
        harness.handle.join().await;
    }

    #[tokio::test]
    async fn keepalive_carries_commit_watermark() {
        let network = MemoryNetwork::shared();
        let node = NodeId::new(1);
        network.add_safekeeper(node);

        let harness = start_link(&network, node, Term::new(2), Lsn::new(0));
        harness.committed_tx.send_replace(Lsn::new(42));

        // The idle link announces the watermark via keep-alives.
        let sim = harness.network.safekeeper(node).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if sim.lock().unwrap().committed_lsn() == Lsn::new(42) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "keep-alive never announced the watermark"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        harness.shutdown_tx.send_replace(true);
        harness.handle.join().await;
    }
}
