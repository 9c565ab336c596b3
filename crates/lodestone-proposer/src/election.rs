//! Term-based election.
//!
//! On promotion (or after losing a term) the proposer must determine the
//! highest WAL position any past quorum has durably accepted before it may
//! stream. The coordinator broadcasts a term proposal to all members,
//! collects acceptances until a quorum is reached, and derives the safe
//! starting LSN: the maximum flushed position among the accepting quorum.
//! Any lower-term proposer can have committed only up to a position some
//! member of that quorum already reflects, so nothing durable precedes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use lodestone_types::{ElectionOutcome, Lsn, NodeId, QuorumConfig, Term, TermHistory};
use lodestone_wire::{ProposerMessage, SafekeeperMessage};

use crate::error::ElectionError;
use crate::term_store::TermStore;
use crate::transport::{Connector, TransportResult};

/// Grace window for near-simultaneous acceptances after quorum is met.
const STRAGGLER_GRACE: Duration = Duration::from_millis(50);

/// One member's answer to a term proposal.
#[derive(Debug)]
enum ProbeOutcome {
    Accepted {
        node_id: NodeId,
        last_flushed_lsn: Lsn,
        term_history: TermHistory,
    },
    Rejected {
        node_id: NodeId,
        higher_term: Term,
    },
    Unreachable {
        node_id: NodeId,
    },
}

/// Runs elections for one proposer.
///
/// Holds the highest term observed anywhere (stored history, rejections,
/// streaming-time supersessions) so every attempt proposes strictly above
/// it. The retry-with-backoff loop belongs to the caller; each [`run`]
/// call is a single bounded attempt.
///
/// [`run`]: ElectionCoordinator::run
pub struct ElectionCoordinator {
    proposer_id: NodeId,
    quorum: QuorumConfig,
    connector: Arc<dyn Connector>,
    store: Arc<dyn TermStore>,
    election_timeout: Duration,
    highest_observed: Term,
}

impl ElectionCoordinator {
    pub fn new(
        proposer_id: NodeId,
        quorum: QuorumConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn TermStore>,
        election_timeout: Duration,
    ) -> Self {
        Self {
            proposer_id,
            quorum,
            connector,
            store,
            election_timeout,
            highest_observed: Term::default(),
        }
    }

    /// Records a term observed outside the election exchange (e.g. a
    /// streaming-time rejection), so the next attempt proposes above it.
    pub fn observe_term(&mut self, term: Term) {
        self.highest_observed = self.highest_observed.max(term);
    }

    /// Runs one election attempt.
    ///
    /// On success the outcome is persisted to the term store before it is
    /// returned; a proposer restart can then never propose at or below a
    /// term it already won.
    pub async fn run(&mut self) -> Result<ElectionOutcome, ElectionError> {
        let stored = self
            .store
            .load()?
            .map(|record| record.term)
            .unwrap_or_default();
        let candidate = self.highest_observed.max(stored).next();
        // A failed attempt retries above this candidate.
        self.highest_observed = candidate;

        match self.attempt(candidate).await {
            Ok(outcome) => {
                self.store.persist(outcome.into())?;
                Ok(outcome)
            }
            Err(ElectionError::Superseded { higher_term }) => {
                self.highest_observed = self.highest_observed.max(higher_term);
                Err(ElectionError::Superseded { higher_term })
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt(&self, candidate: Term) -> Result<ElectionOutcome, ElectionError> {
        info!(term = %candidate, members = self.quorum.member_count(), "starting election");

        let mut probes = JoinSet::new();
        for &node_id in self.quorum.members() {
            let connector = Arc::clone(&self.connector);
            let proposer_id = self.proposer_id;
            let timeout = self.election_timeout;
            probes
                .spawn(async move { probe(connector, node_id, candidate, proposer_id, timeout).await });
        }

        let needed = self.quorum.quorum_size();
        let mut acceptances: Vec<(NodeId, Lsn, TermHistory)> = Vec::new();

        let deadline = tokio::time::Instant::now() + self.election_timeout;
        while acceptances.len() < needed {
            match tokio::time::timeout_at(deadline, probes.join_next()).await {
                // Deadline passed, or every probe has reported.
                Err(_) | Ok(None) => break,
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "election probe task failed");
                }
                Ok(Some(Ok(outcome))) => {
                    if let Some(acceptance) = self.fold_probe(candidate, outcome)? {
                        acceptances.push(acceptance);
                    }
                }
            }
        }

        if acceptances.len() < needed {
            return Err(ElectionError::Timeout {
                acceptances: acceptances.len(),
                needed,
            });
        }

        // Quorum reached. Give members that are about to answer a short
        // grace window so the start position reflects everyone who
        // responded, then abandon the in-flight stragglers. A slow member
        // delays promotion by at most the grace, never the full timeout.
        let grace = tokio::time::Instant::now() + STRAGGLER_GRACE.min(self.election_timeout);
        loop {
            match tokio::time::timeout_at(grace, probes.join_next()).await {
                Err(_) | Ok(None) => break,
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "election probe task failed");
                }
                Ok(Some(Ok(outcome))) => {
                    if let Some(acceptance) = self.fold_probe(candidate, outcome)? {
                        acceptances.push(acceptance);
                    }
                }
            }
        }
        probes.abort_all();

        // Safe start: the maximum flushed position among acceptors. Equal
        // positions resolve to the lowest node id, for determinism.
        let (donor, start_lsn, history) = acceptances
            .into_iter()
            .max_by(|(a_node, a_lsn, _), (b_node, b_lsn, _)| {
                a_lsn.cmp(b_lsn).then(b_node.cmp(a_node))
            })
            .expect("quorum implies at least one acceptance");

        info!(
            term = %candidate,
            %donor,
            %start_lsn,
            donor_epochs = history.len(),
            "election won"
        );
        Ok(ElectionOutcome {
            term: candidate,
            start_lsn,
        })
    }

    /// Turns a probe result into an acceptance, or aborts the attempt on a
    /// higher-term rejection.
    fn fold_probe(
        &self,
        candidate: Term,
        outcome: ProbeOutcome,
    ) -> Result<Option<(NodeId, Lsn, TermHistory)>, ElectionError> {
        match outcome {
            ProbeOutcome::Accepted {
                node_id,
                last_flushed_lsn,
                term_history,
            } => {
                debug!(%node_id, flushed = %last_flushed_lsn, "member accepted term");
                Ok(Some((node_id, last_flushed_lsn, term_history)))
            }
            ProbeOutcome::Rejected {
                node_id,
                higher_term,
            } => {
                info!(%node_id, %higher_term, term = %candidate, "election rejected by member");
                Err(ElectionError::Superseded { higher_term })
            }
            ProbeOutcome::Unreachable { node_id } => {
                debug!(%node_id, "member unreachable during election");
                Ok(None)
            }
        }
    }
}

/// Contacts one member with the term proposal, bounded by the election
/// timeout. Transport failures are folded into `Unreachable`; local retry
/// is pointless within a single attempt.
async fn probe(
    connector: Arc<dyn Connector>,
    node_id: NodeId,
    term: Term,
    proposer_id: NodeId,
    timeout: Duration,
) -> ProbeOutcome {
    match tokio::time::timeout(timeout, exchange(connector, node_id, term, proposer_id)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            debug!(%node_id, error = %e, "election probe failed");
            ProbeOutcome::Unreachable { node_id }
        }
        Err(_) => ProbeOutcome::Unreachable { node_id },
    }
}

async fn exchange(
    connector: Arc<dyn Connector>,
    node_id: NodeId,
    term: Term,
    proposer_id: NodeId,
) -> TransportResult<ProbeOutcome> {
    let mut session = connector.connect(node_id).await?;
    session
        .send(ProposerMessage::ProposeTerm { term, proposer_id })
        .await?;

    loop {
        match session.recv().await? {
            SafekeeperMessage::TermAccepted {
                term: accepted,
                last_flushed_lsn,
                term_history,
            } if accepted == term => {
                return Ok(ProbeOutcome::Accepted {
                    node_id,
                    last_flushed_lsn,
                    term_history,
                });
            }
            SafekeeperMessage::TermRejected { higher_term }
            | SafekeeperMessage::Rejected { higher_term } => {
                return Ok(ProbeOutcome::Rejected {
                    node_id,
                    higher_term,
                });
            }
            other => {
                // Stray acknowledgment from an earlier exchange on a
                // reused acceptor; keep waiting for the vote.
                debug!(%node_id, message = ?other, "ignoring non-vote during election");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lodestone_types::QuorumConfig;

    use crate::term_store::{MemoryTermStore, PersistedTerm};
    use crate::transport::MemoryNetwork;

    use super::*;

    fn quorum_of(members: u64, quorum: usize) -> QuorumConfig {
        let ids = (1..=members).map(NodeId::new).collect();
        QuorumConfig::with_quorum_size(ids, quorum).unwrap()
    }

    fn coordinator(
        network: &Arc<MemoryNetwork>,
        quorum: QuorumConfig,
        store: Arc<dyn TermStore>,
    ) -> ElectionCoordinator {
        ElectionCoordinator::new(
            NodeId::new(0),
            quorum,
            Arc::new(network.connector()),
            store,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn start_lsn_is_max_flushed_among_acceptors() {
        // Members report flush positions {50, 70, 60}; the safe start is
        // the maximum, 70.
        let network = MemoryNetwork::shared();
        for (node, flushed) in [(1, 50), (2, 70), (3, 60)] {
            let sim = network.add_safekeeper(NodeId::new(node));
            sim.lock().unwrap().seed(Term::new(1), Lsn::new(flushed));
        }

        let store = Arc::new(MemoryTermStore::new());
        let mut coordinator = coordinator(&network, quorum_of(3, 2), store.clone());

        let outcome = coordinator.run().await.unwrap();
        assert_eq!(outcome.term, Term::new(2));
        assert_eq!(outcome.start_lsn, Lsn::new(70));

        // The win was persisted before being returned.
        assert_eq!(
            store.load().unwrap(),
            Some(PersistedTerm::from(outcome))
        );
    }

    #[tokio::test]
    async fn rejection_retries_above_observed_term() {
        let network = MemoryNetwork::shared();
        for node in 1..=3u64 {
            network.add_safekeeper(NodeId::new(node));
        }
        // One member already granted term 10 to another proposer.
        network
            .safekeeper(NodeId::new(2))
            .unwrap()
            .lock()
            .unwrap()
            .seed(Term::new(10), Lsn::new(40));

        let mut coordinator = coordinator(
            &network,
            quorum_of(3, 3),
            Arc::new(MemoryTermStore::new()),
        );

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(
            err,
            ElectionError::Superseded { higher_term } if higher_term == Term::new(10)
        ));

        // The retry proposes strictly above the observed term.
        let outcome = coordinator.run().await.unwrap();
        assert_eq!(outcome.term, Term::new(11));
    }

    #[tokio::test]
    async fn election_fails_without_quorum() {
        let network = MemoryNetwork::shared();
        for node in 1..=3u64 {
            network.add_safekeeper(NodeId::new(node));
        }
        network.isolate(NodeId::new(2));
        network.isolate(NodeId::new(3));

        let mut coordinator = coordinator(
            &network,
            quorum_of(3, 2),
            Arc::new(MemoryTermStore::new()),
        );

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(
            err,
            ElectionError::Timeout {
                acceptances: 1,
                needed: 2
            }
        ));
    }

    #[tokio::test]
    async fn candidate_rises_above_stored_term() {
        let network = MemoryNetwork::shared();
        for node in 1..=3u64 {
            network.add_safekeeper(NodeId::new(node));
        }

        let store = Arc::new(MemoryTermStore::new());
        store
            .persist(PersistedTerm {
                term: Term::new(5),
                start_lsn: Lsn::new(100),
            })
            .unwrap();

        let mut coordinator = coordinator(&network, quorum_of(3, 2), store);
        let outcome = coordinator.run().await.unwrap();
        assert_eq!(outcome.term, Term::new(6));
    }

    #[tokio::test]
    async fn tied_flush_positions_resolve_to_lowest_node() {
        let network = MemoryNetwork::shared();
        for node in 1..=3u64 {
            let sim = network.add_safekeeper(NodeId::new(node));
            sim.lock().unwrap().seed(Term::new(1), Lsn::new(64));
        }

        let mut coordinator = coordinator(
            &network,
            quorum_of(3, 3),
            Arc::new(MemoryTermStore::new()),
        );

        // Deterministic outcome regardless of arrival order.
        let outcome = coordinator.run().await.unwrap();
        assert_eq!(outcome.start_lsn, Lsn::new(64));
    }
}
