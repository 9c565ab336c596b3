//! Integration tests for lodestone-proposer.
//!
//! These exercise the whole proposer (election, fan-out, quorum commit,
//! failover) over the in-memory transport, where partitions and lagging
//! members can be injected deterministically.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use lodestone_types::{ConnectionStatus, Lsn, NodeId, QuorumConfig, Term};

use crate::config::{BackoffPolicy, ProposerConfig};
use crate::core::{Proposer, ProposerHandle, ProposerStatus};
use crate::term_store::{MemoryTermStore, TermStore};
use crate::transport::MemoryNetwork;
use crate::wal::WalChunk;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Helper Functions
// ============================================================================

fn test_config(members: u64) -> ProposerConfig {
    let ids = (1..=members).map(NodeId::new).collect();
    let mut config = ProposerConfig::new(NodeId::new(0), QuorumConfig::new(ids).unwrap());
    config.election_timeout = Duration::from_millis(500);
    config.ack_timeout = Duration::from_secs(2);
    config.keepalive_interval = Duration::from_millis(50);
    config.backoff = BackoffPolicy {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(100),
    };
    config
}

fn cluster(members: u64) -> (Arc<MemoryNetwork>, Arc<MemoryTermStore>, ProposerHandle) {
    let network = MemoryNetwork::shared();
    for node in 1..=members {
        network.add_safekeeper(NodeId::new(node));
    }
    let store = Arc::new(MemoryTermStore::new());
    let handle = Proposer::spawn(
        test_config(members),
        Arc::new(network.connector()),
        Arc::clone(&store) as Arc<dyn TermStore>,
    );
    (network, store, handle)
}

async fn wait_status(handle: &ProposerHandle, status: ProposerStatus) {
    let mut rx = handle.subscribe_status();
    tokio::time::timeout(WAIT, async {
        loop {
            let current = rx.borrow().status;
            if current == status {
                return;
            }
            rx.changed().await.expect("proposer alive");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("proposer never reached {status:?}"));
}

async fn wait_committed(handle: &ProposerHandle, target: Lsn) {
    let mut rx = handle.subscribe_committed();
    tokio::time::timeout(WAIT, async {
        loop {
            let current = *rx.borrow();
            if current >= target {
                return;
            }
            rx.changed().await.expect("proposer alive");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("committed LSN never reached {target}"));
}

async fn append(handle: &ProposerHandle, begin: u64, data: &'static [u8]) {
    handle
        .append(WalChunk::new(Lsn::new(begin), Bytes::from_static(data)))
        .await
        .expect("append accepted");
}

// ============================================================================
// Promotion and Streaming
// ============================================================================

#[tokio::test]
async fn promotion_elects_and_streams_to_quorum() {
    let (_network, store, handle) = cluster(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;

    let status = handle.status();
    assert_eq!(status.term, Some(Term::new(1)));

    // Fresh cluster: the elected start position is the beginning.
    assert_eq!(handle.committed(), Lsn::new(0));

    append(&handle, 0, b"0123456789").await;
    append(&handle, 10, b"abcdef").await;
    wait_committed(&handle, Lsn::new(16)).await;

    // Every member converges; all links end up active at the tip.
    tokio::time::timeout(WAIT, async {
        loop {
            let states = handle.member_states().await.unwrap();
            let converged = states.len() == 3
                && states.iter().all(|state| {
                    state.status == ConnectionStatus::Active
                        && state.last_flushed_lsn == Lsn::new(16)
                });
            if converged {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("members never converged to the tip");

    // The election was persisted.
    assert_eq!(store.load().unwrap().unwrap().term, Term::new(1));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn wal_gap_is_rejected() {
    let (_network, _store, handle) = cluster(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;

    append(&handle, 0, b"abc").await;
    let err = handle
        .append(WalChunk::new(Lsn::new(10), Bytes::from_static(b"gap")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::error::ProposerError::WalGap { expected, got }
            if expected == Lsn::new(3) && got == Lsn::new(10)
    ));

    handle.shutdown().await.unwrap();
}

// ============================================================================
// Degraded Quorum
// ============================================================================

#[tokio::test]
async fn lagging_member_converges_after_reconnect() {
    let (network, _store, handle) = cluster(3);
    let lagging = NodeId::new(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;

    append(&handle, 0, b"aaaaaaaaaa").await;
    wait_committed(&handle, Lsn::new(10)).await;

    // One member drops out; the remaining two still form a quorum, so the
    // watermark keeps advancing without it.
    network.isolate(lagging);
    append(&handle, 10, b"bbbbbbbbbb").await;
    wait_committed(&handle, Lsn::new(20)).await;

    // The member comes back: the link retransmits from its acknowledged
    // position and it ends up exactly where an uninterrupted member would.
    network.heal(lagging);
    let sim = network.safekeeper(lagging).unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            if sim.lock().unwrap().flushed_lsn() == Lsn::new(20) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnected member never converged");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn quorum_loss_stalls_commit_without_corruption() {
    let (network, _store, handle) = cluster(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;

    append(&handle, 0, b"xxxx").await;
    wait_committed(&handle, Lsn::new(4)).await;

    // Two of three members go away: no quorum, no commit advancement.
    network.isolate(NodeId::new(2));
    network.isolate(NodeId::new(3));
    append(&handle, 4, b"yyyy").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.committed(), Lsn::new(4));

    // Quorum restored: the stalled suffix commits.
    network.heal(NodeId::new(2));
    network.heal(NodeId::new(3));
    wait_committed(&handle, Lsn::new(8)).await;

    handle.shutdown().await.unwrap();
}

// ============================================================================
// Term Changes
// ============================================================================

#[tokio::test]
async fn higher_term_forces_reelection() {
    let (network, _store, handle) = cluster(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;
    let first_term = handle.status().term.unwrap();

    append(&handle, 0, b"aaaa").await;
    wait_committed(&handle, Lsn::new(4)).await;

    // A member grants a higher term to some other proposer. The next
    // exchange under our term is rejected, which must force re-election
    // above the observed term, never a retry under the stale one.
    let usurper_term = Term::new(first_term.as_u64() + 5);
    network
        .safekeeper(NodeId::new(2))
        .unwrap()
        .lock()
        .unwrap()
        .bump_term(usurper_term);

    // Re-elected and streaming again under a strictly higher term.
    let mut status_rx = handle.subscribe_status();
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = *status_rx.borrow();
            if snapshot.status == ProposerStatus::Streaming
                && snapshot.term.is_some_and(|term| term > usurper_term)
            {
                return;
            }
            status_rx.changed().await.expect("proposer alive");
        }
    })
    .await
    .expect("proposer never re-elected above the usurper term");

    // The watermark never regressed across the term change.
    assert!(handle.committed() >= Lsn::new(4));

    // Streaming continues from where the previous epoch left off.
    append(&handle, 4, b"bbbb").await;
    wait_committed(&handle, Lsn::new(8)).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_resumes_above_persisted_term() {
    let (network, store, handle) = cluster(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;
    append(&handle, 0, b"0123456789ab").await;
    wait_committed(&handle, Lsn::new(12)).await;
    handle.shutdown().await.unwrap();

    // A restarted proposer consults the durable store: it proposes above
    // its own past term, and the election reseeds the watermark at the
    // quorum's flush position, so nothing certified is ever lost.
    let handle = Proposer::spawn(
        test_config(3),
        Arc::new(network.connector()),
        Arc::clone(&store) as Arc<dyn TermStore>,
    );
    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;

    assert_eq!(handle.status().term, Some(Term::new(2)));

    // The watermark reseeds to the elected start position with no appends.
    wait_committed(&handle, Lsn::new(12)).await;

    append(&handle, 12, b"more").await;
    wait_committed(&handle, Lsn::new(16)).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn demotion_returns_to_idle_and_marks_members_stale() {
    let (_network, _store, handle) = cluster(3);

    handle.promote().await.unwrap();
    wait_status(&handle, ProposerStatus::Streaming).await;
    append(&handle, 0, b"zz").await;
    wait_committed(&handle, Lsn::new(2)).await;

    handle.demote().await.unwrap();
    wait_status(&handle, ProposerStatus::Idle).await;

    // Snapshots survive teardown, tagged stale.
    let states = handle.member_states().await.unwrap();
    assert_eq!(states.len(), 3);
    for state in states {
        assert_eq!(state.status, ConnectionStatus::Stale);
    }

    // An idle proposer refuses WAL.
    assert!(handle
        .append(WalChunk::new(Lsn::new(2), Bytes::from_static(b"w")))
        .await
        .is_err());

    handle.shutdown().await.unwrap();
}
