//! Runtime configuration for the proposer core.
//!
//! Consumed, not owned: endpoints and tunables arrive from the embedding
//! process (see the `lodestone-config` crate for the file/env loader).

use std::time::Duration;

use rand::Rng;

use lodestone_types::{NodeId, QuorumConfig};

/// Exponential backoff with jitter for reconnects and election retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given zero-based attempt, doubled per attempt, capped
    /// at `max`, with up to 25% random jitter to avoid thundering herds.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        base.mul_f64(1.0 + jitter).min(self.max)
    }
}

/// Configuration for one proposer instance.
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// Identity this proposer announces in term proposals.
    pub proposer_id: NodeId,

    /// The member set and quorum size for this deployment.
    pub quorum: QuorumConfig,

    /// Bound on a whole election attempt (connect + vote collection).
    pub election_timeout: Duration,

    /// Bound on acknowledgment silence while bytes are outstanding; links
    /// treat longer silences as a dead connection.
    pub ack_timeout: Duration,

    /// Interval between keep-alives on an idle link.
    pub keepalive_interval: Duration,

    /// Backoff for link reconnects and election retries.
    pub backoff: BackoffPolicy,

    /// Largest WAL run sent in a single chunk.
    pub max_chunk_bytes: usize,
}

impl ProposerConfig {
    /// Configuration with defaults suitable for tests and local clusters.
    pub fn new(proposer_id: NodeId, quorum: QuorumConfig) -> Self {
        Self {
            proposer_id,
            quorum,
            election_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            max_chunk_bytes: 128 * 1024,
        }
    }
}
