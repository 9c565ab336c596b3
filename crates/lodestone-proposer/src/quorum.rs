//! Quorum commit arithmetic.
//!
//! Folds per-member flush acknowledgments into the single committed LSN:
//! the highest position at least `quorum_size` members report flushed
//! under the current term.

use std::collections::BTreeMap;

use tracing::warn;

use lodestone_types::{Lsn, NodeId, QuorumConfig, Term};

use crate::error::QuorumError;

/// Tracks per-member flush positions for one term and derives the
/// committed LSN.
///
/// Reset and reseeded from the election outcome on every term change;
/// within a term the committed LSN is non-decreasing because per-member
/// inputs are clamped monotone and quorum-of-maximum is monotone in its
/// inputs.
#[derive(Debug)]
pub struct QuorumTracker {
    term: Term,
    config: QuorumConfig,
    /// Latest flushed position per member under `term`. `Lsn::INVALID`
    /// until the member first acknowledges.
    flushed: BTreeMap<NodeId, Lsn>,
    /// Committed floor from the election; the watermark never drops below
    /// it even while fewer than quorum members have acknowledged.
    floor: Lsn,
    committed: Lsn,
}

impl QuorumTracker {
    /// Creates a tracker for a fresh term, seeded at the elected start
    /// position.
    pub fn new(config: QuorumConfig, term: Term, start_lsn: Lsn) -> Self {
        let flushed = config
            .members()
            .iter()
            .map(|&node_id| (node_id, Lsn::INVALID))
            .collect();
        Self {
            term,
            config,
            flushed,
            floor: start_lsn,
            committed: start_lsn,
        }
    }

    /// The term this tracker is counting under.
    pub fn term(&self) -> Term {
        self.term
    }

    /// The current committed LSN.
    pub fn committed(&self) -> Lsn {
        self.committed
    }

    /// The latest flushed position every member has reached, used to trim
    /// the retained WAL tail. `Lsn::INVALID` until all members have
    /// acknowledged at least once.
    pub fn min_flushed(&self) -> Lsn {
        self.flushed
            .values()
            .copied()
            .min()
            .unwrap_or(Lsn::INVALID)
    }

    /// Records a flush acknowledgment.
    ///
    /// Returns `Ok(Some(lsn))` when the committed LSN advanced, `Ok(None)`
    /// when it did not (including acknowledgments for a stale term, which
    /// are discarded). `Err` only on faults: unknown members, or the
    /// impossible-regression consistency check.
    pub fn observe(
        &mut self,
        node_id: NodeId,
        term: Term,
        flushed_lsn: Lsn,
    ) -> Result<Option<Lsn>, QuorumError> {
        if term != self.term {
            warn!(%node_id, ack_term = %term, current_term = %self.term,
                "discarding acknowledgment for stale term");
            return Ok(None);
        }

        let entry = self
            .flushed
            .get_mut(&node_id)
            .ok_or(QuorumError::UnknownMember(node_id))?;

        // Per-member flush positions never decrease within a term; a lower
        // re-report (e.g. replayed ack after reconnect) is dropped.
        if flushed_lsn <= *entry {
            return Ok(None);
        }
        *entry = flushed_lsn;

        let recomputed = self.recompute();
        if recomputed < self.committed {
            return Err(QuorumError::CommittedLsnRegression {
                published: self.committed,
                recomputed,
            });
        }
        if recomputed > self.committed {
            self.committed = recomputed;
            Ok(Some(recomputed))
        } else {
            Ok(None)
        }
    }

    /// The `quorum_size`-th highest flushed position, floored at the
    /// elected start.
    fn recompute(&self) -> Lsn {
        let mut positions: Vec<Lsn> = self.flushed.values().copied().collect();
        positions.sort_unstable();
        positions.reverse();
        let quorum_pos = positions[self.config.quorum_size() - 1];
        quorum_pos.max(self.floor)
    }
}
