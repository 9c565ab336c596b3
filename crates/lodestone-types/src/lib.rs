//! # lodestone-types: Core types for `Lodestone`
//!
//! This crate contains the shared value types used across the `Lodestone`
//! system:
//! - WAL positions ([`Lsn`])
//! - Election epochs ([`Term`], [`TermHistory`])
//! - Safekeeper identity ([`NodeId`])
//! - Per-member progress snapshots ([`MemberState`], [`ConnectionStatus`])
//! - Quorum membership ([`QuorumConfig`])
//! - Election results ([`ElectionOutcome`])
//!
//! Everything here is a pure value type: no I/O, no clocks, no channels.

use std::{
    fmt::Display,
    ops::{Add, AddAssign, Sub},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Lsn - Copy (cheap 8-byte value)
// ============================================================================

/// A log sequence number: a totally ordered byte position in the WAL stream.
///
/// LSNs are compared to decide durability watermarks and subtracted to
/// measure replication lag. Within a single member's acknowledgment stream
/// under a stable term they never decrease.
///
/// Displayed in the conventional `high/low` hexadecimal form, e.g.
/// `0/16B9188`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn(u64);

impl Lsn {
    /// The invalid (zero) position, used as "nothing known yet".
    pub const INVALID: Lsn = Lsn(0);

    pub fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw position as a `u64`.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is a real position rather than the sentinel.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Byte distance to an earlier position, or `None` if `earlier > self`.
    ///
    /// Used for lag measurement; lag is only meaningful between positions
    /// in the same WAL stream.
    pub fn checked_sub(self, earlier: Lsn) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, bytes: u64) -> Self::Output {
        Lsn(self.0 + bytes)
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, bytes: u64) {
        self.0 += bytes;
    }
}

impl Sub for Lsn {
    type Output = u64;

    /// Byte distance between two positions. Panics in debug builds if
    /// `rhs > self`; use [`Lsn::checked_sub`] when the ordering is not
    /// already established.
    fn sub(self, rhs: Lsn) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

// ============================================================================
// Term - Copy (cheap 8-byte value)
// ============================================================================

/// A monotonically increasing election epoch.
///
/// Terms prevent split-brain between successive proposers: a proposer only
/// accepts acknowledgments tagged with the term it currently holds, and any
/// peer response carrying a higher term forces abdication and re-election.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Term(u64);

impl Term {
    /// The first term a fresh proposer may propose.
    pub const INITIAL: Term = Term(1);

    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Returns the raw term as a `u64`.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The next term after this one.
    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

// ============================================================================
// NodeId - Copy (cheap 8-byte value)
// ============================================================================

/// Unique identifier of a safekeeper (quorum member).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier as a `u64`.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sk-{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ============================================================================
// Term History
// ============================================================================

/// A point at which a safekeeper switched to a new term.
///
/// `start_lsn` is the position from which WAL was accepted under `term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSwitchEntry {
    pub term: Term,
    pub start_lsn: Lsn,
}

/// The ordered list of terms a safekeeper has accepted WAL under.
///
/// Entries are strictly increasing in term and non-decreasing in LSN.
/// Carried in election responses; the proposer uses it for diagnostics and
/// to sanity-check a member's reported flush position against the epochs it
/// claims to have served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TermHistory(Vec<TermSwitchEntry>);

impl TermHistory {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a switch entry, enforcing ordering.
    ///
    /// Returns `false` (and leaves the history untouched) if the entry would
    /// violate strictly-increasing terms or non-decreasing start LSNs.
    pub fn add(&mut self, entry: TermSwitchEntry) -> bool {
        if let Some(last) = self.0.last() {
            if entry.term <= last.term || entry.start_lsn < last.start_lsn {
                return false;
            }
        }
        self.0.push(entry);
        true
    }

    /// The most recent term switch, if any.
    pub fn last(&self) -> Option<&TermSwitchEntry> {
        self.0.last()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The entries in order.
    pub fn entries(&self) -> &[TermSwitchEntry] {
        &self.0
    }
}

// ============================================================================
// Member State
// ============================================================================

/// Connection liveness of a safekeeper link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// The link is establishing (or re-establishing) its connection.
    Connecting,
    /// The link is connected and streaming.
    Active,
    /// The link lost its connection; state reflects the last session.
    Stale,
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Snapshot of one safekeeper's replication progress.
///
/// Owned exclusively by the member's link and published as immutable
/// snapshots; readers never race with the owning link's writes.
///
/// Invariant: `last_flushed_lsn <= last_received_lsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub node_id: NodeId,
    /// The term this member last acknowledged under.
    pub term: Term,
    /// Highest position sent to and received by the member.
    pub last_received_lsn: Lsn,
    /// Highest position the member reported as durably flushed.
    pub last_flushed_lsn: Lsn,
    pub status: ConnectionStatus,
}

impl MemberState {
    /// Initial state for a member that has not connected yet.
    pub fn initial(node_id: NodeId) -> Self {
        Self {
            node_id,
            term: Term::default(),
            last_received_lsn: Lsn::INVALID,
            last_flushed_lsn: Lsn::INVALID,
            status: ConnectionStatus::Connecting,
        }
    }

    /// Bytes received by the member but not yet durably flushed.
    pub fn flush_lag(&self) -> u64 {
        self.last_received_lsn
            .checked_sub(self.last_flushed_lsn)
            .unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

// ============================================================================
// Quorum Configuration
// ============================================================================

/// Error constructing a [`QuorumConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumConfigError {
    /// The member set was empty.
    NoMembers,
    /// `quorum_size` was zero or exceeded the member count.
    InvalidQuorumSize { quorum_size: usize, members: usize },
    /// The same `NodeId` appeared twice.
    DuplicateMember(NodeId),
}

impl Display for QuorumConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMembers => write!(f, "quorum configuration has no members"),
            Self::InvalidQuorumSize {
                quorum_size,
                members,
            } => write!(
                f,
                "quorum size {quorum_size} is invalid for {members} members"
            ),
            Self::DuplicateMember(id) => write!(f, "duplicate member {id}"),
        }
    }
}

impl std::error::Error for QuorumConfigError {}

/// The member set and quorum size for one streaming epoch.
///
/// Immutable for the lifetime of a term; changing membership requires a
/// fresh election under a new term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    members: Vec<NodeId>,
    quorum_size: usize,
}

impl QuorumConfig {
    /// Creates a configuration with the majority quorum `floor(N/2) + 1`.
    pub fn new(members: Vec<NodeId>) -> Result<Self, QuorumConfigError> {
        let quorum = members.len() / 2 + 1;
        Self::with_quorum_size(members, quorum)
    }

    /// Creates a configuration with an explicit quorum size.
    pub fn with_quorum_size(
        mut members: Vec<NodeId>,
        quorum_size: usize,
    ) -> Result<Self, QuorumConfigError> {
        if members.is_empty() {
            return Err(QuorumConfigError::NoMembers);
        }
        members.sort_unstable();
        if let Some(dup) = members.windows(2).find(|w| w[0] == w[1]) {
            return Err(QuorumConfigError::DuplicateMember(dup[0]));
        }
        if quorum_size == 0 || quorum_size > members.len() {
            return Err(QuorumConfigError::InvalidQuorumSize {
                quorum_size,
                members: members.len(),
            });
        }
        Ok(Self {
            members,
            quorum_size,
        })
    }

    /// Members in ascending `NodeId` order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.members.binary_search(&node_id).is_ok()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Members that may fail while the quorum stays reachable.
    pub fn max_failures(&self) -> usize {
        self.members.len() - self.quorum_size
    }
}

// ============================================================================
// Election Outcome
// ============================================================================

/// The result of a successful election.
///
/// `start_lsn` is the highest flushed position among the accepting quorum:
/// the position from which new WAL may be proposed without discarding data
/// a previous proposer may have committed. All subsequent streaming and
/// acknowledgment processing is validated against this baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionOutcome {
    pub term: Term,
    pub start_lsn: Lsn,
}
