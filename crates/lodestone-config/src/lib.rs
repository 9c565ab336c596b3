//! Configuration management for Lodestone
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (LODESTONE_* prefix, highest precedence)
//! 2. lodestone.local.toml (gitignored, local overrides)
//! 3. lodestone.toml (git-tracked, project config)
//! 4. ~/.config/lodestone/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The loaded [`LodestoneConfig`] converts into the proposer's runtime
//! configuration via [`ProposerSection::proposer_config`] and
//! [`ProposerSection::endpoints`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lodestone_proposer::{BackoffPolicy, ProposerConfig};
use lodestone_types::{NodeId, QuorumConfig};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Lodestone configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LodestoneConfig {
    pub proposer: ProposerSection,
}

/// One safekeeper endpoint entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafekeeperEntry {
    /// Stable member identity.
    pub id: u64,
    /// `host:port` the safekeeper listens on.
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposerSection {
    /// Identity this proposer announces in term proposals.
    pub id: u64,

    /// The quorum member set.
    pub safekeepers: Vec<SafekeeperEntry>,

    /// Explicit quorum size; defaults to the majority of the member set.
    pub quorum_size: Option<usize>,

    pub election_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_chunk_bytes: usize,
}

impl Default for ProposerSection {
    fn default() -> Self {
        Self {
            id: 0,
            safekeepers: Vec::new(),
            quorum_size: None,
            election_timeout_ms: 3_000,
            ack_timeout_ms: 10_000,
            keepalive_interval_ms: 1_000,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
            max_chunk_bytes: 128 * 1024,
        }
    }
}

impl ProposerSection {
    /// Builds the runtime proposer configuration.
    pub fn proposer_config(&self) -> Result<ProposerConfig, ConfigError> {
        if self.safekeepers.is_empty() {
            return Err(ConfigError::Invalid(
                "proposer.safekeepers must not be empty".to_string(),
            ));
        }

        let members: Vec<NodeId> = self
            .safekeepers
            .iter()
            .map(|entry| NodeId::new(entry.id))
            .collect();
        let quorum = match self.quorum_size {
            Some(size) => QuorumConfig::with_quorum_size(members, size)?,
            None => QuorumConfig::new(members)?,
        };

        let mut config = ProposerConfig::new(NodeId::new(self.id), quorum);
        config.election_timeout = Duration::from_millis(self.election_timeout_ms);
        config.ack_timeout = Duration::from_millis(self.ack_timeout_ms);
        config.keepalive_interval = Duration::from_millis(self.keepalive_interval_ms);
        config.backoff = BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        };
        config.max_chunk_bytes = self.max_chunk_bytes;
        Ok(config)
    }

    /// Parses the safekeeper endpoints for the TCP connector.
    pub fn endpoints(&self) -> Result<HashMap<NodeId, SocketAddr>, ConfigError> {
        let mut endpoints = HashMap::with_capacity(self.safekeepers.len());
        for entry in &self.safekeepers {
            let addr: SocketAddr = entry.addr.parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "safekeeper {} has invalid address {:?}",
                    entry.id, entry.addr
                ))
            })?;
            endpoints.insert(NodeId::new(entry.id), addr);
        }
        Ok(endpoints)
    }
}
