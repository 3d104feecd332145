//! Tunables for the mesh node and the signaling relay.
//!
//! Both structs deserialize with `#[serde(default)]`, so a partial TOML
//! table only overrides the fields it names.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MeshError;
use crate::protocol::SlotIndex;

/// Mesh node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Number of sequential slots probed before falling back to a random one.
    pub probe_bound: SlotIndex,
    /// How long a single slot claim may take before it counts as rejected.
    pub claim_timeout_ms: u64,
    /// Delay before a lost node restarts allocation and mesh formation.
    pub reconnect_delay_ms: u64,
    /// Lowest slot used by the random fallback.
    pub fallback_base: SlotIndex,
    /// Width of the random fallback range.
    pub fallback_span: SlotIndex,
    /// Random fallback claims attempted before giving up.
    pub fallback_attempts: u32,
    /// Capacity of the notification channel handed to the application.
    pub event_capacity: usize,
    /// Per-channel outbound buffer.
    pub channel_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            probe_bound: 12,
            claim_timeout_ms: 2_000,
            reconnect_delay_ms: 3_000,
            fallback_base: 100,
            fallback_span: 1_000,
            fallback_attempts: 8,
            event_capacity: 256,
            channel_capacity: 256,
        }
    }
}

impl MeshConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Reject settings the allocator cannot work with.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.probe_bound == 0 {
            return Err(MeshError::Config("probe_bound must be at least 1".into()));
        }
        if self.fallback_span == 0 {
            return Err(MeshError::Config("fallback_span must be at least 1".into()));
        }
        if self.fallback_base < self.probe_bound {
            return Err(MeshError::Config(
                "fallback_base must not overlap the probed slots".into(),
            ));
        }
        if self.event_capacity == 0 || self.channel_capacity == 0 {
            return Err(MeshError::Config("channel capacities must be non-zero".into()));
        }
        Ok(())
    }
}

/// Signaling relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrently claimed addresses
    pub max_sessions: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            max_sessions: 1024,
        }
    }
}
