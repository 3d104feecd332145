//! Error taxonomy for the coordination layer.
//!
//! Only `TransportUnavailable` (and a failed `initialize`) is fatal.
//! `SlotClaimRejected` and `PeerUnreachable` are expected during
//! discovery and never reach the user; `ChannelLost` downgrades a
//! member's connection status.

use thiserror::Error;

use crate::protocol::{PeerAddress, ProtocolError, SlotIndex};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MeshError {
    #[error("Signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Slot claim rejected: {0}")]
    SlotClaimRejected(PeerAddress),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerAddress),

    #[error("Channel to {address} lost: {reason}")]
    ChannelLost { address: PeerAddress, reason: String },

    /// Outbound buffer momentarily full; the channel itself is fine.
    #[error("Channel to {0} is full")]
    ChannelFull(PeerAddress),

    #[error("No free slot after {probed} probes and {fallbacks} fallback claims")]
    IdentityExhausted { probed: SlotIndex, fallbacks: u32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Mesh node is not running")]
    NodeStopped,
}

impl MeshError {
    /// Whether the error is part of normal discovery and should stay silent.
    pub fn is_discovery_noise(&self) -> bool {
        matches!(self, Self::SlotClaimRejected(_) | Self::PeerUnreachable(_))
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
