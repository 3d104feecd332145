//! # halfway-mesh — Peer-to-peer room coordination
//!
//! Independent peers sharing only a room id discover each other, claim
//! unique slots, form a full channel mesh and converge on a shared
//! roster of members and their locations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  claim room_0..   ┌──────────────────┐
//! │ SlotAllocator│ ─────────────────►│    Substrate     │
//! └──────┬───────┘                   │ (memory | relay) │
//!        │ Allocation                └────────┬─────────┘
//!        ▼                                    │ Channel
//! ┌──────────────┐  Envelope (bincode) ┌──────┴───────┐
//! │  MeshNode    │ ◄──────────────────►│ remote peers │
//! │  (actor)     │                     └──────────────┘
//! └──────┬───────┘
//!        │ owns
//!        ▼
//! ┌──────────────┬─────────────────┬──────────────┐
//! │ Roster (LWW) │ ConnectionTable │  Liveness    │
//! └──────────────┴─────────────────┴──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Room ids, members and the envelope wire format
//! - [`substrate`] — Address claims and channels (in-process and WebSocket)
//! - [`allocator`] — Sequential slot probing with random fallback
//! - [`mesh`] — Dial targets, duplicate tie-break, connection table
//! - [`roster`] — Last-writer-wins member store and connection status
//! - [`liveness`] — Link state machine with generation counter
//! - [`node`] — The coordination actor and its handle
//! - [`signal`] — WebSocket signaling relay server

pub mod protocol;
pub mod error;
pub mod config;
pub mod names;
pub mod substrate;
pub mod allocator;
pub mod mesh;
pub mod role;
pub mod roster;
pub mod liveness;
pub mod node;
pub mod signal;

// Re-exports for convenience
pub use protocol::{
    Envelope, EnvelopeKind, Location, LocationSource, Member, PeerAddress, ProtocolError,
    RoomId, SlotIndex,
};
pub use error::{MeshError, MeshResult};
pub use config::{MeshConfig, SignalConfig};
pub use names::{generate_pseudonym, generate_room_id};
pub use substrate::{Channel, Claim, Frame, MemorySubstrate, Registration, Substrate, WsSubstrate};
pub use allocator::{Allocation, SlotAllocator};
pub use mesh::{dial_targets, ChannelState, ConnectionTable, OutboundQueue};
pub use role::{host_address, is_host, Role};
pub use roster::{ConnectionStatus, MemoryRosterStore, Roster, RosterEntry, RosterStore, Upsert};
pub use liveness::{LinkState, Liveness};
pub use node::{MeshEvent, MeshHandle, MeshNode, NodeStatus, RoomView};
pub use signal::{ClientFrame, ServerFrame, SignalServer, SignalStats};
