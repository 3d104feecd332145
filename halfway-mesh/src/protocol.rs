//! Envelope protocol exchanged over peer-to-peer channels.
//!
//! Every channel carries a stream of bincode-encoded [`Envelope`]s:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ tag     │ payload                                      │
//! │ varint  │ Member / members+title / UserID / addresses  │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Channels are ordered and reliable, so no sequence numbers travel on
//! the wire. Cross-channel ordering is handled by the per-member
//! `revision` counter (last-write-wins keyed by UserID).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Slot index claimed by a client within a room.
pub type SlotIndex = u32;

/// Room names that collide with static assets of the hosting page.
const RESERVED_ROOM_IDS: [&str; 6] = ["index.html", "index.htm", "app.js", "styles.css", "js", "css"];

// ───────────────────────────────────────────────────────────────────
// Addressing
// ───────────────────────────────────────────────────────────────────

/// Opaque room identifier shared out-of-band.
///
/// Only `[A-Za-z0-9-]` is accepted so the identifier is safe to embed
/// in a URL fragment and in substrate addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let raw = raw.trim().trim_start_matches('#');
        if raw.is_empty() {
            return Err(ProtocolError::InvalidRoom("empty room id".into()));
        }
        if RESERVED_ROOM_IDS.contains(&raw.to_ascii_lowercase().as_str()) {
            return Err(ProtocolError::InvalidRoom(format!("reserved room id: {raw}")));
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ProtocolError::InvalidRoom(format!("invalid characters in room id: {raw}")));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default title shown for a room nobody has renamed yet.
    pub fn default_title(&self) -> String {
        format!("Room {}", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rendezvous name on the signaling substrate: `(room, slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub room: RoomId,
    pub slot: SlotIndex,
}

impl PeerAddress {
    pub fn new(room: RoomId, slot: SlotIndex) -> Self {
        Self { room, slot }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.room, self.slot)
    }
}

// ───────────────────────────────────────────────────────────────────
// Members
// ───────────────────────────────────────────────────────────────────

/// How a location was obtained by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationSource {
    /// Device position.
    Current,
    /// Typed address resolved by a geocoder.
    Geocoded,
    /// Picked from place search results.
    Place,
}

/// A single point a member wants to meet from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
    pub source: LocationSource,
}

impl Location {
    pub fn new(lat: f64, lng: f64, address: impl Into<String>, source: LocationSource) -> Self {
        Self {
            lat,
            lng,
            address: address.into(),
            source,
        }
    }
}

/// A room participant and the data it shares.
///
/// Only the owning peer mutates a member; every mutation bumps
/// `revision` so remote copies can discard stale updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Uuid,
    pub name: String,
    pub locations: Vec<Location>,
    /// Address the member was last reachable at.
    pub address: Option<PeerAddress>,
    pub revision: u64,
}

impl Member {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit user id (for testing)
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            locations: Vec::new(),
            address: None,
            revision: 0,
        }
    }

    /// Check the member is fit to announce to a room.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.user_id.is_nil() {
            return Err(ProtocolError::InvalidMember("nil user id".into()));
        }
        if self.name.trim().is_empty() {
            return Err(ProtocolError::InvalidMember("empty display name".into()));
        }
        Ok(())
    }

    /// Rename, ignoring blank names. Returns whether anything changed.
    pub fn rename(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || name == self.name {
            return false;
        }
        self.name = name.to_string();
        self.revision += 1;
        true
    }

    pub fn add_location(&mut self, location: Location) {
        self.locations.push(location);
        self.revision += 1;
    }

    /// Remove the location at `index`, if present.
    pub fn remove_location(&mut self, index: usize) -> Option<Location> {
        if index >= self.locations.len() {
            return None;
        }
        self.revision += 1;
        Some(self.locations.remove(index))
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelopes
// ───────────────────────────────────────────────────────────────────

/// Tag of an [`Envelope`], handy for logging and dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Join,
    StateSnapshot,
    MemberUpdate,
    MemberLeaving,
    PeerListHint,
    TitleUpdate,
}

/// Top-level message on a peer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Sent once on every channel the sender opened.
    Join { member: Member },
    /// Full room state, in reply to a Join.
    StateSnapshot { title: String, members: Vec<Member> },
    /// Upsert of a single member.
    MemberUpdate { member: Member },
    /// The member is about to disconnect for good.
    MemberLeaving { user_id: Uuid },
    /// Addresses of other room members the receiver should dial.
    PeerListHint { peers: Vec<PeerAddress> },
    /// Room title changed.
    TitleUpdate { title: String },
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Join { .. } => EnvelopeKind::Join,
            Envelope::StateSnapshot { .. } => EnvelopeKind::StateSnapshot,
            Envelope::MemberUpdate { .. } => EnvelopeKind::MemberUpdate,
            Envelope::MemberLeaving { .. } => EnvelopeKind::MemberLeaving,
            Envelope::PeerListHint { .. } => EnvelopeKind::PeerListHint,
            Envelope::TitleUpdate { .. } => EnvelopeKind::TitleUpdate,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid room id: {0}")]
    InvalidRoom(String),
    #[error("Invalid member: {0}")]
    InvalidMember(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::parse("happy-blue-fox").unwrap()
    }

    #[test]
    fn test_room_id_accepts_generated_form() {
        let id = RoomId::parse("#calm-red-owl").unwrap();
        assert_eq!(id.as_str(), "calm-red-owl");
        assert_eq!(id.default_title(), "Room calm-red-owl");
    }

    #[test]
    fn test_room_id_rejects_invalid() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("index.html").is_err());
        assert!(RoomId::parse("CSS").is_err());
        assert!(RoomId::parse("a/b").is_err());
        assert!(RoomId::parse("has space").is_err());
        assert!(RoomId::parse("dots.are.bad").is_err());
    }

    #[test]
    fn test_peer_address_display() {
        let addr = PeerAddress::new(room(), 3);
        assert_eq!(addr.to_string(), "happy-blue-fox_3");
    }

    #[test]
    fn test_member_mutations_bump_revision() {
        let mut m = Member::new("Alice");
        assert_eq!(m.revision, 0);

        assert!(m.rename("  Alicia "));
        assert_eq!(m.name, "Alicia");
        assert_eq!(m.revision, 1);

        // Blank and unchanged names are ignored
        assert!(!m.rename("   "));
        assert!(!m.rename("Alicia"));
        assert_eq!(m.revision, 1);

        m.add_location(Location::new(52.5, 13.4, "Berlin", LocationSource::Geocoded));
        assert_eq!(m.revision, 2);

        assert!(m.remove_location(5).is_none());
        assert_eq!(m.revision, 2);
        let removed = m.remove_location(0).unwrap();
        assert_eq!(removed.address, "Berlin");
        assert_eq!(m.revision, 3);
    }

    #[test]
    fn test_member_validate() {
        assert!(Member::new("Bob").validate().is_ok());
        assert!(Member::new("  ").validate().is_err());
        assert!(Member::with_id(Uuid::nil(), "Nil").validate().is_err());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut alice = Member::new("Alice");
        alice.address = Some(PeerAddress::new(room(), 0));
        alice.add_location(Location::new(48.85, 2.35, "Current Location", LocationSource::Current));
        let bob = Member::new("Bob");

        let env = Envelope::StateSnapshot {
            title: "Friday dinner".into(),
            members: vec![alice.clone(), bob.clone()],
        };
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind(), EnvelopeKind::StateSnapshot);
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_peer_list_hint_roundtrip() {
        let env = Envelope::PeerListHint {
            peers: vec![PeerAddress::new(room(), 1), PeerAddress::new(room(), 4)],
        };
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Envelope::decode(&garbage).is_err());
    }
}
