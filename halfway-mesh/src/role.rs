//! Cosmetic host labelling.
//!
//! The peer at slot 0 is the host only because every later joiner dials
//! it first. Any peer answers joins, so the label never affects
//! correctness. It is derived from the local slot on demand and never
//! sent over the wire.

use crate::protocol::{PeerAddress, RoomId, SlotIndex};

/// Whether `slot` carries the host label.
pub fn is_host(slot: SlotIndex) -> bool {
    slot == 0
}

/// The address every joiner of `room` tries first.
pub fn host_address(room: &RoomId) -> PeerAddress {
    PeerAddress::new(room.clone(), 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

impl Role {
    pub fn for_slot(slot: SlotIndex) -> Self {
        if is_host(slot) {
            Role::Host
        } else {
            Role::Guest
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_zero_is_host() {
        assert!(is_host(0));
        assert!(!is_host(1));
        assert!(!is_host(117));
        assert_eq!(Role::for_slot(0), Role::Host);
        assert_eq!(Role::for_slot(3).label(), "guest");
    }

    #[test]
    fn test_host_address() {
        let room = RoomId::parse("calm-red-owl").unwrap();
        assert_eq!(host_address(&room).to_string(), "calm-red-owl_0");
    }
}
