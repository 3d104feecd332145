//! Slot allocation by sequential probing.
//!
//! Slots `0..probe_bound` are claimed in order; the first grant wins and
//! is kept for the lifetime of the join attempt. When every probed slot
//! is taken the allocator draws random slots from the fallback range,
//! accepting a small collision risk in exchange for progress.

use std::collections::HashSet;
use std::time::Duration;
use rand::Rng;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::protocol::{PeerAddress, RoomId, SlotIndex};
use crate::substrate::{Claim, Registration, Substrate};

/// A claimed identity.
#[derive(Debug)]
pub struct Allocation {
    pub address: PeerAddress,
    pub registration: Registration,
    /// The slot came from the random fallback range.
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct SlotAllocator {
    probe_bound: SlotIndex,
    fallback_base: SlotIndex,
    fallback_span: SlotIndex,
    fallback_attempts: u32,
    claim_timeout: Duration,
}

impl SlotAllocator {
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            probe_bound: config.probe_bound,
            fallback_base: config.fallback_base,
            fallback_span: config.fallback_span.max(1),
            fallback_attempts: config.fallback_attempts,
            claim_timeout: config.claim_timeout(),
        }
    }

    /// Claim a slot in `room`.
    ///
    /// Fails with `TransportUnavailable` as soon as the substrate cannot be
    /// reached, and with `IdentityExhausted` when the fallback range is
    /// exhausted too.
    pub async fn allocate<S: Substrate>(&self, substrate: &S, room: &RoomId) -> Result<Allocation, MeshError> {
        for slot in 0..self.probe_bound {
            let address = PeerAddress::new(room.clone(), slot);
            match self.try_claim(substrate, &address).await? {
                Some(registration) => {
                    log::debug!("Claimed {address}");
                    return Ok(Allocation {
                        address,
                        registration,
                        degraded: false,
                    });
                }
                None => log::debug!("{}", MeshError::SlotClaimRejected(address)),
            }
        }

        log::info!(
            "Slots 0..{} of {room} are all taken, falling back to random slots",
            self.probe_bound
        );

        let mut tried = HashSet::new();
        for _ in 0..self.fallback_attempts {
            let slot = self
                .fallback_base
                .saturating_add(rand::thread_rng().gen_range(0..self.fallback_span));
            if !tried.insert(slot) {
                continue;
            }
            let address = PeerAddress::new(room.clone(), slot);
            match self.try_claim(substrate, &address).await? {
                Some(registration) => {
                    log::info!("Claimed fallback slot {address}");
                    return Ok(Allocation {
                        address,
                        registration,
                        degraded: true,
                    });
                }
                None => log::debug!("{}", MeshError::SlotClaimRejected(address)),
            }
        }

        Err(MeshError::IdentityExhausted {
            probed: self.probe_bound,
            fallbacks: self.fallback_attempts,
        })
    }

    /// `Ok(None)` for a rejected or timed out claim.
    async fn try_claim<S: Substrate>(
        &self,
        substrate: &S,
        address: &PeerAddress,
    ) -> Result<Option<Registration>, MeshError> {
        match tokio::time::timeout(self.claim_timeout, substrate.claim(address, self.claim_timeout)).await {
            Ok(Ok(Claim::Granted(registration))) => Ok(Some(registration)),
            Ok(Ok(Claim::Rejected)) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::debug!("Claim of {address} timed out");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;

    fn room() -> RoomId {
        RoomId::parse("alloc-room").unwrap()
    }

    #[tokio::test]
    async fn test_first_free_slot_wins() {
        let substrate = MemorySubstrate::new();
        let allocator = SlotAllocator::from_config(&MeshConfig::default());

        let first = allocator.allocate(&substrate, &room()).await.unwrap();
        let second = allocator.allocate(&substrate, &room()).await.unwrap();
        assert_eq!(first.address.slot, 0);
        assert_eq!(second.address.slot, 1);
        assert!(!second.degraded);
    }

    #[tokio::test]
    async fn test_freed_low_slot_is_reused() {
        let substrate = MemorySubstrate::new();
        let allocator = SlotAllocator::from_config(&MeshConfig::default());

        let first = allocator.allocate(&substrate, &room()).await.unwrap();
        let _second = allocator.allocate(&substrate, &room()).await.unwrap();
        drop(first);

        let third = allocator.allocate(&substrate, &room()).await.unwrap();
        assert_eq!(third.address.slot, 0);
    }

    #[tokio::test]
    async fn test_fallback_after_probe_bound() {
        let substrate = MemorySubstrate::new();
        let config = MeshConfig {
            probe_bound: 2,
            ..MeshConfig::default()
        };
        let allocator = SlotAllocator::from_config(&config);

        let _a = allocator.allocate(&substrate, &room()).await.unwrap();
        let _b = allocator.allocate(&substrate, &room()).await.unwrap();
        let c = allocator.allocate(&substrate, &room()).await.unwrap();
        assert!(c.degraded);
        assert!(c.address.slot >= config.fallback_base);
        assert!(c.address.slot < config.fallback_base + config.fallback_span);
    }

    #[tokio::test]
    async fn test_exhausted_when_fallback_is_taken() {
        let substrate = MemorySubstrate::new();
        let config = MeshConfig {
            probe_bound: 1,
            fallback_base: 10,
            fallback_span: 1,
            fallback_attempts: 3,
            ..MeshConfig::default()
        };
        let allocator = SlotAllocator::from_config(&config);

        let _a = allocator.allocate(&substrate, &room()).await.unwrap();
        let _b = allocator.allocate(&substrate, &room()).await.unwrap();
        let result = allocator.allocate(&substrate, &room()).await;
        assert!(matches!(
            result,
            Err(MeshError::IdentityExhausted { probed: 1, fallbacks: 3 })
        ));
    }

    #[tokio::test]
    async fn test_unavailable_transport_fails_fast() {
        let substrate = MemorySubstrate::new();
        substrate.set_available(false);
        let allocator = SlotAllocator::from_config(&MeshConfig::default());
        let result = allocator.allocate(&substrate, &room()).await;
        assert!(matches!(result, Err(MeshError::TransportUnavailable(_))));
    }
}
