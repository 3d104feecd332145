//! In-process substrate.
//!
//! A single broker maps claimed addresses to the inbound queue of their
//! registration. Channels are pairs of tokio mpsc queues, so ordering
//! and reliability come for free. Used by tests and single-process
//! simulations of a room.
//!
//! Fault injection:
//! - [`MemorySubstrate::set_available`] makes every claim fail with
//!   `TransportUnavailable`
//! - [`MemorySubstrate::sever`] drops an address's signaling session and
//!   errors every channel it has open

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::{channel_pair, Channel, Claim, DialRequest, Frame, LinkId, Registration, Substrate};
use crate::error::MeshError;
use crate::protocol::PeerAddress;

/// Both ends of a live link, held weakly so the broker never keeps a
/// channel open by itself.
struct LinkEnds {
    a: PeerAddress,
    to_a: mpsc::WeakSender<Frame>,
    b: PeerAddress,
    to_b: mpsc::WeakSender<Frame>,
}

#[derive(Default)]
struct Broker {
    endpoints: HashMap<PeerAddress, mpsc::Sender<Channel>>,
    links: HashMap<LinkId, LinkEnds>,
    next_link: LinkId,
}

impl Broker {
    fn is_claimed(&self, address: &PeerAddress) -> bool {
        self.endpoints
            .get(address)
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// In-process [`Substrate`]. Clones share the same broker.
#[derive(Clone)]
pub struct MemorySubstrate {
    broker: Arc<Mutex<Broker>>,
    available: Arc<AtomicBool>,
    capacity: usize,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create with a custom per-queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            broker: Arc::new(Mutex::new(Broker::default())),
            available: Arc::new(AtomicBool::new(true)),
            capacity,
        }
    }

    /// Toggle whether the substrate can be reached at all.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Whether `address` is currently claimed by a live registration.
    pub async fn is_claimed(&self, address: &PeerAddress) -> bool {
        self.broker.lock().await.is_claimed(address)
    }

    /// Number of live claims.
    pub async fn claimed_count(&self) -> usize {
        let broker = self.broker.lock().await;
        broker.endpoints.values().filter(|tx| !tx.is_closed()).count()
    }

    /// Drop the signaling session of `address` and error its channels.
    ///
    /// The owner's [`Registration::accept`] returns `None` afterwards.
    pub async fn sever(&self, address: &PeerAddress) {
        let mut broker = self.broker.lock().await;
        broker.endpoints.remove(address);

        let reason = format!("{address} severed");
        broker.links.retain(|_, ends| {
            if &ends.a != address && &ends.b != address {
                return true;
            }
            for weak in [&ends.to_a, &ends.to_b] {
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.try_send(Frame::Error(reason.clone()));
                }
            }
            false
        });
        log::debug!("Memory substrate severed {address}");
    }

    async fn open_link(&self, local: &PeerAddress, remote: PeerAddress) -> Result<Channel, MeshError> {
        if !self.is_available() {
            return Err(MeshError::TransportUnavailable("memory substrate offline".into()));
        }
        if local == &remote {
            return Err(MeshError::PeerUnreachable(remote));
        }

        let (remote_incoming, ours, theirs) = {
            let mut broker = self.broker.lock().await;
            let Some(tx) = broker.endpoints.get(&remote).filter(|tx| !tx.is_closed()).cloned() else {
                return Err(MeshError::PeerUnreachable(remote));
            };
            broker.next_link += 1;
            let link = broker.next_link;
            let (ours, theirs) = channel_pair(local.clone(), remote.clone(), link, self.capacity);
            broker
                .links
                .retain(|_, ends| ends.to_a.upgrade().is_some() || ends.to_b.upgrade().is_some());
            (tx, ours, theirs)
        };

        let link = ours.link();
        // Each side's inbound is fed by the other side's outbound queue.
        let (to_remote, to_local) = (ours.outbound_weak(), theirs.outbound_weak());
        remote_incoming
            .send(theirs)
            .await
            .map_err(|_| MeshError::PeerUnreachable(remote.clone()))?;

        self.broker.lock().await.links.insert(
            link,
            LinkEnds {
                a: local.clone(),
                to_a: to_local,
                b: remote,
                to_b: to_remote,
            },
        );
        Ok(ours)
    }
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl Substrate for MemorySubstrate {
    async fn claim(&self, address: &PeerAddress, _timeout: Duration) -> Result<Claim, MeshError> {
        if !self.is_available() {
            return Err(MeshError::TransportUnavailable("memory substrate offline".into()));
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(self.capacity);
        {
            let mut broker = self.broker.lock().await;
            if broker.is_claimed(address) {
                return Ok(Claim::Rejected);
            }
            broker.endpoints.insert(address.clone(), incoming_tx);
        }

        let (dial_tx, mut dial_rx) = mpsc::channel::<DialRequest>(self.capacity);
        let substrate = self.clone();
        let local = address.clone();
        tokio::spawn(async move {
            while let Some(request) = dial_rx.recv().await {
                let result = substrate.open_link(&local, request.remote).await;
                let _ = request.reply.send(result);
            }
        });

        log::trace!("Memory substrate granted {address}");
        Ok(Claim::Granted(Registration::new(address.clone(), dial_tx, incoming_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoomId;

    fn addr(slot: u32) -> PeerAddress {
        PeerAddress::new(RoomId::parse("mem-room").unwrap(), slot)
    }

    async fn granted(substrate: &MemorySubstrate, slot: u32) -> Registration {
        match substrate.claim(&addr(slot), Duration::from_secs(1)).await.unwrap() {
            Claim::Granted(r) => r,
            Claim::Rejected => panic!("slot {slot} unexpectedly rejected"),
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let substrate = MemorySubstrate::new();
        let _reg = granted(&substrate, 0).await;

        let second = substrate.claim(&addr(0), Duration::from_secs(1)).await.unwrap();
        assert!(matches!(second, Claim::Rejected));
        assert_eq!(substrate.claimed_count().await, 1);
    }

    #[tokio::test]
    async fn test_claim_released_on_drop() {
        let substrate = MemorySubstrate::new();
        let reg = granted(&substrate, 0).await;
        drop(reg);

        assert!(!substrate.is_claimed(&addr(0)).await);
        let _again = granted(&substrate, 0).await;
    }

    #[tokio::test]
    async fn test_unavailable_substrate() {
        let substrate = MemorySubstrate::new();
        substrate.set_available(false);
        let result = substrate.claim(&addr(0), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MeshError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let substrate = MemorySubstrate::new();
        let mut host = granted(&substrate, 0).await;
        let guest = granted(&substrate, 1).await;

        let ours = guest.dialer().connect(addr(0)).await.unwrap();
        let mut theirs = host.accept().await.unwrap();
        assert_eq!(ours.remote(), &addr(0));
        assert_eq!(theirs.remote(), &addr(1));
        assert_eq!(ours.link(), theirs.link());

        ours.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(theirs.recv().await, Some(Frame::Data(b"hello".to_vec())));
    }

    #[tokio::test]
    async fn test_connect_to_unclaimed_is_unreachable() {
        let substrate = MemorySubstrate::new();
        let guest = granted(&substrate, 1).await;
        let result = guest.dialer().connect(addr(5)).await;
        assert!(matches!(result, Err(MeshError::PeerUnreachable(_))));
    }

    #[tokio::test]
    async fn test_sever_errors_channels_and_session() {
        let substrate = MemorySubstrate::new();
        let mut host = granted(&substrate, 0).await;
        let guest = granted(&substrate, 1).await;

        let mut ours = guest.dialer().connect(addr(0)).await.unwrap();
        let mut theirs = host.accept().await.unwrap();

        substrate.sever(&addr(0)).await;

        assert!(host.accept().await.is_none());
        assert!(matches!(ours.recv().await, Some(Frame::Error(_))));
        assert!(matches!(theirs.recv().await, Some(Frame::Error(_))));
    }
}
