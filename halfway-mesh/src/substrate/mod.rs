//! Signaling substrate: address claims and point-to-point channels.
//!
//! The coordination layer never talks to a network directly. It claims
//! a [`PeerAddress`] on a [`Substrate`], and the resulting
//! [`Registration`] dials and accepts [`Channel`]s:
//!
//! ```text
//! Substrate::claim(room_3) ──► Claim::Granted(Registration)
//!                                   │
//!                  ┌────────────────┼─────────────────┐
//!                  ▼                                  ▼
//!        Dialer::connect(room_1)            Registration::accept()
//!                  │                                  │
//!                  ▼                                  ▼
//!              Channel ◄═══════ ordered, reliable ═══► Channel
//! ```
//!
//! Implementations:
//! - [`memory::MemorySubstrate`] — in-process broker with fault injection
//! - [`ws::WsSubstrate`] — WebSocket session against [`crate::signal::SignalServer`]

pub mod memory;
pub mod ws;

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::MeshError;
use crate::protocol::PeerAddress;

pub use memory::MemorySubstrate;
pub use ws::WsSubstrate;

/// Identifier of a channel, unique per substrate instance.
pub type LinkId = u64;

/// Result of an exclusive address claim.
#[derive(Debug)]
pub enum Claim {
    Granted(Registration),
    Rejected,
}

/// The external signaling service.
///
/// `claim` fails with [`MeshError::TransportUnavailable`] only when the
/// substrate itself cannot be reached; a taken address is `Ok(Rejected)`.
pub trait Substrate: Send + Sync + 'static {
    fn claim(
        &self,
        address: &PeerAddress,
        timeout: Duration,
    ) -> impl Future<Output = Result<Claim, MeshError>> + Send;
}

/// Something arriving on a channel. End of stream means the channel closed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(Vec<u8>),
    Error(String),
}

/// Request serviced by a substrate session to open an outbound channel.
#[derive(Debug)]
pub struct DialRequest {
    pub remote: PeerAddress,
    pub reply: oneshot::Sender<Result<Channel, MeshError>>,
}

/// An exclusively claimed address. Dropping it releases the claim.
#[derive(Debug)]
pub struct Registration {
    address: PeerAddress,
    dial_tx: mpsc::Sender<DialRequest>,
    incoming_rx: mpsc::Receiver<Channel>,
}

impl Registration {
    pub fn new(
        address: PeerAddress,
        dial_tx: mpsc::Sender<DialRequest>,
        incoming_rx: mpsc::Receiver<Channel>,
    ) -> Self {
        Self {
            address,
            dial_tx,
            incoming_rx,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Cloneable handle for dialing from spawned tasks.
    pub fn dialer(&self) -> Dialer {
        Dialer {
            local: self.address.clone(),
            dial_tx: self.dial_tx.clone(),
        }
    }

    /// Wait for the next inbound channel.
    ///
    /// Returns `None` once the substrate session is gone.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming_rx.recv().await
    }
}

/// Opens channels on behalf of a [`Registration`].
#[derive(Debug, Clone)]
pub struct Dialer {
    local: PeerAddress,
    dial_tx: mpsc::Sender<DialRequest>,
}

impl Dialer {
    pub fn local(&self) -> &PeerAddress {
        &self.local
    }

    /// Open a channel to `remote`. Resolves once the channel is open.
    pub async fn connect(&self, remote: PeerAddress) -> Result<Channel, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.dial_tx
            .send(DialRequest { remote, reply })
            .await
            .map_err(|_| MeshError::TransportUnavailable("substrate session closed".into()))?;
        rx.await
            .map_err(|_| MeshError::TransportUnavailable("substrate session closed".into()))?
    }
}

/// Outbound half of a channel.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    remote: PeerAddress,
    tx: mpsc::Sender<Frame>,
}

impl ChannelSender {
    pub fn new(remote: PeerAddress, tx: mpsc::Sender<Frame>) -> Self {
        Self { remote, tx }
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    /// Queue bytes, waiting for buffer space.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.tx
            .send(Frame::Data(bytes))
            .await
            .map_err(|_| self.lost())
    }

    /// Queue bytes without waiting.
    ///
    /// A full buffer is [`MeshError::ChannelFull`]; only a closed channel
    /// is [`MeshError::ChannelLost`].
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.tx.try_send(Frame::Data(bytes)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MeshError::ChannelFull(self.remote.clone()),
            mpsc::error::TrySendError::Closed(_) => self.lost(),
        })
    }

    fn lost(&self) -> MeshError {
        MeshError::ChannelLost {
            address: self.remote.clone(),
            reason: "channel closed".into(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open, ordered, bidirectional channel to one remote address.
#[derive(Debug)]
pub struct Channel {
    remote: PeerAddress,
    link: LinkId,
    outbound: ChannelSender,
    inbound: mpsc::Receiver<Frame>,
}

impl Channel {
    pub fn new(
        remote: PeerAddress,
        link: LinkId,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Frame>,
    ) -> Self {
        Self {
            outbound: ChannelSender::new(remote.clone(), outbound),
            remote,
            link,
            inbound,
        }
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.outbound.send(bytes).await
    }

    pub fn try_send(&self, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.outbound.try_send(bytes)
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub(crate) fn outbound_weak(&self) -> mpsc::WeakSender<Frame> {
        self.outbound.tx.downgrade()
    }

    /// Split into the outbound handle and the inbound stream.
    pub fn split(self) -> (ChannelSender, mpsc::Receiver<Frame>) {
        (self.outbound, self.inbound)
    }
}

/// Build both ends of a channel between `a` and `b`.
///
/// The first channel belongs to `a` (its remote is `b`), the second to `b`.
pub fn channel_pair(
    a: PeerAddress,
    b: PeerAddress,
    link: LinkId,
    capacity: usize,
) -> (Channel, Channel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        Channel::new(b, link, a_tx, a_rx),
        Channel::new(a, link, b_tx, b_rx),
    )
}
