//! Mesh formation bookkeeping.
//!
//! A peer holding slot `i` dials every lower slot, then probes the higher
//! slots up to the probe bound to catch peers that rejoined into a freed
//! low slot. Because every member runs the same procedure, any pair of
//! members ends up with at least one channel between them.
//!
//! When both ends of a pair dial each other at the same time two
//! channels exist. Both ends keep the one dialed by the higher slot and
//! drop the other, so the decision needs no extra round trip.

use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::MeshError;
use crate::protocol::{PeerAddress, SlotIndex};
use crate::substrate::{ChannelSender, LinkId};

/// Slots to dial after claiming `slot`: all lower slots, then higher ones.
pub fn dial_targets(slot: SlotIndex, bound: SlotIndex) -> impl Iterator<Item = SlotIndex> {
    (0..slot.min(bound)).chain(slot.saturating_add(1)..bound)
}

/// Slot whose outgoing channel survives a duplicate between `a` and `b`.
pub fn preferred_dialer(a: SlotIndex, b: SlotIndex) -> SlotIndex {
    a.max(b)
}

/// Ordered outbound queue of one channel.
///
/// Pushing never waits. A writer task drains the queue into the channel
/// and waits for buffer space, so a burst delays frames instead of
/// failing the channel.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    remote: PeerAddress,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl OutboundQueue {
    /// Returns the queue and the writer future the caller must spawn.
    pub fn new(sender: ChannelSender) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let remote = sender.remote().clone();
        let writer = async move {
            while let Some(bytes) = rx.recv().await {
                if sender.send(bytes).await.is_err() {
                    return;
                }
            }
        };
        (Self { remote, tx }, writer)
    }

    /// Fails only once the channel itself has closed.
    pub fn push(&self, bytes: Vec<u8>) -> Result<(), MeshError> {
        self.tx.send(bytes).map_err(|_| MeshError::ChannelLost {
            address: self.remote.clone(),
            reason: "channel closed".into(),
        })
    }
}

/// State of one entry in the [`ConnectionTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Dial in flight.
    Connecting,
    Open,
    /// Closed cleanly by the remote.
    Closed,
    /// Failed with a transport error.
    Errored,
}

impl ChannelState {
    pub fn is_live(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }
}

#[derive(Debug)]
pub struct ConnectionEntry {
    state: ChannelState,
    link: Option<LinkId>,
    sender: Option<OutboundQueue>,
    reader: Option<AbortHandle>,
    outgoing: bool,
    awaiting_snapshot: bool,
}

impl ConnectionEntry {
    fn connecting() -> Self {
        Self {
            state: ChannelState::Connecting,
            link: None,
            sender: None,
            reader: None,
            outgoing: true,
            awaiting_snapshot: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    /// Whether the local peer dialed this channel.
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    fn shut(&mut self, state: ChannelState) {
        self.state = state;
        self.sender = None;
        self.awaiting_snapshot = false;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Channel freshly handed out by the substrate, ready to be recorded.
#[derive(Debug)]
pub struct OpenedChannel {
    pub link: LinkId,
    pub sender: OutboundQueue,
    pub reader: AbortHandle,
    pub outgoing: bool,
    pub awaiting_snapshot: bool,
}

/// Per-remote channel state, keyed by [`PeerAddress`].
///
/// Closed and errored entries stay as tombstones until the remote
/// reconnects, leaves, or the table is cleared.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: HashMap<PeerAddress, ConnectionEntry>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, remote: &PeerAddress) -> Option<&ConnectionEntry> {
        self.entries.get(remote)
    }

    pub fn state(&self, remote: &PeerAddress) -> Option<ChannelState> {
        self.entries.get(remote).map(|e| e.state)
    }

    /// Connecting or open.
    pub fn contains_live(&self, remote: &PeerAddress) -> bool {
        self.entries.get(remote).is_some_and(|e| e.state.is_live())
    }

    pub fn is_open(&self, remote: &PeerAddress) -> bool {
        self.state(remote) == Some(ChannelState::Open)
    }

    /// Record a dial attempt. Returns false if the remote is already live.
    pub fn begin_dial(&mut self, remote: PeerAddress) -> bool {
        if self.contains_live(&remote) {
            return false;
        }
        self.entries.insert(remote, ConnectionEntry::connecting());
        true
    }

    /// Forget a dial that never produced a channel.
    pub fn dial_failed(&mut self, remote: &PeerAddress) {
        let pending = self
            .entries
            .get(remote)
            .is_some_and(|e| e.state == ChannelState::Connecting && e.link.is_none());
        if pending {
            self.entries.remove(remote);
        }
    }

    /// Whether a new channel to `remote` should replace the current entry.
    pub fn accepts(&self, remote: &PeerAddress, local_slot: SlotIndex, outgoing: bool) -> bool {
        let Some(entry) = self.entries.get(remote) else {
            return true;
        };
        if entry.state != ChannelState::Open {
            return true;
        }
        let preferred = preferred_dialer(local_slot, remote.slot);
        let dialer = |outgoing: bool| if outgoing { local_slot } else { remote.slot };
        // The surviving channel loses only to a newer one from the same side
        !(dialer(entry.outgoing) == preferred && dialer(outgoing) != preferred)
    }

    /// Record an open channel, replacing whatever was there.
    pub fn open(&mut self, remote: PeerAddress, channel: OpenedChannel) {
        self.entries.insert(
            remote,
            ConnectionEntry {
                state: ChannelState::Open,
                link: Some(channel.link),
                sender: Some(channel.sender),
                reader: Some(channel.reader),
                outgoing: channel.outgoing,
                awaiting_snapshot: channel.awaiting_snapshot,
            },
        );
    }

    /// Whether `link` is the channel currently recorded for `remote`.
    pub fn is_current(&self, remote: &PeerAddress, link: LinkId) -> bool {
        self.entries
            .get(remote)
            .is_some_and(|e| e.link == Some(link) && e.state == ChannelState::Open)
    }

    /// Move the current channel to `Closed` or `Errored`.
    ///
    /// Returns false if `link` is not the current open channel.
    pub fn mark_down(&mut self, remote: &PeerAddress, link: LinkId, errored: bool) -> bool {
        if !self.is_current(remote, link) {
            return false;
        }
        let state = if errored {
            ChannelState::Errored
        } else {
            ChannelState::Closed
        };
        if let Some(entry) = self.entries.get_mut(remote) {
            entry.shut(state);
        }
        true
    }

    /// Consume the one-shot permission to apply a snapshot from `link`.
    pub fn take_snapshot_permit(&mut self, remote: &PeerAddress, link: LinkId) -> bool {
        match self.entries.get_mut(remote) {
            Some(entry) if entry.link == Some(link) && entry.awaiting_snapshot => {
                entry.awaiting_snapshot = false;
                true
            }
            _ => false,
        }
    }

    pub fn sender(&self, remote: &PeerAddress) -> Option<&OutboundQueue> {
        self.entries
            .get(remote)
            .filter(|e| e.state == ChannelState::Open)
            .and_then(|e| e.sender.as_ref())
    }

    /// Open channels, optionally skipping one remote.
    pub fn open_senders<'a>(
        &'a self,
        except: Option<&'a PeerAddress>,
    ) -> impl Iterator<Item = (&'a PeerAddress, &'a OutboundQueue)> + 'a {
        self.entries
            .iter()
            .filter(move |(address, _)| Some(*address) != except)
            .filter(|(_, e)| e.state == ChannelState::Open)
            .filter_map(|(address, e)| e.sender.as_ref().map(|s| (address, s)))
    }

    pub fn open_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == ChannelState::Open)
            .count()
    }

    pub fn remove(&mut self, remote: &PeerAddress) -> bool {
        self.entries.remove(remote).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
