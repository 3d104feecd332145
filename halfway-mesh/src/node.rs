//! The room coordination actor.
//!
//! One task per node owns the roster, the connection table and the
//! substrate registration. Everything else talks to it through
//! messages:
//!
//! ```text
//! MeshHandle ──Command──►┌──────────────┐──MeshEvent──► application
//!                        │    Actor     │
//! spawned tasks ─Inbound►│  roster      │◄── Registration::accept()
//!  (claims, dials,       │  table       │
//!   readers, timers)     │  liveness    │──push──► OutboundQueue ──► Channel
//!                        └──────────────┘
//! ```
//!
//! Spawned work is tagged with the liveness generation it was started
//! under; completions from an older generation are dropped.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::allocator::{Allocation, SlotAllocator};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::liveness::{LinkState, Liveness};
use crate::mesh::{dial_targets, ConnectionTable, OpenedChannel, OutboundQueue};
use crate::protocol::{Envelope, Location, Member, PeerAddress, ProtocolError, RoomId};
use crate::role::{is_host, Role};
use crate::roster::{ConnectionStatus, Roster, RosterEntry, Upsert};
use crate::substrate::{Channel, Dialer, Frame, LinkId, Registration, Substrate};

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A slot was claimed, initially or after a reconnect.
    IdentityAssigned {
        address: PeerAddress,
        host: bool,
        degraded: bool,
    },
    MemberJoined(Member),
    /// A remote member changed, or the local member was edited.
    MemberUpdated(Member),
    MemberLeft(Member),
    ConnectionStatusChanged {
        user_id: Uuid,
        status: ConnectionStatus,
    },
    LinkStateChanged(LinkState),
    TitleChanged(String),
    /// A snapshot was applied; carries the full roster afterwards.
    RosterReplaced(Vec<Member>),
}

/// Read-only view of the room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub room: RoomId,
    pub title: String,
    pub address: Option<PeerAddress>,
    pub host: bool,
    pub entries: Vec<RosterEntry>,
    pub midpoint: Option<(f64, f64)>,
}

impl RoomView {
    pub fn member(&self, user_id: &Uuid) -> Option<&Member> {
        self.entries
            .iter()
            .map(|e| &e.member)
            .find(|m| m.user_id == *user_id)
    }

    pub fn status(&self, user_id: &Uuid) -> Option<ConnectionStatus> {
        self.entries
            .iter()
            .find(|e| e.member.user_id == *user_id)
            .map(|e| e.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runtime status of the node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub link: LinkState,
    pub generation: u64,
    pub address: Option<PeerAddress>,
    pub role: Option<Role>,
    pub degraded: bool,
    pub open_channels: usize,
}

enum Command {
    Broadcast {
        member: Member,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    Rename {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    AddLocation {
        location: Location,
        reply: oneshot::Sender<()>,
    },
    RemoveLocation {
        index: usize,
        reply: oneshot::Sender<Option<Location>>,
    },
    SetTitle {
        title: String,
        reply: oneshot::Sender<bool>,
    },
    NotifyLeaving {
        reply: oneshot::Sender<()>,
    },
    Resume,
    Roster {
        reply: oneshot::Sender<RoomView>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
}

/// First envelope sent on a channel we dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announce {
    /// Regular mesh formation; the remote answers with a snapshot.
    Join,
    /// Dial prompted by a peer list hint.
    Update,
}

enum Inbound {
    Allocated {
        generation: u64,
        result: MeshResult<Allocation>,
    },
    Dialed {
        generation: u64,
        remote: PeerAddress,
        announce: Announce,
        result: MeshResult<Channel>,
    },
    Frame {
        generation: u64,
        remote: PeerAddress,
        link: LinkId,
        frame: Frame,
    },
    Closed {
        generation: u64,
        remote: PeerAddress,
        link: LinkId,
    },
    RetryDue {
        generation: u64,
    },
}

/// Cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
    room: RoomId,
    user_id: Uuid,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Broadcast { .. } => "Broadcast",
            Command::Rename { .. } => "Rename",
            Command::AddLocation { .. } => "AddLocation",
            Command::RemoveLocation { .. } => "RemoveLocation",
            Command::SetTitle { .. } => "SetTitle",
            Command::NotifyLeaving { .. } => "NotifyLeaving",
            Command::Resume => "Resume",
            Command::Roster { .. } => "Roster",
            Command::Status { .. } => "Status",
            Command::Cleanup { .. } => "Cleanup",
        };
        f.write_str(name)
    }
}

impl MeshHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Whether the actor is still running.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MeshError::NodeStopped)?;
        rx.await.map_err(|_| MeshError::NodeStopped)
    }

    /// Replace the local member's name and locations and broadcast it.
    pub async fn broadcast_local_update(&self, member: Member) -> MeshResult<()> {
        self.request(|reply| Command::Broadcast { member, reply }).await?
    }

    /// Returns false when the name is blank or unchanged.
    pub async fn rename(&self, name: impl Into<String>) -> MeshResult<bool> {
        let name = name.into();
        self.request(|reply| Command::Rename { name, reply }).await
    }

    pub async fn add_location(&self, location: Location) -> MeshResult<()> {
        self.request(|reply| Command::AddLocation { location, reply }).await
    }

    pub async fn remove_location(&self, index: usize) -> MeshResult<Option<Location>> {
        self.request(|reply| Command::RemoveLocation { index, reply }).await
    }

    pub async fn set_title(&self, title: impl Into<String>) -> MeshResult<bool> {
        let title = title.into();
        self.request(|reply| Command::SetTitle { title, reply }).await
    }

    /// Tell every connected peer we are leaving for good.
    pub async fn notify_leaving(&self) -> MeshResult<()> {
        self.request(|reply| Command::NotifyLeaving { reply }).await
    }

    /// Reconnect now if the node is waiting to reconnect.
    pub async fn resume(&self) -> MeshResult<()> {
        self.commands
            .send(Command::Resume)
            .await
            .map_err(|_| MeshError::NodeStopped)
    }

    pub async fn roster(&self) -> MeshResult<RoomView> {
        self.request(|reply| Command::Roster { reply }).await
    }

    pub async fn status(&self) -> MeshResult<NodeStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Tear down every channel and release the claimed slot.
    pub async fn cleanup(&self) -> MeshResult<()> {
        self.request(|reply| Command::Cleanup { reply }).await
    }
}

/// Entry point for joining a room.
pub struct MeshNode;

impl MeshNode {
    /// Join `room` as `local`.
    ///
    /// Resolves once a slot is claimed. Fails when the configuration or
    /// member is invalid, the substrate is unreachable, or no slot can be
    /// claimed at all.
    pub async fn start<S: Substrate>(
        substrate: S,
        config: MeshConfig,
        room: RoomId,
        local: Member,
    ) -> MeshResult<(MeshHandle, mpsc::Receiver<MeshEvent>)> {
        config.validate()?;
        local.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = MeshHandle {
            commands: command_tx,
            room: room.clone(),
            user_id: local.user_id,
        };
        let actor = Actor::new(Arc::new(substrate), config, room, local, event_tx, ready_tx);
        tokio::spawn(actor.run(command_rx));

        ready_rx.await.map_err(|_| MeshError::NodeStopped)??;
        Ok((handle, event_rx))
    }
}

async fn accept(registration: &mut Option<Registration>) -> Option<Channel> {
    match registration {
        Some(registration) => registration.accept().await,
        None => std::future::pending().await,
    }
}

struct Actor<S: Substrate> {
    substrate: Arc<S>,
    config: MeshConfig,
    allocator: SlotAllocator,
    room: RoomId,
    title: String,
    roster: Roster,
    table: ConnectionTable,
    liveness: Liveness,
    registration: Option<Registration>,
    dialer: Option<Dialer>,
    degraded: bool,
    tasks: JoinSet<()>,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    events: mpsc::Sender<MeshEvent>,
    ready: Option<oneshot::Sender<MeshResult<()>>>,
}

impl<S: Substrate> Actor<S> {
    fn new(
        substrate: Arc<S>,
        config: MeshConfig,
        room: RoomId,
        local: Member,
        events: mpsc::Sender<MeshEvent>,
        ready: oneshot::Sender<MeshResult<()>>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            substrate,
            allocator: SlotAllocator::from_config(&config),
            config,
            title: room.default_title(),
            room,
            roster: Roster::new(local),
            table: ConnectionTable::new(),
            liveness: Liveness::new(),
            registration: None,
            dialer: None,
            degraded: false,
            tasks: JoinSet::new(),
            inbox_tx,
            inbox_rx,
            events,
            ready: Some(ready),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        if let Some(generation) = self.liveness.begin_connect() {
            self.emit(MeshEvent::LinkStateChanged(LinkState::Connecting));
            self.start_allocation(generation);
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        log::debug!("All handles to {} dropped", self.room);
                        self.shutdown();
                        break;
                    }
                },

                Some(inbound) = self.inbox_rx.recv() => {
                    if !self.handle_inbound(inbound) {
                        break;
                    }
                }

                channel = accept(&mut self.registration) => match channel {
                    Some(channel) => self.on_incoming(channel),
                    None => self.on_transport_lost("signaling session lost"),
                },

                Some(result) = self.tasks.join_next() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            log::error!("Mesh task panicked in {}: {e}", self.room);
                        }
                    }
                }
            }
        }
        log::debug!("Mesh node for {} stopped", self.room);
    }

    // ───────────────────────────────────────────────────────────────
    // Commands
    // ───────────────────────────────────────────────────────────────

    /// Returns false when the actor should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        log::trace!("Command {command:?}");
        match command {
            Command::Broadcast { member, reply } => {
                let _ = reply.send(self.replace_local(member));
            }
            Command::Rename { name, reply } => {
                let changed = self.roster.local_mut().rename(&name);
                if changed {
                    self.broadcast_local();
                }
                let _ = reply.send(changed);
            }
            Command::AddLocation { location, reply } => {
                self.roster.local_mut().add_location(location);
                self.broadcast_local();
                let _ = reply.send(());
            }
            Command::RemoveLocation { index, reply } => {
                let removed = self.roster.local_mut().remove_location(index);
                if removed.is_some() {
                    self.broadcast_local();
                }
                let _ = reply.send(removed);
            }
            Command::SetTitle { title, reply } => {
                let changed = self.apply_title(&title);
                if changed {
                    self.broadcast(&Envelope::TitleUpdate { title: self.title.clone() }, None);
                }
                let _ = reply.send(changed);
            }
            Command::NotifyLeaving { reply } => {
                let user_id = self.roster.local_id();
                log::info!("Leaving {}", self.room);
                self.broadcast(&Envelope::MemberLeaving { user_id }, None);
                let _ = reply.send(());
            }
            Command::Resume => self.resume(),
            Command::Roster { reply } => {
                let _ = reply.send(self.view());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Cleanup { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn replace_local(&mut self, member: Member) -> MeshResult<()> {
        if member.user_id != self.roster.local_id() {
            return Err(ProtocolError::InvalidMember("user id does not match the local member".into()).into());
        }
        member.validate()?;

        let local = self.roster.local_mut();
        local.name = member.name.trim().to_string();
        local.locations = member.locations;
        local.revision = (local.revision + 1).max(member.revision);
        self.broadcast_local();
        Ok(())
    }

    fn broadcast_local(&mut self) {
        let member = self.roster.local().clone();
        self.emit(MeshEvent::MemberUpdated(member.clone()));
        self.broadcast(&Envelope::MemberUpdate { member }, None);
    }

    fn resume(&mut self) {
        let generation = match self.liveness.state() {
            LinkState::Reconnecting => self.liveness.retry(),
            LinkState::Disconnected => self.liveness.begin_connect(),
            state => {
                log::debug!("Resume ignored for {}: link is {state:?}", self.room);
                None
            }
        };
        if let Some(generation) = generation {
            log::info!("Resuming {}", self.room);
            self.emit(MeshEvent::LinkStateChanged(LinkState::Connecting));
            self.start_allocation(generation);
        }
    }

    fn view(&self) -> RoomView {
        let address = self.roster.local().address.clone();
        RoomView {
            room: self.room.clone(),
            title: self.title.clone(),
            host: address.as_ref().is_some_and(|a| is_host(a.slot)),
            address,
            entries: self.roster.entries(),
            midpoint: self.roster.midpoint(),
        }
    }

    fn status(&self) -> NodeStatus {
        let address = self.registration.as_ref().map(|r| r.address().clone());
        NodeStatus {
            link: self.liveness.state(),
            generation: self.liveness.generation(),
            role: address.as_ref().map(|a| Role::for_slot(a.slot)),
            address,
            degraded: self.degraded,
            open_channels: self.table.open_count(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Identity and lifecycle
    // ───────────────────────────────────────────────────────────────

    fn start_allocation(&mut self, generation: u64) {
        let substrate = self.substrate.clone();
        let allocator = self.allocator.clone();
        let room = self.room.clone();
        let inbox = self.inbox_tx.clone();
        self.tasks.spawn(async move {
            let result = allocator.allocate(&*substrate, &room).await;
            let _ = inbox.send(Inbound::Allocated { generation, result });
        });
    }

    fn on_allocated(&mut self, result: MeshResult<Allocation>) -> bool {
        match result {
            Ok(allocation) => {
                self.adopt(allocation);
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
                true
            }
            Err(e) => {
                if let Some(ready) = self.ready.take() {
                    log::error!("Failed to join {}: {e}", self.room);
                    self.liveness.stop();
                    let _ = ready.send(Err(e));
                    return false;
                }
                log::warn!("Rejoining {} failed: {e}", self.room);
                if self.liveness.lost().is_some() {
                    self.emit(MeshEvent::LinkStateChanged(LinkState::Reconnecting));
                    self.schedule_retry();
                }
                true
            }
        }
    }

    fn adopt(&mut self, allocation: Allocation) {
        let Allocation {
            address,
            registration,
            degraded,
        } = allocation;

        let local = self.roster.local_mut();
        local.address = Some(address.clone());
        local.revision += 1;
        let local_id = local.user_id;

        self.dialer = Some(registration.dialer());
        self.registration = Some(registration);
        self.degraded = degraded;
        self.liveness.opened();

        log::info!(
            "Joined {} as {address} ({})",
            self.room,
            Role::for_slot(address.slot).label()
        );
        self.emit(MeshEvent::IdentityAssigned {
            address: address.clone(),
            host: is_host(address.slot),
            degraded,
        });
        self.emit(MeshEvent::LinkStateChanged(LinkState::Open));
        self.update_status(local_id, ConnectionStatus::Connected);

        let mut targets: Vec<PeerAddress> = dial_targets(address.slot, self.config.probe_bound)
            .map(|slot| PeerAddress::new(self.room.clone(), slot))
            .collect();
        for known in self.roster.peer_addresses_except(&local_id) {
            if known != address && !targets.contains(&known) {
                targets.push(known);
            }
        }
        for remote in targets {
            self.dial(remote, Announce::Join);
        }
    }

    fn on_transport_lost(&mut self, reason: &str) {
        log::warn!("Signaling session for {} lost: {reason}", self.room);
        self.teardown();

        for user_id in self.roster.remote_ids() {
            if self.roster.status(&user_id) == ConnectionStatus::Connected {
                self.update_status(user_id, ConnectionStatus::Disconnected);
            }
        }
        let local_id = self.roster.local_id();
        self.update_status(local_id, ConnectionStatus::Disconnected);

        if self.liveness.lost().is_some() {
            self.emit(MeshEvent::LinkStateChanged(LinkState::Reconnecting));
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        let generation = self.liveness.generation();
        let delay = self.config.reconnect_delay();
        let inbox = self.inbox_tx.clone();
        log::info!("Reconnecting to {} in {delay:?}", self.room);
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Inbound::RetryDue { generation });
        });
    }

    /// Drop every channel, task and the registration. The roster survives.
    fn teardown(&mut self) {
        self.tasks.abort_all();
        self.table.clear();
        self.dialer = None;
        self.registration = None;
    }

    fn shutdown(&mut self) {
        self.liveness.stop();
        self.teardown();
        log::info!("Left {}", self.room);
        self.emit(MeshEvent::LinkStateChanged(LinkState::Disconnected));
    }

    // ───────────────────────────────────────────────────────────────
    // Channels
    // ───────────────────────────────────────────────────────────────

    fn dial(&mut self, remote: PeerAddress, announce: Announce) {
        let Some(dialer) = self.dialer.clone() else {
            return;
        };
        if &remote == dialer.local() || !self.table.begin_dial(remote.clone()) {
            return;
        }

        let generation = self.liveness.generation();
        let inbox = self.inbox_tx.clone();
        self.tasks.spawn(async move {
            let result = dialer.connect(remote.clone()).await;
            let _ = inbox.send(Inbound::Dialed {
                generation,
                remote,
                announce,
                result,
            });
        });
    }

    fn on_dialed(&mut self, remote: PeerAddress, announce: Announce, result: MeshResult<Channel>) {
        match result {
            Ok(channel) => self.install(channel, true, Some(announce)),
            Err(e) => {
                self.table.dial_failed(&remote);
                if e.is_discovery_noise() {
                    log::trace!("Discovery probe failed: {e}");
                } else {
                    log::debug!("Dial to {remote} failed: {e}");
                }
            }
        }
    }

    fn on_incoming(&mut self, channel: Channel) {
        if self.liveness.state() != LinkState::Open {
            log::debug!("Refusing channel from {} while not open", channel.remote());
            return;
        }
        self.install(channel, false, None);
    }

    fn install(&mut self, channel: Channel, outgoing: bool, announce: Option<Announce>) {
        let Some(local_slot) = self.registration.as_ref().map(|r| r.address().slot) else {
            return;
        };
        let remote = channel.remote().clone();
        if !self.table.accepts(&remote, local_slot, outgoing) {
            log::debug!("Dropping duplicate channel to {remote}");
            return;
        }

        let link = channel.link();
        let (sender, mut inbound) = channel.split();
        let generation = self.liveness.generation();
        let inbox = self.inbox_tx.clone();
        let reader_remote = remote.clone();
        let reader = self.tasks.spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let frame = Inbound::Frame {
                    generation,
                    remote: reader_remote.clone(),
                    link,
                    frame,
                };
                if inbox.send(frame).is_err() {
                    return;
                }
            }
            let _ = inbox.send(Inbound::Closed {
                generation,
                remote: reader_remote,
                link,
            });
        });

        let (sender, writer) = OutboundQueue::new(sender);
        self.tasks.spawn(writer);

        self.table.open(
            remote.clone(),
            OpenedChannel {
                link,
                sender,
                reader,
                outgoing,
                awaiting_snapshot: announce == Some(Announce::Join),
            },
        );
        log::debug!(
            "Channel {link} to {remote} open ({})",
            if outgoing { "dialed" } else { "accepted" }
        );

        if let Some(user_id) = self.roster.find_by_address(&remote).map(|m| m.user_id) {
            self.update_status(user_id, ConnectionStatus::Connected);
        }

        let member = self.roster.local().clone();
        match announce {
            Some(Announce::Join) => self.send_to(&remote, &Envelope::Join { member }),
            Some(Announce::Update) => self.send_to(&remote, &Envelope::MemberUpdate { member }),
            None => {}
        }
    }

    fn channel_down(&mut self, remote: &PeerAddress, link: LinkId, reason: Option<String>) {
        let errored = reason.is_some();
        if !self.table.mark_down(remote, link, errored) {
            return;
        }
        let error = MeshError::ChannelLost {
            address: remote.clone(),
            reason: reason.unwrap_or_else(|| "closed by peer".into()),
        };
        log::info!("{error}");

        if let Some(user_id) = self.roster.find_by_address(remote).map(|m| m.user_id) {
            let status = if errored {
                ConnectionStatus::Errored
            } else {
                ConnectionStatus::Disconnected
            };
            self.update_status(user_id, status);
        }
    }

    fn send_to(&mut self, remote: &PeerAddress, envelope: &Envelope) {
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", envelope.kind());
                return;
            }
        };
        let Some(sender) = self.table.sender(remote) else {
            return;
        };
        if let Err(e) = sender.push(bytes) {
            self.send_failed(remote, e);
        }
    }

    fn broadcast(&mut self, envelope: &Envelope, except: Option<&PeerAddress>) {
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", envelope.kind());
                return;
            }
        };
        let failed: Vec<(PeerAddress, MeshError)> = self
            .table
            .open_senders(except)
            .filter_map(|(remote, sender)| {
                sender
                    .push(bytes.clone())
                    .err()
                    .map(|e| (remote.clone(), e))
            })
            .collect();
        for (remote, e) in failed {
            self.send_failed(&remote, e);
        }
    }

    fn send_failed(&mut self, remote: &PeerAddress, error: MeshError) {
        if let Some(link) = self.table.get(remote).and_then(|e| e.link()) {
            self.channel_down(remote, link, Some(error.to_string()));
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Inbound dispatch
    // ───────────────────────────────────────────────────────────────

    /// Returns false when the actor should exit.
    fn handle_inbound(&mut self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Allocated { generation, result } => {
                if self.liveness.is_current(generation) {
                    return self.on_allocated(result);
                }
                log::trace!("Discarding stale allocation");
            }
            Inbound::Dialed {
                generation,
                remote,
                announce,
                result,
            } => {
                if self.liveness.is_current(generation) {
                    self.on_dialed(remote, announce, result);
                }
            }
            Inbound::Frame {
                generation,
                remote,
                link,
                frame,
            } => {
                if self.liveness.is_current(generation) && self.table.is_current(&remote, link) {
                    self.on_frame(&remote, link, frame);
                }
            }
            Inbound::Closed {
                generation,
                remote,
                link,
            } => {
                if self.liveness.is_current(generation) {
                    self.channel_down(&remote, link, None);
                }
            }
            Inbound::RetryDue { generation } => {
                if self.liveness.is_current(generation) {
                    self.resume();
                }
            }
        }
        true
    }

    fn on_frame(&mut self, remote: &PeerAddress, link: LinkId, frame: Frame) {
        match frame {
            Frame::Data(bytes) => match Envelope::decode(&bytes) {
                Ok(envelope) => {
                    log::trace!("{:?} from {remote}", envelope.kind());
                    self.dispatch(remote, link, envelope);
                }
                Err(e) => log::warn!("Undecodable envelope from {remote}: {e}"),
            },
            Frame::Error(reason) => self.channel_down(remote, link, Some(reason)),
        }
    }

    fn dispatch(&mut self, remote: &PeerAddress, link: LinkId, envelope: Envelope) {
        match envelope {
            Envelope::Join { member } => self.on_join(remote, member),
            Envelope::StateSnapshot { title, members } => self.on_snapshot(remote, link, title, members),
            Envelope::MemberUpdate { member } => self.on_member_update(remote, member),
            Envelope::MemberLeaving { user_id } => self.on_member_leaving(user_id),
            Envelope::PeerListHint { peers } => {
                for peer in peers {
                    self.dial(peer, Announce::Update);
                }
            }
            Envelope::TitleUpdate { title } => {
                self.apply_title(&title);
            }
        }
    }

    fn on_join(&mut self, remote: &PeerAddress, mut member: Member) {
        if let Err(e) = member.validate() {
            log::warn!("Rejected join from {remote}: {e}");
            return;
        }
        let user_id = member.user_id;
        if user_id == self.roster.local_id() {
            log::warn!("{remote} joined with our own user id");
            return;
        }

        member.address = Some(remote.clone());
        let outcome = self.roster.upsert(member);
        self.roster.bind_address(&user_id, remote.clone());
        self.announce_upsert(user_id, outcome);
        self.update_status(user_id, ConnectionStatus::Connected);

        let snapshot = Envelope::StateSnapshot {
            title: self.title.clone(),
            members: self.roster.members(),
        };
        self.send_to(remote, &snapshot);

        if let Some(member) = self.roster.get(&user_id).cloned() {
            self.broadcast(&Envelope::MemberUpdate { member }, Some(remote));
        }

        let peers = self.roster.peer_addresses_except(&user_id);
        if !peers.is_empty() {
            self.send_to(remote, &Envelope::PeerListHint { peers });
        }
    }

    fn on_snapshot(&mut self, remote: &PeerAddress, link: LinkId, title: String, members: Vec<Member>) {
        if !self.table.take_snapshot_permit(remote, link) {
            log::debug!("Ignoring unsolicited snapshot from {remote}");
            return;
        }

        let keep: HashSet<Uuid> = self
            .roster
            .members()
            .into_iter()
            .filter(|m| m.address.as_ref().is_some_and(|a| self.table.contains_live(a)))
            .map(|m| m.user_id)
            .collect();
        let members: Vec<Member> = members
            .into_iter()
            .filter(|m| match m.validate() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Skipping snapshot entry from {remote}: {e}");
                    false
                }
            })
            .collect();
        let diff = self.roster.apply_snapshot(members, &keep);
        log::debug!(
            "Snapshot from {remote}: {} joined, {} updated, {} left",
            diff.joined.len(),
            diff.updated.len(),
            diff.left.len()
        );

        for member in &diff.joined {
            if let Some(address) = member.address.clone() {
                self.dial(address, Announce::Update);
            }
        }
        for member in diff.joined {
            self.emit(MeshEvent::MemberJoined(member));
        }
        for member in diff.updated {
            self.emit(MeshEvent::MemberUpdated(member));
        }
        for member in diff.left {
            self.emit(MeshEvent::MemberLeft(member));
        }

        self.apply_title(&title);
        let connected: Vec<Uuid> = self
            .roster
            .remote_ids()
            .into_iter()
            .filter(|id| {
                self.roster
                    .get(id)
                    .and_then(|m| m.address.as_ref())
                    .is_some_and(|a| self.table.is_open(a))
            })
            .collect();
        for user_id in connected {
            self.update_status(user_id, ConnectionStatus::Connected);
        }
        self.emit(MeshEvent::RosterReplaced(self.roster.members()));
    }

    /// Updates are applied but never relayed.
    fn on_member_update(&mut self, remote: &PeerAddress, member: Member) {
        if let Err(e) = member.validate() {
            log::warn!("Rejected member update from {remote}: {e}");
            return;
        }
        let user_id = member.user_id;
        let outcome = self.roster.upsert(member);
        self.announce_upsert(user_id, outcome);

        // Sent by the member itself, as after a peer list hint
        let direct = self
            .roster
            .get(&user_id)
            .is_some_and(|m| m.address.as_ref() == Some(remote));
        if direct && user_id != self.roster.local_id() {
            self.update_status(user_id, ConnectionStatus::Connected);
        }
    }

    fn on_member_leaving(&mut self, user_id: Uuid) {
        if user_id == self.roster.local_id() {
            return;
        }
        let Some(member) = self.roster.remove(&user_id) else {
            return;
        };
        log::info!("{} left {}", member.name, self.room);
        if let Some(address) = &member.address {
            self.table.remove(address);
        }
        self.emit(MeshEvent::MemberLeft(member));
    }

    /// Returns whether the title changed.
    fn apply_title(&mut self, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() || title == self.title {
            return false;
        }
        self.title = title.to_string();
        self.emit(MeshEvent::TitleChanged(self.title.clone()));
        true
    }

    fn announce_upsert(&mut self, user_id: Uuid, outcome: Upsert) {
        let Some(member) = self.roster.get(&user_id).cloned() else {
            return;
        };
        match outcome {
            Upsert::Inserted => {
                log::info!("{} joined {}", member.name, self.room);
                self.emit(MeshEvent::MemberJoined(member));
            }
            Upsert::Updated => self.emit(MeshEvent::MemberUpdated(member)),
            Upsert::Unchanged | Upsert::Stale | Upsert::Ignored => {}
        }
    }

    fn update_status(&mut self, user_id: Uuid, status: ConnectionStatus) {
        if self.roster.set_status(user_id, status) {
            self.emit(MeshEvent::ConnectionStatusChanged { user_id, status });
        }
    }

    fn emit(&self, event: MeshEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("Event queue full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;

    fn room() -> RoomId {
        RoomId::parse("node-room").unwrap()
    }

    #[tokio::test]
    async fn test_start_fails_without_transport() {
        let substrate = MemorySubstrate::new();
        substrate.set_available(false);
        let result = MeshNode::start(substrate, MeshConfig::default(), room(), Member::new("Ann")).await;
        assert!(matches!(result, Err(MeshError::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_member() {
        let result = MeshNode::start(
            MemorySubstrate::new(),
            MeshConfig::default(),
            room(),
            Member::new("   "),
        )
        .await;
        assert!(matches!(result, Err(MeshError::Protocol(ProtocolError::InvalidMember(_)))));
    }

    #[tokio::test]
    async fn test_lone_node_is_host() {
        let (handle, mut events) =
            MeshNode::start(MemorySubstrate::new(), MeshConfig::default(), room(), Member::new("Ann"))
                .await
                .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first, MeshEvent::LinkStateChanged(LinkState::Connecting));
        match events.recv().await.unwrap() {
            MeshEvent::IdentityAssigned { address, host, degraded } => {
                assert_eq!(address.slot, 0);
                assert!(host);
                assert!(!degraded);
            }
            other => panic!("expected IdentityAssigned, got {other:?}"),
        }

        let status = handle.status().await.unwrap();
        assert_eq!(status.link, LinkState::Open);
        assert_eq!(status.role, Some(Role::Host));

        let view = handle.roster().await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.title, "Room node-room");
        assert!(view.host);
    }

    #[tokio::test]
    async fn test_local_edits() {
        let (handle, _events) =
            MeshNode::start(MemorySubstrate::new(), MeshConfig::default(), room(), Member::new("Ann"))
                .await
                .unwrap();

        assert!(handle.rename("Annie").await.unwrap());
        assert!(!handle.rename("  ").await.unwrap());
        handle
            .add_location(Location::new(1.0, 2.0, "Home", crate::protocol::LocationSource::Current))
            .await
            .unwrap();
        assert!(handle.remove_location(5).await.unwrap().is_none());
        assert!(handle.set_title("Lunch").await.unwrap());
        assert!(!handle.set_title("Lunch").await.unwrap());

        let view = handle.roster().await.unwrap();
        let local = view.member(&handle.user_id()).unwrap();
        assert_eq!(local.name, "Annie");
        assert_eq!(local.locations.len(), 1);
        assert_eq!(view.title, "Lunch");
        assert_eq!(view.midpoint, Some((1.0, 2.0)));
    }

    #[tokio::test]
    async fn test_broadcast_rejects_foreign_member() {
        let (handle, _events) =
            MeshNode::start(MemorySubstrate::new(), MeshConfig::default(), room(), Member::new("Ann"))
                .await
                .unwrap();
        let result = handle.broadcast_local_update(Member::new("Mallory")).await;
        assert!(matches!(result, Err(MeshError::Protocol(ProtocolError::InvalidMember(_)))));
    }

    #[tokio::test]
    async fn test_cleanup_stops_node() {
        let substrate = MemorySubstrate::new();
        let (handle, _events) =
            MeshNode::start(substrate.clone(), MeshConfig::default(), room(), Member::new("Ann"))
                .await
                .unwrap();
        handle.cleanup().await.unwrap();

        assert!(matches!(handle.status().await, Err(MeshError::NodeStopped)));
        assert_eq!(substrate.claimed_count().await, 0);
    }
}
