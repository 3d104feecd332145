//! WebSocket signaling relay.
//!
//! Stands in for the rendezvous service a browser deployment would get
//! from a public signaling cloud. Each WebSocket session claims exactly
//! one [`PeerAddress`]; channels between sessions are relayed frame by
//! frame.
//!
//! ```text
//! Session room_0 ──┐                          ┌── Session room_1
//!   Claim          │      ┌──────────────┐    │     Claim
//!   Open{to: _1} ──┼────► │ SignalState  │ ───┼──►  Incoming{link, from: _0}
//!   Data{link}   ──┼────► │  sessions    │ ───┼──►  Data{link}
//!                  │      │  links       │    │
//!                  └───── └──────────────┘ ◄──┘
//! ```
//!
//! When a session goes away its claim is released and the other end of
//! every link it owned receives `Closed` with a reason.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::config::SignalConfig;
use crate::protocol::{PeerAddress, ProtocolError};
use crate::substrate::LinkId;

// ───────────────────────────────────────────────────────────────────
// Wire frames
// ───────────────────────────────────────────────────────────────────

/// Frames sent by a substrate session to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// First frame of every session.
    Claim { address: PeerAddress },
    /// Open a channel; `request` is echoed back in the answer.
    Open { request: u32, to: PeerAddress },
    Data { link: LinkId, payload: Vec<u8> },
    Close { link: LinkId },
}

/// Frames sent by the relay to a substrate session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Granted,
    Rejected { reason: String },
    Opened { request: u32, link: LinkId },
    Unreachable { request: u32 },
    Incoming { link: LinkId, from: PeerAddress },
    Data { link: LinkId, payload: Vec<u8> },
    /// The other end went away. `reason` is set for abnormal closes.
    Closed { link: LinkId, reason: Option<String> },
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(frame)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay state
// ───────────────────────────────────────────────────────────────────

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalStats {
    pub total_sessions: u64,
    pub active_sessions: usize,
    pub rejected_claims: u64,
    pub relayed_frames: u64,
    pub active_links: usize,
}

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Outbound queue of one session, drained by that session's writer task.
///
/// Delivering to another session never waits, so two busy sessions
/// cannot block on each other.
type SessionTx = mpsc::UnboundedSender<Message>;

struct Session {
    id: u64,
    tx: SessionTx,
}

#[derive(Default)]
struct SignalState {
    sessions: HashMap<PeerAddress, Session>,
    links: HashMap<LinkId, (PeerAddress, PeerAddress)>,
    next_session: u64,
    next_link: LinkId,
    relayed_frames: AtomicU64,
    stats: SignalStats,
}

impl SignalState {
    fn sender(&self, address: &PeerAddress) -> Option<SessionTx> {
        self.sessions.get(address).map(|s| s.tx.clone())
    }

    /// The end of `link` opposite to `from`, if `from` owns the link.
    fn other_end(&self, link: LinkId, from: &PeerAddress) -> Option<&PeerAddress> {
        let (a, b) = self.links.get(&link)?;
        if a == from {
            Some(b)
        } else if b == from {
            Some(a)
        } else {
            None
        }
    }
}

/// Queue `frame` for a session. Fails only if that session is gone.
fn deliver(tx: &SessionTx, frame: &ServerFrame) -> bool {
    match frame.encode() {
        Ok(data) => tx.send(Message::Binary(data.into())).is_ok(),
        Err(e) => {
            log::error!("Failed to encode relay frame: {e}");
            false
        }
    }
}

async fn write_frames(mut writer: WsWriter, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = queue.recv().await {
        if let Err(e) = writer.send(msg).await {
            log::debug!("Relay write failed: {e}");
            return;
        }
    }
    let _ = writer.close().await;
}

/// The signaling relay server.
pub struct SignalServer {
    config: SignalConfig,
    state: Arc<RwLock<SignalState>>,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(SignalState::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(SignalConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Signal server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve sessions on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_session(stream, addr, state, config).await {
                    log::warn!("Signal session error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket session.
    async fn handle_session(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<RwLock<SignalState>>,
        config: SignalConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // First frame must be the claim
        let address = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match ClientFrame::decode(&data)? {
                    ClientFrame::Claim { address } => break address,
                    other => {
                        log::warn!("Expected claim from {addr}, got {other:?}");
                        return Ok(());
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let session_id = {
            let mut st = state.write().await;
            let reason = if st.sessions.contains_key(&address) {
                Some("address already claimed")
            } else if st.sessions.len() >= config.max_sessions {
                Some("relay is full")
            } else {
                None
            };
            if let Some(reason) = reason {
                st.stats.rejected_claims += 1;
                drop(st);
                log::debug!("Rejected claim of {address} from {addr}: {reason}");
                let frame = ServerFrame::Rejected { reason: reason.into() };
                ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                let _ = ws_sender.close().await;
                return Ok(());
            }
            st.next_session += 1;
            let id = st.next_session;
            st.sessions.insert(address.clone(), Session { id, tx: out_tx.clone() });
            st.stats.total_sessions += 1;
            st.stats.active_sessions = st.sessions.len();
            id
        };

        log::info!("{address} claimed by {addr}");
        deliver(&out_tx, &ServerFrame::Granted);
        let writer = tokio::spawn(write_frames(ws_sender, out_rx));

        let result = Self::session_loop(&address, &state, &out_tx, &mut ws_receiver).await;

        Self::release(&address, session_id, &state).await;
        // The writer finishes once the queue drains
        drop(out_tx);
        let _ = writer.await;
        log::info!("{address} released");
        result
    }

    async fn session_loop<R>(
        address: &PeerAddress,
        state: &Arc<RwLock<SignalState>>,
        own: &SessionTx,
        ws_receiver: &mut R,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => match ClientFrame::decode(&data) {
                    Ok(frame) => Self::handle_frame(address, state, frame).await,
                    Err(e) => log::warn!("Failed to decode frame from {address}: {e}"),
                },
                Ok(Message::Ping(data)) => {
                    let _ = own.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }
        }
        Ok(())
    }

    async fn handle_frame(address: &PeerAddress, state: &Arc<RwLock<SignalState>>, frame: ClientFrame) {
        match frame {
            ClientFrame::Claim { .. } => {
                log::debug!("Ignoring repeated claim from {address}");
            }

            ClientFrame::Open { request, to } => {
                let mut st = state.write().await;
                let Some(own) = st.sender(address) else { return };
                let target = if &to == address { None } else { st.sender(&to) };
                let Some(target) = target else {
                    deliver(&own, &ServerFrame::Unreachable { request });
                    return;
                };

                st.next_link += 1;
                let link = st.next_link;
                st.links.insert(link, (address.clone(), to.clone()));
                st.stats.active_links = st.links.len();
                drop(st);

                log::debug!("Link {link}: {address} -> {to}");
                deliver(&target, &ServerFrame::Incoming { link, from: address.clone() });
                deliver(&own, &ServerFrame::Opened { request, link });
            }

            ClientFrame::Data { link, payload } => {
                let st = state.read().await;
                let Some(target) = st.other_end(link, address).and_then(|other| st.sender(other)) else {
                    return;
                };
                st.relayed_frames.fetch_add(1, Ordering::Relaxed);
                drop(st);
                if !deliver(&target, &ServerFrame::Data { link, payload }) {
                    log::debug!("Dropped frame on link {link}: peer session gone");
                }
            }

            ClientFrame::Close { link } => {
                let mut st = state.write().await;
                let Some(other) = st.other_end(link, address).cloned() else { return };
                st.links.remove(&link);
                st.stats.active_links = st.links.len();
                let target = st.sender(&other);
                drop(st);
                if let Some(target) = target {
                    deliver(&target, &ServerFrame::Closed { link, reason: None });
                }
            }
        }
    }

    /// Drop the session's claim and notify the far end of its links.
    async fn release(address: &PeerAddress, session_id: u64, state: &Arc<RwLock<SignalState>>) {
        let notify = {
            let mut st = state.write().await;
            if st.sessions.get(address).is_some_and(|s| s.id == session_id) {
                st.sessions.remove(address);
            }

            let owned: Vec<(LinkId, PeerAddress)> = st
                .links
                .iter()
                .filter_map(|(link, (a, b))| {
                    if a == address {
                        Some((*link, b.clone()))
                    } else if b == address {
                        Some((*link, a.clone()))
                    } else {
                        None
                    }
                })
                .collect();

            let mut notify = Vec::new();
            for (link, other) in owned {
                st.links.remove(&link);
                if let Some(tx) = st.sender(&other) {
                    notify.push((tx, link));
                }
            }
            st.stats.active_sessions = st.sessions.len();
            st.stats.active_links = st.links.len();
            notify
        };

        for (tx, link) in notify {
            let reason = Some(format!("{address} disconnected"));
            deliver(&tx, &ServerFrame::Closed { link, reason });
        }
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> SignalStats {
        let st = self.state.read().await;
        SignalStats {
            relayed_frames: st.relayed_frames.load(Ordering::Relaxed),
            ..st.stats.clone()
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
