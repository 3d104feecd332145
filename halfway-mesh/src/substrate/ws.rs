//! WebSocket substrate backed by [`crate::signal::SignalServer`].
//!
//! One WebSocket session per claimed address. The session task
//! multiplexes every channel of the registration over that socket:
//!
//! ```text
//! Dialer ──DialRequest──► ┌─────────────┐ ──Open/Data/Close──► relay
//! Channel ──Frame──► fwd ─► session task │
//! Channel ◄──Frame─────── └─────────────┘ ◄─Opened/Incoming/Data/Closed──
//! ```
//!
//! If the socket is lost every open channel receives [`Frame::Error`] and
//! [`Registration::accept`] starts returning `None`.

use std::collections::HashMap;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Channel, Claim, DialRequest, Frame, LinkId, Registration, Substrate};
use crate::error::MeshError;
use crate::protocol::PeerAddress;
use crate::signal::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// [`Substrate`] speaking to a signaling relay at `url`.
#[derive(Debug, Clone)]
pub struct WsSubstrate {
    url: String,
    capacity: usize,
}

impl WsSubstrate {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_capacity(url, 256)
    }

    /// Create with a custom per-channel queue capacity.
    pub fn with_capacity(url: impl Into<String>, capacity: usize) -> Self {
        Self {
            url: url.into(),
            capacity,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn send_frame(writer: &mut WsWriter, frame: &ClientFrame) -> Result<(), MeshError> {
    let data = frame.encode()?;
    writer
        .send(Message::Binary(data.into()))
        .await
        .map_err(|e| MeshError::TransportUnavailable(e.to_string()))
}

/// Drain queued frames onto the socket, closing it once the queue ends.
async fn write_frames(
    mut writer: WsWriter,
    mut frames: mpsc::UnboundedReceiver<ClientFrame>,
) -> Result<(), MeshError> {
    while let Some(frame) = frames.recv().await {
        send_frame(&mut writer, &frame).await?;
    }
    let _ = writer.close().await;
    Ok(())
}

/// Wait for the relay's answer to our claim. `None` means the socket closed.
async fn await_answer(reader: &mut WsReader) -> Option<ServerFrame> {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Binary(data)) => match ServerFrame::decode(&data) {
                Ok(frame) => return Some(frame),
                Err(e) => log::warn!("Undecodable relay frame during claim: {e}"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

impl Substrate for WsSubstrate {
    async fn claim(&self, address: &PeerAddress, timeout: Duration) -> Result<Claim, MeshError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| MeshError::TransportUnavailable(format!("{}: {e}", self.url)))?;
        let (mut writer, mut reader) = ws_stream.split();

        send_frame(&mut writer, &ClientFrame::Claim { address: address.clone() }).await?;

        match tokio::time::timeout(timeout, await_answer(&mut reader)).await {
            Ok(Some(ServerFrame::Granted)) => {}
            Ok(Some(ServerFrame::Rejected { reason })) => {
                log::trace!("Relay rejected {address}: {reason}");
                return Ok(Claim::Rejected);
            }
            Ok(Some(other)) => {
                log::warn!("Unexpected relay answer to claim of {address}: {other:?}");
                return Ok(Claim::Rejected);
            }
            Ok(None) => {
                return Err(MeshError::TransportUnavailable(
                    "relay closed the session during claim".into(),
                ))
            }
            Err(_) => {
                log::debug!("Claim of {address} timed out after {timeout:?}");
                let _ = writer.close().await;
                return Ok(Claim::Rejected);
            }
        }

        let (dial_tx, dial_rx) = mpsc::channel(self.capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(self.capacity);
        let session = Session::new(address.clone(), self.capacity, incoming_tx);
        tokio::spawn(session.run(writer, reader, dial_rx));

        log::debug!("Relay granted {address}");
        Ok(Claim::Granted(Registration::new(address.clone(), dial_tx, incoming_rx)))
    }
}

/// Outbound traffic from a channel's forwarding task.
enum Uplink {
    Data(LinkId, Vec<u8>),
    Close(LinkId),
}

struct Session {
    local: PeerAddress,
    capacity: usize,
    incoming_tx: mpsc::Sender<Channel>,
    uplink_tx: mpsc::Sender<Uplink>,
    uplink_rx: Option<mpsc::Receiver<Uplink>>,
    pending: HashMap<u32, (PeerAddress, oneshot::Sender<Result<Channel, MeshError>>)>,
    links: HashMap<LinkId, mpsc::Sender<Frame>>,
    next_request: u32,
}

impl Session {
    fn new(local: PeerAddress, capacity: usize, incoming_tx: mpsc::Sender<Channel>) -> Self {
        let (uplink_tx, uplink_rx) = mpsc::channel(capacity);
        Self {
            local,
            capacity,
            incoming_tx,
            uplink_tx,
            uplink_rx: Some(uplink_rx),
            pending: HashMap::new(),
            links: HashMap::new(),
            next_request: 0,
        }
    }

    /// Build the local end of `link` and start forwarding its outbound queue.
    fn open_channel(&mut self, link: LinkId, remote: PeerAddress) -> Channel {
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(self.capacity);
        self.links.insert(link, in_tx);

        let uplink = self.uplink_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Frame::Data(payload) = frame {
                    if uplink.send(Uplink::Data(link, payload)).await.is_err() {
                        return;
                    }
                }
            }
            let _ = uplink.send(Uplink::Close(link)).await;
        });

        Channel::new(remote, link, out_tx, in_rx)
    }

    async fn on_server_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Opened { request, link } => {
                let Some((remote, reply)) = self.pending.remove(&request) else {
                    return;
                };
                let channel = self.open_channel(link, remote);
                // Dropping the unused channel closes the link again
                let _ = reply.send(Ok(channel));
            }
            ServerFrame::Unreachable { request } => {
                if let Some((remote, reply)) = self.pending.remove(&request) {
                    let _ = reply.send(Err(MeshError::PeerUnreachable(remote)));
                }
            }
            ServerFrame::Incoming { link, from } => {
                log::trace!("{} accepted link {link} from {from}", self.local);
                let channel = self.open_channel(link, from);
                if self.incoming_tx.send(channel).await.is_err() {
                    self.links.remove(&link);
                }
            }
            ServerFrame::Data { link, payload } => {
                if let Some(tx) = self.links.get(&link) {
                    if tx.send(Frame::Data(payload)).await.is_err() {
                        self.links.remove(&link);
                    }
                }
            }
            ServerFrame::Closed { link, reason } => {
                if let Some(tx) = self.links.remove(&link) {
                    if let Some(reason) = reason {
                        let _ = tx.send(Frame::Error(reason)).await;
                    }
                }
            }
            ServerFrame::Granted | ServerFrame::Rejected { .. } => {
                log::debug!("{} ignoring late claim answer", self.local);
            }
        }
    }

    async fn run(mut self, writer: WsWriter, mut reader: WsReader, mut dial_rx: mpsc::Receiver<DialRequest>) {
        let Some(mut uplink_rx) = self.uplink_rx.take() else { return };
        let incoming_tx = self.incoming_tx.clone();
        // Socket writes happen on their own task so reading never waits on them
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_frames(writer, frames_rx));

        let failure = loop {
            tokio::select! {
                msg = reader.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match ServerFrame::decode(&data) {
                        Ok(frame) => self.on_server_frame(frame).await,
                        Err(e) => log::warn!("Undecodable relay frame for {}: {e}", self.local),
                    },
                    Some(Ok(Message::Close(_))) | None => break "relay closed the session".to_string(),
                    Some(Err(e)) => break e.to_string(),
                    Some(Ok(_)) => {}
                },

                Some(request) = dial_rx.recv() => {
                    self.next_request = self.next_request.wrapping_add(1);
                    let request_id = self.next_request;
                    let frame = ClientFrame::Open { request: request_id, to: request.remote.clone() };
                    self.pending.insert(request_id, (request.remote, request.reply));
                    let _ = frames_tx.send(frame);
                }

                Some(uplink) = uplink_rx.recv() => {
                    let frame = match uplink {
                        Uplink::Data(link, payload) => ClientFrame::Data { link, payload },
                        Uplink::Close(link) => {
                            self.links.remove(&link);
                            ClientFrame::Close { link }
                        }
                    };
                    let _ = frames_tx.send(frame);
                }

                written = &mut writer_task => {
                    break match written {
                        Ok(Err(e)) => e.to_string(),
                        _ => "relay writer stopped".to_string(),
                    };
                }

                // Registration dropped: release the claim
                _ = incoming_tx.closed() => {
                    log::debug!("{} released", self.local);
                    drop(frames_tx);
                    let _ = writer_task.await;
                    return;
                }
            }
        };

        writer_task.abort();
        log::warn!("Relay session for {} lost: {failure}", self.local);
        for (_, tx) in self.links.drain() {
            let _ = tx.try_send(Frame::Error(failure.clone()));
        }
        for (_, (_, reply)) in self.pending.drain() {
            let _ = reply.send(Err(MeshError::TransportUnavailable(failure.clone())));
        }
    }
}
