//! Network implementation over plain tokio TCP.
//!
//! This module provides [`TcpNetwork`], a [`DiscoveryNetwork`] that keeps one
//! TCP connection per peer and surfaces connection changes and decoded
//! messages as [`NetworkEvent`]s.
//!
//! # Protocol
//!
//! Every frame is length-prefixed (see [`crate::framing`]). The first frame in
//! each direction is a hello carrying the sender's [`NodeId`] and listen port;
//! after that every frame holds one encoded [`Message`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::core::NodeId;
use crate::discovery::{DiscoveryNetwork, PeerInfo};
use crate::framing::{read_frame, write_frame};
use crate::protocol::Message;

/// Bound on dialing plus the hello exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const HELLO_LEN: usize = 32 + 2;

/// Something the hosting node must forward to the discovery protocol.
#[derive(Debug)]
pub enum NetworkEvent {
    Connected(PeerInfo),
    Disconnected(PeerInfo),
    Message(PeerInfo, Message),
}

struct PeerLink {
    info: PeerInfo,
    conn_id: u64,
    /// Who opened the connection; decides which link survives a cross-dial.
    dialer: NodeId,
    outbound: mpsc::UnboundedSender<Bytes>,
    /// Dropping this stops the link's read loop.
    _close: oneshot::Sender<()>,
}

struct Shared {
    local: NodeId,
    listen_addr: String,
    listen_port: u16,
    peers: RwLock<HashMap<NodeId, PeerLink>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    next_conn: AtomicU64,
}

/// TCP transport shared by the accept loop and the discovery protocol.
#[derive(Clone)]
pub struct TcpNetwork {
    shared: Arc<Shared>,
}

impl TcpNetwork {
    /// Create the transport. `listen_addr` is what the local node advertises;
    /// its port is also sent to peers in the hello frame.
    pub fn new(local: NodeId, listen_addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            local,
            listen_addr: listen_addr.to_string(),
            listen_port: listen_addr.port(),
            peers: RwLock::new(HashMap::new()),
            events,
            next_conn: AtomicU64::new(1),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            rx,
        )
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.read().len()
    }

    /// Take over an inbound connection.
    pub async fn accept(&self, stream: TcpStream, remote: SocketAddr) -> Result<PeerInfo> {
        self.establish(stream, remote, false).await
    }

    /// Run the hello exchange on a fresh stream and start serving it.
    ///
    /// When both sides dial each other at once, the connection opened by the
    /// lower identifier is kept on both ends.
    async fn establish(&self, stream: TcpStream, remote: SocketAddr, dialed: bool) -> Result<PeerInfo> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = encode_hello(&self.shared.local, self.shared.listen_port);
        let exchange = async {
            write_frame(&mut writer, &hello).await?;
            let frame = read_frame(&mut reader)
                .await?
                .ok_or_else(|| anyhow!("peer closed before hello"))?;
            decode_hello(&frame)
        };
        let (id, port) = timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| anyhow!("hello exchange with {remote} timed out"))??;

        if id == self.shared.local {
            bail!("refusing connection to self at {remote}");
        }

        let info = PeerInfo::new(id, remote, SocketAddr::new(remote.ip(), port).to_string());
        let conn_id = self.shared.next_conn.fetch_add(1, Ordering::Relaxed);
        let dialer = if dialed { self.shared.local } else { id };
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (close, closed) = oneshot::channel();
        let replaced = {
            let mut peers = self.shared.peers.write();
            let replaced = match peers.get(&id) {
                Some(existing) if existing.dialer <= dialer => {
                    bail!("already connected to {}", hex::encode(id));
                }
                Some(_) => true,
                None => false,
            };
            peers.insert(
                id,
                PeerLink {
                    info: info.clone(),
                    conn_id,
                    dialer,
                    outbound,
                    _close: close,
                },
            );
            replaced
        };

        // Connected must be queued before the read loop can report messages
        // or a disconnect for this link.
        if replaced {
            debug!(peer = %hex::encode(id), %remote, "replaced cross-dialed connection");
        } else {
            let _ = self.shared.events.send(NetworkEvent::Connected(info.clone()));
            debug!(peer = %hex::encode(id), %remote, "peer connected");
        }
        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(self.shared.clone(), reader, closed, info.clone(), conn_id));
        Ok(info)
    }
}

#[async_trait]
impl DiscoveryNetwork for TcpNetwork {
    fn local_id(&self) -> NodeId {
        self.shared.local
    }

    fn listen_addr(&self) -> String {
        self.shared.listen_addr.clone()
    }

    fn get_peer(&self, id: &NodeId) -> Option<PeerInfo> {
        self.shared.peers.read().get(id).map(|link| link.info.clone())
    }

    async fn send_to(&self, to: &NodeId, msg: Message) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let peers = self.shared.peers.read();
        let link = peers
            .get(to)
            .ok_or_else(|| anyhow!("peer {} not connected", hex::encode(to)))?;
        link.outbound
            .send(bytes)
            .map_err(|_| anyhow!("connection to {} closed", hex::encode(to)))
    }

    async fn connect(&self, addr: &str) -> Result<()> {
        let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("dial {addr} timed out"))?
            .with_context(|| format!("dial {addr}"))?;
        let remote = stream.peer_addr()?;
        self.establish(stream, remote, true).await?;
        Ok(())
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            debug!("write failed: {err:?}");
            break;
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut closed: oneshot::Receiver<()>,
    info: PeerInfo,
    conn_id: u64,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            // The link was replaced or dropped; the new owner reports state.
            _ = &mut closed => return,
        };
        match frame {
            Ok(Some(frame)) => match Message::decode(&frame) {
                Ok(msg) => {
                    trace!(peer = %hex::encode(info.id), kind = msg.kind(), "received message");
                    if shared
                        .events
                        .send(NetworkEvent::Message(info.clone(), msg))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(peer = %hex::encode(info.id), %err, "dropping connection on malformed message");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %hex::encode(info.id), "read failed: {err:?}");
                break;
            }
        }
    }

    let removed = {
        let mut peers = shared.peers.write();
        match peers.get(&info.id) {
            Some(link) if link.conn_id == conn_id => peers.remove(&info.id).is_some(),
            _ => false,
        }
    };
    if removed {
        debug!(peer = %hex::encode(info.id), "peer disconnected");
        let _ = shared.events.send(NetworkEvent::Disconnected(info));
    }
}

fn encode_hello(id: &NodeId, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HELLO_LEN);
    buf.put_slice(id);
    buf.put_u16_le(port);
    buf.freeze()
}

fn decode_hello(mut frame: &[u8]) -> Result<(NodeId, u16)> {
    if frame.len() != HELLO_LEN {
        bail!("hello frame has {} bytes, expected {HELLO_LEN}", frame.len());
    }
    let mut id = [0u8; 32];
    frame.copy_to_slice(&mut id);
    Ok((id, frame.get_u16_le()))
}
