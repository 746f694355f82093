use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryNetwork, DiscoveryNode};
use crate::net::{NetworkEvent, TcpNetwork};

/// Handles a single inbound TCP connection: runs the hello exchange and hands
/// the stream over to the network for the rest of its life.
pub async fn handle_connection(network: TcpNetwork, stream: TcpStream, remote: SocketAddr) -> Result<()> {
    network.accept(stream, remote).await?;
    Ok(())
}

/// Accept inbound connections forever.
pub async fn serve(listener: TcpListener, network: TcpNetwork) -> Result<()> {
    info!(addr = %listener.local_addr()?, "accepting discovery connections");
    loop {
        let (stream, remote) = listener.accept().await?;
        let network = network.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(network, stream, remote).await {
                debug!(%remote, "inbound connection rejected: {err:?}");
            }
        });
    }
}

/// Forward network events to the discovery protocol until the event channel
/// closes.
///
/// Connection changes are applied in arrival order; message handlers run
/// concurrently.
pub async fn run_events<N: DiscoveryNetwork>(
    node: DiscoveryNode<N>,
    mut events: mpsc::UnboundedReceiver<NetworkEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::Connected(info) => node.on_peer_connected(&info).await,
            NetworkEvent::Disconnected(info) => node.on_peer_disconnected(&info),
            NetworkEvent::Message(from, msg) => {
                let node = node.clone();
                tokio::spawn(async move { node.handle_message(&from, msg).await });
            }
        }
    }
    warn!("network event channel closed");
}
