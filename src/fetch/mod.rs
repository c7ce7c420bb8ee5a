//! Fetching cached responses from other peers: connector seam, DHT swarm
//! discovery and the block-level multi-peer reader.

pub mod multi_peer;

pub use multi_peer::MultiPeerReader;

use crate::dht::MainlineDht;
use crate::error::Result;
use crate::swarm;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Opens byte streams to peers. The real transport is TCP; tests swap in
/// in-memory duplex pairs.
pub trait Connector: Clone + Send + Sync + 'static {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static;

    fn connect(
        &self,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(
        &self,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<TcpStream>> + Send {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(crate::Error::Aborted),
                connected = TcpStream::connect(peer) => Ok(connected?),
            }
        }
    }
}

/// Look up the swarm for a content key and return its peers.
pub async fn discover_peers(
    dht: &MainlineDht,
    public_key: &[u8; 32],
    key: &str,
    cancel: &CancellationToken,
) -> Result<Vec<SocketAddr>> {
    let name = swarm::uri_swarm_name(public_key, key);
    let infohash = swarm::swarm_infohash(&name);
    let peers = dht.tracker_get_peers(infohash, cancel).await?;
    Ok(peers.into_iter().collect())
}
