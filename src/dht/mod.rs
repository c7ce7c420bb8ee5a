pub mod lookup;
pub mod message;
pub mod node;
pub mod routing;
pub mod stats;
pub mod storage;

pub use message::{Contact, NodeContact};
pub use node::{DhtNode, DEFAULT_BOOTSTRAP_DOMAINS};
pub use storage::MutableItem;

use crate::bencode::Value;
use crate::data::NodeId;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const READY_POLL_PERIOD: Duration = Duration::from_millis(200);

/// The Mainline DHT as seen by the rest of the system: one [`DhtNode`]
/// per local UDP endpoint, operations fanned out across them.
pub struct MainlineDht {
    nodes: Vec<DhtNode>,
    cancel: CancellationToken,
}

impl MainlineDht {
    pub async fn bind(
        endpoints: &[SocketAddr],
        bootstrap_domains: Vec<String>,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let mut nodes = Vec::with_capacity(endpoints.len());

        for (i, ep) in endpoints.iter().enumerate() {
            let cache_file = cache_dir
                .as_ref()
                .map(|dir| dir.join(format!("dht.{i}")));
            nodes.push(
                DhtNode::bind(
                    *ep,
                    bootstrap_domains.clone(),
                    cache_file,
                    cancel.child_token(),
                )
                .await?,
            );
        }

        Ok(Self { nodes, cancel })
    }

    pub fn nodes(&self) -> &[DhtNode] {
        &self.nodes
    }

    pub fn local_endpoints(&self) -> Vec<SocketAddr> {
        self.nodes
            .iter()
            .filter_map(|n| n.local_endpoint().ok())
            .collect()
    }

    pub fn wan_endpoints(&self) -> HashSet<SocketAddr> {
        self.nodes.iter().filter_map(|n| n.wan_endpoint()).collect()
    }

    pub fn all_ready(&self) -> bool {
        self.nodes.iter().all(|n| n.is_ready())
    }

    pub async fn wait_all_ready(&self, cancel: &CancellationToken) -> Result<()> {
        while !self.all_ready() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = self.cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep(READY_POLL_PERIOD) => {}
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for node in &self.nodes {
            node.shutdown().await;
        }
    }

    /// Fan an operation out over the ready nodes; the first useful result
    /// wins and cancels the other attempts.
    async fn first_success<T, F, Fut>(&self, cancel: &CancellationToken, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: Fn(DhtNode, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let attempts = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for node in self.nodes.iter().filter(|n| n.is_ready()) {
            tasks.spawn(f(node.clone(), attempts.clone()));
        }
        if tasks.is_empty() {
            return Err(Error::TryAgain);
        }

        let mut found = None;
        let mut last_err: Option<Error> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    attempts.cancel();
                    tasks.shutdown().await;
                    return Err(Error::Aborted);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(Some(value)))) => {
                        found = Some(value);
                        attempts.cancel();
                    }
                    Some(Ok(Ok(None))) => {}
                    Some(Ok(Err(e))) => last_err = Some(e),
                    Some(Err(_)) => {}
                },
            }
        }

        match (found, last_err) {
            (Some(value), _) => Ok(Some(value)),
            (None, Some(Error::Aborted)) | (None, None) => Ok(None),
            (None, Some(e)) => Err(e),
        }
    }

    pub async fn tracker_get_peers(
        &self,
        info_hash: NodeId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let found = self
            .first_success(cancel, |node, attempts| async move {
                let peers = node.tracker_get_peers(info_hash, &attempts).await?;
                Ok((!peers.is_empty()).then_some(peers))
            })
            .await?;
        found.ok_or(Error::NotFound)
    }

    pub async fn tracker_announce(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let found = self
            .first_success(cancel, |node, attempts| async move {
                let peers = node.tracker_announce(info_hash, port, &attempts).await?;
                Ok(Some(peers))
            })
            .await?;
        found.ok_or(Error::NetworkDown)
    }

    pub async fn immutable_get(
        &self,
        key: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        self.first_success(cancel, |node, attempts| async move {
            node.data_get_immutable(key, &attempts).await
        })
        .await
    }

    pub async fn immutable_put(
        &self,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        let found = self
            .first_success(cancel, move |node, attempts| {
                let value = value.clone();
                async move { node.data_put_immutable(value, &attempts).await.map(Some) }
            })
            .await?;
        found.ok_or(Error::NetworkDown)
    }

    pub async fn mutable_get(
        &self,
        public_key: &[u8; 32],
        salt: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Option<MutableItem>> {
        let public_key = *public_key;
        self.first_success(cancel, move |node, attempts| {
            let salt = salt.clone();
            async move { node.data_get_mutable(&public_key, salt, &attempts).await }
        })
        .await
    }

    pub async fn mutable_put(
        &self,
        item: MutableItem,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        let found = self
            .first_success(cancel, move |node, attempts| {
                let item = item.clone();
                async move { node.data_put_mutable(item, &attempts).await.map(Some) }
            })
            .await?;
        found.ok_or(Error::NetworkDown)
    }
}

impl Drop for MainlineDht {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
