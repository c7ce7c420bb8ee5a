//! Assemble one cached response from several untrusted peers: the hash
//! list comes from whoever answers first, then every block is raced
//! across a few peers and the first one whose bytes check out wins.

use super::Connector;
use crate::constants::BLOCK_FANOUT;
use crate::error::{Error, Result};
use crate::httpmsg::{ChunkHdr, Part, PartStream, ResponseReader, Trailer};
use crate::serve::request_bytes;
use crate::sign::chain::{self, BlockDigest, BlockSignature, ChainHash};
use crate::sign::reader::block_chunk_ext;
use crate::sign::{EXT_SIG, HDR_DATA_SIZE};
use crate::store::HashList;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Start,
    Streaming,
    Done,
}

/// Reads one response out of a swarm of peers; the output is a single
/// verified part sequence, indistinguishable from one served by a lone
/// peer.
pub struct MultiPeerReader<C: Connector> {
    connector: C,
    public_key: [u8; 32],
    key: String,
    peers: Vec<SocketAddr>,
    bad_peers: HashSet<SocketAddr>,

    state: State,
    list: Option<HashList>,
    injection_id: String,
    block_size: u64,
    data_size: u64,
    num_blocks: u64,
    /// `CHASH[i]` per block, derived from the hash list.
    chain_digests: Vec<BlockDigest>,
    /// Block signatures captured from winning range responses.
    block_sigs: Vec<Option<BlockSignature>>,
    next_block: u64,
    pending: VecDeque<Part>,
}

impl<C: Connector> MultiPeerReader<C> {
    pub fn new(
        connector: C,
        public_key: [u8; 32],
        key: impl Into<String>,
        peers: Vec<SocketAddr>,
    ) -> Self {
        Self {
            connector,
            public_key,
            key: key.into(),
            peers,
            bad_peers: HashSet::new(),
            state: State::Start,
            list: None,
            injection_id: String::new(),
            block_size: 0,
            data_size: 0,
            num_blocks: 0,
            chain_digests: Vec::new(),
            block_sigs: Vec::new(),
            next_block: 0,
            pending: VecDeque::new(),
        }
    }

    fn live_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|p| !self.bad_peers.contains(p))
            .copied()
            .collect()
    }

    /// Phase one: race the hash list across all peers.
    async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        let peers = self.live_peers();
        if peers.is_empty() {
            return Err(Error::HostUnreachable);
        }

        let attempt = cancel.child_token();
        let mut tasks: JoinSet<(SocketAddr, Result<HashList>)> = JoinSet::new();
        for peer in peers {
            let connector = self.connector.clone();
            let key = self.key.clone();
            let public_key = self.public_key;
            let attempt = attempt.clone();
            tasks.spawn(async move {
                let got = fetch_hash_list(connector, peer, key, public_key, &attempt).await;
                (peer, got)
            });
        }

        let mut list = None;
        while let Some(joined) = tasks.join_next().await {
            let Ok((peer, got)) = joined else { continue };
            match got {
                Ok(l) => {
                    debug!(%peer, "hash list received");
                    list = Some(l);
                    attempt.cancel();
                    break;
                }
                Err(Error::Aborted) => {}
                Err(e) => {
                    debug!(%peer, ?e, "peer failed to provide hash list");
                    self.bad_peers.insert(peer);
                }
            }
        }
        tasks.shutdown().await;

        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        let list = list.ok_or(Error::HostUnreachable)?;

        let mut head = list.head.clone();
        let params = list
            .params()
            .ok_or(Error::BadMessage("hash list head lacks block params"))?;
        let (injection_id, _) = crate::sign::head::parse_injection(&head)
            .ok_or(Error::BadMessage("hash list head lacks injection id"))?;
        let data_size: u64 = head
            .get(HDR_DATA_SIZE)
            .and_then(|v| v.parse().ok())
            .ok_or(Error::BadMessage("hash list head lacks data size"))?;

        let expected_blocks = if data_size == 0 {
            1
        } else {
            data_size.div_ceil(params.size)
        };
        if expected_blocks != list.block_hashes.len() as u64 {
            return Err(Error::BadMessage("hash count does not match data size"));
        }

        // Precompute every chain hash once.
        let mut chain_digests = Vec::with_capacity(list.block_hashes.len());
        let mut chained: Option<BlockDigest> = None;
        for digest in &list.block_hashes {
            let next = chain::chained_digest(chained.as_ref(), digest);
            chain_digests.push(next);
            chained = Some(next);
        }

        head.set("Transfer-Encoding", "chunked");
        self.pending.push_back(Part::Head(head));

        self.injection_id = injection_id;
        self.block_size = params.size;
        self.data_size = data_size;
        self.num_blocks = if data_size == 0 { 0 } else { expected_blocks };
        self.chain_digests = chain_digests;
        self.block_sigs = vec![None; list.block_hashes.len()];
        self.list = Some(list);
        self.state = State::Streaming;
        Ok(())
    }

    /// Extensions for the chunk that carries block `index`.
    fn exts_for_block(&self, index: u64) -> String {
        if index == 0 {
            return String::new();
        }
        let sig = self.block_sigs[(index - 1) as usize];
        let hash = (index >= 2).then(|| self.chain_digests[(index - 2) as usize]);
        block_chunk_ext(sig.as_ref(), hash.as_ref())
    }

    fn final_exts(&self) -> String {
        let list = self.list.as_ref().expect("streaming implies a list");
        let last = list.block_hashes.len() as u64 - 1;
        let hash = (last >= 1).then(|| self.chain_digests[(last - 1) as usize]);
        block_chunk_ext(Some(&list.signature), hash.as_ref())
    }

    /// Phase two, one step: race one block across the best few peers.
    async fn fetch_next_block(&mut self, cancel: &CancellationToken) -> Result<()> {
        let index = self.next_block;
        let first = index * self.block_size;
        let last = (first + self.block_size).min(self.data_size) - 1;
        let expected_len = (last - first + 1) as usize;
        let expected_digest = self.list.as_ref().expect("started").block_hashes[index as usize];
        let expected_chain = ChainHash {
            offset: first,
            digest: self.chain_digests[index as usize],
        };
        let verifying_key = self
            .list
            .as_ref()
            .and_then(|l| l.params())
            .and_then(|p| p.verifying_key())
            .ok_or(Error::BadMessage("unusable block signing key"))?;

        let mut won: Option<(Vec<u8>, BlockSignature)> = None;

        while won.is_none() {
            let live_before = self.live_peers();
            let candidates: Vec<SocketAddr> =
                live_before.iter().take(BLOCK_FANOUT).copied().collect();
            if candidates.is_empty() {
                return Err(Error::HostUnreachable);
            }

            let attempt = cancel.child_token();
            let mut tasks: JoinSet<(SocketAddr, Result<(Vec<u8>, Option<BlockSignature>)>)> =
                JoinSet::new();
            for peer in candidates {
                let connector = self.connector.clone();
                let key = self.key.clone();
                let attempt = attempt.clone();
                tasks.spawn(async move {
                    let got =
                        fetch_block(connector, peer, key, first, last, expected_len, &attempt)
                            .await;
                    (peer, got)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let Ok((peer, got)) = joined else { continue };
                match got {
                    Ok((body, Some(sig)))
                        if body.len() == expected_len
                            && chain::data_digest(&body) == expected_digest
                            && expected_chain.verify(&verifying_key, &self.injection_id, &sig) =>
                    {
                        won = Some((body, sig));
                        attempt.cancel();
                        break;
                    }
                    Err(Error::Aborted) => {}
                    _ => {
                        warn!(%peer, block = index, "peer failed block verification");
                        self.bad_peers.insert(peer);
                    }
                }
            }
            tasks.shutdown().await;

            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }
            if won.is_none() && self.live_peers().len() == live_before.len() {
                // No peer was disqualified and none delivered; give up
                // rather than spin.
                return Err(Error::HostUnreachable);
            }
        }

        let (body, sig) = won.expect("loop exits with a winner");
        self.block_sigs[index as usize] = Some(sig);
        self.pending
            .push_back(Part::ChunkHdr(ChunkHdr::new(body.len(), self.exts_for_block(index))));
        self.pending.push_back(Part::ChunkBody(body));
        self.next_block += 1;
        Ok(())
    }

    pub async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            match self.state {
                State::Start => self.start(cancel).await?,
                State::Streaming => {
                    if self.next_block < self.num_blocks {
                        self.fetch_next_block(cancel).await?;
                    } else {
                        self.pending
                            .push_back(Part::ChunkHdr(ChunkHdr::new(0, self.final_exts())));
                        self.pending.push_back(Part::Trailer(Trailer::new()));
                        self.state = State::Done;
                    }
                }
                State::Done => return Ok(None),
            }
        }
    }
}

impl<C: Connector> PartStream for MultiPeerReader<C> {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send {
        MultiPeerReader::read_part(self, cancel)
    }
}

async fn fetch_hash_list<C: Connector>(
    connector: C,
    peer: SocketAddr,
    key: String,
    public_key: [u8; 32],
    cancel: &CancellationToken,
) -> Result<HashList> {
    let mut stream = connector.connect(peer, cancel).await?;
    stream
        .write_all(&request_bytes(&key, None, true))
        .await?;

    let mut reader = ResponseReader::new(stream);
    HashList::from_stream(&mut reader, &public_key, cancel).await
}

async fn fetch_block<C: Connector>(
    connector: C,
    peer: SocketAddr,
    key: String,
    first: u64,
    last: u64,
    expected_len: usize,
    cancel: &CancellationToken,
) -> Result<(Vec<u8>, Option<BlockSignature>)> {
    let mut stream = connector.connect(peer, cancel).await?;
    stream
        .write_all(&request_bytes(&key, Some((first, last)), false))
        .await?;

    let mut reader = ResponseReader::new(stream);
    let mut body = Vec::new();
    let mut sig = None;

    while let Some(part) = reader.read_part(cancel).await? {
        match part {
            Part::Head(head) => {
                if head.status != 206 {
                    return Err(Error::BadMessage("peer refused block range"));
                }
            }
            Part::ChunkHdr(hdr) => {
                if let Some(value) = hdr.ext(EXT_SIG) {
                    sig = B64
                        .decode(value)
                        .ok()
                        .and_then(|b| <[u8; 64]>::try_from(b).ok());
                }
            }
            Part::ChunkBody(data) => {
                if body.len() + data.len() > expected_len {
                    return Err(Error::BadMessage("peer sent more data than requested"));
                }
                body.extend_from_slice(&data);
            }
            Part::Trailer(_) => {}
        }
    }

    Ok((body, sig))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpmsg::Head;
    use crate::serve::handle_connection;
    use crate::sign::reader::test_support::{three_block_body, PartVec};
    use crate::sign::reader::{SigningReader, VerifyingReader};
    use crate::store::Store;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    const KEY: &str = "https://example.com/foo";
    const INJECTION_ID: &str = "d6076384-2295-462b-a047-fe2c9274e58d";

    /// In-memory "network": each address is backed by a store (or by a
    /// black hole).
    #[derive(Clone)]
    struct DuplexConnector {
        stores: Arc<HashMap<SocketAddr, Store>>,
    }

    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        fn connect(
            &self,
            peer: SocketAddr,
            _cancel: &CancellationToken,
        ) -> impl Future<Output = Result<DuplexStream>> + Send {
            let store = self.stores.get(&peer).cloned();
            async move {
                let Some(store) = store else {
                    return Err(Error::HostUnreachable);
                };
                let (client, server) = tokio::io::duplex(1 << 17);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    let _ = handle_connection(&store, server, &cancel).await;
                });
                Ok(client)
            }
        }
    }

    fn addr(n: u8) -> SocketAddr {
        format!("10.1.1.{n}:7500").parse().unwrap()
    }

    async fn populated_store(key: &SigningKey) -> (tempfile::TempDir, Store) {
        let blocks = three_block_body();

        let mut head = Head::new(200);
        head.insert("Content-Type", "text/html");
        head.set("Transfer-Encoding", "chunked");
        let mut parts = vec![Part::Head(head)];
        for block in &blocks {
            parts.push(Part::ChunkHdr(ChunkHdr::new(block.len(), String::new())));
            parts.push(Part::ChunkBody(block.clone()));
        }
        parts.push(Part::ChunkHdr(ChunkHdr::new(0, String::new())));
        parts.push(Part::Trailer(Trailer::new()));

        let mut signer = SigningReader::new(
            PartVec::new(parts),
            KEY,
            INJECTION_ID,
            1516048310,
            key.clone(),
        );

        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let cancel = CancellationToken::new();
        store.store(KEY, &mut signer, &cancel).await.unwrap();
        (dir, store)
    }

    /// A copy of `store`'s entry with one corrupted body byte; its sigs
    /// no longer match the data.
    async fn corrupted_copy(store: &Store) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let bad = Store::new(dir.path());

        let src = store.entry_path(KEY);
        let dst = bad.entry_path(KEY);
        tokio::fs::create_dir_all(&dst).await.unwrap();
        for name in ["head", "body", "sigs"] {
            tokio::fs::copy(src.join(name), dst.join(name)).await.unwrap();
        }

        let body_path = dst.join("body");
        let mut body = tokio::fs::read(&body_path).await.unwrap();
        body[70_000] ^= 1; // inside block 1
        tokio::fs::write(&body_path, body).await.unwrap();

        (dir, bad)
    }

    async fn collect<S: PartStream + Send>(mut stream: S) -> Result<Vec<Part>> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let Some(part) = stream.read_part(&cancel).await? {
            out.push(part);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn assembles_from_one_peer() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let (_tmp, store) = populated_store(&key).await;

        let connector = DuplexConnector {
            stores: Arc::new(HashMap::from([(addr(1), store)])),
        };
        let reader = MultiPeerReader::new(connector, pk, KEY, vec![addr(1)]);
        let parts = collect(reader).await.unwrap();

        let bodies: Vec<_> = parts.iter().filter_map(|p| p.as_chunk_body()).collect();
        assert_eq!(bodies.len(), 3);
        assert!(bodies[0].starts_with(b"0123"));
        assert_eq!(bodies[2], b"abcd");

        // The assembled stream is a valid signed response.
        let verified = collect(VerifyingReader::new(PartVec::new(parts), pk)).await;
        assert!(verified.is_ok());
    }

    #[tokio::test]
    async fn routes_around_a_corrupt_peer() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let (_tmp, store) = populated_store(&key).await;
        let (_tmp_bad, bad_store) = corrupted_copy(&store).await;

        let connector = DuplexConnector {
            stores: Arc::new(HashMap::from([
                (addr(1), bad_store),
                (addr(2), store),
            ])),
        };
        let reader = MultiPeerReader::new(connector, pk, KEY, vec![addr(1), addr(2)]);
        let parts = collect(reader).await.unwrap();

        let bodies: Vec<_> = parts.iter().filter_map(|p| p.as_chunk_body()).collect();
        assert_eq!(bodies.len(), 3);
        assert!(bodies[1].starts_with(b"89AB"));

        let verified = collect(VerifyingReader::new(PartVec::new(parts), pk)).await;
        assert!(verified.is_ok());
    }

    #[tokio::test]
    async fn fails_with_no_reachable_peers() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();

        let connector = DuplexConnector {
            stores: Arc::new(HashMap::new()),
        };
        let mut reader = MultiPeerReader::new(connector, pk, KEY, vec![addr(9)]);
        let cancel = CancellationToken::new();

        assert!(matches!(
            reader.read_part(&cancel).await,
            Err(Error::HostUnreachable)
        ));
    }

    #[tokio::test]
    async fn serves_hash_list_over_the_wire() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let (_tmp, store) = populated_store(&key).await;

        let connector = DuplexConnector {
            stores: Arc::new(HashMap::from([(addr(1), store)])),
        };
        let cancel = CancellationToken::new();
        let list = fetch_hash_list(connector, addr(1), KEY.to_owned(), pk, &cancel)
            .await
            .unwrap();

        assert_eq!(list.block_hashes.len(), 3);
        assert!(list.verify());
    }

    #[tokio::test]
    async fn block_request_gets_exactly_one_block() {
        let key = SigningKey::generate(&mut OsRng);
        let (_tmp, store) = populated_store(&key).await;

        let connector = DuplexConnector {
            stores: Arc::new(HashMap::from([(addr(1), store)])),
        };
        let cancel = CancellationToken::new();

        let first = crate::constants::DATA_BLOCK_SIZE as u64;
        let last = 2 * crate::constants::DATA_BLOCK_SIZE as u64 - 1;
        let (body, sig) = fetch_block(
            connector,
            addr(1),
            KEY.to_owned(),
            first,
            last,
            crate::constants::DATA_BLOCK_SIZE,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(body.len(), crate::constants::DATA_BLOCK_SIZE);
        assert!(body.starts_with(b"89AB"));
        assert!(sig.is_some());
    }
}
