//! One DHT node per local UDP endpoint: the datagram loop, the pending
//! request table, inbound query handlers and the high-level tracker and
//! BEP-44 operations.

use crate::bencode::Value;
use crate::constants::{
    MAX_PEERS_PER_REPLY, MAX_SALT_LEN, MAX_VALUE_LEN, RESPONSIBLE_NODES_PER_KEY,
    WRITE_QUERY_RETRIES,
};
use crate::data::NodeId;
use crate::dht::lookup::{collect, ProximityMap};
use crate::dht::message::{
    code, Contact, Message, MessageBody, NodeContact, PutArgs, Query, Response,
};
use crate::dht::routing::RoutingTable;
use crate::dht::stats::Stats;
use crate::dht::storage::{immutable_target, DataStore, MutableItem, PeerStore};
use crate::error::{Error, Result};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub const DEFAULT_BOOTSTRAP_DOMAINS: &[&str] = &[
    "router.bittorrent.com",
    "router.utorrent.com",
    "router.transmissionbt.com",
];

const BOOTSTRAP_PORT: u16 = 6881;
const BOOTSTRAP_RETRY: Duration = Duration::from_secs(10);
const TABLE_REFRESH_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Once a mutable get has one valid item, give the swarm this long to
/// produce a better one before settling.
const MUTABLE_GET_SETTLE: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 65536;

struct PendingReply {
    peer: SocketAddr,
    tx: oneshot::Sender<MessageBody>,
}

#[derive(Debug, Default)]
struct NodeState {
    own_id: Option<NodeId>,
    routing_table: Option<RoutingTable>,
    bootstrap_endpoints: Vec<SocketAddr>,
    wan_endpoint: Option<SocketAddr>,
    ready: bool,
}

struct Inner {
    socket: UdpSocket,
    is_v4: bool,
    cancel: CancellationToken,
    next_transaction_id: AtomicU32,
    pending: Mutex<HashMap<Bytes, PendingReply>>,
    state: Mutex<NodeState>,
    peers: Mutex<PeerStore>,
    data: Mutex<DataStore>,
    stats: Mutex<Stats>,
    bootstrap_domains: Vec<String>,
    cache_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<Inner>,
}

impl DhtNode {
    /// Bind a node to `local`, then bootstrap in the background. The node
    /// answers inbound queries immediately; outbound operations return
    /// [`Error::TryAgain`] until bootstrapped.
    pub async fn bind(
        local: SocketAddr,
        bootstrap_domains: Vec<String>,
        cache_file: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<DhtNode> {
        let socket = UdpSocket::bind(local).await?;

        let node = DhtNode {
            inner: Arc::new(Inner {
                is_v4: local.is_ipv4(),
                socket,
                cancel,
                next_transaction_id: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                state: Mutex::new(NodeState::default()),
                peers: Mutex::new(PeerStore::new()),
                data: Mutex::new(DataStore::new()),
                stats: Mutex::new(Stats::new()),
                bootstrap_domains,
                cache_file,
            }),
        };

        let receiver = node.clone();
        tokio::spawn(async move { receiver.receive_loop().await });

        let bootstrapper = node.clone();
        tokio::spawn(async move { bootstrapper.bootstrap().await });

        Ok(node)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().unwrap().ready
    }

    pub fn is_v4(&self) -> bool {
        self.inner.is_v4
    }

    pub fn own_id(&self) -> Option<NodeId> {
        self.inner.state.lock().unwrap().own_id
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn wan_endpoint(&self) -> Option<SocketAddr> {
        self.inner.state.lock().unwrap().wan_endpoint
    }

    /// Persist the routing table and stop serving.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let (table, path) = {
            let mut state = self.inner.state.lock().unwrap();
            (state.routing_table.take(), self.inner.cache_file.clone())
        };
        if let (Some(table), Some(path)) = (table, path) {
            if let Err(e) = table.store(&path).await {
                warn!(?e, "failed to persist routing table");
            }
        }
    }

    // ---- receive loop ----------------------------------------------------

    async fn receive_loop(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                recv = self.inner.socket.recv_from(&mut buf) => match recv {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(?e, "udp receive failed");
                        continue;
                    }
                },
            };

            let Some(message) = Message::from_bytes(&buf[..len]) else {
                trace!(%from, "dropping undecodable datagram");
                continue;
            };

            match message.body {
                MessageBody::Query(query) => {
                    self.handle_query(message.transaction_id, query, message.read_only, from)
                        .await
                }
                body => self.deliver_reply(message.transaction_id, body, from),
            }
        }
    }

    /// Match `y=r`/`y=e` messages to their pending query by transaction id
    /// and source; at most one reply is delivered per id.
    fn deliver_reply(&self, transaction_id: Bytes, body: MessageBody, from: SocketAddr) {
        let mut pending = self.inner.pending.lock().unwrap();

        match pending.get(&transaction_id) {
            Some(entry) if entry.peer == from => {}
            _ => {
                trace!(%from, "dropping unexpected reply");
                return;
            }
        }

        let entry = pending.remove(&transaction_id).expect("checked above");
        let _ = entry.tx.send(body);
    }

    async fn send_message(&self, message: Message, to: SocketAddr) {
        if let Err(e) = self.inner.socket.send_to(&message.into_bytes(), to).await {
            warn!(?e, %to, "udp send failed");
        }
    }

    // ---- inbound queries -------------------------------------------------

    async fn handle_query(
        &self,
        transaction_id: Bytes,
        query: Query,
        read_only: bool,
        from: SocketAddr,
    ) {
        // Per BEP-43, read-only senders are useless as contacts.
        if !read_only {
            if let Some(sender_id) = query_sender_id(&query) {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(rt) = state.routing_table.as_mut() {
                    rt.try_add(
                        &NodeContact {
                            id: sender_id,
                            addr: from,
                        },
                        false,
                    );
                }
            }
        }

        let reply = self.build_reply(query, from);
        self.send_message(
            match reply {
                Ok(response) => Message::response(transaction_id, response),
                Err((error_code, text)) => Message::error(transaction_id, error_code, text),
            },
            from,
        )
        .await;
    }

    fn build_reply(
        &self,
        query: Query,
        from: SocketAddr,
    ) -> std::result::Result<Response, (i64, &'static str)> {
        match query {
            Query::Ping { .. } => Ok(self.empty_reply()),
            Query::FindNode { target, .. } => {
                let mut reply = self.empty_reply();
                let state = self.inner.state.lock().unwrap();
                if let Some(rt) = state.routing_table.as_ref() {
                    self.set_reply_nodes(&mut reply, rt.find_node(&target));
                }
                Ok(reply)
            }
            Query::GetPeers { info_hash, .. } => {
                let mut reply = self.empty_reply();
                {
                    let state = self.inner.state.lock().unwrap();
                    if let Some(rt) = state.routing_table.as_ref() {
                        self.set_reply_nodes(
                            &mut reply,
                            rt.find_closest(&info_hash, RESPONSIBLE_NODES_PER_KEY),
                        );
                    }
                }
                let mut peers = self.inner.peers.lock().unwrap();
                reply.token = Some(peers.tokens.generate(&from.ip(), &info_hash));
                reply.values = peers.list_peers(&info_hash, MAX_PEERS_PER_REPLY);
                Ok(reply)
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
                ..
            } => {
                {
                    let mut peers = self.inner.peers.lock().unwrap();
                    if !peers.tokens.verify(&from.ip(), &info_hash, &token) {
                        return Err((code::PROTOCOL, "Incorrect announce token"));
                    }
                }
                if !self.is_responsible_for(&info_hash) {
                    return Err((code::NOT_RESPONSIBLE, "This swarm is not my responsibility"));
                }

                let peer_port = if implied_port { from.port() } else { port };
                self.inner
                    .peers
                    .lock()
                    .unwrap()
                    .add_peer(info_hash, SocketAddr::new(from.ip(), peer_port));
                Ok(self.empty_reply())
            }
            Query::Get { target, seq, .. } => {
                let mut reply = self.empty_reply();
                {
                    let state = self.inner.state.lock().unwrap();
                    if let Some(rt) = state.routing_table.as_ref() {
                        self.set_reply_nodes(
                            &mut reply,
                            rt.find_closest(&target, RESPONSIBLE_NODES_PER_KEY),
                        );
                    }
                }

                let mut data = self.inner.data.lock().unwrap();
                reply.token = Some(data.tokens.generate(&from.ip(), &target));

                if seq.is_none() {
                    if let Some(value) = data.get_immutable(&target) {
                        reply.v = Some(value.clone());
                        return Ok(reply);
                    }
                }

                if let Some(item) = data.get_mutable(&target) {
                    // Withhold the value when the requester is up to date.
                    if seq.map(|s| s >= item.seq).unwrap_or(false) {
                        return Ok(reply);
                    }
                    reply.key = Some(item.public_key);
                    reply.seq = Some(item.seq);
                    reply.signature = Some(item.signature);
                    reply.v = Some(item.value.clone());
                }
                Ok(reply)
            }
            Query::Put(args) => self.handle_put(args, from),
            Query::Invalid { what } => Err((code::PROTOCOL, what)),
            Query::Unknown => Err((code::METHOD_UNKNOWN, "Query type not implemented")),
        }
    }

    fn handle_put(
        &self,
        args: PutArgs,
        from: SocketAddr,
    ) -> std::result::Result<Response, (i64, &'static str)> {
        if args.value.encode().len() > MAX_VALUE_LEN {
            return Err((code::VALUE_TOO_BIG, "Argument 'v' too big"));
        }

        if let Some(public_key) = args.key {
            // Mutable item.
            let Some(signature) = args.signature else {
                return Err((code::PROTOCOL, "Missing argument 'sig'"));
            };
            let Some(seq) = args.seq else {
                return Err((code::PROTOCOL, "Missing argument 'seq'"));
            };
            let salt = args.salt.unwrap_or_default();
            if salt.len() > MAX_SALT_LEN {
                return Err((code::SALT_TOO_BIG, "Argument 'salt' too big"));
            }

            let target = MutableItem::target_of(&public_key, &salt);

            if !self
                .inner
                .data
                .lock()
                .unwrap()
                .tokens
                .verify(&from.ip(), &target, &args.token)
            {
                return Err((code::PROTOCOL, "Incorrect put token"));
            }
            if !self.is_responsible_for(&target) {
                return Err((
                    code::NOT_RESPONSIBLE,
                    "This data item is not my responsibility",
                ));
            }

            let item = MutableItem {
                public_key,
                salt,
                value: args.value,
                seq,
                signature,
            };
            if !item.verify() {
                return Err((code::BAD_SIGNATURE, "Invalid signature"));
            }

            let mut data = self.inner.data.lock().unwrap();
            if let Some(existing) = data.get_mutable(&target) {
                if seq < existing.seq {
                    return Err((code::SEQ_REGRESS, "Sequence number less than current"));
                }
                if seq == existing.seq && item.value != existing.value {
                    return Err((code::SEQ_REGRESS, "Sequence number not updated"));
                }
                if let Some(cas) = args.cas {
                    if cas != existing.seq {
                        return Err((code::CAS_MISMATCH, "Compare-and-swap mismatch"));
                    }
                }
            }
            data.put_mutable(item);
            Ok(self.empty_reply())
        } else {
            // Immutable item.
            let target = immutable_target(&args.value);

            if !self
                .inner
                .data
                .lock()
                .unwrap()
                .tokens
                .verify(&from.ip(), &target, &args.token)
            {
                return Err((code::PROTOCOL, "Incorrect put token"));
            }
            if !self.is_responsible_for(&target) {
                return Err((
                    code::NOT_RESPONSIBLE,
                    "This data item is not my responsibility",
                ));
            }

            self.inner.data.lock().unwrap().put_immutable(args.value);
            Ok(self.empty_reply())
        }
    }

    fn empty_reply(&self) -> Response {
        let id = self
            .inner
            .state
            .lock()
            .unwrap()
            .own_id
            .unwrap_or_else(|| NodeId::new([0; 20]));
        Response::new(id)
    }

    fn set_reply_nodes(&self, reply: &mut Response, contacts: Vec<NodeContact>) {
        if self.inner.is_v4 {
            reply.nodes = contacts;
        } else {
            reply.nodes6 = contacts;
        }
    }

    /// Accept writes only when we sit among the ~4K closest known nodes.
    fn is_responsible_for(&self, target: &NodeId) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (Some(own_id), Some(rt)) = (state.own_id, state.routing_table.as_ref()) else {
            return true;
        };

        rt.find_closest(target, 4 * RESPONSIBLE_NODES_PER_KEY)
            .iter()
            .any(|contact| target.closer_to(&own_id, &contact.id))
    }

    // ---- outbound queries ------------------------------------------------

    fn new_transaction_id(&self) -> Bytes {
        let id = self
            .inner
            .next_transaction_id
            .fetch_add(1, AtomicOrdering::Relaxed);
        if id == 0 {
            return Bytes::from_static(b"\x00");
        }
        let bytes = id.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).expect("id is nonzero");
        Bytes::copy_from_slice(&bytes[first..])
    }

    /// Send one query and wait for its reply, error reply, adaptive
    /// timeout or cancellation; update the routing table either way.
    pub(crate) async fn send_query_await_reply(
        &self,
        dst: Contact,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let query_type = query.name();
        let transaction_id = self.new_transaction_id();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(
            transaction_id.clone(),
            PendingReply { peer: dst.addr, tx },
        );

        let message = Message::query(transaction_id.clone(), query);
        let started = Instant::now();
        let wait = self
            .inner
            .stats
            .lock()
            .unwrap()
            .max_reply_wait_time(query_type);

        let outcome: Result<MessageBody> = match self
            .inner
            .socket
            .send_to(&message.into_bytes(), dst.addr)
            .await
        {
            Err(e) => Err(Error::Io(e)),
            Ok(_) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Aborted),
                    _ = self.inner.cancel.cancelled() => Err(Error::Aborted),
                    _ = sleep(wait) => Err(Error::Timeout),
                    reply = rx => reply.map_err(|_| Error::Aborted),
                }
            }
        };

        self.inner.pending.lock().unwrap().remove(&transaction_id);

        let fail_contact = |this: &DhtNode| {
            if let Some(id) = dst.id {
                let mut state = this.inner.state.lock().unwrap();
                if let Some(rt) = state.routing_table.as_mut() {
                    rt.fail_node(&NodeContact { id, addr: dst.addr });
                }
            }
        };

        match outcome {
            Ok(MessageBody::Response(response)) => {
                self.inner
                    .stats
                    .lock()
                    .unwrap()
                    .add_reply_time(query_type, started.elapsed());

                let mut state = self.inner.state.lock().unwrap();
                if let Some(rt) = state.routing_table.as_mut() {
                    let id = dst.id.unwrap_or(response.id);
                    rt.try_add(&NodeContact { id, addr: dst.addr }, true);
                }
                Ok(response)
            }
            Ok(MessageBody::Error { code, message }) => {
                debug!(code, %message, peer = %dst.addr, "dht error reply");
                fail_contact(self);
                Err(Error::BadMessage("dht error reply"))
            }
            Ok(MessageBody::Query(_)) => {
                fail_contact(self);
                Err(Error::BadMessage("query sent as reply"))
            }
            Err(e) => {
                if !e.is_aborted() {
                    fail_contact(self);
                }
                Err(e)
            }
        }
    }

    /// Write queries (`announce_peer`, `put`) are retried a few times.
    async fn send_write_query(
        &self,
        dst: Contact,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut last_err = Error::NetworkDown;
        for _ in 0..WRITE_QUERY_RETRIES {
            match self.send_query_await_reply(dst, query.clone(), cancel).await {
                Ok(_) => return Ok(()),
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn own_id_or_zero(&self) -> NodeId {
        self.inner
            .state
            .lock()
            .unwrap()
            .own_id
            .unwrap_or_else(|| NodeId::new([0; 20]))
    }

    fn reply_nodes(&self, response: &Response) -> Vec<NodeContact> {
        if self.inner.is_v4 {
            response.nodes.clone()
        } else {
            response.nodes6.clone()
        }
    }

    async fn push_closer_nodes(
        &self,
        response: &Response,
        closer: &mpsc::Sender<NodeContact>,
    ) -> bool {
        let nodes = self.reply_nodes(response);
        let mut any = false;
        for node in nodes {
            any = true;
            if closer.send(node).await.is_err() {
                break;
            }
        }
        any
    }

    async fn query_find_node(
        &self,
        target: NodeId,
        contact: Contact,
        closer: &mpsc::Sender<NodeContact>,
        cancel: &CancellationToken,
    ) -> Option<SocketAddr> {
        let response = self
            .send_query_await_reply(
                contact,
                Query::FindNode {
                    id: self.own_id_or_zero(),
                    target,
                },
                cancel,
            )
            .await
            .ok()?;

        self.push_closer_nodes(&response, closer)
            .await
            .then_some(contact.addr)
    }

    /// `get` with a `find_node` fallback: many nodes never implement
    /// BEP-44 and simply stay silent, but can still supply closer nodes.
    async fn query_get_data(
        &self,
        target: NodeId,
        contact: Contact,
        closer: &mpsc::Sender<NodeContact>,
        cancel: &CancellationToken,
    ) -> Option<Response> {
        let response = self
            .send_query_await_reply(
                contact,
                Query::Get {
                    id: self.own_id_or_zero(),
                    target,
                    seq: None,
                },
                cancel,
            )
            .await;

        match response {
            Ok(response) => {
                self.push_closer_nodes(&response, closer).await;
                Some(response)
            }
            Err(Error::Aborted) => None,
            Err(_) => {
                self.query_find_node(target, contact, closer, cancel).await;
                None
            }
        }
    }

    async fn query_get_peers(
        &self,
        info_hash: NodeId,
        contact: Contact,
        closer: &mpsc::Sender<NodeContact>,
        cancel: &CancellationToken,
    ) -> Option<Response> {
        let response = self
            .send_query_await_reply(
                contact,
                Query::GetPeers {
                    id: self.own_id_or_zero(),
                    info_hash,
                },
                cancel,
            )
            .await
            .ok()?;

        if !self.push_closer_nodes(&response, closer).await {
            // A reply without nodes; follow up to keep the lookup moving.
            self.query_find_node(info_hash, contact, closer, cancel)
                .await;
        }
        Some(response)
    }

    fn lookup_seeds(&self, target: &NodeId) -> Result<Vec<Contact>> {
        let state = self.inner.state.lock().unwrap();
        let Some(rt) = state.routing_table.as_ref() else {
            return Err(Error::TryAgain);
        };

        let mut seeds: Vec<Contact> = rt
            .find_closest(target, RESPONSIBLE_NODES_PER_KEY)
            .into_iter()
            .map(Contact::from)
            .collect();
        let known: HashSet<SocketAddr> = seeds.iter().map(|c| c.addr).collect();

        for ep in &state.bootstrap_endpoints {
            if !known.contains(ep) {
                seeds.push(Contact {
                    id: None,
                    addr: *ep,
                });
            }
        }
        Ok(seeds)
    }

    // ---- bootstrap -------------------------------------------------------

    async fn bootstrap(self) {
        let domains: Vec<String> = if self.inner.bootstrap_domains.is_empty() {
            DEFAULT_BOOTSTRAP_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect()
        } else {
            self.inner.bootstrap_domains.clone()
        };

        let (wan_endpoint, bootstrap_ep) = loop {
            let mut shuffled = domains.clone();
            shuffled.shuffle(&mut rand::thread_rng());

            let mut found = None;
            for domain in &shuffled {
                if self.inner.cancel.is_cancelled() {
                    return;
                }
                match self.bootstrap_single(domain).await {
                    Ok(pair) => {
                        found = Some(pair);
                        break;
                    }
                    Err(e) => debug!(%domain, ?e, "bootstrap attempt failed"),
                }
            }

            if let Some(pair) = found {
                break pair;
            }

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = sleep(BOOTSTRAP_RETRY) => {}
            }
        };

        let own_id = NodeId::from_ip(&wan_endpoint.ip(), rand::random());
        debug!(?own_id, %wan_endpoint, "derived node id");

        let table = match &self.inner.cache_file {
            Some(path) => match RoutingTable::load(path, &own_id).await {
                Ok(table) => table,
                Err(e) => {
                    debug!(?e, "starting with a fresh routing table");
                    RoutingTable::new(own_id)
                }
            },
            None => RoutingTable::new(own_id),
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.own_id = Some(own_id);
            state.wan_endpoint = Some(wan_endpoint);
            state.routing_table = Some(table);
            state.bootstrap_endpoints.push(bootstrap_ep);
        }

        // Look up our own id to populate the table around us.
        if let Err(e) = self.find_closest_nodes(own_id, &self.inner.cancel.clone()).await {
            debug!(?e, "self lookup failed");
        }

        self.inner.state.lock().unwrap().ready = true;
        debug!("dht node ready");

        self.refresh_loop().await;
    }

    async fn bootstrap_single(&self, domain: &str) -> Result<(SocketAddr, SocketAddr)> {
        let candidates = tokio::net::lookup_host((domain, BOOTSTRAP_PORT)).await?;
        let Some(bootstrap_ep) = candidates.into_iter().find(|ep| ep.is_ipv4() == self.inner.is_v4)
        else {
            return Err(Error::NotFound);
        };

        let response = self
            .send_query_await_reply(
                Contact {
                    id: None,
                    addr: bootstrap_ep,
                },
                Query::Ping {
                    id: self.own_id_or_zero(),
                },
                &self.inner.cancel.clone(),
            )
            .await?;

        let wan = response
            .external_ip
            .ok_or(Error::BadMessage("bootstrap reply carries no ip"))?;

        Ok((wan, bootstrap_ep))
    }

    async fn refresh_loop(self) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = sleep(TABLE_REFRESH_PERIOD) => {}
            }

            let targets = {
                let state = self.inner.state.lock().unwrap();
                match state.routing_table.as_ref() {
                    Some(rt) => rt.refresh_targets(),
                    None => continue,
                }
            };

            for target in targets {
                let cancel = self.inner.cancel.clone();
                if let Err(e) = self.find_closest_nodes(target, &cancel).await {
                    debug!(?e, "bucket refresh lookup failed");
                    break;
                }
            }
        }
    }

    // ---- high-level operations -------------------------------------------

    pub async fn find_closest_nodes(
        &self,
        target: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeContact>> {
        let seeds = self.lookup_seeds(&target)?;
        let stop = CancellationToken::new();

        let node = self.clone();
        let cancel_for_probes = cancel.clone();
        let out = collect(
            target,
            seeds,
            move |contact, closer| {
                let node = node.clone();
                let cancel = cancel_for_probes.clone();
                async move {
                    node.query_find_node(target, contact, &closer, &cancel)
                        .await
                }
            },
            RESPONSIBLE_NODES_PER_KEY,
            cancel,
            &stop,
        )
        .await?;

        Ok(out
            .into_entries()
            .into_iter()
            .map(|(id, addr)| NodeContact { id, addr })
            .collect())
    }

    async fn tracker_search(
        &self,
        info_hash: NodeId,
        cancel: &CancellationToken,
    ) -> Result<(HashSet<SocketAddr>, Vec<(NodeId, TrackerNode)>)> {
        let seeds = self.lookup_seeds(&info_hash)?;
        let stop = CancellationToken::new();

        let node = self.clone();
        let cancel_for_probes = cancel.clone();
        let out: ProximityMap<TrackerNode> = collect(
            info_hash,
            seeds,
            move |contact, closer| {
                let node = node.clone();
                let cancel = cancel_for_probes.clone();
                async move {
                    let response = node
                        .query_get_peers(info_hash, contact, &closer, &cancel)
                        .await?;
                    let token = response.token.clone()?;
                    Some(TrackerNode {
                        addr: contact.addr,
                        token,
                        peers: response.values,
                    })
                }
            },
            RESPONSIBLE_NODES_PER_KEY,
            cancel,
            &stop,
        )
        .await?;

        let entries = out.into_entries();
        let peers = entries
            .iter()
            .flat_map(|(_, node)| node.peers.iter().copied())
            .collect();
        Ok((peers, entries))
    }

    /// Swarm lookup: the peers known to the closest responsible nodes.
    pub async fn tracker_get_peers(
        &self,
        info_hash: NodeId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let (peers, _) = self.tracker_search(info_hash, cancel).await?;
        Ok(peers)
    }

    /// Announce ourselves on a swarm; returns the peers discovered on the
    /// way.
    pub async fn tracker_announce(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let (peers, responsible) = self.tracker_search(info_hash, cancel).await?;

        let own_id = self.own_id_or_zero();
        let mut writes = JoinSet::new();
        for (id, tracker) in responsible {
            let node = self.clone();
            let cancel = cancel.clone();
            writes.spawn(async move {
                node.send_write_query(
                    Contact {
                        id: Some(id),
                        addr: tracker.addr,
                    },
                    Query::AnnouncePeer {
                        id: own_id,
                        info_hash,
                        port: port.unwrap_or(0),
                        implied_port: port.is_none(),
                        token: tracker.token,
                    },
                    &cancel,
                )
                .await
            });
        }

        let success = await_any_write(&mut writes).await;

        if cancel.is_cancelled() {
            Err(Error::Aborted)
        } else if success {
            Ok(peers)
        } else {
            Err(Error::NetworkDown)
        }
    }

    pub async fn data_get_immutable(
        &self,
        key: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        let seeds = self.lookup_seeds(&key)?;
        let stop = CancellationToken::new();
        let found: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));

        let node = self.clone();
        let cancel_for_probes = cancel.clone();
        let found_in_probe = found.clone();
        let stop_in_probe = stop.clone();
        collect(
            key,
            seeds,
            move |contact, closer| {
                let node = node.clone();
                let cancel = cancel_for_probes.clone();
                let found = found_in_probe.clone();
                let stop = stop_in_probe.clone();
                async move {
                    let response = node.query_get_data(key, contact, &closer, &cancel).await?;
                    if let Some(value) = &response.v {
                        if immutable_target(value) == key {
                            *found.lock().unwrap() = Some(value.clone());
                            // First valid value ends the search.
                            stop.cancel();
                        }
                    }
                    Some(())
                }
            },
            RESPONSIBLE_NODES_PER_KEY,
            cancel,
            &stop,
        )
        .await?;

        let value = found.lock().unwrap().take();
        Ok(value)
    }

    pub async fn data_put_immutable(
        &self,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        if value.encode().len() > MAX_VALUE_LEN {
            return Err(Error::InvalidArgument("value too big"));
        }
        let key = immutable_target(&value);
        let seeds = self.lookup_seeds(&key)?;
        let stop = CancellationToken::new();

        let node = self.clone();
        let cancel_for_probes = cancel.clone();
        let out: ProximityMap<(SocketAddr, Bytes)> = collect(
            key,
            seeds,
            move |contact, closer| {
                let node = node.clone();
                let cancel = cancel_for_probes.clone();
                async move {
                    let response = node.query_get_data(key, contact, &closer, &cancel).await?;
                    let token = response.token.clone()?;
                    Some((contact.addr, token))
                }
            },
            RESPONSIBLE_NODES_PER_KEY,
            cancel,
            &stop,
        )
        .await?;

        let own_id = self.own_id_or_zero();
        let mut writes = JoinSet::new();
        for (id, (addr, token)) in out.into_entries() {
            let node = self.clone();
            let cancel = cancel.clone();
            let value = value.clone();
            writes.spawn(async move {
                node.send_write_query(
                    Contact {
                        id: Some(id),
                        addr,
                    },
                    Query::Put(PutArgs {
                        id: own_id,
                        token,
                        value,
                        key: None,
                        signature: None,
                        seq: None,
                        salt: None,
                        cas: None,
                    }),
                    &cancel,
                )
                .await
            });
        }

        let success = await_any_write(&mut writes).await;

        if cancel.is_cancelled() {
            Err(Error::Aborted)
        } else if success {
            Ok(key)
        } else {
            Err(Error::NetworkDown)
        }
    }

    /// Mutable get: keep scanning and adopt the highest validly-signed
    /// sequence seen; a short watchdog ends the tail once something was
    /// found.
    pub async fn data_get_mutable(
        &self,
        public_key: &[u8; 32],
        salt: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Option<MutableItem>> {
        let target = MutableItem::target_of(public_key, &salt);
        let seeds = self.lookup_seeds(&target)?;
        let stop = CancellationToken::new();
        let best: Arc<Mutex<Option<MutableItem>>> = Arc::new(Mutex::new(None));

        let node = self.clone();
        let cancel_for_probes = cancel.clone();
        let best_in_probe = best.clone();
        let stop_in_probe = stop.clone();
        let public_key = *public_key;
        collect(
            target,
            seeds,
            move |contact, closer| {
                let node = node.clone();
                let cancel = cancel_for_probes.clone();
                let best = best_in_probe.clone();
                let stop = stop_in_probe.clone();
                let salt = salt.clone();
                async move {
                    let response = node
                        .query_get_data(target, contact, &closer, &cancel)
                        .await?;

                    let item = mutable_item_from_response(&response, &public_key, &salt)?;

                    let mut best = best.lock().unwrap();
                    let improved = best
                        .as_ref()
                        .map(|cur| item.seq > cur.seq)
                        .unwrap_or(true);
                    if improved {
                        let first = best.is_none();
                        *best = Some(item);
                        if first {
                            let stop = stop.clone();
                            tokio::spawn(async move {
                                sleep(MUTABLE_GET_SETTLE).await;
                                stop.cancel();
                            });
                        }
                    }
                    Some(())
                }
            },
            RESPONSIBLE_NODES_PER_KEY,
            cancel,
            &stop,
        )
        .await?;

        let item = best.lock().unwrap().take();
        Ok(item)
    }

    pub async fn data_put_mutable(
        &self,
        item: MutableItem,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        if !item.verify() {
            return Err(Error::InvalidArgument("item signature does not verify"));
        }
        if item.value.encode().len() > MAX_VALUE_LEN {
            return Err(Error::InvalidArgument("value too big"));
        }

        let target = item.target();
        let seeds = self.lookup_seeds(&target)?;
        let stop = CancellationToken::new();

        let node = self.clone();
        let cancel_for_probes = cancel.clone();
        let probe_item = item.clone();
        let out: ProximityMap<(SocketAddr, Bytes)> = collect(
            target,
            seeds,
            move |contact, closer| {
                let node = node.clone();
                let cancel = cancel_for_probes.clone();
                let item = probe_item.clone();
                async move {
                    let response = node
                        .query_get_data(target, contact, &closer, &cancel)
                        .await?;
                    let token = response.token.clone()?;

                    // A node holding an older version gets refreshed right
                    // away, responsible or not.
                    if let Some(held) =
                        mutable_item_from_response(&response, &item.public_key, &item.salt)
                    {
                        if held.seq < item.seq {
                            let _ = node
                                .send_query_await_reply(
                                    contact,
                                    put_query(node.own_id_or_zero(), token.clone(), &item),
                                    &cancel,
                                )
                                .await;
                            return Some((contact.addr, token));
                        }
                    }

                    Some((contact.addr, token))
                }
            },
            RESPONSIBLE_NODES_PER_KEY,
            cancel,
            &stop,
        )
        .await?;

        let own_id = self.own_id_or_zero();
        let mut writes = JoinSet::new();
        for (id, (addr, token)) in out.into_entries() {
            let node = self.clone();
            let cancel = cancel.clone();
            let item = item.clone();
            writes.spawn(async move {
                node.send_write_query(
                    Contact {
                        id: Some(id),
                        addr,
                    },
                    put_query(own_id, token, &item),
                    &cancel,
                )
                .await
            });
        }

        let success = await_any_write(&mut writes).await;

        if cancel.is_cancelled() {
            Err(Error::Aborted)
        } else if success {
            Ok(target)
        } else {
            Err(Error::NetworkDown)
        }
    }
}

#[derive(Debug, Clone)]
struct TrackerNode {
    addr: SocketAddr,
    token: Bytes,
    peers: Vec<SocketAddr>,
}

fn query_sender_id(query: &Query) -> Option<NodeId> {
    match query {
        Query::Ping { id }
        | Query::FindNode { id, .. }
        | Query::GetPeers { id, .. }
        | Query::AnnouncePeer { id, .. }
        | Query::Get { id, .. } => Some(*id),
        Query::Put(args) => Some(args.id),
        Query::Invalid { .. } | Query::Unknown => None,
    }
}

fn put_query(own_id: NodeId, token: Bytes, item: &MutableItem) -> Query {
    Query::Put(PutArgs {
        id: own_id,
        token,
        value: item.value.clone(),
        key: Some(item.public_key),
        signature: Some(item.signature),
        seq: Some(item.seq),
        salt: (!item.salt.is_empty()).then(|| item.salt.clone()),
        cas: None,
    })
}

fn mutable_item_from_response(
    response: &Response,
    public_key: &[u8; 32],
    salt: &Bytes,
) -> Option<MutableItem> {
    if response.key.as_ref() != Some(public_key) {
        return None;
    }

    let item = MutableItem {
        public_key: *public_key,
        salt: salt.clone(),
        value: response.v.clone()?,
        seq: response.seq?,
        signature: response.signature?,
    };
    item.verify().then_some(item)
}

/// Drain a write fan-out; true when at least one write succeeded.
async fn await_any_write(writes: &mut JoinSet<Result<()>>) -> bool {
    let mut success = false;
    while let Some(joined) = writes.join_next().await {
        if matches!(joined, Ok(Ok(()))) {
            success = true;
        }
    }
    success
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tokio::net::UdpSocket as RawUdp;
    use tokio::time::timeout;

    async fn test_node() -> DhtNode {
        DhtNode::bind(
            "127.0.0.1:0".parse().unwrap(),
            // A domain that never resolves keeps the bootstrapper idle.
            vec!["bootstrap.invalid".to_owned()],
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn ask(client: &RawUdp, node: SocketAddr, query: Query) -> Message {
        let msg = Message::query(Bytes::from_static(b"aa"), query);
        client.send_to(&msg.into_bytes(), node).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("node did not reply")
            .unwrap();
        Message::from_bytes(&buf[..len]).expect("reply decodes")
    }

    fn response(msg: &Message) -> &Response {
        match &msg.body {
            MessageBody::Response(r) => r,
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn error_code(msg: &Message) -> i64 {
        match &msg.body {
            MessageBody::Error { code, .. } => *code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let node = test_node().await;
        let addr = node.local_endpoint().unwrap();
        let client = RawUdp::bind("127.0.0.1:0").await.unwrap();

        let reply = ask(&client, addr, Query::Ping { id: NodeId::random() }).await;
        assert_eq!(reply.transaction_id, Bytes::from_static(b"aa"));
        response(&reply);
    }

    #[tokio::test]
    async fn mutable_put_enforces_seq_and_cas() {
        let node = test_node().await;
        let addr = node.local_endpoint().unwrap();
        let client = RawUdp::bind("127.0.0.1:0").await.unwrap();

        let sk = SigningKey::generate(&mut OsRng);
        let salt = Bytes::from_static(b"salt");
        let target = MutableItem::target_of(&sk.verifying_key().to_bytes(), &salt);

        let first = ask(
            &client,
            addr,
            Query::Get {
                id: NodeId::random(),
                target,
                seq: None,
            },
        )
        .await;
        let token = response(&first).token.clone().expect("get replies carry a token");

        let put = |seq: i64, cas: Option<i64>| {
            let item = MutableItem::sign(&sk, salt.clone(), Value::Int(seq * 100), seq);
            let mut query = put_query(NodeId::random(), token.clone(), &item);
            if let Query::Put(args) = &mut query {
                args.cas = cas;
            }
            query
        };

        // Fresh item is stored.
        response(&ask(&client, addr, put(5, None)).await);

        // Correct seq but stale compare-and-swap.
        let reply = ask(&client, addr, put(6, Some(4))).await;
        assert_eq!(error_code(&reply), code::CAS_MISMATCH);

        // Matching compare-and-swap goes through.
        response(&ask(&client, addr, put(6, Some(5))).await);

        // Sequence regress.
        let reply = ask(&client, addr, put(5, None)).await;
        assert_eq!(error_code(&reply), code::SEQ_REGRESS);

        // Same seq, different value.
        let conflicting = MutableItem::sign(&sk, salt.clone(), Value::Int(31337), 6);
        let reply = ask(
            &client,
            addr,
            put_query(NodeId::random(), token.clone(), &conflicting),
        )
        .await;
        assert_eq!(error_code(&reply), code::SEQ_REGRESS);

        // The stored item is the seq 6 one, withheld from an up-to-date
        // requester.
        let got = ask(
            &client,
            addr,
            Query::Get {
                id: NodeId::random(),
                target,
                seq: None,
            },
        )
        .await;
        assert_eq!(response(&got).seq, Some(6));
        assert_eq!(response(&got).v, Some(Value::Int(600)));

        let up_to_date = ask(
            &client,
            addr,
            Query::Get {
                id: NodeId::random(),
                target,
                seq: Some(6),
            },
        )
        .await;
        assert_eq!(response(&up_to_date).v, None);
    }

    #[tokio::test]
    async fn mutable_put_rejects_bad_signature() {
        let node = test_node().await;
        let addr = node.local_endpoint().unwrap();
        let client = RawUdp::bind("127.0.0.1:0").await.unwrap();

        let sk = SigningKey::generate(&mut OsRng);
        let salt = Bytes::from_static(b"s");
        let target = MutableItem::target_of(&sk.verifying_key().to_bytes(), &salt);

        let first = ask(
            &client,
            addr,
            Query::Get {
                id: NodeId::random(),
                target,
                seq: None,
            },
        )
        .await;
        let token = response(&first).token.clone().unwrap();

        let mut item = MutableItem::sign(&sk, salt, Value::Int(1), 1);
        item.signature[0] ^= 1;
        let reply = ask(&client, addr, put_query(NodeId::random(), token, &item)).await;
        assert_eq!(error_code(&reply), code::BAD_SIGNATURE);
    }

    #[tokio::test]
    async fn immutable_put_and_get() {
        let node = test_node().await;
        let addr = node.local_endpoint().unwrap();
        let client = RawUdp::bind("127.0.0.1:0").await.unwrap();

        let value = Value::from_str("immutable value");
        let target = immutable_target(&value);

        let first = ask(
            &client,
            addr,
            Query::Get {
                id: NodeId::random(),
                target,
                seq: None,
            },
        )
        .await;
        let token = response(&first).token.clone().unwrap();

        response(
            &ask(
                &client,
                addr,
                Query::Put(PutArgs {
                    id: NodeId::random(),
                    token: token.clone(),
                    value: value.clone(),
                    key: None,
                    signature: None,
                    seq: None,
                    salt: None,
                    cas: None,
                }),
            )
            .await,
        );

        let got = ask(
            &client,
            addr,
            Query::Get {
                id: NodeId::random(),
                target,
                seq: None,
            },
        )
        .await;
        assert_eq!(response(&got).v, Some(value));

        // Oversized values are refused.
        let huge = Value::from_slice(&vec![0u8; MAX_VALUE_LEN + 1]);
        let reply = ask(
            &client,
            addr,
            Query::Put(PutArgs {
                id: NodeId::random(),
                token,
                value: huge,
                key: None,
                signature: None,
                seq: None,
                salt: None,
                cas: None,
            }),
        )
        .await;
        assert_eq!(error_code(&reply), code::VALUE_TOO_BIG);
    }

    #[tokio::test]
    async fn announce_requires_a_valid_token() {
        let node = test_node().await;
        let addr = node.local_endpoint().unwrap();
        let client = RawUdp::bind("127.0.0.1:0").await.unwrap();

        let info_hash = NodeId::random();
        let first = ask(
            &client,
            addr,
            Query::GetPeers {
                id: NodeId::random(),
                info_hash,
            },
        )
        .await;
        let token = response(&first).token.clone().unwrap();

        let reply = ask(
            &client,
            addr,
            Query::AnnouncePeer {
                id: NodeId::random(),
                info_hash,
                port: 7777,
                implied_port: false,
                token: Bytes::from_static(b"bogus"),
            },
        )
        .await;
        assert_eq!(error_code(&reply), code::PROTOCOL);

        response(
            &ask(
                &client,
                addr,
                Query::AnnouncePeer {
                    id: NodeId::random(),
                    info_hash,
                    port: 7777,
                    implied_port: false,
                    token,
                },
            )
            .await,
        );

        // Loopback peers never make it onto the wire, so check the store.
        let peers = node
            .inner
            .peers
            .lock()
            .unwrap()
            .list_peers(&info_hash, 10);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 7777);
    }

    #[tokio::test]
    async fn unknown_queries_get_error_204() {
        let node = test_node().await;
        let addr = node.local_endpoint().unwrap();
        let client = RawUdp::bind("127.0.0.1:0").await.unwrap();

        let wire = b"d1:ad2:id20:abcdefghij0123456789e1:q7:whatver1:t2:aa1:y1:qe";
        client.send_to(wire, addr).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(error_code(&reply), code::METHOD_UNKNOWN);
    }

    #[tokio::test]
    async fn transaction_ids_are_minimal_big_endian() {
        let node = test_node().await;

        assert_eq!(node.new_transaction_id(), Bytes::from_static(&[1]));
        for _ in 0..253 {
            node.new_transaction_id();
        }
        assert_eq!(node.new_transaction_id(), Bytes::from_static(&[255]));
        assert_eq!(node.new_transaction_id(), Bytes::from_static(&[1, 0]));
    }
}
