//! KRPC wire messages: BEP-5 queries plus the BEP-44 `get`/`put` extension,
//! and the compact endpoint/contact codecs.

use crate::bencode::{DictBuilder, Value};
use crate::constants::{
    COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN, COMPACT_SOCKADDR_V4_LEN, COMPACT_SOCKADDR_V6_LEN,
    ID_LEN,
};
use crate::data::NodeId;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// BEP-5 / BEP-44 error codes.
pub mod code {
    pub const NOT_RESPONSIBLE: i64 = 201;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
    pub const VALUE_TOO_BIG: i64 = 205;
    pub const BAD_SIGNATURE: i64 = 206;
    pub const SALT_TOO_BIG: i64 = 207;
    pub const CAS_MISMATCH: i64 = 301;
    pub const SEQ_REGRESS: i64 = 302;
}

/// A contact whose id is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeContact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// A lookup candidate; bootstrap entries are known by address only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
}

impl From<NodeContact> for Contact {
    fn from(c: NodeContact) -> Self {
        Contact {
            id: Some(c.id),
            addr: c.addr,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub transaction_id: Bytes,
    pub body: MessageBody,
    /// BEP-43: the sender asked to be left out of routing tables.
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Query(Query),
    Response(Response),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: NodeId,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Bytes,
    },
    Get {
        id: NodeId,
        target: NodeId,
        seq: Option<i64>,
    },
    Put(PutArgs),
    /// A recognized query with missing or malformed arguments; the handler
    /// answers it with error 203 and this description.
    Invalid {
        what: &'static str,
    },
    /// A query type we do not implement; answered with error 204.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutArgs {
    pub id: NodeId,
    pub token: Bytes,
    pub value: Value,
    pub key: Option<[u8; 32]>,
    pub signature: Option<[u8; 64]>,
    pub seq: Option<i64>,
    pub salt: Option<Bytes>,
    pub cas: Option<i64>,
}

/// One bag for every reply shape; only present fields hit the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: NodeId,
    pub nodes: Vec<NodeContact>,
    pub nodes6: Vec<NodeContact>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Bytes>,
    pub v: Option<Value>,
    pub key: Option<[u8; 32]>,
    pub seq: Option<i64>,
    pub signature: Option<[u8; 64]>,
    /// Compact form of the requester's external endpoint, seen in
    /// bootstrap replies.
    pub external_ip: Option<SocketAddr>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            nodes6: Vec::new(),
            values: Vec::new(),
            token: None,
            v: None,
            key: None,
            seq: None,
            signature: None,
            external_ip: None,
        }
    }
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::Get { .. } => "get",
            Query::Put(_) => "put",
            Query::Invalid { .. } | Query::Unknown => "",
        }
    }
}

impl Message {
    pub fn query(transaction_id: Bytes, query: Query) -> Self {
        Message {
            transaction_id,
            body: MessageBody::Query(query),
            read_only: false,
        }
    }

    pub fn response(transaction_id: Bytes, response: Response) -> Self {
        Message {
            transaction_id,
            body: MessageBody::Response(response),
            read_only: false,
        }
    }

    pub fn error(transaction_id: Bytes, code: i64, message: &str) -> Self {
        Message {
            transaction_id,
            body: MessageBody::Error {
                code,
                message: message.to_owned(),
            },
            read_only: false,
        }
    }

    pub fn into_bytes(&self) -> Vec<u8> {
        self.to_value().encode()
    }

    fn to_value(&self) -> Value {
        let tid = Value::Bytes(self.transaction_id.clone());
        match &self.body {
            MessageBody::Query(q) => {
                let mut args = query_args(q);
                if self.read_only {
                    if let Value::Dict(d) = &mut args {
                        d.insert(Bytes::from_static(b"ro"), Value::Int(1));
                    }
                }
                DictBuilder::new()
                    .set("a", args)
                    .set("q", Value::from_str(q.name()))
                    .set("t", tid)
                    .set("y", Value::from_str("q"))
                    .build()
            }
            MessageBody::Response(r) => DictBuilder::new()
                .set_opt(
                    "ip",
                    r.external_ip
                        .as_ref()
                        .map(|ep| Value::Bytes(encode_endpoint(ep).into())),
                )
                .set("r", response_dict(r))
                .set("t", tid)
                .set("y", Value::from_str("r"))
                .build(),
            MessageBody::Error { code, message } => DictBuilder::new()
                .set(
                    "e",
                    Value::List(vec![Value::Int(*code), Value::from_str(message)]),
                )
                .set("t", tid)
                .set("y", Value::from_str("e"))
                .build(),
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Message> {
        let root = Value::decode(buf)?;
        let dict = root.as_dict()?;

        let transaction_id = dict.get(b"t".as_slice())?.as_bytes()?.clone();
        let msg_type = dict.get(b"y".as_slice())?.as_bytes()?;

        let mut read_only = false;
        let body = match msg_type.as_ref() {
            b"q" => {
                let name = dict.get(b"q".as_slice())?.as_bytes()?.clone();
                match dict.get(b"a".as_slice()).and_then(|v| v.as_dict()) {
                    Some(args) => {
                        read_only = sender_is_read_only(args);
                        MessageBody::Query(decode_query(&name, args))
                    }
                    None => MessageBody::Query(Query::Invalid { what: "a" }),
                }
            }
            b"r" => {
                let r = dict.get(b"r".as_slice())?.as_dict()?;
                let mut response = decode_response(r)?;
                // BEP-42: bootstrap replies tell us our external endpoint.
                response.external_ip = dict
                    .get(b"ip".as_slice())
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| decode_endpoint(b));
                MessageBody::Response(response)
            }
            b"e" => {
                let e = dict.get(b"e".as_slice())?.as_list()?;
                let code = e.first()?.as_int()?;
                let message = e
                    .get(1)
                    .and_then(|m| m.as_bytes())
                    .map(|m| String::from_utf8_lossy(m).into_owned())
                    .unwrap_or_default();
                MessageBody::Error { code, message }
            }
            _ => return None,
        };

        Some(Message {
            transaction_id,
            body,
            read_only,
        })
    }
}

fn id_value(id: &NodeId) -> Value {
    Value::from_slice(id.as_bytes())
}

fn query_args(query: &Query) -> Value {
    match query {
        Query::Ping { id } => DictBuilder::new().set("id", id_value(id)).build(),
        Query::FindNode { id, target } => DictBuilder::new()
            .set("id", id_value(id))
            .set("target", id_value(target))
            .build(),
        Query::GetPeers { id, info_hash } => DictBuilder::new()
            .set("id", id_value(id))
            .set("info_hash", id_value(info_hash))
            .build(),
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            implied_port,
            token,
        } => DictBuilder::new()
            .set("id", id_value(id))
            .set("implied_port", Value::Int(*implied_port as i64))
            .set("info_hash", id_value(info_hash))
            .set("port", Value::Int(*port as i64))
            .set("token", Value::Bytes(token.clone()))
            .build(),
        Query::Get { id, target, seq } => DictBuilder::new()
            .set("id", id_value(id))
            .set_opt("seq", seq.map(Value::Int))
            .set("target", id_value(target))
            .build(),
        Query::Put(put) => DictBuilder::new()
            .set_opt("cas", put.cas.map(Value::Int))
            .set("id", id_value(&put.id))
            .set_opt("k", put.key.map(|k| Value::from_slice(&k)))
            .set_opt("salt", put.salt.clone().map(Value::Bytes))
            .set_opt("seq", put.seq.map(Value::Int))
            .set_opt("sig", put.signature.map(|s| Value::from_slice(&s)))
            .set("token", Value::Bytes(put.token.clone()))
            .set("v", put.value.clone())
            .build(),
        Query::Invalid { .. } | Query::Unknown => DictBuilder::new().build(),
    }
}

fn response_dict(r: &Response) -> Value {
    DictBuilder::new()
        .set("id", id_value(&r.id))
        .set_opt(
            "k",
            r.key.map(|k| Value::from_slice(&k)),
        )
        .set_opt(
            "nodes",
            (!r.nodes.is_empty()).then(|| Value::Bytes(encode_contacts(&r.nodes).into())),
        )
        .set_opt(
            "nodes6",
            (!r.nodes6.is_empty()).then(|| Value::Bytes(encode_contacts(&r.nodes6).into())),
        )
        .set_opt("seq", r.seq.map(Value::Int))
        .set_opt("sig", r.signature.map(|s| Value::from_slice(&s)))
        .set_opt("token", r.token.clone().map(Value::Bytes))
        .set_opt("v", r.v.clone())
        .set_opt(
            "values",
            (!r.values.is_empty()).then(|| {
                Value::List(
                    r.values
                        .iter()
                        .map(|ep| Value::Bytes(encode_endpoint(ep).into()))
                        .collect(),
                )
            }),
        )
        .build()
}

macro_rules! required {
    ($args:expr, $key:literal, $what:literal) => {
        match $args.get($key.as_slice()) {
            Some(v) => v,
            None => return Query::Invalid { what: $what },
        }
    };
}

macro_rules! required_id {
    ($args:expr, $key:literal, $what:literal) => {
        match $args
            .get($key.as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(|b| NodeId::from_slice(b))
        {
            Some(id) => id,
            None => return Query::Invalid { what: $what },
        }
    };
}

/// BEP-43: whether the query's sender asked to be left out of routing
/// tables.
fn sender_is_read_only(args: &std::collections::BTreeMap<Bytes, Value>) -> bool {
    args.get(b"ro".as_slice())
        .and_then(|v| v.as_int())
        .map(|v| v == 1)
        .unwrap_or(false)
}

fn decode_query(name: &[u8], args: &std::collections::BTreeMap<Bytes, Value>) -> Query {
    let id = required_id!(args, b"id", "id");

    match name {
        b"ping" => Query::Ping { id },
        b"find_node" => Query::FindNode {
            id,
            target: required_id!(args, b"target", "target"),
        },
        b"get_peers" => Query::GetPeers {
            id,
            info_hash: required_id!(args, b"info_hash", "info_hash"),
        },
        b"announce_peer" => {
            let info_hash = required_id!(args, b"info_hash", "info_hash");
            let token = match required!(args, b"token", "token").as_bytes() {
                Some(t) => t.clone(),
                None => return Query::Invalid { what: "token" },
            };
            let port = match required!(args, b"port", "port").as_int() {
                Some(p) if (0..=u16::MAX as i64).contains(&p) => p as u16,
                _ => return Query::Invalid { what: "port" },
            };
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(|v| v.as_int())
                .map(|v| v != 0)
                .unwrap_or(false);
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                implied_port,
                token,
            }
        }
        b"get" => Query::Get {
            id,
            target: required_id!(args, b"target", "target"),
            seq: args.get(b"seq".as_slice()).and_then(|v| v.as_int()),
        },
        b"put" => {
            let token = match required!(args, b"token", "token").as_bytes() {
                Some(t) => t.clone(),
                None => return Query::Invalid { what: "token" },
            };
            let value = match args.get(b"v".as_slice()) {
                Some(v) => v.clone(),
                None => return Query::Invalid { what: "v" },
            };
            let key = match args.get(b"k".as_slice()) {
                None => None,
                Some(k) => match k.as_bytes().and_then(|b| <[u8; 32]>::try_from(b.as_ref()).ok())
                {
                    Some(k) => Some(k),
                    None => return Query::Invalid { what: "k" },
                },
            };
            let signature = match args.get(b"sig".as_slice()) {
                None => None,
                Some(s) => match s.as_bytes().and_then(|b| <[u8; 64]>::try_from(b.as_ref()).ok())
                {
                    Some(s) => Some(s),
                    None => return Query::Invalid { what: "sig" },
                },
            };
            Query::Put(PutArgs {
                id,
                token,
                value,
                key,
                signature,
                seq: args.get(b"seq".as_slice()).and_then(|v| v.as_int()),
                salt: args
                    .get(b"salt".as_slice())
                    .and_then(|v| v.as_bytes())
                    .cloned(),
                cas: args.get(b"cas".as_slice()).and_then(|v| v.as_int()),
            })
        }
        _ => Query::Unknown,
    }
}

fn decode_response(r: &std::collections::BTreeMap<Bytes, Value>) -> Option<Response> {
    let id = NodeId::from_slice(r.get(b"id".as_slice())?.as_bytes()?)?;
    let mut out = Response::new(id);

    if let Some(nodes) = r.get(b"nodes".as_slice()).and_then(|v| v.as_bytes()) {
        out.nodes = decode_contacts_v4(nodes)?;
    }
    if let Some(nodes6) = r.get(b"nodes6".as_slice()).and_then(|v| v.as_bytes()) {
        out.nodes6 = decode_contacts_v6(nodes6)?;
    }
    if let Some(values) = r.get(b"values".as_slice()).and_then(|v| v.as_list()) {
        out.values = values
            .iter()
            .filter_map(|v| v.as_bytes())
            .filter_map(|b| decode_endpoint(b))
            .filter(|ep| !is_martian(ep))
            .collect();
    }
    out.token = r
        .get(b"token".as_slice())
        .and_then(|v| v.as_bytes())
        .cloned();
    out.v = r.get(b"v".as_slice()).cloned();
    out.key = r
        .get(b"k".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| <[u8; 32]>::try_from(b.as_ref()).ok());
    out.seq = r.get(b"seq".as_slice()).and_then(|v| v.as_int());
    out.signature = r
        .get(b"sig".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| <[u8; 64]>::try_from(b.as_ref()).ok());

    Some(out)
}

pub fn encode_endpoint(ep: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_SOCKADDR_V6_LEN);
    match ep.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&ep.port().to_be_bytes());
    out
}

pub fn decode_endpoint(buf: &[u8]) -> Option<SocketAddr> {
    match buf.len() {
        COMPACT_SOCKADDR_V4_LEN => {
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        COMPACT_SOCKADDR_V6_LEN => {
            let octets: [u8; 16] = buf[..16].try_into().ok()?;
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

pub fn encode_contacts(contacts: &[NodeContact]) -> Vec<u8> {
    let mut out = Vec::new();
    for c in contacts {
        out.extend_from_slice(c.id.as_bytes());
        out.extend_from_slice(&encode_endpoint(&c.addr));
    }
    out
}

fn decode_contacts(buf: &[u8], entry_len: usize) -> Option<Vec<NodeContact>> {
    if buf.len() % entry_len != 0 {
        return None;
    }

    let mut out = Vec::with_capacity(buf.len() / entry_len);
    for chunk in buf.chunks(entry_len) {
        let (id, addr) = chunk.split_at(ID_LEN);
        let addr = decode_endpoint(addr)?;
        if is_martian(&addr) {
            continue;
        }
        out.push(NodeContact {
            id: NodeId::from_slice(id)?,
            addr,
        });
    }
    Some(out)
}

pub fn decode_contacts_v4(buf: &[u8]) -> Option<Vec<NodeContact>> {
    decode_contacts(buf, COMPACT_NODE_V4_LEN)
}

pub fn decode_contacts_v6(buf: &[u8]) -> Option<Vec<NodeContact>> {
    decode_contacts(buf, COMPACT_NODE_V6_LEN)
}

/// Endpoints that cannot belong to a public DHT peer.
pub fn is_martian(ep: &SocketAddr) -> bool {
    if ep.port() == 0 {
        return true;
    }
    match ep.ip() {
        IpAddr::V4(ip) => {
            ip.is_loopback()
                || ip.is_multicast()
                || ip.is_broadcast()
                || ip.is_unspecified()
                || ip.octets()[0] == 0
        }
        IpAddr::V6(ip) => ip.is_loopback() || ip.is_multicast() || ip.is_unspecified(),
    }
}
