//! Server-side state of a DHT node: announce tokens, swarm peer records
//! and BEP-44 immutable/mutable items.

use crate::bencode::{DictBuilder, Value};
use crate::data::NodeId;
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

const SECRET_ROTATION_PERIOD: Duration = Duration::from_secs(5 * 60);
const PEER_VALIDITY: Duration = Duration::from_secs(30 * 60);

type HmacSha1 = Hmac<Sha1>;

/// Announce/put tokens: `HMAC(secret, requester_ip ++ target)` with a
/// secret that rotates every few minutes. Verification accepts tokens
/// minted under the current or the previous secret.
#[derive(Debug)]
pub struct TokenKeeper {
    current: [u8; 32],
    previous: [u8; 32],
    rotated_at: Instant,
}

impl Default for TokenKeeper {
    fn default() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: Instant::now(),
        }
    }
}

impl TokenKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn maybe_rotate(&mut self) {
        if self.rotated_at.elapsed() >= SECRET_ROTATION_PERIOD {
            self.previous = self.current;
            self.current = rand::random();
            self.rotated_at = Instant::now();
        }
    }

    #[cfg(test)]
    pub fn force_rotation(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        self.rotated_at = Instant::now();
    }

    fn compute(secret: &[u8; 32], ip: &IpAddr, target: &NodeId) -> Bytes {
        let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
        match ip {
            IpAddr::V4(v4) => mac.update(&v4.octets()),
            IpAddr::V6(v6) => mac.update(&v6.octets()),
        }
        mac.update(target.as_bytes());
        Bytes::copy_from_slice(&mac.finalize().into_bytes())
    }

    pub fn generate(&mut self, ip: &IpAddr, target: &NodeId) -> Bytes {
        self.maybe_rotate();
        Self::compute(&self.current, ip, target)
    }

    pub fn verify(&mut self, ip: &IpAddr, target: &NodeId, token: &[u8]) -> bool {
        self.maybe_rotate();
        token == Self::compute(&self.current, ip, target)
            || token == Self::compute(&self.previous, ip, target)
    }
}

/// Swarm peers learned through `announce_peer`, per infohash.
#[derive(Debug, Default)]
pub struct PeerStore {
    peers: HashMap<NodeId, HashMap<SocketAddr, Instant>>,
    pub tokens: TokenKeeper,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, info_hash: NodeId, peer: SocketAddr) {
        self.peers
            .entry(info_hash)
            .or_default()
            .insert(peer, Instant::now());
    }

    /// Up to `n` live peers for `info_hash`, pruning stale records on the
    /// way.
    pub fn list_peers(&mut self, info_hash: &NodeId, n: usize) -> Vec<SocketAddr> {
        let Some(swarm) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };

        swarm.retain(|_, seen| seen.elapsed() < PEER_VALIDITY);
        if swarm.is_empty() {
            self.peers.remove(info_hash);
            return Vec::new();
        }

        swarm.keys().take(n).copied().collect()
    }
}

/// A BEP-44 mutable item: the signed tuple under `(public key, salt)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MutableItem {
    pub public_key: [u8; 32],
    pub salt: Bytes,
    pub value: Value,
    pub seq: i64,
    pub signature: [u8; 64],
}

impl MutableItem {
    /// Item key: `SHA-1(public_key ++ salt)`.
    pub fn target_of(public_key: &[u8; 32], salt: &[u8]) -> NodeId {
        let mut hasher = Sha1::new();
        hasher.update(public_key);
        hasher.update(salt);
        NodeId::new(hasher.finalize().into())
    }

    pub fn target(&self) -> NodeId {
        Self::target_of(&self.public_key, &self.salt)
    }

    /// The signature covers the bencoded `{"salt": …, "seq": …, "v": …}`
    /// dictionary, salt omitted when empty.
    pub fn signing_bytes(salt: &[u8], seq: i64, value: &Value) -> Vec<u8> {
        let mut dict = DictBuilder::new()
            .set("seq", Value::Int(seq))
            .set("v", value.clone());
        if !salt.is_empty() {
            dict = dict.set("salt", Value::from_slice(salt));
        }
        dict.build().encode()
    }

    pub fn sign(key: &SigningKey, salt: Bytes, value: Value, seq: i64) -> Self {
        let signature = key
            .sign(&Self::signing_bytes(&salt, seq, &value))
            .to_bytes();

        Self {
            public_key: key.verifying_key().to_bytes(),
            salt,
            value,
            seq,
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        key.verify(
            &Self::signing_bytes(&self.salt, self.seq, &self.value),
            &signature,
        )
        .is_ok()
    }
}

/// Immutable item key: `SHA-1(bencode(value))`.
pub fn immutable_target(value: &Value) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.update(value.encode());
    NodeId::new(hasher.finalize().into())
}

/// BEP-44 item storage.
#[derive(Debug, Default)]
pub struct DataStore {
    immutable: HashMap<NodeId, Value>,
    mutable: HashMap<NodeId, MutableItem>,
    pub tokens: TokenKeeper,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_immutable(&self, target: &NodeId) -> Option<&Value> {
        self.immutable.get(target)
    }

    pub fn put_immutable(&mut self, value: Value) -> NodeId {
        let target = immutable_target(&value);
        self.immutable.insert(target, value);
        target
    }

    pub fn get_mutable(&self, target: &NodeId) -> Option<&MutableItem> {
        self.mutable.get(target)
    }

    pub fn put_mutable(&mut self, item: MutableItem) {
        self.mutable.insert(item.target(), item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn some_ip() -> IpAddr {
        "93.184.216.34".parse().unwrap()
    }

    #[test]
    fn token_accepts_current_and_previous_secret() {
        let mut tokens = TokenKeeper::new();
        let ip = some_ip();
        let target = NodeId::random();

        let token = tokens.generate(&ip, &target);
        assert!(tokens.verify(&ip, &target, &token));

        tokens.force_rotation();
        assert!(tokens.verify(&ip, &target, &token));

        tokens.force_rotation();
        assert!(!tokens.verify(&ip, &target, &token));
    }

    #[test]
    fn token_binds_ip_and_target() {
        let mut tokens = TokenKeeper::new();
        let target = NodeId::random();
        let token = tokens.generate(&some_ip(), &target);

        let other_ip: IpAddr = "198.51.100.7".parse().unwrap();
        assert!(!tokens.verify(&other_ip, &target, &token));
        assert!(!tokens.verify(&some_ip(), &NodeId::random(), &token));
    }

    #[test]
    fn peer_store_lists_and_prunes() {
        let mut store = PeerStore::new();
        let info_hash = NodeId::random();

        store.add_peer(info_hash, "1.2.3.4:1000".parse().unwrap());
        store.add_peer(info_hash, "1.2.3.5:1001".parse().unwrap());

        assert_eq!(store.list_peers(&info_hash, 10).len(), 2);
        assert_eq!(store.list_peers(&info_hash, 1).len(), 1);
        assert!(store.list_peers(&NodeId::random(), 10).is_empty());
    }

    #[test]
    fn mutable_item_signing_bytes() {
        let bytes = MutableItem::signing_bytes(b"foobar", 4, &Value::from_str("Hello world!"));
        assert_eq!(bytes, b"d4:salt6:foobar3:seqi4e1:v12:Hello world!e");

        let no_salt = MutableItem::signing_bytes(b"", 4, &Value::from_str("Hello world!"));
        assert_eq!(no_salt, b"d3:seqi4e1:v12:Hello world!e");
    }

    #[test]
    fn mutable_item_sign_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let item = MutableItem::sign(&key, Bytes::from_static(b"salt"), Value::Int(7), 1);

        assert!(item.verify());

        let mut tampered = item.clone();
        tampered.seq = 2;
        assert!(!tampered.verify());

        let mut tampered = item;
        tampered.value = Value::Int(8);
        assert!(!tampered.verify());
    }

    #[test]
    fn immutable_target_is_value_hash() {
        let v = Value::from_str("immutable!");
        let target = immutable_target(&v);

        let mut hasher = Sha1::new();
        hasher.update(v.encode());
        assert_eq!(target, NodeId::new(hasher.finalize().into()));
    }
}
