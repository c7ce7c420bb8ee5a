//! Swarm names bind a cache public key, a protocol version and a role (or
//! a content key) to an infohash announced on the DHT.

use crate::constants::PROTOCOL_VERSION;
use crate::data::NodeId;
use data_encoding::BASE32_NOPAD;
use sha1::{Digest, Sha1};

fn key_prefix(public_key: &[u8; 32]) -> String {
    format!("ed25519:{}", BASE32_NOPAD.encode(public_key))
}

pub fn injector_swarm_name(public_key: &[u8; 32]) -> String {
    format!("{}/v{}/injectors", key_prefix(public_key), PROTOCOL_VERSION)
}

pub fn bridge_swarm_name(public_key: &[u8; 32]) -> String {
    format!("{}/v{}/bridges", key_prefix(public_key), PROTOCOL_VERSION)
}

pub fn uri_swarm_name(public_key: &[u8; 32], key: &str) -> String {
    format!("{}/v{}/uri/{}", key_prefix(public_key), PROTOCOL_VERSION, key)
}

/// Swarm infohash: SHA-1 of the UTF-8 swarm name.
pub fn swarm_infohash(name: &str) -> NodeId {
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    NodeId::new(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PK: [u8; 32] = [0xab; 32];

    #[test]
    fn swarm_names_carry_key_version_and_role() {
        let b32 = BASE32_NOPAD.encode(&PK);
        assert!(b32.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        assert_eq!(
            injector_swarm_name(&PK),
            format!("ed25519:{b32}/v5/injectors")
        );
        assert_eq!(bridge_swarm_name(&PK), format!("ed25519:{b32}/v5/bridges"));
        assert_eq!(
            uri_swarm_name(&PK, "https://example.com/foo"),
            format!("ed25519:{b32}/v5/uri/https://example.com/foo")
        );
    }

    #[test]
    fn infohash_is_sha1_of_name() {
        let name = injector_swarm_name(&PK);
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        let expect = NodeId::new(hasher.finalize().into());

        assert_eq!(swarm_infohash(&name), expect);
        assert_ne!(swarm_infohash(&name), swarm_infohash(&bridge_swarm_name(&PK)));
    }
}
