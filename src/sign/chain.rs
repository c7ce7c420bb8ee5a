//! Per-block hashes: `DHASH[i] = SHA-512(BLOCK[i])` and the chain
//! `CHASH[i] = SHA-512(CHASH[i-1] ++ DHASH[i])`. A block signature covers
//! the injection id, the block's byte offset and `CHASH[i]`, so one block
//! can be verified in isolation when `CHASH[i-1]` travels with it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};

pub const DIGEST_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;

pub type BlockDigest = [u8; DIGEST_LEN];
pub type BlockSignature = [u8; SIGNATURE_LEN];

pub fn data_digest(block: &[u8]) -> BlockDigest {
    Sha512::digest(block).into()
}

/// `CHASH[i] = SHA-512(CHASH[i-1] ++ DHASH[i])`, `CHASH[-1]` empty.
pub fn chained_digest(prev: Option<&BlockDigest>, data_digest: &BlockDigest) -> BlockDigest {
    let mut hasher = Sha512::new();
    if let Some(prev) = prev {
        hasher.update(prev);
    }
    hasher.update(data_digest);
    hasher.finalize().into()
}

fn block_signing_input(injection_id: &str, offset: u64, chain_digest: &BlockDigest) -> Vec<u8> {
    let mut out = Vec::with_capacity(injection_id.len() + 2 + 20 + DIGEST_LEN);
    out.extend_from_slice(injection_id.as_bytes());
    out.push(0);
    out.extend_from_slice(offset.to_string().as_bytes());
    out.push(0);
    out.extend_from_slice(chain_digest);
    out
}

/// The chain hash of one block together with the block's offset; what a
/// block signature actually covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHash {
    pub offset: u64,
    pub digest: BlockDigest,
}

impl ChainHash {
    pub fn sign(&self, key: &SigningKey, injection_id: &str) -> BlockSignature {
        key.sign(&block_signing_input(injection_id, self.offset, &self.digest))
            .to_bytes()
    }

    pub fn verify(
        &self,
        key: &VerifyingKey,
        injection_id: &str,
        signature: &BlockSignature,
    ) -> bool {
        key.verify(
            &block_signing_input(injection_id, self.offset, &self.digest),
            &Signature::from_bytes(signature),
        )
        .is_ok()
    }
}

/// Folds block data digests into the chain, tracking offsets.
#[derive(Debug, Default, Clone)]
pub struct ChainHasher {
    offset: u64,
    prev_chained: Option<BlockDigest>,
}

impl ChainHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume mid-stream, e.g. at the start of a range.
    pub fn resume(offset: u64, prev_chained: Option<BlockDigest>) -> Self {
        Self {
            offset,
            prev_chained,
        }
    }

    pub fn prev_chained_digest(&self) -> Option<&BlockDigest> {
        self.prev_chained.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Chain the next block in; returns the block's [`ChainHash`].
    pub fn push_block(&mut self, block_size: usize, data_digest: BlockDigest) -> ChainHash {
        let chained = chained_digest(self.prev_chained.as_ref(), &data_digest);

        let offset = self.offset;
        self.offset += block_size as u64;
        self.prev_chained = Some(chained);

        ChainHash {
            offset,
            digest: chained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn chain_is_order_sensitive() {
        let d1 = data_digest(b"one");
        let d2 = data_digest(b"two");

        let mut a = ChainHasher::new();
        a.push_block(3, d1);
        let a2 = a.push_block(3, d2);

        let mut b = ChainHasher::new();
        b.push_block(3, d2);
        let b2 = b.push_block(3, d1);

        assert_ne!(a2.digest, b2.digest);
        assert_eq!(a2.offset, 3);
        assert_eq!(b2.offset, 3);
    }

    #[test]
    fn first_chain_hash_is_plain_rehash() {
        let d = data_digest(b"block");
        let mut hasher = ChainHasher::new();
        let ch = hasher.push_block(5, d);

        let expect: BlockDigest = Sha512::digest(d).into();
        assert_eq!(ch.digest, expect);
        assert_eq!(ch.offset, 0);
    }

    #[test]
    fn resumed_chain_matches_straight_run() {
        let blocks: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];

        let mut whole = ChainHasher::new();
        let mut hashes = Vec::new();
        for b in blocks {
            hashes.push(whole.push_block(b.len(), data_digest(b)));
        }

        // Restart at block 1 using block 0's chain hash as seed.
        let mut resumed = ChainHasher::resume(4, Some(hashes[0].digest));
        assert_eq!(resumed.push_block(4, data_digest(blocks[1])), hashes[1]);
        assert_eq!(resumed.push_block(2, data_digest(blocks[2])), hashes[2]);
    }

    #[test]
    fn block_signatures_bind_id_offset_and_chain() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key();
        let id = "d6076384-2295-462b-a047-fe2c9274e58d";

        let mut hasher = ChainHasher::new();
        let ch = hasher.push_block(4, data_digest(b"data"));
        let sig = ch.sign(&key, id);

        assert!(ch.verify(&pk, id, &sig));
        assert!(!ch.verify(&pk, "other-injection", &sig));

        let moved = ChainHash {
            offset: ch.offset + 4,
            digest: ch.digest,
        };
        assert!(!moved.verify(&pk, id, &sig));
    }
}
