//! The per-entry hash list: every block's data digest plus the signature
//! of the last block, which the chain construction makes a commitment to
//! all of them. Peers exchange it so single blocks can be verified
//! without replaying the whole response.

use super::entry::{SigEntry, HEAD_FNAME, SIGS_FNAME, SIG_LINE_LEN};
use crate::error::{Error, Result};
use crate::httpmsg::{ChunkHdr, Head, Part, PartStream, Trailer};
use crate::sign::chain::{self, BlockDigest, BlockSignature, ChainHash};
use crate::sign::head::{parse_injection, verify_head, BlockSigsParams};
use crate::sign::HDR_BSIGS;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

pub const HASH_LIST_MAGIC: &str = "OUINET_HASH_LIST_V1";

const MAX_WIRE_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HashList {
    /// The (signed) head of the response the hashes belong to.
    pub head: Head,
    /// Signature of the last block, committing to the whole chain.
    pub signature: BlockSignature,
    /// `DHASH[i]` per block.
    pub block_hashes: Vec<BlockDigest>,
}

impl HashList {
    pub fn params(&self) -> Option<BlockSigsParams> {
        self.head.get(HDR_BSIGS).and_then(BlockSigsParams::parse)
    }

    /// Recompute the chain over the data digests and check the final
    /// signature against the head's key and injection id.
    pub fn verify(&self) -> bool {
        if self.block_hashes.is_empty() {
            return false;
        }
        let Some(params) = self.params() else {
            return false;
        };
        let Some(key) = params.verifying_key() else {
            return false;
        };
        let Some((injection_id, _)) = parse_injection(&self.head) else {
            return false;
        };

        let mut chained: Option<BlockDigest> = None;
        for digest in &self.block_hashes {
            chained = Some(chain::chained_digest(chained.as_ref(), digest));
        }

        let last_offset = (self.block_hashes.len() as u64 - 1) * params.size;
        ChainHash {
            offset: last_offset,
            digest: chained.expect("at least one block"),
        }
        .verify(&key, &injection_id, &self.signature)
    }

    /// Chain hash of block `i-1`, the seed needed to verify block `i`.
    pub fn chain_digest_before(&self, block_index: usize) -> Option<BlockDigest> {
        if block_index == 0 {
            return None;
        }
        let mut chained: Option<BlockDigest> = None;
        for digest in &self.block_hashes[..block_index] {
            chained = Some(chain::chained_digest(chained.as_ref(), digest));
        }
        chained
    }

    // ---- wire form -------------------------------------------------------

    pub fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(HASH_LIST_MAGIC.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.signature);
        for digest in &self.block_hashes {
            out.extend_from_slice(digest);
        }
        out
    }

    pub fn from_body(head: Head, body: &[u8]) -> Result<HashList> {
        let bad = Error::BadMessage("malformed hash list");

        let nl = body
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(Error::BadMessage("malformed hash list"))?;
        if &body[..nl] != HASH_LIST_MAGIC.as_bytes() {
            return Err(bad);
        }

        let rest = &body[nl + 1..];
        if rest.len() < chain::SIGNATURE_LEN {
            return Err(bad);
        }
        let (sig, hashes) = rest.split_at(chain::SIGNATURE_LEN);
        if hashes.is_empty() || hashes.len() % chain::DIGEST_LEN != 0 {
            return Err(bad);
        }

        Ok(HashList {
            head,
            signature: sig.try_into().expect("length checked"),
            block_hashes: hashes
                .chunks(chain::DIGEST_LEN)
                .map(|c| c.try_into().expect("length checked"))
                .collect(),
        })
    }

    /// Serve form: the signed head followed by the list as a chunked
    /// body.
    pub fn to_parts(&self) -> Vec<Part> {
        let mut head = self.head.without_framing();
        head.set("Transfer-Encoding", "chunked");

        let body = self.body_bytes();
        vec![
            Part::Head(head),
            Part::ChunkHdr(ChunkHdr::new(body.len(), String::new())),
            Part::ChunkBody(body),
            Part::ChunkHdr(ChunkHdr::new(0, String::new())),
            Part::Trailer(Trailer::new()),
        ]
    }

    /// Read a hash list response from a peer and verify everything.
    pub async fn from_stream<S: PartStream + Send>(
        stream: &mut S,
        public_key: &[u8; 32],
        cancel: &CancellationToken,
    ) -> Result<HashList> {
        let head = match stream.read_part(cancel).await? {
            Some(Part::Head(h)) => h,
            _ => return Err(Error::BadMessage("hash list response without head")),
        };
        let head = verify_head(head, public_key)
            .ok_or(Error::BadMessage("hash list head verification failed"))?;

        let mut body = Vec::new();
        while let Some(part) = stream.read_part(cancel).await? {
            if let Part::ChunkBody(data) = part {
                if body.len() + data.len() > MAX_WIRE_BODY {
                    return Err(Error::BadMessage("hash list too large"));
                }
                body.extend_from_slice(&data);
            }
        }

        let list = HashList::from_body(head, &body)?;
        if !list.verify() {
            return Err(Error::BadMessage("hash list signature verification failed"));
        }
        Ok(list)
    }
}

/// Assemble the hash list of a stored entry.
pub async fn load_hash_list(dir: &Path) -> Result<HashList> {
    let head_bytes = match tokio::fs::read(dir.join(HEAD_FNAME)).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
        Err(e) => return Err(e.into()),
    };
    let head = Head::parse(&head_bytes)?;

    let sigs = match File::open(dir.join(SIGS_FNAME)).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
        Err(e) => return Err(e.into()),
    };
    let mut sigs = BufReader::new(sigs);

    let mut block_hashes = Vec::new();
    let mut last_entry: Option<SigEntry> = None;
    loop {
        let mut line = String::with_capacity(SIG_LINE_LEN);
        if sigs.read_line(&mut line).await? == 0 {
            break;
        }
        if !line.ends_with('\n') {
            return Err(Error::BadMessage("truncated signature line"));
        }
        let entry = SigEntry::parse(&line)?;
        block_hashes.push(
            entry
                .decoded_data_digest()
                .ok_or(Error::BadMessage("malformed data digest"))?,
        );
        last_entry = Some(entry);
    }

    let last_entry = last_entry.ok_or(Error::BadMessage("entry has no signed blocks"))?;
    let signature = last_entry
        .decoded_signature()
        .ok_or(Error::BadMessage("malformed block signature"))?;

    Ok(HashList {
        head,
        signature,
        block_hashes,
    })
}
