//! Streaming signer and verifier for cached responses.
//!
//! Both wrap a part stream and present another one: the signer turns an
//! ordinary response into the signed chunked form (one chunk per data
//! block, signatures in chunk extensions, completion trailer); the
//! verifier checks a signed stream block by block and re-emits it.

use super::chain::{self, BlockDigest, BlockSignature, ChainHasher};
use super::head::{
    http_digest_header, parse_injection, sign_head, signature_trailer, verify_head,
    BlockSigsParams,
};
use super::{EXT_HASH, EXT_SIG, HDR_BSIGS, HDR_DATA_SIZE, HDR_HTTP_STATUS};
use crate::constants::{DATA_BLOCK_SIZE, MAX_DATA_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::httpmsg::{
    format_extension, ByteRange, ChunkHdr, Head, Part, PartStream, Trailer,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Chunk extension string for a block signature and an optional chain
/// hash seed.
pub(crate) fn block_chunk_ext(
    sig: Option<&BlockSignature>,
    hash: Option<&BlockDigest>,
) -> String {
    let mut exts = String::new();
    if let Some(sig) = sig {
        exts.push_str(&format_extension(EXT_SIG, &B64.encode(sig)));
    }
    if let Some(hash) = hash {
        exts.push_str(&format_extension(EXT_HASH, &B64.encode(hash)));
    }
    exts
}

fn decode_ext_array<const N: usize>(hdr: &ChunkHdr, name: &str) -> Option<[u8; N]> {
    let value = hdr.ext(name)?;
    let decoded = B64.decode(value).ok()?;
    decoded.try_into().ok()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Tracks which signature/hash pair the next emitted chunk must carry:
/// the chunk for block `i` travels with `SIG[i-1]` and `CHASH[i-2]`.
#[derive(Debug, Default)]
struct ExtShift {
    prev_sig: Option<BlockSignature>,
    prev_chash: Option<BlockDigest>,
    prev_prev_chash: Option<BlockDigest>,
}

impl ExtShift {
    fn seeded(seed: Option<BlockDigest>) -> Self {
        Self {
            prev_chash: seed,
            ..Default::default()
        }
    }

    /// Extension for the chunk emitted now, then advance past a block
    /// with signature `sig` and chain hash `chash`.
    fn take_and_advance(&mut self, sig: BlockSignature, chash: BlockDigest) -> String {
        let exts = block_chunk_ext(self.prev_sig.as_ref(), self.prev_prev_chash.as_ref());
        self.prev_prev_chash = self.prev_chash.take();
        self.prev_chash = Some(chash);
        self.prev_sig = Some(sig);
        exts
    }

    /// Extension for the final zero-size chunk: the last block's
    /// signature and its predecessor's chain hash.
    fn final_ext(&self) -> String {
        block_chunk_ext(self.prev_sig.as_ref(), self.prev_prev_chash.as_ref())
    }
}

// ---- SigningReader -------------------------------------------------------

/// Wraps a plain response stream, producing the signed chunked form.
pub struct SigningReader<S> {
    source: S,
    key: SigningKey,
    uri: String,
    injection_id: String,
    injection_ts: u64,
    block_size: usize,

    head: Option<Head>,
    qbuf: Vec<u8>,
    chain: ChainHasher,
    exts: ExtShift,
    body_length: u64,
    body_hash: Sha256,
    blocks_emitted: u64,
    pending: VecDeque<Part>,
    upstream_done: bool,
    done: bool,
}

impl<S: PartStream + Send> SigningReader<S> {
    pub fn new(
        source: S,
        uri: impl Into<String>,
        injection_id: impl Into<String>,
        injection_ts: u64,
        key: SigningKey,
    ) -> Self {
        Self::with_block_size(source, uri, injection_id, injection_ts, key, DATA_BLOCK_SIZE)
    }

    pub fn with_block_size(
        source: S,
        uri: impl Into<String>,
        injection_id: impl Into<String>,
        injection_ts: u64,
        key: SigningKey,
        block_size: usize,
    ) -> Self {
        Self {
            source,
            key,
            uri: uri.into(),
            injection_id: injection_id.into(),
            injection_ts,
            block_size,
            head: None,
            qbuf: Vec::new(),
            chain: ChainHasher::new(),
            exts: ExtShift::default(),
            body_length: 0,
            body_hash: Sha256::new(),
            blocks_emitted: 0,
            pending: VecDeque::new(),
            upstream_done: false,
            done: false,
        }
    }

    fn complete_block(&mut self, data: Vec<u8>) -> (ChunkHdr, Vec<u8>) {
        let digest = chain::data_digest(&data);
        let chain_hash = self.chain.push_block(data.len(), digest);
        let sig = chain_hash.sign(&self.key, &self.injection_id);
        let exts = self.exts.take_and_advance(sig, chain_hash.digest);
        self.blocks_emitted += 1;
        (ChunkHdr::new(data.len(), exts), data)
    }

    fn drain_full_blocks(&mut self) {
        while self.qbuf.len() >= self.block_size {
            let rest = self.qbuf.split_off(self.block_size);
            let block = std::mem::replace(&mut self.qbuf, rest);
            let (hdr, body) = self.complete_block(block);
            self.pending.push_back(Part::ChunkHdr(hdr));
            self.pending.push_back(Part::ChunkBody(body));
        }
    }

    fn finish(&mut self) {
        let rest = std::mem::take(&mut self.qbuf);
        if !rest.is_empty() {
            let (hdr, body) = self.complete_block(rest);
            self.pending.push_back(Part::ChunkHdr(hdr));
            self.pending.push_back(Part::ChunkBody(body));
        } else if self.blocks_emitted == 0 {
            // Zero-length body still gets one signed (empty) block.
            let _ = self.complete_block(Vec::new());
        }

        self.pending
            .push_back(Part::ChunkHdr(ChunkHdr::new(0, self.exts.final_ext())));

        let body_hash = std::mem::take(&mut self.body_hash);
        let digest: [u8; 32] = body_hash.finalize().into();
        let head = self.head.as_ref().expect("head precedes body end");
        let trailer = signature_trailer(head, self.body_length, &digest, &self.key, unix_now());
        self.pending.push_back(Part::Trailer(trailer));

        self.done = true;
    }

    pub async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            if self.done {
                return Ok(None);
            }

            if self.upstream_done {
                if self.head.is_none() {
                    return Err(Error::BadMessage("response stream without head"));
                }
                self.finish();
                continue;
            }

            match self.source.read_part(cancel).await? {
                None => self.upstream_done = true,
                Some(Part::Head(inh)) => {
                    let signed = sign_head(
                        inh,
                        &self.uri,
                        &self.injection_id,
                        self.injection_ts,
                        &self.key,
                        self.block_size as u64,
                    );
                    self.head = Some(signed.clone());
                    return Ok(Some(Part::Head(signed)));
                }
                // Origin chunking and extensions are dropped; blocks are
                // re-chunked to the signed block size.
                Some(Part::ChunkHdr(_)) => {}
                Some(Part::ChunkBody(data)) => {
                    self.body_length += data.len() as u64;
                    self.body_hash.update(&data);
                    self.qbuf.extend_from_slice(&data);
                    self.drain_full_blocks();
                }
                // Origin trailers cannot be covered by our signatures.
                Some(Part::Trailer(_)) => {}
            }
        }
    }
}

impl<S: PartStream + Send> PartStream for SigningReader<S> {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send {
        SigningReader::read_part(self, cancel)
    }
}

// ---- VerifyingReader -----------------------------------------------------

struct VerifiedHead {
    head: Head,
    injection_id: String,
    params: BlockSigsParams,
    key: VerifyingKey,
    range: Option<ByteRange>,
}

/// Wraps an inbound signed response stream; every part handed out has
/// been verified against `public_key`. Broken signatures or hash chains
/// surface as [`Error::BadMessage`] before the offending data is
/// delivered.
pub struct VerifyingReader<S> {
    source: S,
    public_key: [u8; 32],

    verified: Option<VerifiedHead>,
    chain: ChainHasher,
    need_seed: bool,
    qbuf: Vec<u8>,
    exts: ExtShift,
    blocks_verified: u64,
    body_length: u64,
    body_hash: Sha256,
    pending: VecDeque<Part>,
    done: bool,
}

impl<S: PartStream + Send> VerifyingReader<S> {
    pub fn new(source: S, public_key: [u8; 32]) -> Self {
        Self {
            source,
            public_key,
            verified: None,
            chain: ChainHasher::new(),
            need_seed: false,
            qbuf: Vec::new(),
            exts: ExtShift::default(),
            blocks_verified: 0,
            body_length: 0,
            body_hash: Sha256::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// The verified head, once the head part has been read.
    pub fn head(&self) -> Option<&Head> {
        self.verified.as_ref().map(|v| &v.head)
    }

    fn process_head(&mut self, mut inh: Head) -> Result<Part> {
        // A partial response is verified under its original status.
        let received_status = inh.status;
        let mut range = None;
        if received_status == 206 {
            let orig: u16 = inh
                .get(HDR_HTTP_STATUS)
                .and_then(|v| v.parse().ok())
                .ok_or(Error::BadMessage("partial response without original status"))?;
            let content_range = inh
                .get("Content-Range")
                .and_then(ByteRange::parse)
                .ok_or(Error::BadMessage("partial response without content range"))?;
            range = Some(content_range);
            inh.status = orig;
            inh.reason = String::new();
            inh.remove(HDR_HTTP_STATUS);
            inh.remove("Content-Range");
        }

        let head = verify_head(inh, &self.public_key)
            .ok_or(Error::BadMessage("head signature verification failed"))?;

        if !head.is_chunked() {
            return Err(Error::BadMessage("signed response is not chunked"));
        }

        let params = head
            .get(HDR_BSIGS)
            .and_then(BlockSigsParams::parse)
            .ok_or(Error::BadMessage("missing or malformed block signature params"))?;
        if params.size > MAX_DATA_BLOCK_SIZE as u64 {
            return Err(Error::BadMessage("signed block size too large"));
        }
        let key = params
            .verifying_key()
            .ok_or(Error::BadMessage("invalid block signing key"))?;

        let (injection_id, _) =
            parse_injection(&head).ok_or(Error::BadMessage("missing injection identifier"))?;

        if let Some(range) = &range {
            if range.first % params.size != 0 {
                return Err(Error::BadMessage("range does not start on a block boundary"));
            }
            if let Some(expected) = head.get(HDR_DATA_SIZE).and_then(|v| v.parse::<u64>().ok())
            {
                if range.last >= expected {
                    return Err(Error::BadMessage("range beyond signed data size"));
                }
            }
            self.chain = ChainHasher::resume(range.first, None);
            self.need_seed = range.first > 0;
        }

        // Hand out the head under the status it arrived with; the
        // original one moves (back) into its own header.
        let mut out = head.clone();
        if let Some(range) = &range {
            out.set(HDR_HTTP_STATUS, head.status.to_string());
            out.set("Content-Range", range.to_content_range());
            out.status = received_status;
            out.reason = String::new();
        }

        self.verified = Some(VerifiedHead {
            head,
            injection_id,
            params,
            key,
            range,
        });

        Ok(Part::Head(out))
    }

    fn process_chunk_hdr(&mut self, inch: ChunkHdr) -> Result<Option<Part>> {
        let verified = self
            .verified
            .as_ref()
            .ok_or(Error::BadMessage("chunk before head"))?;
        let block_size = verified.params.size as usize;

        if inch.size > block_size {
            return Err(Error::BadMessage("chunk exceeds signed block size"));
        }

        let block: Vec<u8> = if self.qbuf.len() >= block_size {
            let rest = self.qbuf.split_off(block_size);
            std::mem::replace(&mut self.qbuf, rest)
        } else if inch.size == 0 {
            let rest = std::mem::take(&mut self.qbuf);
            if rest.is_empty() && self.blocks_verified > 0 {
                // Nothing left to verify; the stream ends here.
                return Ok(None);
            }
            rest
        } else {
            // Keep buffering this block.
            return Ok(None);
        };

        let sig: BlockSignature = decode_ext_array(&inch, EXT_SIG)
            .ok_or(Error::BadMessage("missing or malformed block signature"))?;

        if self.need_seed {
            let seed: BlockDigest = decode_ext_array(&inch, EXT_HASH)
                .ok_or(Error::BadMessage("missing chain hash for ranged block"))?;
            self.chain = ChainHasher::resume(self.chain.offset(), Some(seed));
            self.exts = ExtShift::seeded(Some(seed));
            self.need_seed = false;
        }

        let digest = chain::data_digest(&block);
        let chain_hash = self.chain.push_block(block.len(), digest);
        if !chain_hash.verify(&verified.key, &verified.injection_id, &sig) {
            warn!(offset = chain_hash.offset, "block signature verification failed");
            return Err(Error::BadMessage("block signature verification failed"));
        }
        self.blocks_verified += 1;

        let exts = self.exts.take_and_advance(sig, chain_hash.digest);
        if block.is_empty() {
            return Ok(None);
        }

        let hdr = ChunkHdr::new(block.len(), exts);
        self.pending.push_back(Part::ChunkBody(block));
        Ok(Some(Part::ChunkHdr(hdr)))
    }

    fn process_trailer(&mut self, trailer: Trailer) -> Result<Part> {
        let verified = self
            .verified
            .as_mut()
            .ok_or(Error::BadMessage("trailer before head"))?;

        // Fold the trailer into the head; new signatures must verify.
        let mut extended = verified.head.clone();
        let mut sigs_in_trailer = false;
        for (name, value) in trailer.headers() {
            extended.insert(name, value.clone());
            if super::is_signature_header(name) {
                sigs_in_trailer = true;
            }
        }
        if sigs_in_trailer {
            extended = verify_head(extended, &self.public_key)
                .ok_or(Error::BadMessage("trailer signature verification failed"))?;
        }
        verified.head = extended;

        self.check_body()?;

        self.pending.push_back(Part::Trailer(trailer));
        Ok(Part::ChunkHdr(ChunkHdr::new(0, self.exts.final_ext())))
    }

    fn check_body(&self) -> Result<()> {
        let verified = self.verified.as_ref().expect("checked by caller");

        let signed_length: u64 = verified
            .head
            .get(HDR_DATA_SIZE)
            .and_then(|v| v.parse().ok())
            .ok_or(Error::BadMessage("missing signed data size"))?;

        let expected = match &verified.range {
            Some(range) => range.byte_len(),
            None => signed_length,
        };
        if expected != self.body_length {
            warn!(
                got = self.body_length,
                expected, "body length does not match"
            );
            return Err(Error::BadMessage("body length mismatch"));
        }

        // A partial body cannot be checked against the whole-body digest.
        if verified.range.is_some() {
            return Ok(());
        }

        let digest: [u8; 32] = self.body_hash.clone().finalize().into();
        let computed = http_digest_header(&digest);
        for value in verified.head.get_all("Digest") {
            let same_algo = value
                .split('=')
                .next()
                .map(|a| a.eq_ignore_ascii_case("SHA-256"))
                .unwrap_or(false);
            if same_algo && value != computed {
                warn!(got = %computed, signed = value, "body digest mismatch");
                return Err(Error::BadMessage("body digest mismatch"));
            }
        }
        Ok(())
    }

    pub async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            if self.done {
                return Ok(None);
            }

            let Some(part) = self.source.read_part(cancel).await? else {
                // Truncated stream: all delivered blocks were verified,
                // the rest never arrived.
                self.done = true;
                return Ok(None);
            };

            match part {
                Part::Head(inh) => return self.process_head(inh).map(Some),
                Part::ChunkHdr(inch) => {
                    if let Some(part) = self.process_chunk_hdr(inch)? {
                        return Ok(Some(part));
                    }
                }
                Part::ChunkBody(data) => {
                    let block_size = self
                        .verified
                        .as_ref()
                        .map(|v| v.params.size as usize)
                        .ok_or(Error::BadMessage("body before head"))?;
                    if self.qbuf.len() + data.len() > 2 * block_size {
                        return Err(Error::BadMessage("data overflows block boundary"));
                    }
                    self.body_length += data.len() as u64;
                    self.body_hash.update(&data);
                    self.qbuf.extend_from_slice(&data);
                }
                Part::Trailer(trailer) => {
                    let part = self.process_trailer(trailer)?;
                    self.done = true;
                    return Ok(Some(part));
                }
            }
        }
    }
}

impl<S: PartStream + Send> PartStream for VerifyingReader<S> {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send {
        VerifyingReader::read_part(self, cancel)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A canned part sequence as a stream.
    pub struct PartVec(pub VecDeque<Part>);

    impl PartVec {
        pub fn new(parts: Vec<Part>) -> Self {
            Self(parts.into())
        }
    }

    impl PartStream for PartVec {
        fn read_part(
            &mut self,
            _cancel: &CancellationToken,
        ) -> impl Future<Output = Result<Option<Part>>> + Send {
            let next = self.0.pop_front();
            async move { Ok(next) }
        }
    }

    /// The canonical three-block test body: two full blocks with marked
    /// corners plus a four byte tail.
    pub fn three_block_body() -> Vec<Vec<u8>> {
        let fill = DATA_BLOCK_SIZE - 8;
        vec![
            [b"0123".as_slice(), &vec![b'x'; fill], b"4567"].concat(),
            [b"89AB".as_slice(), &vec![b'x'; fill], b"CDEF"].concat(),
            b"abcd".to_vec(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{three_block_body, PartVec};
    use super::*;
    use crate::sign::{HDR_INJECTION, HDR_SIG0, HDR_SIG1, HDR_VERSION};
    use rand::rngs::OsRng;

    const INJECTION_ID: &str = "d6076384-2295-462b-a047-fe2c9274e58d";
    const INJECTION_TS: u64 = 1516048310;

    fn origin_head() -> Head {
        let mut head = Head::new(200);
        head.insert("Date", "Mon, 15 Jan 2018 20:31:50 GMT");
        head.insert("Server", "Apache1");
        head.insert("Content-Type", "text/html");
        head
    }

    fn origin_parts(blocks: &[Vec<u8>]) -> Vec<Part> {
        let mut head = origin_head();
        head.set("Transfer-Encoding", "chunked");
        let mut parts = vec![Part::Head(head)];
        for block in blocks {
            // Origin chunking differs from block boundaries on purpose.
            for piece in block.chunks(40_000) {
                parts.push(Part::ChunkHdr(ChunkHdr::new(piece.len(), String::new())));
                parts.push(Part::ChunkBody(piece.to_vec()));
            }
        }
        parts.push(Part::ChunkHdr(ChunkHdr::new(0, String::new())));
        parts.push(Part::Trailer(Trailer::new()));
        parts
    }

    async fn collect_parts<S: PartStream + Send>(mut stream: S) -> Result<Vec<Part>> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        while let Some(part) = stream.read_part(&cancel).await? {
            out.push(part);
        }
        Ok(out)
    }

    fn signer(key: &SigningKey, blocks: &[Vec<u8>]) -> SigningReader<PartVec> {
        SigningReader::new(
            PartVec::new(origin_parts(blocks)),
            "https://example.com/foo",
            INJECTION_ID,
            INJECTION_TS,
            key.clone(),
        )
    }

    #[tokio::test]
    async fn three_block_signing_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let blocks = three_block_body();

        let parts = collect_parts(signer(&key, &blocks)).await.unwrap();

        // Head, three (hdr, body) pairs, final chunk, trailer.
        assert_eq!(parts.len(), 1 + 3 * 2 + 1 + 1);

        let head = parts[0].as_head().unwrap();
        assert_eq!(head.get(HDR_VERSION), Some("5"));
        assert_eq!(
            head.get(HDR_INJECTION),
            Some(format!("id={INJECTION_ID},ts={INJECTION_TS}").as_str())
        );
        assert!(head.get(HDR_SIG0).is_some());

        let hdrs: Vec<&ChunkHdr> = parts[1..]
            .iter()
            .filter_map(|p| p.as_chunk_hdr())
            .collect();
        assert_eq!(hdrs.len(), 4);
        assert_eq!(hdrs[0].size, DATA_BLOCK_SIZE);
        assert_eq!(hdrs[2].size, 4);
        assert_eq!(hdrs[3].size, 0);

        // First chunk carries no signature; three `ouisig`s follow, the
        // hash seed joins from the third chunk on.
        assert!(hdrs[0].exts.is_empty());
        assert!(hdrs[1].ext(EXT_SIG).is_some());
        assert!(hdrs[1].ext(EXT_HASH).is_none());
        assert!(hdrs[2].ext(EXT_SIG).is_some());
        assert!(hdrs[2].ext(EXT_HASH).is_some());
        assert!(hdrs[3].ext(EXT_SIG).is_some());
        assert!(hdrs[3].ext(EXT_HASH).is_some());

        let trailer = parts.last().unwrap().as_trailer().unwrap();
        assert_eq!(trailer.get(HDR_DATA_SIZE), Some("131076"));
        assert_eq!(
            trailer.get("Digest"),
            Some("SHA-256=E4RswXyAONCaILm5T/ZezbHI87EKvKIdxURKxiVHwKE=")
        );
        assert!(trailer.get(HDR_SIG1).is_some());
    }

    #[tokio::test]
    async fn verifier_accepts_and_mirrors_signed_stream() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let blocks = three_block_body();

        let signed = collect_parts(signer(&key, &blocks)).await.unwrap();
        let verified = collect_parts(VerifyingReader::new(
            PartVec::new(signed.clone()),
            pk,
        ))
        .await
        .unwrap();

        // Verification may reorder head lines (signatures are re-added
        // last); everything else mirrors the input byte for byte.
        assert_eq!(verified.len(), signed.len());
        assert_eq!(&verified[1..], &signed[1..]);

        let sort = |h: &Head| {
            let mut hs: Vec<(String, String)> = h.headers().to_vec();
            hs.sort();
            (h.status, hs)
        };
        assert_eq!(
            sort(verified[0].as_head().unwrap()),
            sort(signed[0].as_head().unwrap())
        );
    }

    #[tokio::test]
    async fn verifier_rejects_tampered_block() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let blocks = three_block_body();

        let mut signed = collect_parts(signer(&key, &blocks)).await.unwrap();
        // Flip one byte inside the second block's body.
        for part in signed.iter_mut() {
            if let Part::ChunkBody(data) = part {
                if data.starts_with(b"89AB") {
                    data[10] ^= 1;
                    break;
                }
            }
        }

        let cancel = CancellationToken::new();
        let mut verifier = VerifyingReader::new(PartVec::new(signed), pk);

        let mut tampered_delivered = false;
        let mut failed = false;
        loop {
            match verifier.read_part(&cancel).await {
                Ok(Some(Part::ChunkBody(data))) => {
                    if data.starts_with(b"89AB") {
                        tampered_delivered = true;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(Error::BadMessage(_)) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }

        assert!(failed);
        assert!(!tampered_delivered);
    }

    #[tokio::test]
    async fn verifier_rejects_wrong_data_size() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let blocks = vec![b"tiny".to_vec()];

        let mut signed = collect_parts(signer(&key, &blocks)).await.unwrap();
        if let Some(Part::Trailer(trailer)) = signed.last_mut() {
            trailer.set(HDR_DATA_SIZE, "5");
        }

        let res = collect_parts(VerifyingReader::new(PartVec::new(signed), pk)).await;
        assert!(matches!(res, Err(Error::BadMessage(_))));
    }

    #[tokio::test]
    async fn truncated_stream_yields_verified_prefix() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let blocks = three_block_body();

        let mut signed = collect_parts(signer(&key, &blocks)).await.unwrap();
        // Keep head, block 0 and block 1 with its header carrying SIG[0];
        // SIG[1] never arrives.
        signed.truncate(5);

        let verified = collect_parts(VerifyingReader::new(PartVec::new(signed), pk))
            .await
            .unwrap();

        // Only the first block could be verified and delivered.
        let bodies: Vec<&[u8]> = verified
            .iter()
            .filter_map(|p| p.as_chunk_body())
            .collect();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].starts_with(b"0123"));
    }

    #[tokio::test]
    async fn single_small_response_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let pk = key.verifying_key().to_bytes();
        let blocks = vec![b"hello world".to_vec()];

        let signed = collect_parts(signer(&key, &blocks)).await.unwrap();
        let verified = collect_parts(VerifyingReader::new(PartVec::new(signed.clone()), pk))
            .await
            .unwrap();

        assert_eq!(&verified[1..], &signed[1..]);
        let trailer = signed.last().unwrap().as_trailer().unwrap();
        assert_eq!(trailer.get(HDR_DATA_SIZE), Some("11"));
    }
}
