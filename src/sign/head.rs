//! Response head signing and verification: draft-cavage HTTP signatures
//! restricted to Ed25519/`hs2019`, the `X-Ouinet-Sig0`/`Sig1` pair, the
//! `X-Ouinet-BSigs` block signature parameters, and merging of the
//! signature trailer into a completed head.

use super::{
    is_signature_header, HDR_BSIGS, HDR_DATA_SIZE, HDR_INJECTION, HDR_SIG0, HDR_SIG1,
    HDR_SIG_PREFIX, HDR_URI, HDR_VERSION, KEY_ID_PREFIX, SIG_ALGORITHM,
};
use crate::constants::PROTOCOL_VERSION;
use crate::httpmsg::{Head, Trailer};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashSet;
use tracing::{debug, warn};

/// `keyId` carrying the public key itself.
pub fn http_key_id(public_key: &[u8; 32]) -> String {
    format!("{KEY_ID_PREFIX}{}", B64.encode(public_key))
}

pub fn decode_key_id(key_id: &str) -> Option<[u8; 32]> {
    let b64 = key_id.strip_prefix(KEY_ID_PREFIX)?;
    let bytes = B64.decode(b64).ok()?;
    bytes.try_into().ok()
}

/// `Digest` header value per RFC 3230.
pub fn http_digest_header(sha256: &[u8; 32]) -> String {
    format!("SHA-256={}", B64.encode(sha256))
}

pub fn injection_header_value(injection_id: &str, injection_ts: u64) -> String {
    format!("id={injection_id},ts={injection_ts}")
}

/// Pick `id` and `ts` out of `X-Ouinet-Injection`.
pub fn parse_injection(head: &Head) -> Option<(String, u64)> {
    let value = head.get(HDR_INJECTION)?;
    let mut id = None;
    let mut ts = None;
    for item in value.split(',') {
        match item.trim().split_once('=') {
            Some(("id", v)) => id = Some(v.to_owned()),
            Some(("ts", v)) => ts = v.parse().ok(),
            _ => {}
        }
    }
    Some((id?, ts?))
}

fn has_comma_in_quotes(s: &str) -> bool {
    let mut quotes_seen = 0;
    for c in s.chars() {
        if c == '"' {
            quotes_seen += 1;
        } else if c == ',' && quotes_seen % 2 != 0 {
            return true;
        }
    }
    false
}

/// A parsed HTTP signature header value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpSignature {
    pub key_id: String,
    pub algorithm: String,
    pub created: String,
    pub expires: String,
    pub headers: String,
    pub signature: String,
}

impl HttpSignature {
    /// Quoted commas are not supported; such values fail closed.
    pub fn parse(value: &str) -> Option<HttpSignature> {
        if has_comma_in_quotes(value) {
            warn!("commas in quoted HTTP signature parameters are not supported");
            return None;
        }

        let mut sig = HttpSignature {
            // Missing is not the same as empty.
            headers: "(created)".to_owned(),
            ..Default::default()
        };

        for item in value.split(',') {
            let (key, val) = item.trim().split_once('=')?;
            match key {
                // Unquoted parameters.
                "created" => sig.created = val.to_owned(),
                "expires" => sig.expires = val.to_owned(),
                // Quoted parameters.
                "keyId" | "algorithm" | "headers" | "signature" => {
                    if val.len() < 2 || !val.starts_with('"') || !val.ends_with('"') {
                        return None;
                    }
                    let val = val[1..val.len() - 1].to_owned();
                    match key {
                        "keyId" => sig.key_id = val,
                        "algorithm" => sig.algorithm = val,
                        "headers" => sig.headers = val,
                        _ => sig.signature = val,
                    }
                }
                _ => return None,
            }
        }

        if sig.key_id.is_empty() || sig.signature.is_empty() {
            warn!("HTTP signature without key identifier or signature");
            return None;
        }
        Some(sig)
    }

    pub fn created_ts(&self) -> Option<u64> {
        self.created.parse().ok()
    }

    pub fn covered_headers(&self) -> HashSet<String> {
        self.headers
            .split_ascii_whitespace()
            .map(|h| h.to_owned())
            .collect()
    }

    /// Check this signature against `head`; on success return the set of
    /// lowercased header names it covers.
    pub fn verify(&self, head: &Head, key: &VerifyingKey) -> Option<HashSet<String>> {
        let pairs = self.verification_pairs(head)?;
        let (sig_string, _) = signing_string(&pairs);

        let decoded = B64.decode(&self.signature).ok()?;
        let sig_bytes: [u8; 64] = decoded.try_into().ok()?;
        key.verify(sig_string.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .ok()?;

        Some(self.covered_headers())
    }

    fn verification_pairs(&self, head: &Head) -> Option<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        for name in self.headers.split_ascii_whitespace() {
            if let Some(pseudo) = name.strip_prefix('(') {
                let value = match pseudo.strip_suffix(')')? {
                    "response-status" => head.status.to_string(),
                    "created" => self.created.clone(),
                    "expires" => self.expires.clone(),
                    other => {
                        warn!(pseudo = other, "unknown HTTP signature pseudo-header");
                        return None;
                    }
                };
                if value.is_empty() {
                    return None;
                }
                pairs.push((name.to_owned(), value));
            } else {
                // A listed but missing header fails the verification; an
                // empty one is fine.
                let mut values = head.get_all(name).peekable();
                values.peek()?;
                let joined = values
                    .map(str::trim)
                    .collect::<Vec<_>>()
                    .join(", ");
                pairs.push((name.to_owned(), joined));
            }
        }
        Some(pairs)
    }
}

/// Lowercase names, merge duplicates, keep input order.
fn prepared_pairs(head: &Head) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for (name, value) in head.headers() {
        let name = name.to_ascii_lowercase();
        let value = value.trim();
        match out.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => out.push((name, value.to_owned())),
        }
    }
    out
}

fn signing_string(pairs: &[(String, String)]) -> (String, String) {
    let sig_string = pairs
        .iter()
        .map(|(n, v)| format!("{n}: {v}"))
        .collect::<Vec<_>>()
        .join("\n");
    let headers = pairs
        .iter()
        .map(|(n, _)| n.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    (sig_string, headers)
}

/// Produce an HTTP signature header value over `head` (which should
/// already be stripped of framing and of the signatures to exclude).
pub fn http_signature(head: &Head, key: &SigningKey, key_id: &str, created_ts: u64) -> String {
    let mut pairs = vec![
        ("(response-status)".to_owned(), head.status.to_string()),
        ("(created)".to_owned(), created_ts.to_string()),
    ];
    pairs.extend(prepared_pairs(head));

    let (sig_string, headers) = signing_string(&pairs);
    let signature = B64.encode(key.sign(sig_string.as_bytes()).to_bytes());

    format!(
        "keyId=\"{key_id}\",algorithm=\"{SIG_ALGORITHM}\",created={created_ts},\
         headers=\"{headers}\",signature=\"{signature}\""
    )
}

/// Block signature parameters from `X-Ouinet-BSigs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSigsParams {
    pub public_key: [u8; 32],
    pub size: u64,
}

impl BlockSigsParams {
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key).ok()
    }

    pub fn to_header_value(&self) -> String {
        format!(
            "keyId=\"{}\",algorithm=\"{SIG_ALGORITHM}\",size={}",
            http_key_id(&self.public_key),
            self.size
        )
    }

    pub fn parse(value: &str) -> Option<BlockSigsParams> {
        if has_comma_in_quotes(value) {
            warn!("commas in quoted block signature parameters are not supported");
            return None;
        }

        let mut public_key = None;
        let mut algorithm = String::new();
        let mut size = 0u64;

        for item in value.split(',') {
            let (key, val) = item.trim().split_once('=')?;
            if key == "size" {
                size = val.parse().ok()?;
                continue;
            }
            if val.len() < 2 || !val.starts_with('"') || !val.ends_with('"') {
                warn!("invalid quoting in block signature parameters");
                return None;
            }
            let val = &val[1..val.len() - 1];
            match key {
                "keyId" => public_key = decode_key_id(val),
                "algorithm" => algorithm = val.to_owned(),
                _ => return None,
            }
        }

        if algorithm != SIG_ALGORITHM || size == 0 {
            return None;
        }
        Some(BlockSigsParams {
            public_key: public_key?,
            size,
        })
    }
}

/// Extend a response head for injection: stamp the cache headers, sign the
/// head (`X-Ouinet-Sig0`) and announce the signature trailer.
pub fn sign_head(
    mut head: Head,
    request_uri: &str,
    injection_id: &str,
    injection_ts: u64,
    key: &SigningKey,
    block_size: u64,
) -> Head {
    let key_id = http_key_id(&key.verifying_key().to_bytes());

    head.set(HDR_VERSION, PROTOCOL_VERSION.to_string());
    head.set(HDR_URI, request_uri);
    head.set(HDR_INJECTION, injection_header_value(injection_id, injection_ts));
    head.set(
        HDR_BSIGS,
        BlockSigsParams {
            public_key: key.verifying_key().to_bytes(),
            size: block_size,
        }
        .to_header_value(),
    );

    let to_sign = head.without_framing();
    head.set(HDR_SIG0, http_signature(&to_sign, key, &key_id, injection_ts));

    head.set("Transfer-Encoding", "chunked");
    let announced = format!("{HDR_DATA_SIZE}, Digest, {HDR_SIG1}");
    let trailer_value = match head.get("Trailer") {
        Some(existing) if !existing.is_empty() => format!("{existing}, {announced}"),
        _ => announced,
    };
    head.set("Trailer", trailer_value);

    head
}

/// The completion trailer: data size, body digest and the final signature
/// over head plus trailer fields (minus `Sig0`).
pub fn signature_trailer(
    head: &Head,
    body_length: u64,
    body_sha256: &[u8; 32],
    key: &SigningKey,
    created_ts: u64,
) -> Trailer {
    let key_id = http_key_id(&key.verifying_key().to_bytes());

    let mut trailer = Trailer::new();
    trailer.set(HDR_DATA_SIZE, body_length.to_string());
    trailer.set("Digest", http_digest_header(body_sha256));

    let mut to_sign = head.without_framing();
    to_sign.remove(HDR_SIG0);
    for (name, value) in trailer.headers() {
        to_sign.set(name, value.clone());
    }

    trailer.set(HDR_SIG1, http_signature(&to_sign, key, &key_id, created_ts));
    trailer
}

/// Is signature `a` made redundant by signature `b`?
fn sig_redundant_against(a: &HttpSignature, a_ts: u64, b: &HttpSignature, b_ts: u64) -> bool {
    let a_hdrs = a.covered_headers();
    let b_hdrs = b.covered_headers();
    !(a_ts > b_ts || a_hdrs.difference(&b_hdrs).next().is_some())
}

/// Merge trailer headers into the head, dropping redundant signatures:
/// same key and algorithm, no extra covered headers, not newer.
pub fn merge_trailer(head: Head, trailer: &Trailer) -> Head {
    let mut head = head.without_framing();

    for (name, value) in trailer.headers() {
        if !is_signature_header(name) {
            head.set(name, value.clone());
            continue;
        }

        let Some(new_sig) = HttpSignature::parse(value) else {
            warn!(header = %name, "dropping unparseable trailer signature");
            continue;
        };
        let Some(new_ts) = new_sig.created_ts() else {
            warn!("dropping trailer signature with no creation time stamp");
            continue;
        };

        let mut insert = true;
        let mut kept: Vec<(String, String)> = Vec::new();
        for (hn, hv) in head.headers() {
            if !is_signature_header(hn) {
                kept.push((hn.clone(), hv.clone()));
                continue;
            }
            let keep = match HttpSignature::parse(hv) {
                None => false,
                Some(old_sig) => {
                    if old_sig.key_id != new_sig.key_id || old_sig.algorithm != new_sig.algorithm
                    {
                        true
                    } else {
                        let old_ts = old_sig.created_ts().unwrap_or(0);
                        insert =
                            insert && !sig_redundant_against(&new_sig, new_ts, &old_sig, old_ts);
                        !sig_redundant_against(&old_sig, old_ts, &new_sig, new_ts)
                    }
                }
            };
            if keep {
                kept.push((hn.clone(), hv.clone()));
            }
        }

        if insert {
            kept.push((name.clone(), value.clone()));
        }

        let mut merged = Head::new(head.status);
        merged.reason = head.reason.clone();
        for (n, v) in kept {
            merged.insert(&n, v);
        }
        head = merged;
    }

    head
}

/// Verify the signatures of a head against `public_key`.
///
/// Returns a head holding only headers covered by at least one good
/// signature, the good signatures themselves (renumbered) and signatures
/// for unknown keys; bad signatures are dropped. Framing headers are
/// preserved. `None` when no good signature exists.
pub fn verify_head(head: Head, public_key: &[u8; 32]) -> Option<Head> {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return None;
    };
    let own_key_id = http_key_id(public_key);

    let mut head = head;
    let mut to_verify = head.without_framing();
    let mut sig_headers: Vec<(String, String)> = Vec::new();
    for (name, value) in head.headers() {
        if is_signature_header(name) {
            sig_headers.push((name.clone(), value.clone()));
        }
    }
    for (name, _) in &sig_headers {
        to_verify.remove(name);
        head.remove(name);
    }

    let mut sig_ok = false;
    let mut covered: HashSet<String> = HashSet::new();
    let mut kept_signatures: Vec<String> = Vec::new();

    for (name, value) in &sig_headers {
        let Some(sig) = HttpSignature::parse(value) else {
            warn!(header = %name, "malformed HTTP signature");
            continue;
        };
        if sig.key_id != own_key_id {
            debug!(header = %name, "keeping signature for unknown key");
            kept_signatures.push(value.clone());
            continue;
        }
        if !sig.algorithm.is_empty() && sig.algorithm != SIG_ALGORITHM {
            warn!(header = %name, algorithm = %sig.algorithm, "unsupported signature algorithm");
            continue;
        }
        match sig.verify(&to_verify, &key) {
            None => {
                warn!(header = %name, "head does not match HTTP signature");
            }
            Some(sig_covered) => {
                sig_ok = true;
                kept_signatures.push(value.clone());
                covered.extend(sig_covered);
            }
        }
    }

    if !sig_ok {
        return None;
    }

    // Drop headers no good signature covers; framing stays.
    let verifiable: HashSet<String> = to_verify
        .headers()
        .iter()
        .map(|(n, _)| n.to_ascii_lowercase())
        .collect();
    head.retain(|(name, _)| {
        let lower = name.to_ascii_lowercase();
        let keep = covered.contains(&lower) || !verifiable.contains(&lower);
        if !keep {
            warn!(header = %name, "dropping header not covered by any signature");
        }
        keep
    });

    for (idx, value) in kept_signatures.into_iter().enumerate() {
        head.insert(&format!("{HDR_SIG_PREFIX}{idx}"), value);
    }

    Some(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use sha2::Digest;

    fn test_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn origin_head() -> Head {
        let mut head = Head::new(200);
        head.insert("Date", "Mon, 15 Jan 2018 20:31:50 GMT");
        head.insert("Server", "Apache1");
        head.insert("Server", "Apache2");
        head.insert("Content-Type", "text/html");
        head.insert("Content-Disposition", "inline; filename=\"foo.html\"");
        head
    }

    const INJECTION_ID: &str = "d6076384-2295-462b-a047-fe2c9274e58d";
    const INJECTION_TS: u64 = 1516048310;

    fn signed_origin_head(key: &SigningKey) -> Head {
        sign_head(
            origin_head(),
            "https://example.com/foo",
            INJECTION_ID,
            INJECTION_TS,
            key,
            65536,
        )
    }

    #[test]
    fn sign_head_stamps_and_frames() {
        let key = test_key();
        let head = signed_origin_head(&key);

        assert_eq!(head.get(HDR_VERSION), Some("5"));
        assert_eq!(head.get(HDR_URI), Some("https://example.com/foo"));
        assert_eq!(
            head.get(HDR_INJECTION),
            Some(format!("id={INJECTION_ID},ts={INJECTION_TS}").as_str())
        );
        assert!(head.get(HDR_SIG0).is_some());
        assert!(head.is_chunked());
        assert_eq!(
            head.get("Trailer"),
            Some("X-Ouinet-Data-Size, Digest, X-Ouinet-Sig1")
        );

        let bsigs = BlockSigsParams::parse(head.get(HDR_BSIGS).unwrap()).unwrap();
        assert_eq!(bsigs.size, 65536);
        assert_eq!(bsigs.public_key, key.verifying_key().to_bytes());
    }

    #[test]
    fn verify_accepts_signed_head() {
        let key = test_key();
        let pk = key.verifying_key().to_bytes();
        let head = signed_origin_head(&key);

        let verified = verify_head(head.clone(), &pk).expect("head verifies");

        // Everything but the (renumbered) signature matches.
        assert_eq!(verified.get("Server"), head.get("Server"));
        assert_eq!(verified.get(HDR_URI), head.get(HDR_URI));
        assert_eq!(verified.get("X-Ouinet-Sig0"), head.get(HDR_SIG0));
        assert!(verified.is_chunked());
    }

    #[test]
    fn verify_rejects_tampered_head() {
        let key = test_key();
        let pk = key.verifying_key().to_bytes();
        let mut head = signed_origin_head(&key);
        head.set("Content-Type", "text/plain");

        assert!(verify_head(head, &pk).is_none());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let key = test_key();
        let other = test_key();
        let head = signed_origin_head(&key);

        assert!(verify_head(head, &other.verifying_key().to_bytes()).is_none());
    }

    #[test]
    fn verify_drops_uncovered_headers() {
        let key = test_key();
        let pk = key.verifying_key().to_bytes();
        let mut head = signed_origin_head(&key);
        head.insert("X-Added-Later", "not signed");

        let verified = verify_head(head, &pk).unwrap();
        assert!(!verified.has("X-Added-Later"));
        assert!(verified.has("Content-Type"));
    }

    #[test]
    fn verify_keeps_unknown_key_signatures() {
        let key = test_key();
        let pk = key.verifying_key().to_bytes();
        let mut head = signed_origin_head(&key);
        head.insert(
            "X-Ouinet-Sig7",
            "keyId=\"ed25519=c3R1Yg==\",algorithm=\"hs2019\",created=1,\
             headers=\"(created)\",signature=\"Zm9v\"",
        );

        let verified = verify_head(head, &pk).unwrap();
        let sigs: Vec<&str> = verified
            .headers()
            .iter()
            .filter(|(n, _)| is_signature_header(n))
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(sigs, vec!["X-Ouinet-Sig0", "X-Ouinet-Sig1"]);
    }

    #[test]
    fn trailer_signature_covers_digest_fields() {
        let key = test_key();
        let pk = key.verifying_key().to_bytes();
        let head = signed_origin_head(&key);

        let digest: [u8; 32] = sha2::Sha256::digest(b"some body").into();
        let trailer = signature_trailer(&head, 9, &digest, &key, INJECTION_TS + 1);

        assert_eq!(trailer.get(HDR_DATA_SIZE), Some("9"));
        assert!(trailer.get("Digest").unwrap().starts_with("SHA-256="));

        let sig1 = HttpSignature::parse(trailer.get(HDR_SIG1).unwrap()).unwrap();
        assert!(sig1.headers.contains("x-ouinet-data-size"));
        assert!(sig1.headers.contains("digest"));
        assert!(!sig1.headers.contains("x-ouinet-sig0"));

        // The merged head still verifies, now through Sig1.
        let merged = merge_trailer(head, &trailer);
        assert!(verify_head(merged, &pk).is_some());
    }

    #[test]
    fn merge_prunes_redundant_signatures() {
        let key = test_key();
        let head = signed_origin_head(&key);
        let digest: [u8; 32] = sha2::Sha256::digest(b"x").into();
        let trailer = signature_trailer(&head, 1, &digest, &key, INJECTION_TS + 1);

        let merged = merge_trailer(head, &trailer);

        // Sig1 covers a superset of Sig0's headers and is newer.
        assert!(merged.get(HDR_SIG1).is_some());
        assert!(merged.get(HDR_SIG0).is_none());
        assert!(!merged.has("Transfer-Encoding"));
        assert!(!merged.has("Trailer"));
        assert_eq!(merged.get(HDR_DATA_SIZE), Some("1"));
    }

    #[test]
    fn http_signature_parse_round_trip() {
        let key = test_key();
        let key_id = http_key_id(&key.verifying_key().to_bytes());
        let head = origin_head();

        let value = http_signature(&head.without_framing(), &key, &key_id, 7);
        let sig = HttpSignature::parse(&value).unwrap();

        assert_eq!(sig.key_id, key_id);
        assert_eq!(sig.algorithm, SIG_ALGORITHM);
        assert_eq!(sig.created, "7");
        assert!(sig.headers.starts_with("(response-status) (created)"));
        assert!(sig
            .verify(&head.without_framing(), &key.verifying_key())
            .is_some());
    }

    #[test]
    fn signature_parse_fails_closed_on_quoted_comma() {
        assert!(HttpSignature::parse(
            "keyId=\"a,b\",algorithm=\"hs2019\",signature=\"xx\""
        )
        .is_none());
        assert!(BlockSigsParams::parse("keyId=\"a,b\",algorithm=\"hs2019\",size=1").is_none());
    }

    #[test]
    fn bsigs_round_trip() {
        let params = BlockSigsParams {
            public_key: [7; 32],
            size: 65536,
        };
        assert_eq!(
            BlockSigsParams::parse(&params.to_header_value()),
            Some(params)
        );

        // Unknown algorithms and zero sizes are rejected.
        assert!(BlockSigsParams::parse(
            "keyId=\"ed25519=BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=\",\
             algorithm=\"rsa-sha256\",size=65536"
        )
        .is_none());
    }

    #[test]
    fn injection_parsing() {
        let key = test_key();
        let head = signed_origin_head(&key);
        assert_eq!(
            parse_injection(&head),
            Some((INJECTION_ID.to_owned(), INJECTION_TS))
        );
        assert_eq!(parse_injection(&origin_head()), None);
    }
}
