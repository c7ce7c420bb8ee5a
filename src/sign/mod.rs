pub mod chain;
pub mod head;
pub mod reader;

pub use head::{BlockSigsParams, HttpSignature};
pub use reader::{SigningReader, VerifyingReader};

/// Headers of the signed cache format.
pub const HDR_VERSION: &str = "X-Ouinet-Version";
pub const HDR_URI: &str = "X-Ouinet-URI";
pub const HDR_INJECTION: &str = "X-Ouinet-Injection";
pub const HDR_BSIGS: &str = "X-Ouinet-BSigs";
pub const HDR_SIG_PREFIX: &str = "X-Ouinet-Sig";
pub const HDR_SIG0: &str = "X-Ouinet-Sig0";
pub const HDR_SIG1: &str = "X-Ouinet-Sig1";
pub const HDR_DATA_SIZE: &str = "X-Ouinet-Data-Size";
pub const HDR_HTTP_STATUS: &str = "X-Ouinet-HTTP-Status";
pub const HDR_AVAIL_DATA: &str = "X-Ouinet-Avail-Data";

/// Chunk extensions carrying the block signature and the chain hash seed.
pub const EXT_SIG: &str = "ouisig";
pub const EXT_HASH: &str = "ouihash";

/// The only supported HTTP signature algorithm.
pub const SIG_ALGORITHM: &str = "hs2019";

pub const KEY_ID_PREFIX: &str = "ed25519=";

/// `X-Ouinet-SigN` detection, returning the signature index.
pub fn signature_header_index(name: &str) -> Option<u32> {
    let rest = name
        .to_ascii_lowercase()
        .strip_prefix(&HDR_SIG_PREFIX.to_ascii_lowercase())?
        .to_owned();
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

pub fn is_signature_header(name: &str) -> bool {
    signature_header_index(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_header_detection() {
        assert_eq!(signature_header_index("X-Ouinet-Sig0"), Some(0));
        assert_eq!(signature_header_index("x-ouinet-sig12"), Some(12));
        assert_eq!(signature_header_index("X-Ouinet-Sig"), None);
        assert_eq!(signature_header_index("X-Ouinet-Signature"), None);
        assert_eq!(signature_header_index("X-Ouinet-BSigs"), None);
    }
}
