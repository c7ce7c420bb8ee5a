//! On-disk layout of one cached response: the `head`, `body` and `sigs`
//! files, and the writer that splits a verified part stream into them.

use crate::error::{Error, Result};
use crate::httpmsg::{format_extension, Head, Part, PartStream, Trailer};
use crate::sign::chain::{self, BlockDigest};
use crate::sign::head::{merge_trailer, BlockSigsParams};
use crate::sign::{EXT_HASH, EXT_SIG, HDR_BSIGS, HDR_URI};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const HEAD_FNAME: &str = "head";
pub const BODY_FNAME: &str = "body";
pub const SIGS_FNAME: &str = "sigs";

/// `sigs` lines are fixed width: a 16-digit hex offset and three 88-char
/// base64 fields (Ed25519 signature, SHA-512 data digest, previous chain
/// digest), space separated, LF terminated.
pub const SIG_LINE_LEN: usize = 16 + 1 + 88 + 1 + 88 + 1 + 88 + 1;

/// Base64 of 64 zero bytes, standing in for the absent `CHASH[-1]`.
pub fn pad_digest() -> String {
    B64.encode([0u8; chain::DIGEST_LEN])
}

/// One `sigs` file record: `OFFSET SIG[i] DHASH[i] CHASH[i-1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigEntry {
    pub offset: u64,
    pub signature: String,
    pub data_digest: String,
    /// Empty when this is the first block.
    pub prev_digest: String,
}

impl SigEntry {
    pub fn line(&self) -> String {
        let prev = if self.prev_digest.is_empty() {
            pad_digest()
        } else {
            self.prev_digest.clone()
        };
        format!(
            "{:016x} {} {} {}\n",
            self.offset, self.signature, self.data_digest, prev
        )
    }

    pub fn parse(line: &str) -> Result<SigEntry> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 4 {
            return Err(Error::BadMessage("malformed signature line"));
        }

        let offset_ok = fields[0].len() == 16
            && fields[0].bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        let b64_ok = |f: &str| {
            f.len() == 88
                && f.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
        };
        if !offset_ok || !fields[1..].iter().all(|f| b64_ok(f)) {
            return Err(Error::BadMessage("malformed signature line"));
        }

        let offset = u64::from_str_radix(fields[0], 16)
            .map_err(|_| Error::BadMessage("malformed signature line"))?;
        let prev = if fields[3] == pad_digest() {
            String::new()
        } else {
            fields[3].to_owned()
        };

        Ok(SigEntry {
            offset,
            signature: fields[1].to_owned(),
            data_digest: fields[2].to_owned(),
            prev_digest: prev,
        })
    }

    /// The chunk extensions this record contributes when read back.
    pub fn chunk_exts(&self) -> String {
        let mut exts = String::new();
        if !self.signature.is_empty() {
            exts.push_str(&format_extension(EXT_SIG, &self.signature));
        }
        if !self.prev_digest.is_empty() {
            exts.push_str(&format_extension(EXT_HASH, &self.prev_digest));
        }
        exts
    }

    pub fn decoded_signature(&self) -> Option<[u8; 64]> {
        B64.decode(&self.signature).ok()?.try_into().ok()
    }

    pub fn decoded_data_digest(&self) -> Option<BlockDigest> {
        B64.decode(&self.data_digest).ok()?.try_into().ok()
    }

    pub fn decoded_prev_digest(&self) -> Option<BlockDigest> {
        if self.prev_digest.is_empty() {
            return None;
        }
        B64.decode(&self.prev_digest).ok()?.try_into().ok()
    }
}

/// Consume a (verified) signed response stream into `head`, `body` and
/// `sigs` files under `dir`. A truncated stream leaves a valid incomplete
/// entry; a malformed one is an error and the caller discards the
/// directory.
pub async fn write_entry<S: PartStream + Send>(
    reader: &mut S,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut head: Option<Head> = None;
    let mut head_file: Option<File> = None;
    let mut body_file: Option<File> = None;
    let mut sigs_file: Option<File> = None;

    let mut block_size = 0u64;
    let mut byte_count = 0u64;
    let mut block_count = 0u64;
    let mut block_hash = sha2::Sha512::default();
    let mut prev_chained: Option<BlockDigest> = None;

    while let Some(part) = reader.read_part(cancel).await? {
        match part {
            Part::Head(inh) => {
                if head.is_some() {
                    return Err(Error::BadMessage("second head in response"));
                }
                if inh.get(HDR_URI).map(str::is_empty).unwrap_or(true) {
                    return Err(Error::InvalidArgument("missing URI in signed head"));
                }
                let params = inh
                    .get(HDR_BSIGS)
                    .and_then(BlockSigsParams::parse)
                    .ok_or(Error::InvalidArgument("missing block signature params"))?;
                block_size = params.size;

                let merged = merge_trailer(inh, &Trailer::new());
                let mut file = File::create(dir.join(HEAD_FNAME)).await?;
                file.write_all(&merged.to_bytes()).await?;
                head = Some(merged);
                head_file = Some(file);
            }
            Part::ChunkHdr(ch) => {
                // Only chunk headers carrying a signature produce records.
                let Some(signature) = ch.ext(EXT_SIG) else {
                    continue;
                };

                let offset = block_count * block_size;
                block_count += 1;
                if ch.size > 0 && byte_count != block_count * block_size {
                    warn!(byte_count, "block signature not aligned to block boundary");
                    return Err(Error::InvalidArgument("unaligned block signature"));
                }

                use sha2::Digest;
                let data_digest: BlockDigest =
                    std::mem::take(&mut block_hash).finalize().into();

                let entry = SigEntry {
                    offset,
                    signature,
                    data_digest: B64.encode(data_digest),
                    prev_digest: prev_chained.map(|d| B64.encode(d)).unwrap_or_default(),
                };
                prev_chained = Some(chain::chained_digest(prev_chained.as_ref(), &data_digest));

                if sigs_file.is_none() {
                    sigs_file = Some(File::create(dir.join(SIGS_FNAME)).await?);
                }
                sigs_file
                    .as_mut()
                    .expect("created above")
                    .write_all(entry.line().as_bytes())
                    .await?;
            }
            Part::ChunkBody(data) => {
                use sha2::Digest;
                if body_file.is_none() {
                    body_file = Some(File::create(dir.join(BODY_FNAME)).await?);
                }
                byte_count += data.len() as u64;
                block_hash.update(&data);
                body_file
                    .as_mut()
                    .expect("created above")
                    .write_all(&data)
                    .await?;
            }
            Part::Trailer(trailer) => {
                if trailer.is_empty() {
                    continue;
                }
                let current = head.take().ok_or(Error::BadMessage("trailer before head"))?;
                let merged = merge_trailer(current, &trailer);

                let file = head_file.as_mut().ok_or(Error::BadMessage("trailer before head"))?;
                file.set_len(0).await?;
                use tokio::io::AsyncSeekExt;
                file.seek(std::io::SeekFrom::Start(0)).await?;
                file.write_all(&merged.to_bytes()).await?;
                head = Some(merged);
            }
        }
    }

    if head.is_none() {
        return Err(Error::BadMessage("empty response stream"));
    }

    for file in [head_file, body_file, sigs_file].into_iter().flatten() {
        file.sync_all().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_line_fixed_width_round_trip() {
        let entry = SigEntry {
            offset: 65536,
            signature: "c".repeat(88),
            data_digest: "d".repeat(88),
            prev_digest: String::new(),
        };

        let line = entry.line();
        assert_eq!(line.len(), SIG_LINE_LEN);
        assert!(line.starts_with("0000000000010000 "));
        assert!(line.ends_with(&format!("{}\n", pad_digest())));

        assert_eq!(SigEntry::parse(&line).unwrap(), entry);
    }

    #[test]
    fn sig_line_keeps_prev_digest() {
        let entry = SigEntry {
            offset: 0,
            signature: "A".repeat(88),
            data_digest: "B".repeat(88),
            prev_digest: "C".repeat(88),
        };

        let parsed = SigEntry::parse(&entry.line()).unwrap();
        assert_eq!(parsed.prev_digest, "C".repeat(88));
    }

    #[test]
    fn sig_line_rejects_garbage() {
        assert!(SigEntry::parse("not a line").is_err());
        assert!(SigEntry::parse(&format!(
            "zzzz {} {} {}",
            "a".repeat(88),
            "a".repeat(88),
            "a".repeat(88)
        ))
        .is_err());
        // Wrong field width.
        assert!(SigEntry::parse(&format!(
            "0000000000000000 {} {} {}",
            "a".repeat(87),
            "a".repeat(88),
            "a".repeat(88)
        ))
        .is_err());
    }

    #[test]
    fn chunk_exts_omit_missing_prev() {
        let first = SigEntry {
            offset: 0,
            signature: "U0lH".to_owned() + &"A".repeat(84),
            data_digest: "B".repeat(88),
            prev_digest: String::new(),
        };
        assert!(first.chunk_exts().contains("ouisig"));
        assert!(!first.chunk_exts().contains("ouihash"));

        let later = SigEntry {
            prev_digest: "C".repeat(88),
            ..first
        };
        assert!(later.chunk_exts().contains("ouihash"));
    }
}
