//! Readers over a stored entry: the whole response in signed chunked
//! form, a block-aligned range of it, or just the head with the available
//! data range.

use super::entry::{SigEntry, BODY_FNAME, HEAD_FNAME, SIGS_FNAME, SIG_LINE_LEN};
use crate::error::{Error, Result};
use crate::httpmsg::{ByteRange, ChunkHdr, Head, Part, PartStream, Trailer};
use crate::sign::head::BlockSigsParams;
use crate::sign::{HDR_AVAIL_DATA, HDR_BSIGS, HDR_DATA_SIZE, HDR_HTTP_STATUS};
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;

async fn open_optional(path: &Path) -> Result<Option<File>> {
    match File::open(path).await {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

struct EntryFiles {
    head: Head,
    sigs: Option<BufReader<File>>,
    body: Option<File>,
    block_size: u64,
    data_size: Option<u64>,
}

async fn open_entry(dir: &Path) -> Result<EntryFiles> {
    let head_bytes = match tokio::fs::read(dir.join(HEAD_FNAME)).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NotFound),
        Err(e) => return Err(e.into()),
    };
    let head = Head::parse(&head_bytes)?;

    let block_size = head
        .get(HDR_BSIGS)
        .and_then(BlockSigsParams::parse)
        .map(|p| p.size)
        .ok_or(Error::BadMessage("stored head lacks block signature params"))?;
    let data_size = head.get(HDR_DATA_SIZE).and_then(|v| v.parse().ok());

    Ok(EntryFiles {
        head,
        sigs: open_optional(&dir.join(SIGS_FNAME)).await?.map(BufReader::new),
        body: open_optional(&dir.join(BODY_FNAME)).await?,
        block_size,
        data_size,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Head,
    Chunks,
    Trailer,
    Done,
}

/// Streams a stored entry back as head, signed chunks and (for complete
/// entries) a trailer. Incomplete entries end after the last signed
/// block.
pub struct EntryReader {
    out_head: Head,
    sigs: Option<BufReader<File>>,
    body: Option<File>,
    block_size: u64,
    complete: bool,
    range_end: Option<u64>,
    state: State,
    block_offset: u64,
    next_chunk_exts: String,
    next_chunk_body: Option<Vec<u8>>,
}

impl EntryReader {
    /// Whole-response reader.
    pub async fn open(dir: &Path) -> Result<EntryReader> {
        let files = open_entry(dir).await?;
        Self::build(files, None).await
    }

    /// Reader over the blocks covering `first..=last`; the range is
    /// snapped to block boundaries and clipped to the stored data.
    pub async fn open_range(dir: &Path, first: u64, last: u64) -> Result<EntryReader> {
        if first > last {
            warn!(first, last, "inverted range boundaries");
            return Err(Error::InvalidSeek);
        }

        let files = open_entry(dir).await?;
        let Some(body) = &files.body else {
            warn!("range requested for a response with no stored data");
            return Err(Error::InvalidSeek);
        };
        let body_size = body.metadata().await?.len();
        if first >= body_size || last >= body_size {
            warn!(first, last, body_size, "requested range beyond stored data");
            return Err(Error::InvalidSeek);
        }

        let bs = files.block_size;
        let begin = bs * (first / bs);
        let end = (bs * (last / bs + 1)).min(body_size);

        Self::build(files, Some((begin, end))).await
    }

    async fn build(files: EntryFiles, range: Option<(u64, u64)>) -> Result<EntryReader> {
        let EntryFiles {
            head,
            mut sigs,
            mut body,
            block_size,
            data_size,
        } = files;

        let complete = data_size.is_some();
        let mut out_head = head;
        if out_head.is_chunked() || out_head.has("Content-Length") || out_head.has("Trailer") {
            warn!("found framing headers in stored head");
            out_head = out_head.without_framing();
        }

        let mut block_offset = 0;
        let mut range_end = None;

        if let Some((begin, end)) = range {
            let original_status = out_head.status;
            out_head.status = 206;
            out_head.reason = String::new();
            out_head.set(HDR_HTTP_STATUS, original_status.to_string());
            out_head.set(
                "Content-Range",
                ByteRange {
                    first: begin,
                    last: end - 1,
                    total: data_size,
                }
                .to_content_range(),
            );

            if let Some(body) = body.as_mut() {
                body.seek(SeekFrom::Start(begin)).await?;
            }
            if let Some(sigs) = sigs.as_mut() {
                for _ in 0..(begin / block_size) {
                    let mut line = String::with_capacity(SIG_LINE_LEN);
                    sigs.read_line(&mut line).await?;
                }
            }
            block_offset = begin;
            range_end = Some(end);
        }

        out_head.set("Transfer-Encoding", "chunked");

        Ok(EntryReader {
            out_head,
            sigs,
            body,
            block_size,
            complete,
            range_end,
            state: State::Head,
            block_offset,
            next_chunk_exts: String::new(),
            next_chunk_body: None,
        })
    }

    pub fn head(&self) -> &Head {
        &self.out_head
    }

    async fn read_sig_entry(&mut self) -> Result<Option<SigEntry>> {
        let Some(sigs) = self.sigs.as_mut() else {
            return Ok(None);
        };

        let mut line = String::with_capacity(SIG_LINE_LEN);
        let n = sigs.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            warn!("truncated signature line");
            return Err(Error::BadMessage("truncated signature line"));
        }
        SigEntry::parse(&line).map(Some)
    }

    async fn read_chunk_body(&mut self) -> Result<Vec<u8>> {
        let Some(body) = self.body.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out = vec![0u8; self.block_size as usize];
        let mut filled = 0;
        while filled < out.len() {
            let n = body.read(&mut out[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    async fn get_chunk_part(&mut self) -> Result<Option<Part>> {
        if let Some(body) = self.next_chunk_body.take() {
            return Ok(Some(Part::ChunkBody(body)));
        }

        let sig_entry = self.read_sig_entry().await?;
        // With no new signature and nothing pending there is nothing
        // more worth sending.
        if sig_entry.is_none() && self.next_chunk_exts.is_empty() {
            return Ok(None);
        }

        let chunk_body = self.read_chunk_body().await?;

        if let Some(entry) = &sig_entry {
            if entry.offset != self.block_offset {
                warn!(
                    entry = entry.offset,
                    expected = self.block_offset,
                    "data block offset mismatch"
                );
                return Err(Error::BadMessage("data block offset mismatch"));
            }
        }
        self.block_offset += chunk_body.len() as u64;

        if let Some(end) = self.range_end {
            if self.block_offset >= end {
                // Range served; the next read produces the last chunk.
                self.sigs = None;
                self.body = None;
            }
        }

        if chunk_body.is_empty() && self.next_chunk_exts.is_empty() {
            let entry = sig_entry.expect("guarded above");
            return Ok(Some(Part::ChunkHdr(ChunkHdr::new(0, entry.chunk_exts()))));
        }

        let hdr = ChunkHdr::new(
            chunk_body.len(),
            std::mem::take(&mut self.next_chunk_exts),
        );
        match &sig_entry {
            Some(entry) => {
                self.next_chunk_exts = entry.chunk_exts();
                // A block without its signature is withheld.
                if !chunk_body.is_empty() {
                    self.next_chunk_body = Some(chunk_body);
                }
            }
            None => self.next_chunk_exts = String::new(),
        }
        Ok(Some(Part::ChunkHdr(hdr)))
    }

    pub async fn read_part(&mut self, _cancel: &CancellationToken) -> Result<Option<Part>> {
        match self.state {
            State::Head => {
                self.state = State::Chunks;
                Ok(Some(Part::Head(self.out_head.clone())))
            }
            State::Chunks => match self.get_chunk_part().await? {
                None => {
                    self.state = State::Done;
                    Ok(None)
                }
                Some(part) => {
                    if part.as_chunk_hdr().map(|h| h.size == 0).unwrap_or(false) {
                        // Incomplete entries have no trailer to emit.
                        self.state = if self.complete {
                            State::Trailer
                        } else {
                            State::Done
                        };
                    }
                    Ok(Some(part))
                }
            },
            State::Trailer => {
                self.state = State::Done;
                Ok(Some(Part::Trailer(Trailer::new())))
            }
            State::Done => Ok(None),
        }
    }
}

impl PartStream for EntryReader {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send {
        EntryReader::read_part(self, cancel)
    }
}

/// Head-only reader: the stored head plus `X-Ouinet-Avail-Data` derived
/// from the signature records, no body.
pub struct HeadReader {
    out_head: Option<Head>,
}

impl HeadReader {
    pub async fn open(dir: &Path) -> Result<HeadReader> {
        let mut files = open_entry(dir).await?;

        let avail = Self::avail_data(&mut files).await?;
        let mut head = files.head.without_framing();
        head.set(HDR_AVAIL_DATA, avail);

        Ok(HeadReader {
            out_head: Some(head),
        })
    }

    async fn avail_data(files: &mut EntryFiles) -> Result<String> {
        let total = files
            .data_size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "*".to_owned());
        let unsatisfied = format!("bytes */{total}");

        let (Some(sigs), Some(body)) = (files.sigs.as_mut(), files.body.as_ref()) else {
            return Ok(unsatisfied);
        };
        let body_size = body.metadata().await?.len();
        if body_size == 0 {
            return Ok(unsatisfied);
        }

        // The last byte covered by both stored data and a signature.
        let mut last_sig_offset = None;
        loop {
            let mut line = String::with_capacity(SIG_LINE_LEN);
            if sigs.read_line(&mut line).await? == 0 {
                break;
            }
            if !line.ends_with('\n') {
                break;
            }
            last_sig_offset = Some(SigEntry::parse(&line)?.offset);
        }
        let Some(last_sig_offset) = last_sig_offset else {
            return Ok(unsatisfied);
        };

        let bs = files.block_size;
        let end = if body_size > last_sig_offset {
            last_sig_offset + (body_size - last_sig_offset).min(bs)
        } else {
            (body_size / bs) * bs
        };

        Ok(format!("bytes 0-{}/{total}", end - 1))
    }

    pub async fn read_part(&mut self, _cancel: &CancellationToken) -> Result<Option<Part>> {
        Ok(self.out_head.take().map(Part::Head))
    }
}

impl PartStream for HeadReader {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send {
        HeadReader::read_part(self, cancel)
    }
}
