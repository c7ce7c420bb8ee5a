//! A minimal HTTP/1.1 response model tailored to the signed cache format:
//! a head with ordered headers, chunk headers with signed extensions,
//! chunk bodies and a trailer, plus an async reader that turns a byte
//! stream into that part sequence.

use crate::constants::MAX_DATA_BLOCK_SIZE;
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Response head: status plus headers in insertion order. Header names
/// compare case-insensitively but keep the case they were written with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Head {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
}

pub fn reason_for(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "",
    }
}

impl Head {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_for(status).to_owned(),
            headers: Vec::new(),
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every occurrence of `name` with a single header.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.headers.push((name.to_owned(), value.into()));
    }

    /// Append without touching existing occurrences.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_owned(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn retain(&mut self, keep: impl FnMut(&(String, String)) -> bool) {
        self.headers.retain(keep);
    }

    pub fn is_chunked(&self) -> bool {
        self.get_all("Transfer-Encoding")
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
    }

    /// Drop message framing: chunking, length, trailer announcement.
    pub fn without_framing(&self) -> Head {
        let mut out = self.clone();
        out.remove("Transfer-Encoding");
        out.remove("Content-Length");
        out.remove("Trailer");
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let reason = if self.reason.is_empty() {
            reason_for(self.status).to_owned()
        } else {
            self.reason.clone()
        };
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parse a complete head, terminating blank line included.
    pub fn parse(buf: &[u8]) -> Result<Head> {
        let text = std::str::from_utf8(buf).map_err(|_| Error::BadMessage("head not utf-8"))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().ok_or(Error::BadMessage("empty head"))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(Error::BadMessage("bad status line"));
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::BadMessage("bad status code"))?;
        let reason = parts.next().unwrap_or_default().to_owned();

        let mut head = Head {
            status,
            reason,
            headers: Vec::new(),
        };
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(Error::BadMessage("malformed header line"))?;
            head.headers
                .push((name.trim().to_owned(), value.trim().to_owned()));
        }
        Ok(head)
    }
}

/// Chunk header: size plus raw extension string (`;name="value"` pairs).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkHdr {
    pub size: usize,
    pub exts: String,
}

impl ChunkHdr {
    pub fn new(size: usize, exts: String) -> Self {
        Self { size, exts }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{:x}{}\r\n", self.size, self.exts).into_bytes()
    }

    pub fn parse_line(line: &str) -> Result<ChunkHdr> {
        let (size_str, exts) = match line.find(';') {
            Some(pos) => (&line[..pos], &line[pos..]),
            None => (line, ""),
        };
        let size = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| Error::BadMessage("bad chunk size"))?;

        // Validate the extension syntax up front.
        parse_extensions(exts)?;

        Ok(ChunkHdr {
            size,
            exts: exts.to_owned(),
        })
    }

    pub fn ext(&self, name: &str) -> Option<String> {
        parse_extensions(&self.exts)
            .ok()?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

fn has_comma_in_quotes(s: &str) -> bool {
    // A comma is inside quotes when preceded by an odd number of quotes.
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

/// Parse `;name="value"` chunk extensions. Quoted commas are not
/// supported by the downstream parameter parsers, so they are rejected
/// outright rather than mis-split later.
pub fn parse_extensions(exts: &str) -> Result<Vec<(String, String)>> {
    if has_comma_in_quotes(exts) {
        return Err(Error::BadMessage("comma inside quoted chunk extension"));
    }

    let mut out = Vec::new();
    for item in exts.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('=') {
            None => out.push((item.to_owned(), String::new())),
            Some((name, value)) => {
                let value = if value.starts_with('"') {
                    if value.len() < 2 || !value.ends_with('"') {
                        return Err(Error::BadMessage("unbalanced quotes in chunk extension"));
                    }
                    &value[1..value.len() - 1]
                } else {
                    value
                };
                out.push((name.trim().to_owned(), value.to_owned()));
            }
        }
    }
    Ok(out)
}

pub fn format_extension(name: &str, value: &str) -> String {
    format!(";{name}=\"{value}\"")
}

/// Trailer headers following the last chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trailer {
    headers: Vec<(String, String)>,
}

impl Trailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.into()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// One element of a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Head(Head),
    ChunkHdr(ChunkHdr),
    ChunkBody(Vec<u8>),
    Trailer(Trailer),
}

impl Part {
    pub fn as_head(&self) -> Option<&Head> {
        match self {
            Part::Head(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_chunk_hdr(&self) -> Option<&ChunkHdr> {
        match self {
            Part::ChunkHdr(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_chunk_body(&self) -> Option<&[u8]> {
        match self {
            Part::ChunkBody(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_trailer(&self) -> Option<&Trailer> {
        match self {
            Part::Trailer(t) => Some(t),
            _ => None,
        }
    }
}

/// Write one part in wire form.
pub async fn write_part<W: AsyncWrite + Unpin>(writer: &mut W, part: &Part) -> Result<()> {
    match part {
        Part::Head(h) => writer.write_all(&h.to_bytes()).await?,
        Part::ChunkHdr(h) => writer.write_all(&h.to_bytes()).await?,
        Part::ChunkBody(b) => {
            writer.write_all(b).await?;
            writer.write_all(b"\r\n").await?;
        }
        Part::Trailer(t) => writer.write_all(&t.to_bytes()).await?,
    }
    Ok(())
}

/// Anything producing a response part sequence.
pub trait PartStream {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send;
}

/// An inclusive HTTP byte range, as in `Content-Range: bytes A-B/Total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub first: u64,
    pub last: u64,
    /// `None` renders as `*` (unknown total).
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn byte_len(&self) -> u64 {
        self.last - self.first + 1
    }

    pub fn to_content_range(self) -> String {
        match self.total {
            Some(total) => format!("bytes {}-{}/{}", self.first, self.last, total),
            None => format!("bytes {}-{}/*", self.first, self.last),
        }
    }

    pub fn parse(value: &str) -> Option<ByteRange> {
        let rest = value.trim().strip_prefix("bytes ")?;
        let (range, total) = rest.split_once('/')?;
        let (first, last) = range.split_once('-')?;

        let first = first.trim().parse().ok()?;
        let last = last.trim().parse().ok()?;
        if last < first {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        if let Some(total) = total {
            if last >= total {
                return None;
            }
        }
        Some(ByteRange { first, last, total })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReaderState {
    Head,
    ChunkHeader,
    ChunkBody { remaining: usize },
    Trailer,
    Done,
}

/// Parse a (chunked) HTTP response from an async byte stream into parts.
/// A clean end-of-input at a part boundary yields `None`, which lets
/// truncated streams of incomplete cache entries be consumed as far as
/// they go.
pub struct ResponseReader<R> {
    reader: R,
    buf: BytesMut,
    state: ReaderState,
}

impl<R: AsyncRead + Unpin + Send> ResponseReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(16 * 1024),
            state: ReaderState::Head,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ReaderState::Done
    }

    /// Read more bytes; false on end of input.
    async fn fill(&mut self, cancel: &CancellationToken) -> Result<bool> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Aborted),
            read = self.reader.read_buf(&mut self.buf) => Ok(read? > 0),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.windows(2).position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf.advance(pos + 2);
        Some(line)
    }

    async fn read_line(&mut self, cancel: &CancellationToken) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if !self.fill(cancel).await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::BadMessage("truncated line"));
            }
        }
    }

    async fn read_head(&mut self, cancel: &CancellationToken) -> Result<Option<Head>> {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = Head::parse(&self.buf[..pos + 4])?;
                self.buf.advance(pos + 4);
                return Ok(Some(head));
            }
            if !self.fill(cancel).await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::BadMessage("truncated head"));
            }
        }
    }

    pub async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        match self.state {
            ReaderState::Head => {
                let Some(head) = self.read_head(cancel).await? else {
                    return Ok(None);
                };
                self.state = if head.is_chunked() {
                    ReaderState::ChunkHeader
                } else {
                    // Only chunked bodies are modeled; anything else is a
                    // bare head (e.g. a head-only cache read).
                    ReaderState::Done
                };
                Ok(Some(Part::Head(head)))
            }
            ReaderState::ChunkHeader => {
                let Some(line) = self.read_line(cancel).await? else {
                    return Ok(None);
                };
                let hdr = ChunkHdr::parse_line(&line)?;
                if hdr.size > MAX_DATA_BLOCK_SIZE {
                    return Err(Error::BadMessage("chunk too large"));
                }
                self.state = if hdr.size == 0 {
                    ReaderState::Trailer
                } else {
                    ReaderState::ChunkBody {
                        remaining: hdr.size,
                    }
                };
                Ok(Some(Part::ChunkHdr(hdr)))
            }
            ReaderState::ChunkBody { remaining } => {
                // Whole chunk body plus its closing CRLF.
                while self.buf.len() < remaining + 2 {
                    if !self.fill(cancel).await? {
                        return Err(Error::BadMessage("truncated chunk body"));
                    }
                }
                let body = self.buf[..remaining].to_vec();
                if &self.buf[remaining..remaining + 2] != b"\r\n" {
                    return Err(Error::BadMessage("chunk body not CRLF terminated"));
                }
                self.buf.advance(remaining + 2);
                self.state = ReaderState::ChunkHeader;
                Ok(Some(Part::ChunkBody(body)))
            }
            ReaderState::Trailer => {
                let mut trailer = Trailer::new();
                loop {
                    let Some(line) = self.read_line(cancel).await? else {
                        // The final CRLF never arrived; treat as done.
                        self.state = ReaderState::Done;
                        return Ok(Some(Part::Trailer(trailer)));
                    };
                    if line.is_empty() {
                        break;
                    }
                    let (name, value) = line
                        .split_once(':')
                        .ok_or(Error::BadMessage("malformed trailer line"))?;
                    trailer
                        .set(name.trim(), value.trim().to_owned());
                }
                self.state = ReaderState::Done;
                Ok(Some(Part::Trailer(trailer)))
            }
            ReaderState::Done => Ok(None),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> PartStream for ResponseReader<R> {
    fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<Part>>> + Send {
        ResponseReader::read_part(self, cancel)
    }
}
