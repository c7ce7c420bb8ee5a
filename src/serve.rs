//! Thin peer-facing serving loop: answers cache requests straight from
//! the local store. One request per connection; the heavy lifting lives
//! in the store readers.

use crate::error::{Error, Result};
use crate::httpmsg::{write_part, ByteRange, Head, PartStream};
use crate::store::Store;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Requesting this header serves the entry's hash list instead of its
/// body.
pub const HDR_HASH_LIST: &str = "X-Ouinet-Hash-List";

const MAX_REQUEST_HEAD: usize = 16 * 1024;

#[derive(Debug)]
struct Request {
    target: String,
    range: Option<(u64, u64)>,
    hash_list: bool,
}

fn parse_request(buf: &[u8]) -> Result<Request> {
    let text = std::str::from_utf8(buf).map_err(|_| Error::BadMessage("request not utf-8"))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(Error::BadMessage("empty request"))?;
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    if method != "GET" || target.is_empty() {
        return Err(Error::BadMessage("unsupported request"));
    }

    let mut request = Request {
        target: target.to_owned(),
        range: None,
        hash_list: false,
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case(HDR_HASH_LIST) {
            request.hash_list = value.eq_ignore_ascii_case("true") || value == "1";
        } else if name.eq_ignore_ascii_case("Range") {
            request.range = parse_byte_range(value);
        }
    }
    Ok(request)
}

/// `Range: bytes=A-B`; open-ended and multi-range forms are not served.
fn parse_byte_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (first, last) = spec.split_once('-')?;
    Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
}

async fn write_error<IO: AsyncWrite + Unpin>(io: &mut IO, status: u16) -> Result<()> {
    let mut head = Head::new(status);
    head.set("Content-Length", "0");
    io.write_all(&head.to_bytes()).await?;
    Ok(())
}

async fn write_stream<IO, S>(io: &mut IO, mut stream: S, cancel: &CancellationToken) -> Result<()>
where
    IO: AsyncWrite + Unpin,
    S: PartStream + Send,
{
    while let Some(part) = stream.read_part(cancel).await? {
        write_part(io, &part).await?;
    }
    io.flush().await?;
    Ok(())
}

/// Serve one request from the store over `io`.
pub async fn handle_connection<IO>(store: &Store, mut io: IO, cancel: &CancellationToken) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Read the request head.
    let mut buf = Vec::with_capacity(1024);
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(Error::BadMessage("request head too large"));
        }
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Aborted),
            n = io.read_buf(&mut buf) => n?,
        };
        if n == 0 {
            return Err(Error::BadMessage("connection closed mid-request"));
        }
    }

    let request = match parse_request(&buf) {
        Ok(r) => r,
        Err(_) => return write_error(&mut io, 400).await,
    };
    debug!(target = %request.target, range = ?request.range, hash_list = request.hash_list, "serving");

    if request.hash_list {
        return match store.hash_list(&request.target).await {
            Ok(list) => {
                for part in list.to_parts() {
                    write_part(&mut io, &part).await?;
                }
                io.flush().await?;
                Ok(())
            }
            Err(Error::NotFound) => write_error(&mut io, 404).await,
            Err(e) => {
                let _ = write_error(&mut io, 500).await;
                Err(e)
            }
        };
    }

    if let Some((first, last)) = request.range {
        return match store.range_reader(&request.target, first, last).await {
            Ok(reader) => write_stream(&mut io, reader, cancel).await,
            Err(Error::InvalidSeek) => {
                // RFC 7233: range outside the representation.
                let total = available_total(store, &request.target).await;
                let mut head = Head::new(416);
                head.set(
                    "Content-Range",
                    match total {
                        Some(t) => format!("bytes */{t}"),
                        None => "bytes */*".to_owned(),
                    },
                );
                head.set("Content-Length", "0");
                io.write_all(&head.to_bytes()).await?;
                Ok(())
            }
            Err(Error::NotFound) => write_error(&mut io, 404).await,
            Err(e) => {
                let _ = write_error(&mut io, 500).await;
                Err(e)
            }
        };
    }

    match store.reader(&request.target).await {
        Ok(reader) => write_stream(&mut io, reader, cancel).await,
        Err(Error::NotFound) => write_error(&mut io, 404).await,
        Err(e) => {
            let _ = write_error(&mut io, 500).await;
            Err(e)
        }
    }
}

async fn available_total(store: &Store, key: &str) -> Option<u64> {
    let mut reader = store.head_reader(key).await.ok()?;
    let cancel = CancellationToken::new();
    let part = reader.read_part(&cancel).await.ok()??;
    let head = part.as_head()?;
    head.get(crate::sign::HDR_AVAIL_DATA)
        .and_then(ByteRange::parse)
        .and_then(|r| r.total)
}

/// Accept loop; one task per connection.
pub async fn serve(listener: TcpListener, store: Store, cancel: CancellationToken) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(?e, "accept failed");
                    continue;
                }
            },
        };

        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&store, socket, &cancel).await {
                if !e.is_aborted() {
                    debug!(%peer, ?e, "connection failed");
                }
            }
        });
    }
}

/// The client half of the peer protocol: one GET on a fresh connection.
pub fn request_bytes(key: &str, range: Option<(u64, u64)>, hash_list: bool) -> Vec<u8> {
    let mut out = format!("GET {key} HTTP/1.1\r\nHost: cache\r\n");
    if let Some((first, last)) = range {
        out.push_str(&format!("Range: bytes={first}-{last}\r\n"));
    }
    if hash_list {
        out.push_str(&format!("{HDR_HASH_LIST}: true\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parsing() {
        let raw = request_bytes("https://example.com/foo", Some((0, 99)), false);
        let req = parse_request(&raw).unwrap();
        assert_eq!(req.target, "https://example.com/foo");
        assert_eq!(req.range, Some((0, 99)));
        assert!(!req.hash_list);

        let raw = request_bytes("k", None, true);
        let req = parse_request(&raw).unwrap();
        assert!(req.hash_list);
        assert_eq!(req.range, None);

        assert!(parse_request(b"POST /x HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn byte_range_parsing() {
        assert_eq!(parse_byte_range("bytes=0-99"), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=65536-131075"), Some((65536, 131075)));
        assert_eq!(parse_byte_range("bytes=-5"), None);
        assert_eq!(parse_byte_range("items=0-5"), None);
    }
}
