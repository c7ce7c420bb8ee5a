use thiserror::Error;

/// Error kinds surfaced by DHT operations, the signed-response codecs and
/// the local store. I/O paths never panic; everything funnels into one of
/// these.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation's cancellation signal fired.
    #[error("operation aborted")]
    Aborted,

    /// A single RPC exceeded its adaptive deadline.
    #[error("request timed out")]
    Timeout,

    /// No responsible node accepted a write.
    #[error("network down")]
    NetworkDown,

    /// No peer produced a usable reply.
    #[error("host unreachable")]
    HostUnreachable,

    /// The key is not present, locally or in the swarm.
    #[error("not found")]
    NotFound,

    /// A peer sent a malformed message, a signature failed to verify or a
    /// hash chain broke.
    #[error("bad message: {0}")]
    BadMessage(&'static str),

    /// The caller asked for something unparseable or oversized.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A requested range falls outside the available data.
    #[error("invalid seek")]
    InvalidSeek,

    /// The DHT node has not bootstrapped yet.
    #[error("try again: not bootstrapped")]
    TryAgain,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
