use std::io;
use thiserror::Error;

/// Errors raised while serving a single client connection.
///
/// Every variant is scoped to one connection; none of them is allowed to
/// escape the per-connection task and reach the acceptor loop.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The request line or a header line did not split into the expected parts.
    ///
    /// `status_allowed` is set once the request line parsed cleanly, meaning the
    /// client spoke enough HTTP to be answered with `400 Bad Request`.
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String, status_allowed: bool },

    /// The client closed the stream before a complete request was read.
    #[error("incomplete request")]
    IncompleteRequest,

    #[error("blocked host: {host}")]
    BlockedHost { host: String },

    /// DNS failure, refused connection, TLS failure or timeout toward the origin.
    #[error("upstream {target} unavailable: {source}")]
    UpstreamUnavailable {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("relay interrupted: {0}")]
    RelayInterrupted(#[source] io::Error),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn malformed_line<S: Into<String>>(reason: S) -> Self {
        Self::MalformedRequest {
            reason: reason.into(),
            status_allowed: false,
        }
    }

    pub fn malformed_header<S: Into<String>>(reason: S) -> Self {
        Self::MalformedRequest {
            reason: reason.into(),
            status_allowed: true,
        }
    }

    pub fn upstream<S: Into<String>>(target: S, source: io::Error) -> Self {
        Self::UpstreamUnavailable {
            target: target.into(),
            source,
        }
    }

    /// True for outcomes that are ordinary connection endings rather than faults.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::IncompleteRequest | Self::RelayInterrupted(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for ProxyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::CacheUnavailable(e.to_string())
    }
}
