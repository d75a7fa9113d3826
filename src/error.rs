use std::sync::Arc;

use http::Method;
use thiserror::Error;

pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Failure classes a [`Transport`](crate::transport::Transport) reports for an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    EmptyReply,
    TooManyRedirects,
    MalformedUrl,
    UnsupportedProtocol,
    MalformedResponse,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::EmptyReply => "empty_reply",
            Self::TooManyRedirects => "too_many_redirects",
            Self::MalformedUrl => "malformed_url",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::MalformedResponse => "malformed_response",
            Self::Other => "other",
        }
    }

    /// Numeric codes follow the CURLcode table.
    pub const fn code(self) -> u32 {
        match self {
            Self::UnsupportedProtocol => 1,
            Self::MalformedUrl => 3,
            Self::Dns => 6,
            Self::Connect => 7,
            Self::MalformedResponse => 8,
            Self::Timeout => 28,
            Self::Tls => 60,
            Self::TooManyRedirects => 47,
            Self::EmptyReply => 52,
            Self::Read => 56,
            Self::Other => 2,
        }
    }

    /// Hard protocol violations are never retried, whatever the budget.
    pub const fn is_retriable(self) -> bool {
        !matches!(
            self,
            Self::MalformedUrl
                | Self::UnsupportedProtocol
                | Self::MalformedResponse
                | Self::TooManyRedirects
        )
    }

    const fn status(self) -> u16 {
        match self {
            Self::EmptyReply => 503,
            Self::TooManyRedirects => 429,
            Self::Tls => 526,
            _ => 408,
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    BadUrl,
    BadRequest,
    Transport,
    Tls,
    BadStatus,
    Timeout,
    Aborted,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadUrl => "bad_url",
            Self::BadRequest => "bad_request",
            Self::Transport => "transport",
            Self::Tls => "tls",
            Self::BadStatus => "bad_status",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Which timer ended the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// The overall deadline covering every attempt and retry pause.
    Deadline,
    /// The watchdog of a single attempt.
    Attempt,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Deadline => "deadline",
            Self::Attempt => "attempt",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("400: malformed or invalid url: {url}")]
    BadUrl { url: String },
    #[error("400: bad request: {message}")]
    BadRequest { message: String },
    #[error("transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("tls error for {method} {uri}: {source}")]
    Tls {
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("bad http status {status} for {method} {uri}")]
    BadStatus {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("408: request timed out ({phase}) after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("499: client closed request {method} {uri}")]
    Aborted { method: Method, uri: String },
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BadUrl { .. } => ErrorKind::BadUrl,
            Self::BadRequest { .. } => ErrorKind::BadRequest,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Tls { .. } => ErrorKind::Tls,
            Self::BadStatus { .. } => ErrorKind::BadStatus,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Aborted { .. } => ErrorKind::Aborted,
        }
    }

    pub const fn code(&self) -> u32 {
        match self {
            Self::BadUrl { .. } => 3,
            Self::BadRequest { .. } => 43,
            Self::Transport { kind, .. } => kind.code(),
            Self::Tls { .. } => TransportErrorKind::Tls.code(),
            Self::BadStatus { .. } => 22,
            Self::Timeout { .. } => 28,
            Self::Aborted { .. } => 42,
        }
    }

    /// HTTP-like status describing the failure to callers.
    pub const fn status(&self) -> u16 {
        match self {
            Self::BadUrl { .. } | Self::BadRequest { .. } => 400,
            Self::Transport { kind, .. } => kind.status(),
            Self::Tls { .. } => TransportErrorKind::Tls.status(),
            Self::BadStatus { status, .. } => *status,
            Self::Timeout { .. } => 408,
            Self::Aborted { .. } => 499,
        }
    }

    pub const fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            Self::Tls { .. } => Some(TransportErrorKind::Tls),
            _ => None,
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub(crate) fn from_transport(
        kind: TransportErrorKind,
        method: &Method,
        uri: &str,
        source: SharedError,
    ) -> Self {
        match kind {
            TransportErrorKind::Tls => Self::Tls {
                method: method.clone(),
                uri: uri.to_owned(),
                source,
            },
            kind => Self::Transport {
                kind,
                method: method.clone(),
                uri: uri.to_owned(),
                source,
            },
        }
    }
}
