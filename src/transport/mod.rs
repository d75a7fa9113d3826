//! Contract between the request coordinator and the engine doing network I/O.
//!
//! A [`Transport`] performs one physical attempt per call. It reports progress
//! and the terminal result through the [`AttemptEvents`] it is handed; the
//! terminal methods consume the sender, so an attempt can emit at most one
//! terminal event. The coordinator discards everything an attempt sends once
//! that attempt is superseded or the request is finished.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{SharedError, TransportErrorKind};

#[cfg(feature = "hyper-transport")]
mod decode;
#[cfg(feature = "hyper-transport")]
mod hyper;
#[cfg(feature = "hyper-transport")]
mod proxy;
#[cfg(feature = "hyper-transport")]
mod tls;

#[cfg(feature = "hyper-transport")]
pub use self::hyper::HyperTransport;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Response headers of one redirect hop.
pub type HeaderFrame = HeaderMap;

pub type UploadReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

pub enum AttemptBody {
    Buffered(Bytes),
    /// Read once; requests carrying an upload are never retried.
    Upload(UploadReader),
}

impl std::fmt::Debug for AttemptBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(body) => formatter
                .debug_tuple("Buffered")
                .field(&body.len())
                .finish(),
            Self::Upload(_) => formatter.write_str("Upload(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TlsOptions {
    pub reject_unauthorized: bool,
    pub reject_unauthorized_proxy: bool,
}

#[derive(Debug)]
pub struct AttemptRequest {
    pub index: usize,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<AttemptBody>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub follow_redirect: bool,
    pub max_redirects: usize,
    pub tls: TlsOptions,
    pub proxy: Option<Url>,
    /// When false the completion body stays empty and bytes only travel
    /// through [`AttemptEvents::data`].
    pub buffer_body: bool,
    pub keep_alive: bool,
}

#[derive(Clone, Debug)]
pub struct TransportFailure {
    pub kind: TransportErrorKind,
    pub source: SharedError,
}

impl TransportFailure {
    pub fn new(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            source: Arc::from(source.into()),
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub status: StatusCode,
    pub body: Bytes,
    /// One frame per hop, oldest first.
    pub header_frames: Vec<HeaderFrame>,
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Header(String),
    Data(Bytes),
    Completed(Completion),
    Failed(TransportFailure),
}

/// Sending half of one attempt's event channel.
///
/// Every method returns `false` once the coordinator stopped listening to
/// this attempt; transports should wind down when they see it.
#[derive(Debug)]
pub struct AttemptEvents {
    tx: mpsc::Sender<TransportEvent>,
}

impl AttemptEvents {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// A raw header line, or a status line such as `HTTP/1.1 200 OK`.
    pub async fn header(&self, line: impl Into<String>) -> bool {
        self.tx
            .send(TransportEvent::Header(line.into()))
            .await
            .is_ok()
    }

    pub async fn data(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(TransportEvent::Data(chunk)).await.is_ok()
    }

    pub async fn completed(
        self,
        status: StatusCode,
        body: Bytes,
        header_frames: Vec<HeaderFrame>,
    ) -> bool {
        self.tx
            .send(TransportEvent::Completed(Completion {
                status,
                body,
                header_frames,
            }))
            .await
            .is_ok()
    }

    pub async fn failed(self, failure: TransportFailure) -> bool {
        self.tx.send(TransportEvent::Failed(failure)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub trait AttemptHandle: Send {
    /// Idempotent and best effort; must not panic.
    fn cancel(&mut self);
}

impl AttemptHandle for tokio::task::JoinHandle<()> {
    fn cancel(&mut self) {
        self.abort();
    }
}

impl AttemptHandle for tokio::task::AbortHandle {
    fn cancel(&mut self) {
        self.abort();
    }
}

pub trait Transport: Send + Sync + 'static {
    fn attempt(&self, request: AttemptRequest, events: AttemptEvents) -> Box<dyn AttemptHandle>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn attempt(&self, request: AttemptRequest, events: AttemptEvents) -> Box<dyn AttemptHandle> {
        (**self).attempt(request, events)
    }
}
