use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::error::Error;
use crate::transport::{AttemptBody, UploadReader};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Request payload.
///
/// Structured payloads are serialized when the body is built, but a failure
/// is only reported when the request is sent, as a `BadRequest` outcome.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Form(String),
    Encoded {
        encoded: Result<Bytes, String>,
        content_type: &'static str,
    },
    Raw(Bytes),
    Upload(UploadReader),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match &self.inner {
            BodyInner::Form(_) => "Form",
            BodyInner::Encoded { .. } => "Encoded",
            BodyInner::Raw(_) => "Raw",
            BodyInner::Upload(_) => "Upload",
        };
        formatter.debug_tuple("Body").field(&text).finish()
    }
}

impl Body {
    /// A pre-encoded form string, sent as `application/x-www-form-urlencoded`.
    pub fn form_text(text: impl Into<String>) -> Self {
        Self {
            inner: BodyInner::Form(text.into()),
        }
    }

    pub fn json<T>(payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|source| format!("failed to serialize json body: {source}"));
        Self {
            inner: BodyInner::Encoded {
                encoded,
                content_type: JSON_CONTENT_TYPE,
            },
        }
    }

    pub fn form_urlencoded<T>(payload: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map(Bytes::from)
            .map_err(|source| format!("failed to serialize form body: {source}"));
        Self {
            inner: BodyInner::Encoded {
                encoded,
                content_type: FORM_CONTENT_TYPE,
            },
        }
    }

    /// Raw bytes; no content type is implied.
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self {
            inner: BodyInner::Raw(body.into()),
        }
    }

    /// Streams the request body from a reader. Such requests are not retried.
    pub fn upload<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        Self {
            inner: BodyInner::Upload(Box::pin(reader)),
        }
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self.inner, BodyInner::Upload(_))
    }

    pub(crate) fn prepare(self) -> Result<PreparedBody, Error> {
        match self.inner {
            BodyInner::Form(text) => Ok(PreparedBody {
                payload: Payload::Buffered(Bytes::from(text)),
                content_type: Some(FORM_CONTENT_TYPE),
            }),
            BodyInner::Encoded {
                encoded,
                content_type,
            } => Ok(PreparedBody {
                payload: Payload::Buffered(encoded.map_err(Error::bad_request)?),
                content_type: Some(content_type),
            }),
            BodyInner::Raw(bytes) => Ok(PreparedBody {
                payload: Payload::Buffered(bytes),
                content_type: None,
            }),
            BodyInner::Upload(reader) => Ok(PreparedBody {
                payload: Payload::Upload(Some(reader)),
                content_type: None,
            }),
        }
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::form_text(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::form_text(value)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::json(&value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::bytes(value)
    }
}

pub(crate) struct PreparedBody {
    pub(crate) payload: Payload,
    pub(crate) content_type: Option<&'static str>,
}

pub(crate) enum Payload {
    Buffered(Bytes),
    Upload(Option<UploadReader>),
}

impl Payload {
    /// Body for the next attempt; an upload is handed out only once.
    pub(crate) fn next_attempt_body(&mut self) -> Option<AttemptBody> {
        match self {
            Self::Buffered(bytes) => Some(AttemptBody::Buffered(bytes.clone())),
            Self::Upload(reader) => reader.take().map(AttemptBody::Upload),
        }
    }

    pub(crate) fn is_replayable(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }
}
