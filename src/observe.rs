use std::time::Duration;

use http::Method;

use crate::error::Error;
use crate::response::Response;
use crate::retry::AttemptOutcome;

/// Identifies the request an [`Observer`] callback belongs to.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    uri: String,
}

impl RequestContext {
    pub(crate) fn new(method: Method, redacted_uri: String) -> Self {
        Self {
            method,
            uri: redacted_uri,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URI without credentials, query or fragment.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Hooks called from the coordinator task. Implementations must not block.
pub trait Observer: Send + Sync {
    fn on_request_start(&self, _context: &RequestContext) {}

    fn on_attempt_start(&self, _context: &RequestContext, _attempt: usize) {}

    fn on_retry_scheduled(
        &self,
        _context: &RequestContext,
        _outcome: &AttemptOutcome,
        _delay: Duration,
    ) {
    }

    fn on_outcome(&self, _context: &RequestContext, _outcome: &Result<Response, Error>) {}
}
