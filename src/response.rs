use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// Outcome of a request that produced an HTTP response.
///
/// `headers` are normalized across the redirect chain: the last hop wins,
/// with `location` taken from the previous hop when the last one has none.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    attempts: usize,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        url: Url,
        attempts: usize,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            url,
            attempts,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Empty when buffering was disabled with `raw_body` or `no_storage`.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The requested URL, before any redirect.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Physical attempts made, including the one that produced this response.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }
}
