use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue, LOCATION};
use http::{HeaderMap, StatusCode};

use crate::error::Error;
use crate::transport::HeaderFrame;

/// A per-call header entry: either a value or a request to drop a default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderOverride {
    Set(String),
    Unset,
}

impl From<&str> for HeaderOverride {
    fn from(value: &str) -> Self {
        Self::Set(value.to_owned())
    }
}

impl From<String> for HeaderOverride {
    fn from(value: String) -> Self {
        Self::Set(value)
    }
}

impl<T> From<Option<T>> for HeaderOverride
where
    T: Into<String>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Set(value.into()),
            None => Self::Unset,
        }
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|source| Error::bad_request(format!("invalid header name {name}: {source}")))
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|source| Error::bad_request(format!("invalid header value for {name}: {source}")))
}

/// Applies overrides on top of the defaults; names compare case-insensitively.
pub(crate) fn merge_headers(
    defaults: &HeaderMap,
    overrides: &[(String, HeaderOverride)],
) -> Result<HeaderMap, Error> {
    let mut merged = defaults.clone();
    for (name, entry) in overrides {
        let header_name = parse_header_name(name)?;
        match entry {
            HeaderOverride::Set(value) => {
                let value = parse_header_value(name, value)?;
                merged.insert(header_name, value);
            }
            HeaderOverride::Unset => {
                merged.remove(&header_name);
            }
        }
    }
    Ok(merged)
}

pub(crate) fn basic_authorization(credentials: &str) -> Result<HeaderValue, Error> {
    let encoded = STANDARD.encode(credentials.as_bytes());
    let mut value = parse_header_value(AUTHORIZATION.as_str(), &format!("Basic {encoded}"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Builds the header map delivered with a response.
///
/// The last hop is authoritative. When it carries no `location`, the one
/// from the hop before it is copied over so the final redirect target stays
/// visible after the redirect was followed.
pub fn normalize_response_headers(frames: &[HeaderFrame]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(last) = frames.last() else {
        return headers;
    };
    for (name, value) in last {
        if !value.is_empty() {
            headers.append(name.clone(), value.clone());
        }
    }

    if !headers.contains_key(LOCATION)
        && frames.len() > 1
        && let Some(location) = frames[frames.len() - 2]
            .get(LOCATION)
            .filter(|value| !value.is_empty())
    {
        headers.insert(LOCATION, location.clone());
    }
    headers
}

/// Reads the status code out of a line such as `HTTP/1.1 503 Service Unavailable`.
pub(crate) fn parse_status_line(line: &str) -> Option<StatusCode> {
    let line = line.trim();
    if !line.starts_with("HTTP/") {
        return None;
    }
    let code = line.split_whitespace().nth(1)?;
    StatusCode::from_bytes(code.as_bytes()).ok()
}
