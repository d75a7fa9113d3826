//! Default [`Transport`] on top of the `hyper_util` legacy client.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderValue, LOCATION,
    PROXY_AUTHORIZATION,
};
use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use super::decode::{BodyDecoder, strip_encoding_headers};
use super::proxy::{ProxyConnector, ProxyEndpoint};
use super::tls::client_config;
use super::{
    AttemptBody, AttemptEvents, AttemptHandle, AttemptRequest, HeaderFrame, Transport,
    TransportFailure, UploadReader,
};
use crate::error::TransportErrorKind;
use crate::headers::basic_authorization;
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

const ACCEPTED_ENCODINGS: &str = "gzip, deflate";

type BoxBodyError = Box<dyn StdError + Send + Sync>;
type ReqBody = BoxBody<Bytes, BoxBodyError>;
type HyperClient = Client<hyper_rustls::HttpsConnector<ProxyConnector>, ReqBody>;

/// Connection settings that require a separate pool.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClientProfile {
    verify_server: bool,
    proxy: Option<String>,
    connect_timeout: Duration,
    keep_alive: bool,
}

/// Performs each attempt on its own task; cancelling the attempt aborts it.
///
/// HTTP clients are cached per connection profile, so attempts with the same
/// TLS, proxy and connect settings share pooled connections. Only plain
/// `http://` proxies are supported.
#[derive(Clone, Default)]
pub struct HyperTransport {
    clients: Arc<Mutex<HashMap<ClientProfile, HyperClient>>>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HyperTransport")
            .field("profiles", &lock_unpoisoned(&self.clients).len())
            .finish()
    }
}

impl HyperTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(
        &self,
        profile: ClientProfile,
        proxy: Option<ProxyEndpoint>,
    ) -> Result<HyperClient, TransportFailure> {
        let mut clients = lock_unpoisoned(&self.clients);
        if let Some(client) = clients.get(&profile) {
            return Ok(client.clone());
        }
        let tls = client_config(profile.verify_server)
            .map_err(|error| TransportFailure::new(TransportErrorKind::Tls, error))?;
        let connector = ProxyConnector::new(proxy, profile.connect_timeout, profile.keep_alive);
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new()).build(https);
        clients.insert(profile, client.clone());
        Ok(client)
    }

    async fn run(
        &self,
        request: AttemptRequest,
        events: &AttemptEvents,
    ) -> Result<Finished, TransportFailure> {
        let AttemptRequest {
            index,
            url,
            method,
            mut headers,
            body,
            timeout,
            connect_timeout,
            follow_redirect,
            max_redirects,
            tls,
            proxy,
            buffer_body,
            keep_alive,
        } = request;

        ensure_http_scheme(&url)?;
        let endpoint = proxy.as_ref().map(ProxyEndpoint::from_url).transpose()?;
        let profile = ClientProfile {
            verify_server: tls.reject_unauthorized,
            proxy: proxy.as_ref().map(|url| url.as_str().to_owned()),
            connect_timeout,
            keep_alive,
        };
        let client = self.client_for(profile, endpoint.clone())?;

        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        }
        let mut body = HopBody::from(body);
        let mut method = method;
        let mut current = url;
        let mut frames: Vec<HeaderFrame> = Vec::new();
        let mut redirects = 0_usize;

        loop {
            let mut hop_headers = headers.clone();
            if current.scheme() == "http"
                && let Some(authorization) = endpoint
                    .as_ref()
                    .and_then(|endpoint| endpoint.authorization.as_ref())
            {
                hop_headers.insert(PROXY_AUTHORIZATION, authorization.clone());
            }
            let http_request = build_request(&method, &current, hop_headers, body.next()?)?;
            debug!(
                attempt = index,
                method = %method,
                uri = %redact_uri_for_logs(current.as_str()),
                "sending request"
            );

            let response = match tokio::time::timeout(timeout, client.request(http_request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => {
                    let kind = classify_request_error(&error);
                    return Err(TransportFailure::new(kind, error));
                }
                Err(_) => {
                    return Err(TransportFailure::new(
                        TransportErrorKind::Timeout,
                        format!("no response within {}ms", timeout.as_millis()),
                    ));
                }
            };

            let (parts, incoming) = response.into_parts();
            let status = parts.status;
            if !report_head(events, parts.version, status, &parts.headers).await {
                return Err(detached());
            }
            let next = redirect_target(follow_redirect, status, &current, &parts.headers)?;
            let Some(next) = next else {
                let decoder = BodyDecoder::for_response(&method, status, &parts.headers);
                let mut final_headers = parts.headers;
                if !decoder.is_identity() {
                    strip_encoding_headers(&mut final_headers);
                }
                frames.push(final_headers);
                let body = stream_body(events, decoder, incoming, buffer_body).await?;
                return Ok(Finished {
                    status,
                    body,
                    frames,
                });
            };
            frames.push(parts.headers);
            drop(incoming);

            if redirects >= max_redirects {
                return Err(TransportFailure::new(
                    TransportErrorKind::TooManyRedirects,
                    format!("maximum of {max_redirects} redirects exceeded"),
                ));
            }
            redirects += 1;

            if switches_to_get(status, &method) {
                method = Method::GET;
                body = HopBody::Empty;
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
            }
            if current.origin() != next.origin() {
                headers.remove(AUTHORIZATION);
                headers.remove(COOKIE);
            }
            debug!(
                attempt = index,
                status = status.as_u16(),
                location = %redact_uri_for_logs(next.as_str()),
                "following redirect"
            );
            current = next;
        }
    }
}

impl Transport for HyperTransport {
    fn attempt(&self, request: AttemptRequest, events: AttemptEvents) -> Box<dyn AttemptHandle> {
        let transport = self.clone();
        let task = tokio::spawn(async move {
            match transport.run(request, &events).await {
                Ok(finished) => {
                    events
                        .completed(finished.status, finished.body, finished.frames)
                        .await;
                }
                Err(failure) => {
                    events.failed(failure).await;
                }
            }
        });
        Box::new(task)
    }
}

struct Finished {
    status: StatusCode,
    body: Bytes,
    frames: Vec<HeaderFrame>,
}

enum HopBody {
    Empty,
    Buffered(Bytes),
    Upload(Option<UploadReader>),
}

impl From<Option<AttemptBody>> for HopBody {
    fn from(body: Option<AttemptBody>) -> Self {
        match body {
            None => Self::Empty,
            Some(AttemptBody::Buffered(bytes)) => Self::Buffered(bytes),
            Some(AttemptBody::Upload(reader)) => Self::Upload(Some(reader)),
        }
    }
}

impl HopBody {
    fn next(&mut self) -> Result<ReqBody, TransportFailure> {
        match self {
            Self::Empty => Ok(full_body(Bytes::new())),
            Self::Buffered(bytes) => Ok(full_body(bytes.clone())),
            Self::Upload(reader) => match reader.take() {
                Some(reader) => Ok(BodyExt::boxed(StreamBody::new(
                    ReaderStream::new(reader)
                        .map_ok(Frame::data)
                        .map_err(|error| Box::new(error) as BoxBodyError),
                ))),
                None => Err(TransportFailure::new(
                    TransportErrorKind::Other,
                    "upload body cannot be resent to a redirect target",
                )),
            },
        }
    }
}

fn full_body(bytes: Bytes) -> ReqBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed()
}

fn ensure_http_scheme(url: &Url) -> Result<(), TransportFailure> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(TransportFailure::new(
                TransportErrorKind::UnsupportedProtocol,
                format!("unsupported scheme `{other}`"),
            ));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(TransportFailure::new(
            TransportErrorKind::MalformedUrl,
            "url has no host",
        ));
    }
    Ok(())
}

/// Credentials embedded in the URL become basic auth unless the caller set
/// an `authorization` header; the userinfo itself never goes on the wire.
fn build_request(
    method: &Method,
    url: &Url,
    mut headers: HeaderMap,
    body: ReqBody,
) -> Result<Request<ReqBody>, TransportFailure> {
    let mut target = url.clone();
    target.set_fragment(None);
    if !target.username().is_empty() {
        if !headers.contains_key(AUTHORIZATION) {
            let credentials = format!(
                "{}:{}",
                target.username(),
                target.password().unwrap_or_default()
            );
            let value = basic_authorization(&credentials).map_err(|error| {
                TransportFailure::new(TransportErrorKind::MalformedUrl, error.to_string())
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        let _ = target.set_username("");
        let _ = target.set_password(None);
    }
    let uri = target
        .as_str()
        .parse::<Uri>()
        .map_err(|error| TransportFailure::new(TransportErrorKind::MalformedUrl, error))?;

    let mut request = Request::new(body);
    *request.method_mut() = method.clone();
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    Ok(request)
}

async fn report_head(
    events: &AttemptEvents,
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
) -> bool {
    if !events.header(format!("{version:?} {status}")).await {
        return false;
    }
    for (name, value) in headers {
        let line = format!("{name}: {}", String::from_utf8_lossy(value.as_bytes()));
        if !events.header(line).await {
            return false;
        }
    }
    true
}

fn redirect_target(
    follow_redirect: bool,
    status: StatusCode,
    current: &Url,
    headers: &HeaderMap,
) -> Result<Option<Url>, TransportFailure> {
    if !follow_redirect || !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
        return Ok(None);
    }
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }
    let Some(location) = headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
    else {
        return Ok(None);
    };
    let next = current.join(location.trim()).map_err(|error| {
        TransportFailure::new(
            TransportErrorKind::MalformedUrl,
            format!("invalid redirect location `{location}`: {error}"),
        )
    })?;
    ensure_http_scheme(&next)?;
    Ok(Some(next))
}

fn switches_to_get(status: StatusCode, method: &Method) -> bool {
    match status.as_u16() {
        303 => *method != Method::HEAD,
        301 | 302 => *method == Method::POST,
        _ => false,
    }
}

async fn stream_body(
    events: &AttemptEvents,
    mut decoder: BodyDecoder,
    mut incoming: Incoming,
    buffer_body: bool,
) -> Result<Bytes, TransportFailure> {
    let mut buffered = BytesMut::new();
    while let Some(frame) = incoming.frame().await {
        let frame = frame.map_err(|error| {
            let kind = classify_body_error(&error);
            TransportFailure::new(kind, error)
        })?;
        let Ok(chunk) = frame.into_data() else {
            continue;
        };
        let decoded = decoder.decode(chunk).map_err(|error| {
            TransportFailure::new(TransportErrorKind::MalformedResponse, error)
        })?;
        emit(events, &mut buffered, decoded, buffer_body).await?;
    }
    let tail = decoder
        .finish()
        .map_err(|error| TransportFailure::new(TransportErrorKind::MalformedResponse, error))?;
    emit(events, &mut buffered, tail, buffer_body).await?;
    Ok(buffered.freeze())
}

async fn emit(
    events: &AttemptEvents,
    buffered: &mut BytesMut,
    chunk: Bytes,
    buffer_body: bool,
) -> Result<(), TransportFailure> {
    if chunk.is_empty() {
        return Ok(());
    }
    if buffer_body {
        buffered.extend_from_slice(&chunk);
    }
    if events.data(chunk).await {
        Ok(())
    } else {
        Err(detached())
    }
}

fn detached() -> TransportFailure {
    TransportFailure::new(TransportErrorKind::Other, "attempt no longer observed")
}

fn error_chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = String::new();
    let mut current = Some(error);
    while let Some(error) = current {
        text.push_str(&error.to_string().to_ascii_lowercase());
        text.push(' ');
        current = error.source();
    }
    text
}

fn find_source<'a, T>(error: &'a (dyn StdError + 'static)) -> Option<&'a T>
where
    T: StdError + 'static,
{
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(found) = error.downcast_ref::<T>() {
            return Some(found);
        }
        current = error.source();
    }
    None
}

fn classify_request_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error_chain_text(error);
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        if text.contains("timed out") {
            return TransportErrorKind::Timeout;
        }
        return TransportErrorKind::Connect;
    }

    if let Some(hyper_error) = find_source::<hyper::Error>(error) {
        return classify_body_error(hyper_error);
    }
    classify_text(&text)
}

fn classify_body_error(error: &hyper::Error) -> TransportErrorKind {
    if error.is_incomplete_message() {
        return TransportErrorKind::EmptyReply;
    }
    if error.is_parse() || error.is_parse_status() {
        return TransportErrorKind::MalformedResponse;
    }
    if error.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    classify_text(&error_chain_text(error))
}

fn classify_text(text: &str) -> TransportErrorKind {
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}
