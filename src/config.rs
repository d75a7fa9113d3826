use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method};
use url::Url;

use crate::body::{Body, Payload};
use crate::error::Error;
use crate::headers::{HeaderOverride, basic_authorization, merge_headers};
use crate::retry::{BadStatusClassifier, RetryPolicy};
use crate::transport::TlsOptions;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Whether a final bad status reaches the caller as a response or an error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusPolicy {
    #[default]
    Response,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ProxySetting {
    #[default]
    None,
    /// Send through the target's own origin.
    TargetOrigin,
    Url(String),
}

/// Process-wide defaults. Never mutated by a running request.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) timeout: Duration,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_redirects: usize,
    pub(crate) follow_redirect: bool,
    pub(crate) tls: TlsOptions,
    pub(crate) proxy: ProxySetting,
    pub(crate) raw_body: bool,
    pub(crate) no_storage: bool,
    pub(crate) keep_alive: bool,
    pub(crate) wait: bool,
    pub(crate) status_policy: StatusPolicy,
    pub(crate) headers: HeaderMap,
}

impl Default for Config {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        Self {
            timeout: Duration::from_millis(6144),
            connect_timeout: None,
            retry: RetryPolicy::standard(),
            max_redirects: 4,
            follow_redirect: true,
            tls: TlsOptions::default(),
            proxy: ProxySetting::None,
            raw_body: false,
            no_storage: false,
            keep_alive: false,
            wait: false,
            status_policy: StatusPolicy::Response,
            headers,
        }
    }
}

impl Config {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retry = self.retry.retries(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry = self.retry.delay(delay);
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn follow_redirect(mut self, follow_redirect: bool) -> Self {
        self.follow_redirect = follow_redirect;
        self
    }

    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.tls.reject_unauthorized = reject;
        self
    }

    pub fn reject_unauthorized_proxy(mut self, reject: bool) -> Self {
        self.tls.reject_unauthorized_proxy = reject;
        self
    }

    pub fn proxy(mut self, proxy: ProxySetting) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn raw_body(mut self, raw_body: bool) -> Self {
        self.raw_body = raw_body;
        self
    }

    pub fn no_storage(mut self, no_storage: bool) -> Self {
        self.no_storage = no_storage;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.status_policy = status_policy;
        self
    }

    pub fn default_header(mut self, name: http::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn without_default_header(mut self, name: http::HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    /// Freezes defaults and per-call overrides into one request plan.
    ///
    /// Invalid input does not fail here; it is kept in the plan and reported
    /// when the request is sent.
    pub(crate) fn resolve(&self, options: RequestOptions) -> RequestPlan {
        let RequestOptions {
            url,
            method,
            headers,
            body,
            auth,
            timeout,
            connect_timeout,
            retry,
            retries,
            retry_delay,
            bad_statuses,
            bad_status_classifier,
            max_redirects,
            follow_redirect,
            reject_unauthorized,
            reject_unauthorized_proxy,
            proxy,
            raw_body,
            no_storage,
            keep_alive,
            wait,
            status_policy,
        } = options;

        let mut retry_policy = self.retry.clone();
        if let Some(enabled) = retry {
            retry_policy = retry_policy.enabled(enabled);
        }
        if let Some(retries) = retries {
            retry_policy = retry_policy.retries(retries);
        }
        if let Some(delay) = retry_delay {
            retry_policy = retry_policy.delay(delay);
        }
        if let Some(statuses) = bad_statuses {
            retry_policy = retry_policy.bad_statuses(statuses);
        }
        if let Some(classifier) = bad_status_classifier {
            retry_policy = retry_policy.classifier(classifier);
        }

        let timeout = timeout
            .map(|value| value.max(Duration::from_millis(1)))
            .unwrap_or(self.timeout);
        let config = RequestConfig {
            timeout,
            connect_timeout: connect_timeout.or(self.connect_timeout).unwrap_or(timeout),
            retry: retry_policy,
            max_redirects: max_redirects.unwrap_or(self.max_redirects),
            follow_redirect: follow_redirect.unwrap_or(self.follow_redirect),
            tls: TlsOptions {
                reject_unauthorized: reject_unauthorized.unwrap_or(self.tls.reject_unauthorized),
                reject_unauthorized_proxy: reject_unauthorized_proxy
                    .unwrap_or(self.tls.reject_unauthorized_proxy),
            },
            proxy: proxy.unwrap_or_else(|| self.proxy.clone()),
            buffer_body: !(raw_body.unwrap_or(self.raw_body) || no_storage.unwrap_or(self.no_storage)),
            keep_alive: keep_alive.unwrap_or(self.keep_alive),
            status_policy: status_policy.unwrap_or(self.status_policy),
        };

        let method_text = method.unwrap_or_else(|| "GET".to_owned()).to_ascii_uppercase();
        let method = Method::from_bytes(method_text.as_bytes()).unwrap_or(Method::GET);
        let prepared = build_prepared(
            &url,
            &method_text,
            &self.headers,
            &headers,
            body,
            auth.as_deref(),
        );

        RequestPlan {
            raw_url: url,
            method,
            config,
            wait: wait.unwrap_or(self.wait),
            prepared,
        }
    }
}

fn build_prepared(
    url: &str,
    method_text: &str,
    defaults: &HeaderMap,
    overrides: &[(String, HeaderOverride)],
    body: Option<Body>,
    auth: Option<&str>,
) -> Result<PreparedRequest, Error> {
    let url = Url::parse(url).map_err(|_| Error::BadUrl {
        url: url.to_owned(),
    })?;
    Method::from_bytes(method_text.as_bytes())
        .map_err(|_| Error::bad_request(format!("invalid method {method_text}")))?;

    let mut headers = merge_headers(defaults, overrides)?;
    if let Some(credentials) = auth {
        headers.insert(AUTHORIZATION, basic_authorization(credentials)?);
    }

    let payload = match body {
        Some(body) => {
            let prepared = body.prepare()?;
            if let Some(content_type) = prepared.content_type
                && !headers.contains_key(CONTENT_TYPE)
            {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
            Some(prepared.payload)
        }
        None => None,
    };

    Ok(PreparedRequest {
        url,
        headers,
        payload,
    })
}

/// Per-call overrides. Unset fields fall back to the client's [`Config`].
#[derive(Default)]
pub struct RequestOptions {
    pub(crate) url: String,
    pub(crate) method: Option<String>,
    pub(crate) headers: Vec<(String, HeaderOverride)>,
    pub(crate) body: Option<Body>,
    pub(crate) auth: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) retry: Option<bool>,
    pub(crate) retries: Option<u32>,
    pub(crate) retry_delay: Option<Duration>,
    pub(crate) bad_statuses: Option<BTreeSet<u16>>,
    pub(crate) bad_status_classifier: Option<Arc<dyn BadStatusClassifier>>,
    pub(crate) max_redirects: Option<usize>,
    pub(crate) follow_redirect: Option<bool>,
    pub(crate) reject_unauthorized: Option<bool>,
    pub(crate) reject_unauthorized_proxy: Option<bool>,
    pub(crate) proxy: Option<ProxySetting>,
    pub(crate) raw_body: Option<bool>,
    pub(crate) no_storage: Option<bool>,
    pub(crate) keep_alive: Option<bool>,
    pub(crate) wait: Option<bool>,
    pub(crate) status_policy: Option<StatusPolicy>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestOptions")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Case-insensitive; upper-cased before use.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderOverride>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Drops a default header for this request.
    pub fn unset_header(mut self, name: impl Into<String>) -> Self {
        self.headers.push((name.into(), HeaderOverride::Unset));
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// `user:password` credentials for basic authentication.
    pub fn auth(mut self, credentials: impl Into<String>) -> Self {
        self.auth = Some(credentials.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn bad_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.bad_statuses = Some(statuses.into_iter().collect());
        self
    }

    pub fn bad_status_classifier(mut self, classifier: Arc<dyn BadStatusClassifier>) -> Self {
        self.bad_status_classifier = Some(classifier);
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = Some(max_redirects);
        self
    }

    pub fn follow_redirect(mut self, follow_redirect: bool) -> Self {
        self.follow_redirect = Some(follow_redirect);
        self
    }

    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = Some(reject);
        self
    }

    pub fn reject_unauthorized_proxy(mut self, reject: bool) -> Self {
        self.reject_unauthorized_proxy = Some(reject);
        self
    }

    pub fn proxy(mut self, proxy: ProxySetting) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn raw_body(mut self, raw_body: bool) -> Self {
        self.raw_body = Some(raw_body);
        self
    }

    pub fn no_storage(mut self, no_storage: bool) -> Self {
        self.no_storage = Some(no_storage);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Build the request without sending it, so sinks can be attached first.
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.status_policy = Some(status_policy);
        self
    }
}

impl From<&str> for RequestOptions {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for RequestOptions {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Frozen configuration of one request.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_redirects: usize,
    pub follow_redirect: bool,
    pub tls: TlsOptions,
    pub proxy: ProxySetting,
    pub buffer_body: bool,
    pub keep_alive: bool,
    pub status_policy: StatusPolicy,
}

impl RequestConfig {
    /// Bounds every attempt and pause: `(timeout + delay) * (retries + 1)`.
    pub fn overall_deadline(&self) -> Duration {
        let per_attempt = self
            .timeout
            .saturating_add(self.retry.configured_delay());
        per_attempt.saturating_mul(self.retry.configured_retries().saturating_add(1))
    }

    pub(crate) fn proxy_url(&self, target: &Url) -> Result<Option<Url>, Error> {
        match &self.proxy {
            ProxySetting::None => Ok(None),
            ProxySetting::TargetOrigin => {
                let origin = target.origin().ascii_serialization();
                Url::parse(&origin)
                    .map(Some)
                    .map_err(|_| Error::BadUrl { url: origin })
            }
            ProxySetting::Url(text) => Url::parse(text)
                .map(Some)
                .map_err(|_| Error::BadUrl { url: text.clone() }),
        }
    }
}

pub(crate) struct PreparedRequest {
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) payload: Option<Payload>,
}

pub(crate) struct RequestPlan {
    pub(crate) raw_url: String,
    pub(crate) method: Method,
    pub(crate) config: RequestConfig,
    pub(crate) wait: bool,
    pub(crate) prepared: Result<PreparedRequest, Error>,
}
