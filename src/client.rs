use std::sync::Arc;
#[cfg(feature = "hyper-transport")]
use std::sync::OnceLock;
use std::time::Duration;

use crate::body::Body;
use crate::config::{Config, RequestOptions};
use crate::error::Error;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::observe::{Observer, RequestContext};
use crate::request::RequestHandle;
use crate::response::Response;
use crate::retry::AttemptOutcome;
use crate::transport::Transport;

pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: Config,
    observer: Option<Arc<dyn Observer>>,
    metrics_enabled: bool,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            transport: None,
            config: Config::default(),
            observer: None,
            metrics_enabled: false,
        }
    }

    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let metrics = if self.metrics_enabled {
            Metrics::enabled()
        } else {
            Metrics::disabled()
        };
        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                config: self.config,
                observer: self.observer,
                metrics,
            }),
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqwire client: {error}"))
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::transport::HyperTransport::new()))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> crate::Result<Arc<dyn Transport>> {
    Err(Error::bad_request(
        "no transport configured; enable the `hyper-transport` feature or set one explicitly",
    ))
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    config: Config,
    observer: Option<Arc<dyn Observer>>,
    metrics: Metrics,
}

/// Issues requests against one transport with shared defaults.
///
/// Cheap to clone; clones share the transport, defaults and metrics.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("config", &self.inner.config)
            .field("observer", &self.inner.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Creates a request. Unless `wait` is set it is sent right away, so
    /// sinks and streaming callbacks need `wait(true)` and an explicit
    /// [`RequestHandle::send`].
    pub fn request(&self, options: impl Into<RequestOptions>) -> RequestHandle {
        let plan = self.inner.config.resolve(options.into());
        let wait = plan.wait;
        let handle = RequestHandle::new(self.clone(), plan);
        if wait { handle } else { handle.send() }
    }

    pub fn get(&self, url: impl Into<String>) -> RequestHandle {
        self.request(RequestOptions::new(url))
    }

    pub fn post(&self, url: impl Into<String>, body: impl Into<Body>) -> RequestHandle {
        self.request(RequestOptions::new(url).method("POST").body(body))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub(crate) fn record_started(&self, context: &RequestContext) {
        self.inner.metrics.record_request_started();
        if let Some(observer) = &self.inner.observer {
            observer.on_request_start(context);
        }
    }

    pub(crate) fn record_attempt(&self, context: &RequestContext, attempt: usize) {
        self.inner.metrics.record_attempt();
        if let Some(observer) = &self.inner.observer {
            observer.on_attempt_start(context, attempt);
        }
    }

    pub(crate) fn record_retry(
        &self,
        context: &RequestContext,
        outcome: &AttemptOutcome,
        delay: Duration,
    ) {
        self.inner.metrics.record_retry();
        if let Some(observer) = &self.inner.observer {
            observer.on_retry_scheduled(context, outcome, delay);
        }
    }

    pub(crate) fn record_finished(
        &self,
        context: &RequestContext,
        outcome: &Result<Response, Error>,
        latency: Duration,
    ) {
        self.inner.metrics.record_outcome(outcome, latency);
        if let Some(observer) = &self.inner.observer {
            observer.on_outcome(context, outcome);
        }
    }

    /// Accounts for a request that failed validation and never reached the
    /// transport.
    pub(crate) fn record_rejected(&self, context: &RequestContext, outcome: &Result<Response, Error>) {
        self.record_started(context);
        self.record_finished(context, outcome, Duration::ZERO);
    }
}

#[cfg(feature = "hyper-transport")]
static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();

/// Sends a request with the process-wide default client.
#[cfg(feature = "hyper-transport")]
pub fn request(options: impl Into<RequestOptions>) -> RequestHandle {
    DEFAULT_CLIENT
        .get_or_init(|| Client {
            inner: Arc::new(ClientInner {
                transport: Arc::new(crate::transport::HyperTransport::new()),
                config: Config::default(),
                observer: None,
                metrics: Metrics::disabled(),
            }),
        })
        .request(options)
}
