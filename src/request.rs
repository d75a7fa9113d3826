use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use http::Method;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::client::Client;
use crate::config::RequestPlan;
use crate::coordinator::{Coordinator, CoordinatorParts};
use crate::error::Error;
use crate::latch::OnceLatch;
use crate::observe::RequestContext;
use crate::response::Response;
use crate::sink::{Sink, SinkFanout};
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

pub(crate) type DataCallback = Box<dyn FnMut(&Bytes) + Send>;
pub(crate) type HeaderCallback = Box<dyn FnMut(&str) + Send>;
type CompletionCallback = Box<dyn FnOnce(Result<Response, Error>) + Send>;

/// Everything a request needs before it is sent.
pub(crate) struct Pending {
    plan: RequestPlan,
    sinks: SinkFanout,
    on_data: Option<DataCallback>,
    on_header: Option<HeaderCallback>,
    client: Client,
}

/// State shared between the caller's handles and the coordinator task.
///
/// Every outcome goes through [`Shared::deliver`], so the caller's `abort()`
/// and the coordinator can race without producing two outcomes.
pub(crate) struct Shared {
    latch: OnceLatch,
    cancel: CancellationToken,
    method: Method,
    uri: String,
    outcome: watch::Sender<Option<Result<Response, Error>>>,
    callbacks: Mutex<Vec<CompletionCallback>>,
    pending: Mutex<Option<Pending>>,
}

impl Shared {
    pub(crate) fn is_finished(&self) -> bool {
        self.latch.is_closed()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn aborted_error(&self) -> Error {
        Error::Aborted {
            method: self.method.clone(),
            uri: self.uri.clone(),
        }
    }

    /// Returns `false` when another path already delivered an outcome.
    pub(crate) fn deliver(&self, outcome: Result<Response, Error>) -> bool {
        if !self.latch.close() {
            return false;
        }
        let callbacks = {
            let mut callbacks = lock_unpoisoned(&self.callbacks);
            self.outcome.send_replace(Some(outcome.clone()));
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }

    fn abort(&self) {
        self.cancel.cancel();
        let error = self.aborted_error();
        if let Some(mut pending) = lock_unpoisoned(&self.pending).take() {
            pending.sinks.destroy(&error);
        }
        if self.deliver(Err(error)) {
            debug!(method = %self.method, uri = %self.uri, "request aborted by caller");
        }
    }

    async fn outcome(&self) -> Result<Response, Error> {
        let mut receiver = self.outcome.subscribe();
        let delivered = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone());
        delivered.unwrap_or_else(|| Err(self.aborted_error()))
    }
}

/// One logical request.
///
/// Sinks and streaming callbacks must be attached before [`send`]. The
/// outcome is delivered exactly once, to every [`on_complete`] callback and
/// to the handle awaited as a future.
///
/// [`send`]: RequestHandle::send
/// [`on_complete`]: RequestHandle::on_complete
pub struct RequestHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestHandle")
            .field("method", &self.shared.method)
            .field("uri", &self.shared.uri)
            .field("finished", &self.shared.is_finished())
            .finish()
    }
}

impl RequestHandle {
    pub(crate) fn new(client: Client, plan: RequestPlan) -> Self {
        let (outcome, _) = watch::channel(None);
        let shared = Shared {
            latch: OnceLatch::new(),
            cancel: CancellationToken::new(),
            method: plan.method.clone(),
            uri: redact_uri_for_logs(&plan.raw_url),
            outcome,
            callbacks: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
        };
        let shared = Arc::new(shared);
        *lock_unpoisoned(&shared.pending) = Some(Pending {
            plan,
            sinks: SinkFanout::default(),
            on_data: None,
            on_header: None,
            client,
        });
        Self { shared }
    }

    /// Starts the request. Calling it again, or after `abort()`, does nothing.
    pub fn send(self) -> Self {
        let pending = lock_unpoisoned(&self.shared.pending).take();
        if let Some(pending) = pending {
            dispatch(&self.shared, pending);
        }
        self
    }

    /// Cancels the request and delivers `Aborted` unless an outcome was
    /// already delivered. Safe to call any number of times.
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Streams the response body into `sink` as well.
    pub fn pipe(self, sink: impl Sink) -> Self {
        self.with_pending("pipe", |pending| pending.sinks.push(Box::new(sink)));
        self
    }

    /// Called with each body chunk of the attempt whose outcome is delivered.
    pub fn on_data<F>(self, callback: F) -> Self
    where
        F: FnMut(&Bytes) + Send + 'static,
    {
        self.with_pending("on_data", |pending| {
            pending.on_data = Some(Box::new(callback));
        });
        self
    }

    /// Called with every raw header line, status lines included.
    pub fn on_header<F>(self, callback: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.with_pending("on_header", |pending| {
            pending.on_header = Some(Box::new(callback));
        });
        self
    }

    /// Registers a completion callback. If the outcome is already known the
    /// callback runs immediately on the calling thread.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        let delivered = {
            let mut callbacks = lock_unpoisoned(&self.shared.callbacks);
            let delivered = self.shared.outcome.borrow().clone();
            if delivered.is_none() {
                callbacks.push(Box::new(callback));
                None
            } else {
                delivered.map(|outcome| (outcome, callback))
            }
        };
        if let Some((outcome, callback)) = delivered {
            callback(outcome);
        }
        self
    }

    fn with_pending(&self, operation: &str, attach: impl FnOnce(&mut Pending)) {
        let mut pending = lock_unpoisoned(&self.shared.pending);
        match pending.as_mut() {
            Some(pending) => attach(pending),
            None => warn!(
                operation,
                uri = %self.shared.uri,
                "request already sent; attachment ignored"
            ),
        }
    }
}

impl IntoFuture for RequestHandle {
    type Output = Result<Response, Error>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    /// Sends the request if needed and resolves with its outcome.
    fn into_future(self) -> Self::IntoFuture {
        let handle = self.send();
        Box::pin(async move { handle.shared.outcome().await })
    }
}

/// Cloneable handle that can only cancel the request.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AbortHandle")
            .field("finished", &self.shared.is_finished())
            .finish()
    }
}

impl AbortHandle {
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }
}

fn dispatch(shared: &Arc<Shared>, pending: Pending) {
    let Pending {
        plan,
        mut sinks,
        on_data,
        on_header,
        client,
    } = pending;
    let RequestPlan {
        method,
        config,
        prepared,
        ..
    } = plan;
    let context = RequestContext::new(method.clone(), shared.uri.clone());

    let prepared = prepared.and_then(|prepared| {
        let proxy = config.proxy_url(&prepared.url)?;
        Ok((prepared, proxy))
    });
    let prepared = prepared.and_then(|prepared| match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Ok((prepared, runtime)),
        Err(_) => Err(Error::bad_request(
            "requests must be sent from within a tokio runtime",
        )),
    });
    let ((prepared, proxy), runtime) = match prepared {
        Ok(ready) => ready,
        Err(error) => {
            debug!(method = %method, uri = %shared.uri, error = %error, "request rejected before sending");
            sinks.destroy(&error);
            let outcome = Err(error);
            client.record_rejected(&context, &outcome);
            shared.deliver(outcome);
            return;
        }
    };

    let span = info_span!("reqwire.request", method = %method, uri = %shared.uri);
    let coordinator = Coordinator::new(CoordinatorParts {
        shared: Arc::clone(shared),
        client,
        context,
        method,
        url: prepared.url,
        headers: prepared.headers,
        payload: prepared.payload,
        proxy,
        config,
        sinks,
        on_data,
        on_header,
        started_at: Instant::now(),
    });
    runtime.spawn(coordinator.run().instrument(span));
}
