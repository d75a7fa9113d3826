//! Lifecycle of one logical request across its physical attempts.
//!
//! The coordinator runs as a single task. Abort, timers and transport events
//! are raced in one biased `select!`, so every state change is a discrete
//! step and nothing for the same request ever interleaves. Each attempt gets
//! a fresh event channel; dropping the previous receiver is what makes a
//! superseded attempt's late events unobservable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::body::Payload;
use crate::client::Client;
use crate::config::{RequestConfig, StatusPolicy};
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::headers::{normalize_response_headers, parse_status_line};
use crate::observe::RequestContext;
use crate::request::{DataCallback, HeaderCallback, Shared};
use crate::response::Response;
use crate::retry::{AttemptOutcome, RetryVerdict};
use crate::sink::SinkFanout;
use crate::timer::{TimerKind, TimerSet};
use crate::transport::{
    AttemptEvents, AttemptHandle, AttemptRequest, Completion, TransportEvent, TransportFailure,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Sending,
    Retrying,
    Finished,
    Aborted,
}

struct LiveAttempt {
    index: usize,
    handle: Box<dyn AttemptHandle>,
    events: mpsc::Receiver<TransportEvent>,
    status: Option<StatusCode>,
    streamed: bool,
}

enum Step {
    Abort,
    Timer(TimerKind),
    Event(Option<TransportEvent>),
}

/// Result of a sink operation raced against abort and the armed timers.
enum SinkStep {
    Done(usize),
    Abort,
    Timer(TimerKind),
}

/// Upper bound on the extra time a transport gets past its own timeout
/// before the attempt watchdog times the attempt out on its behalf.
const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

fn watchdog_after(timeout: Duration) -> Duration {
    timeout + timeout.min(WATCHDOG_GRACE)
}

pub(crate) struct CoordinatorParts {
    pub(crate) shared: Arc<Shared>,
    pub(crate) client: Client,
    pub(crate) context: RequestContext,
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) payload: Option<Payload>,
    pub(crate) proxy: Option<Url>,
    pub(crate) config: RequestConfig,
    pub(crate) sinks: SinkFanout,
    pub(crate) on_data: Option<DataCallback>,
    pub(crate) on_header: Option<HeaderCallback>,
    pub(crate) started_at: Instant,
}

pub(crate) struct Coordinator {
    shared: Arc<Shared>,
    client: Client,
    context: RequestContext,
    method: Method,
    url: Url,
    headers: HeaderMap,
    payload: Option<Payload>,
    proxy: Option<Url>,
    config: RequestConfig,
    sinks: SinkFanout,
    on_data: Option<DataCallback>,
    on_header: Option<HeaderCallback>,
    started_at: Instant,
    state: State,
    timers: TimerSet,
    remaining: u32,
    attempts_started: usize,
    attempt: Option<LiveAttempt>,
}

impl Coordinator {
    pub(crate) fn new(parts: CoordinatorParts) -> Self {
        let CoordinatorParts {
            shared,
            client,
            context,
            method,
            url,
            headers,
            payload,
            proxy,
            config,
            sinks,
            on_data,
            on_header,
            started_at,
        } = parts;
        let replayable = payload.as_ref().is_none_or(Payload::is_replayable);
        let remaining = if replayable {
            config.retry.configured_retries()
        } else {
            if config.retry.configured_retries() > 0 {
                debug!("upload body cannot be replayed; retries disabled");
            }
            0
        };
        Self {
            shared,
            client,
            context,
            method,
            url,
            headers,
            payload,
            proxy,
            config,
            sinks,
            on_data,
            on_header,
            started_at,
            state: State::Created,
            timers: TimerSet::default(),
            remaining,
            attempts_started: 0,
            attempt: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.client.record_started(&self.context);
        let _in_flight = self.client.metrics().enter_in_flight();
        let deadline = self.config.overall_deadline();
        debug!(
            retries = self.remaining,
            deadline_ms = deadline.as_millis(),
            sinks = self.sinks.len(),
            "request started"
        );
        self.timers.arm_deadline(deadline);
        self.start_attempt();

        let outcome = loop {
            let step = {
                let abort = self.shared.cancel_token().cancelled();
                let attempt = &mut self.attempt;
                tokio::select! {
                    biased;
                    () = abort => Step::Abort,
                    kind = self.timers.expired() => Step::Timer(kind),
                    event = next_event(attempt) => Step::Event(event),
                }
            };
            let resolved = match step {
                Step::Abort => Some(Err(self.shared.aborted_error())),
                Step::Timer(kind) => self.on_timer(kind),
                Step::Event(Some(event)) => self.on_event(event).await,
                Step::Event(None) => self.on_attempt_failed(TransportFailure::new(
                    TransportErrorKind::Other,
                    "transport dropped the attempt without a result",
                )),
            };
            if let Some(outcome) = resolved {
                break outcome;
            }
        };

        let outcome = self.finish(outcome).await;
        self.client
            .record_finished(&self.context, &outcome, self.started_at.elapsed());
        if !self.shared.deliver(outcome) {
            debug!("outcome already delivered; discarding coordinator result");
        }
    }

    fn start_attempt(&mut self) {
        if let Some(mut previous) = self.attempt.take() {
            previous.handle.cancel();
        }
        let index = self.attempts_started;
        self.attempts_started += 1;
        self.state = State::Sending;

        let (events, receiver) = AttemptEvents::channel();
        let request = AttemptRequest {
            index,
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body: self.payload.as_mut().and_then(Payload::next_attempt_body),
            timeout: self.config.timeout,
            connect_timeout: self.config.connect_timeout,
            follow_redirect: self.config.follow_redirect,
            max_redirects: self.config.max_redirects,
            tls: self.config.tls,
            proxy: self.proxy.clone(),
            buffer_body: self.config.buffer_body,
            keep_alive: self.config.keep_alive,
        };
        debug!(attempt = index, remaining = self.remaining, "starting attempt");
        self.client.record_attempt(&self.context, index);
        self.timers.arm_attempt(watchdog_after(self.config.timeout));
        let handle = self.client.transport().attempt(request, events);
        self.attempt = Some(LiveAttempt {
            index,
            handle,
            events: receiver,
            status: None,
            streamed: false,
        });
    }

    fn on_timer(&mut self, kind: TimerKind) -> Option<Result<Response, Error>> {
        self.timers.disarm(kind);
        match kind {
            TimerKind::Deadline => Some(Err(self.timeout_error(
                TimeoutPhase::Deadline,
                self.config.overall_deadline(),
            ))),
            TimerKind::Attempt => {
                let after = watchdog_after(self.config.timeout);
                debug!(after_ms = after.as_millis(), "attempt watchdog fired");
                self.on_attempt_failed(TransportFailure::new(
                    TransportErrorKind::Timeout,
                    format!("attempt produced no result within {}ms", after.as_millis()),
                ))
            }
            TimerKind::Retry => {
                if self.state == State::Retrying {
                    self.start_attempt();
                }
                None
            }
        }
    }

    async fn on_event(&mut self, event: TransportEvent) -> Option<Result<Response, Error>> {
        match event {
            TransportEvent::Header(line) => {
                if let Some(status) = parse_status_line(&line)
                    && let Some(attempt) = self.attempt.as_mut()
                {
                    attempt.status = Some(status);
                }
                if let Some(on_header) = self.on_header.as_mut() {
                    on_header(&line);
                }
                None
            }
            TransportEvent::Data(chunk) => self.forward_chunk(chunk).await,
            TransportEvent::Completed(completion) => self.on_attempt_completed(completion),
            TransportEvent::Failed(failure) => self.on_attempt_failed(failure),
        }
    }

    /// Bytes of an attempt whose status is about to be retried never reach
    /// sinks or the data callback. Sink writes stay bounded by abort and the
    /// armed timers.
    async fn forward_chunk(&mut self, chunk: Bytes) -> Option<Result<Response, Error>> {
        let consumed = !self.sinks.is_empty() || self.on_data.is_some();
        let Some(attempt) = self.attempt.as_mut() else {
            return None;
        };
        if let Some(status) = attempt.status
            && self
                .config
                .retry
                .decide(self.remaining, AttemptOutcome::Status(status))
                .is_retry()
        {
            debug!(
                attempt = attempt.index,
                status = status.as_u16(),
                bytes = chunk.len(),
                "discarding body of attempt that will be retried"
            );
            return None;
        }
        if !consumed {
            return None;
        }
        attempt.streamed = true;
        if !self.sinks.is_empty() {
            let step = {
                let abort = self.shared.cancel_token().cancelled();
                tokio::select! {
                    biased;
                    () = abort => SinkStep::Abort,
                    kind = self.timers.expired() => SinkStep::Timer(kind),
                    failures = self.sinks.write(&chunk) => SinkStep::Done(failures),
                }
            };
            match step {
                SinkStep::Done(failures) => self.client.metrics().record_sink_failures(failures),
                SinkStep::Abort => return Some(Err(self.shared.aborted_error())),
                SinkStep::Timer(kind) => {
                    debug!(timer = ?kind, "timer fired while writing to sinks");
                    return self.on_timer(kind);
                }
            }
        }
        if let Some(on_data) = self.on_data.as_mut() {
            on_data(&chunk);
        }
        None
    }

    fn on_attempt_completed(&mut self, completion: Completion) -> Option<Result<Response, Error>> {
        let streamed = self.close_attempt();
        let Completion {
            status,
            body,
            header_frames,
        } = completion;
        let outcome = AttemptOutcome::Status(status);
        if !streamed && self.try_schedule_retry(outcome) {
            return None;
        }

        if self.config.status_policy == StatusPolicy::Error && self.config.retry.is_bad_status(status)
        {
            return Some(Err(Error::BadStatus {
                status: status.as_u16(),
                method: self.method.clone(),
                uri: self.context.uri().to_owned(),
            }));
        }
        let headers = normalize_response_headers(&header_frames);
        let body = if self.config.buffer_body {
            body
        } else {
            Bytes::new()
        };
        Some(Ok(Response::new(
            status,
            headers,
            body,
            self.url.clone(),
            self.attempts_started,
        )))
    }

    fn on_attempt_failed(&mut self, failure: TransportFailure) -> Option<Result<Response, Error>> {
        let streamed = self.close_attempt();
        let TransportFailure { kind, source } = failure;
        if streamed {
            debug!(kind = %kind, "attempt failed after streaming to sinks; not retrying");
        } else if self.try_schedule_retry(AttemptOutcome::TransportError(kind)) {
            return None;
        }
        if kind == TransportErrorKind::Timeout {
            return Some(Err(self.timeout_error(TimeoutPhase::Attempt, self.config.timeout)));
        }
        Some(Err(Error::from_transport(
            kind,
            &self.method,
            self.context.uri(),
            source,
        )))
    }

    /// Stops the current attempt and its watchdog. Returns whether any of its
    /// bytes were forwarded.
    fn close_attempt(&mut self) -> bool {
        self.timers.disarm(TimerKind::Attempt);
        match self.attempt.take() {
            Some(mut attempt) => {
                attempt.handle.cancel();
                attempt.streamed
            }
            None => false,
        }
    }

    fn try_schedule_retry(&mut self, outcome: AttemptOutcome) -> bool {
        let RetryVerdict::Retry { delay } = self.config.retry.decide(self.remaining, outcome) else {
            return false;
        };
        self.remaining -= 1;
        self.state = State::Retrying;
        debug!(
            outcome = ?outcome,
            remaining = self.remaining,
            delay_ms = delay.as_millis(),
            "scheduling retry"
        );
        self.client.record_retry(&self.context, &outcome, delay);
        self.timers.arm_retry(delay);
        true
    }

    async fn finish(&mut self, outcome: Result<Response, Error>) -> Result<Response, Error> {
        // Only the deadline may still fire; it bounds sink finalization.
        self.timers.disarm(TimerKind::Attempt);
        self.timers.disarm(TimerKind::Retry);
        if let Some(mut attempt) = self.attempt.take() {
            attempt.handle.cancel();
        }

        let outcome = match outcome {
            Ok(response) if self.shared.is_finished() => {
                debug!(status = response.status().as_u16(), "request finished after abort");
                Err(self.shared.aborted_error())
            }
            Ok(response) if self.sinks.is_empty() => Ok(response),
            Ok(response) => {
                let step = {
                    let abort = self.shared.cancel_token().cancelled();
                    tokio::select! {
                        biased;
                        () = abort => SinkStep::Abort,
                        kind = self.timers.expired() => SinkStep::Timer(kind),
                        failures = self.sinks.finalize() => SinkStep::Done(failures),
                    }
                };
                match step {
                    SinkStep::Done(failures) => {
                        self.client.metrics().record_sink_failures(failures);
                        Ok(response)
                    }
                    SinkStep::Abort => Err(self.shared.aborted_error()),
                    SinkStep::Timer(_) => {
                        debug!("deadline fired while finalizing sinks");
                        Err(self.timeout_error(
                            TimeoutPhase::Deadline,
                            self.config.overall_deadline(),
                        ))
                    }
                }
            }
            Err(error) => Err(error),
        };
        self.timers.disarm_all();

        match &outcome {
            Ok(_) => self.state = State::Finished,
            Err(error) => {
                self.sinks.destroy(error);
                self.state = match error {
                    Error::Aborted { .. } => State::Aborted,
                    _ => State::Finished,
                };
            }
        }
        debug!(state = ?self.state, attempts = self.attempts_started, "request finished");
        outcome
    }

    fn timeout_error(&self, phase: TimeoutPhase, after: Duration) -> Error {
        Error::Timeout {
            phase,
            timeout_ms: after.as_millis(),
            method: self.method.clone(),
            uri: self.context.uri().to_owned(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(mut attempt) = self.attempt.take() {
            attempt.handle.cancel();
        }
        if !self.shared.is_finished() {
            let error = self.shared.aborted_error();
            self.sinks.destroy(&error);
            self.shared.deliver(Err(error));
        }
    }
}

async fn next_event(attempt: &mut Option<LiveAttempt>) -> Option<TransportEvent> {
    match attempt {
        Some(attempt) => attempt.events.recv().await,
        None => std::future::pending().await,
    }
}
