use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, TimeoutPhase};
use crate::response::Response;
use crate::util::{duration_to_millis_u64, lock_unpoisoned};

#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub deadline_timeouts: u64,
    pub attempt_timeouts: u64,
    pub aborts: u64,
    pub transport_errors: u64,
    pub sink_failures: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// In-process counters shared by every request of a client. A disabled
/// instance records nothing.
#[derive(Clone, Debug, Default)]
pub(crate) struct Metrics {
    inner: Option<Arc<MetricsInner>>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    deadline_timeouts: AtomicU64,
    attempt_timeouts: AtomicU64,
    aborts: AtomicU64,
    transport_errors: AtomicU64,
    sink_failures: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<MetricsInner>>,
}

impl Metrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(MetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_started(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_attempt(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sink_failures(&self, failures: usize) {
        let Some(inner) = &self.inner else {
            return;
        };
        if failures > 0 {
            inner
                .sink_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_outcome(&self, outcome: &Result<Response, Error>, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner
            .latency_total_ms
            .fetch_add(duration_to_millis_u64(latency), Ordering::Relaxed);

        let error = match outcome {
            Ok(response) => {
                inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
                return;
            }
            Err(error) => error,
        };

        inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        match error {
            Error::Timeout { phase, .. } => {
                let counter = match phase {
                    TimeoutPhase::Deadline => &inner.deadline_timeouts,
                    TimeoutPhase::Attempt => &inner.attempt_timeouts,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("timeout:{phase}"));
            }
            Error::Aborted { .. } => {
                inner.aborts.fetch_add(1, Ordering::Relaxed);
                self.add_error_count("aborted".to_owned());
            }
            Error::Transport { kind, .. } => {
                inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("transport:{kind}"));
            }
            Error::BadStatus { status, .. } => {
                self.add_status_count(*status);
                self.add_error_count(format!("bad_status:{status}"));
            }
            other => {
                if other.transport_kind().is_some() {
                    inner.transport_errors.fetch_add(1, Ordering::Relaxed);
                }
                self.add_error_count(other.kind().as_str().to_owned());
            }
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let Some(inner) = &self.inner else {
            return MetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            requests_started: inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            attempts: inner.attempts.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            deadline_timeouts: inner.deadline_timeouts.load(Ordering::Relaxed),
            attempt_timeouts: inner.attempt_timeouts.load(Ordering::Relaxed),
            aborts: inner.aborts.load(Ordering::Relaxed),
            transport_errors: inner.transport_errors.load(Ordering::Relaxed),
            sink_failures: inner.sink_failures.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut status_counts = lock_unpoisoned(&inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
