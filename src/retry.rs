use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::error::TransportErrorKind;

pub const DEFAULT_BAD_STATUSES: [u16; 13] = [
    300, 303, 305, 400, 407, 408, 409, 410, 500, 502, 503, 504, 510,
];

/// What the latest attempt produced, as seen by the retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Status(StatusCode),
    TransportError(TransportErrorKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry { delay: Duration },
    Stop,
}

impl RetryVerdict {
    pub const fn is_retry(self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Decides whether a completed response status counts as a failure.
pub trait BadStatusClassifier: Send + Sync {
    fn is_bad_status(&self, status: StatusCode, bad_statuses: &BTreeSet<u16>) -> bool;
}

/// Listed statuses and every 5xx are bad.
#[derive(Debug, Default)]
pub struct StandardBadStatus;

impl BadStatusClassifier for StandardBadStatus {
    fn is_bad_status(&self, status: StatusCode, bad_statuses: &BTreeSet<u16>) -> bool {
        bad_statuses.contains(&status.as_u16()) || status.as_u16() >= 500
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    enabled: bool,
    retries: u32,
    delay: Duration,
    bad_statuses: BTreeSet<u16>,
    classifier: Arc<dyn BadStatusClassifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("enabled", &self.enabled)
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .field("bad_statuses", &self.bad_statuses)
            .finish()
    }
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            enabled: true,
            retries: 3,
            delay: Duration::from_millis(256),
            bad_statuses: DEFAULT_BAD_STATUSES.into_iter().collect(),
            classifier: Arc::new(StandardBadStatus),
        }
    }

    pub fn disabled() -> Self {
        Self::standard().enabled(false).retries(0)
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn bad_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.bad_statuses = statuses.into_iter().collect();
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn BadStatusClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn configured_retries(&self) -> u32 {
        if self.enabled { self.retries } else { 0 }
    }

    pub fn configured_delay(&self) -> Duration {
        self.delay
    }

    pub fn is_bad_status(&self, status: StatusCode) -> bool {
        self.classifier.is_bad_status(status, &self.bad_statuses)
    }

    /// Status-based retry keeps the final retry in reserve; error-based
    /// retry may spend it.
    pub fn decide(&self, remaining: u32, outcome: AttemptOutcome) -> RetryVerdict {
        if !self.enabled || remaining == 0 {
            return RetryVerdict::Stop;
        }
        let retry = match outcome {
            AttemptOutcome::TransportError(kind) => kind.is_retriable(),
            AttemptOutcome::Status(status) => remaining > 1 && self.is_bad_status(status),
        };
        if retry {
            RetryVerdict::Retry { delay: self.delay }
        } else {
            RetryVerdict::Stop
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
