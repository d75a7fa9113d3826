use std::time::Duration;

use tokio::time::{Instant, sleep_until};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Deadline,
    Attempt,
    Retry,
}

/// Every timer a request owns. Each kind is armed at most once at a time and
/// disarming is a plain reset, so a disarmed timer can never fire later.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    deadline: Option<Instant>,
    attempt: Option<Instant>,
    retry: Option<Instant>,
}

impl TimerSet {
    pub(crate) fn arm_deadline(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub(crate) fn arm_attempt(&mut self, after: Duration) {
        self.attempt = Some(Instant::now() + after);
    }

    pub(crate) fn arm_retry(&mut self, after: Duration) {
        self.retry = Some(Instant::now() + after);
    }

    pub(crate) fn disarm(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Deadline => self.deadline = None,
            TimerKind::Attempt => self.attempt = None,
            TimerKind::Retry => self.retry = None,
        }
    }

    pub(crate) fn disarm_all(&mut self) {
        self.deadline = None;
        self.attempt = None;
        self.retry = None;
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Deadline => self.deadline.is_some(),
            TimerKind::Attempt => self.attempt.is_some(),
            TimerKind::Retry => self.retry.is_some(),
        }
    }

    /// Resolves with the first armed timer to expire. When several are due,
    /// the deadline wins over the attempt watchdog, which wins over a retry.
    pub(crate) async fn expired(&self) -> TimerKind {
        tokio::select! {
            biased;
            () = wait_for(self.deadline) => TimerKind::Deadline,
            () = wait_for(self.attempt) => TimerKind::Attempt,
            () = wait_for(self.retry) => TimerKind::Retry,
        }
    }
}

async fn wait_for(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
