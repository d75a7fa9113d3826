use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot guard: exactly one caller of [`OnceLatch::close`] wins.
#[derive(Debug, Default)]
pub(crate) struct OnceLatch {
    closed: AtomicBool,
}

impl OnceLatch {
    pub(crate) const fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` only for the call that closed the latch.
    pub(crate) fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::OnceLatch;

    #[test]
    fn only_first_close_wins() {
        let latch = OnceLatch::new();
        assert!(!latch.is_closed());
        assert!(latch.close());
        assert!(!latch.close());
        assert!(latch.is_closed());
    }

    #[test]
    fn racing_threads_close_exactly_once() {
        let latch = Arc::new(OnceLatch::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let threads = (0..8)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if latch.close() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().expect("latch thread");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
