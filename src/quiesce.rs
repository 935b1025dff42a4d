//! Quiescence detection.
//!
//! A locality is quiescent when, after reaping terminated tasks, no more than
//! one live task remains beyond the background housekeeping tasks — the one
//! being the caller itself. [`yield_while`] is the only polling primitive in
//! the crate: every quiescence wait goes through it, so the yielding
//! behavior is a single seam.

use std::time::{Duration, Instant};

use crate::services::ThreadManager;

/// Cooperative yield seam.
///
/// Production yields the current worker; test doubles count the yields or
/// drive a scripted scheduler.
pub trait Yielder: Send + Sync {
    /// Give up the current time slice.
    fn yield_now(&self);
}

/// Yields the current OS thread.
#[derive(Debug, Default)]
pub struct ThreadYield;

impl Yielder for ThreadYield {
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Polls `predicate`, yielding between evaluations, until it returns false.
pub fn yield_while<F: FnMut() -> bool>(mut predicate: F, yielder: &dyn Yielder) {
    while predicate() {
        yielder.yield_now();
    }
}

/// Returns true if only housekeeping work (plus the caller) remains.
#[must_use]
pub fn is_quiescent(tm: &dyn ThreadManager) -> bool {
    tm.thread_count() <= 1 + tm.background_thread_count()
}

/// Blocks (yielding) until the locality is quiescent.
pub fn wait_until_quiescent(tm: &dyn ThreadManager, yielder: &dyn Yielder) {
    yield_while(
        || {
            tm.cleanup_terminated(true);
            !is_quiescent(tm)
        },
        yielder,
    );
}

/// Blocks (yielding) until the locality is quiescent or the wall-clock
/// budget expires. Returns true if the budget expired first; `None` waits
/// forever.
pub fn wait_until_quiescent_for(
    tm: &dyn ThreadManager,
    yielder: &dyn Yielder,
    timeout: Option<Duration>,
) -> bool {
    let start = Instant::now();
    let mut timed_out = false;
    yield_while(
        || {
            tm.cleanup_terminated(true);
            if let Some(budget) = timeout {
                if start.elapsed() > budget {
                    timed_out = true;
                    return false;
                }
            }
            !is_quiescent(tm)
        },
        yielder,
    );
    timed_out
}

/// Converts a wire-level timeout (seconds, negative = forever) to a budget.
#[must_use]
pub fn timeout_from_seconds(seconds: f64) -> Option<Duration> {
    if seconds < 0.0 {
        None
    } else {
        Some(Duration::from_secs_f64(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingYield {
        yields: AtomicUsize,
    }

    impl Yielder for CountingYield {
        fn yield_now(&self) {
            self.yields.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct FakeThreads {
        live: AtomicI64,
        background: i64,
        drain_per_cleanup: i64,
    }

    impl FakeThreads {
        fn new(live: i64, background: i64, drain_per_cleanup: i64) -> Self {
            Self {
                live: AtomicI64::new(live),
                background,
                drain_per_cleanup,
            }
        }
    }

    impl ThreadManager for FakeThreads {
        fn cleanup_terminated(&self, _full: bool) {
            let live = self.live.load(Ordering::Relaxed);
            let floor = 1 + self.background;
            if live > floor {
                self.live
                    .store((live - self.drain_per_cleanup).max(floor), Ordering::Relaxed);
            }
        }

        fn thread_count(&self) -> i64 {
            self.live.load(Ordering::Relaxed)
        }

        fn background_thread_count(&self) -> i64 {
            self.background
        }

        fn abort_all_suspended_threads(&self) {
            self.live.store(1 + self.background, Ordering::Relaxed);
        }

        fn resume(&self) {}
    }

    #[test]
    fn yield_while_stops_when_predicate_clears() {
        let yielder = CountingYield::default();
        let mut polls = 0;
        yield_while(
            || {
                polls += 1;
                polls < 4
            },
            &yielder,
        );
        assert_eq!(polls, 4);
        assert_eq!(yielder.yields.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn quiescence_counts_caller_and_background() {
        let tm = FakeThreads::new(3, 2, 0);
        assert!(is_quiescent(&tm));
        let busy = FakeThreads::new(4, 2, 0);
        assert!(!is_quiescent(&busy));
    }

    #[test]
    fn unbounded_wait_drains_to_quiescence() {
        let tm = FakeThreads::new(10, 0, 2);
        let yielder = CountingYield::default();
        wait_until_quiescent(&tm, &yielder);
        assert!(is_quiescent(&tm));
    }

    #[test]
    fn bounded_wait_reports_expiry() {
        // Live count never drains: the budget must expire.
        let tm = FakeThreads::new(10, 0, 0);
        let yielder = Arc::new(CountingYield::default());
        let timed_out =
            wait_until_quiescent_for(&tm, yielder.as_ref(), Some(Duration::from_millis(5)));
        assert!(timed_out);
        assert!(!is_quiescent(&tm));
    }

    #[test]
    fn negative_seconds_wait_forever() {
        assert_eq!(timeout_from_seconds(-1.0), None);
        assert_eq!(
            timeout_from_seconds(0.25),
            Some(Duration::from_millis(250))
        );
    }
}
