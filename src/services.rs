//! Consumed interfaces of the runtime-support server.
//!
//! The server is a control plane: it owns the shutdown protocol but none of
//! the machinery it coordinates. The scheduler, the address-resolution
//! service, the parcel layer and the surrounding runtime are reached through
//! the traits in this module, which keeps every effect behind an explicit
//! handle and lets the test fixtures script them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::action::{Action, ActionResult};
use crate::error::{Error, Result};
use crate::types::{CounterInfo, Endpoints, Gid, LocalityId, RuntimeState};

// ---------------------------------------------------------------------------
// ThreadManager
// ---------------------------------------------------------------------------

/// The local scheduler, seen through the five operations the shutdown path
/// needs.
pub trait ThreadManager: Send + Sync {
    /// Reap terminated tasks; `full` also compacts internal queues.
    fn cleanup_terminated(&self, full: bool);

    /// Number of live tasks, including the caller.
    fn thread_count(&self) -> i64;

    /// Number of background (housekeeping) tasks.
    fn background_thread_count(&self) -> i64;

    /// Abort every suspended task; used when a stop budget expires.
    fn abort_all_suspended_threads(&self);

    /// Resume any parked worker threads.
    fn resume(&self);
}

// ---------------------------------------------------------------------------
// AddressingService
// ---------------------------------------------------------------------------

/// The cluster's name resolver and lifetime manager (AGAS).
pub trait AddressingService: Send + Sync {
    /// All localities of the run, in id order.
    fn localities(&self) -> Vec<LocalityId>;

    /// The locality this process is.
    fn local_locality(&self) -> LocalityId;

    /// Drop a local binding; the entity is no longer resolvable.
    fn unbind_local(&self, gid: Gid) -> Result<()>;

    /// Remove a locality from the partition table.
    fn unregister_locality(&self, locality: LocalityId) -> Result<()>;

    /// Switch the resolver into shutdown mode (no new registrations).
    fn start_shutdown(&self);

    /// Kick off a non-blocking garbage-collection pass.
    fn garbage_collect_non_blocking(&self);

    /// Returns true if the address of `gid` is cached locally.
    fn is_local_address_cached(&self, gid: Gid) -> bool;
}

// ---------------------------------------------------------------------------
// ParcelHandler
// ---------------------------------------------------------------------------

/// The wire transport, seen through its cache-maintenance surface.
pub trait ParcelHandler: Send + Sync {
    /// Push out any buffered parcels.
    fn flush_parcels(&self);

    /// Drop all cached connections to the given peer.
    fn remove_from_connection_cache(&self, gid: Gid, endpoints: &Endpoints);
}

// ---------------------------------------------------------------------------
// RuntimeHandle
// ---------------------------------------------------------------------------

/// The surrounding runtime instance.
pub trait RuntimeHandle: Send + Sync {
    /// Record the lifecycle phase transition.
    fn set_state(&self, state: RuntimeState);

    /// Report an error captured from a shutdown hook.
    fn report_error(&self, error: Error);

    /// Transport endpoints of this locality.
    fn endpoints(&self) -> Endpoints;

    /// Push pending log records out before the address space tears down.
    fn flush_logs(&self);

    /// Stop evaluating performance counters during shutdown.
    fn disable_counter_evaluation(&self);

    /// Instantiate a performance counter locally.
    fn create_performance_counter(&self, info: &CounterInfo) -> Result<Gid>;
}

// ---------------------------------------------------------------------------
// Terminator
// ---------------------------------------------------------------------------

/// The abnormal-exit seam.
///
/// Production aborts the process; tests record the call and return so the
/// fixture can assert on it.
pub trait Terminator: Send + Sync {
    /// Abort this locality. May return in test harnesses.
    fn terminate(&self);
}

/// Production terminator: aborts the process.
#[derive(Debug, Default)]
pub struct AbortTerminator;

impl Terminator for AbortTerminator {
    fn terminate(&self) {
        std::process::abort();
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// A join handle over one or more pending acknowledgments.
///
/// Created with an expected count; every [`Completion::signal`] decrements
/// it, and waiters are released when the count reaches zero. A count of one
/// is a plain future-like ack; broadcasts hand out one completion shared
/// across all destinations.
#[derive(Clone, Debug)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

#[derive(Debug)]
struct CompletionInner {
    remaining: Mutex<usize>,
    condvar: Condvar,
}

impl Completion {
    /// Creates a completion expecting `count` signals. A zero count is
    /// already done.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                remaining: Mutex::new(count),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Records one acknowledgment.
    pub fn signal(&self) {
        let mut remaining = self.inner.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.inner.condvar.notify_all();
        }
    }

    /// Blocks until every expected signal arrived.
    pub fn wait(&self) {
        let mut remaining = self.inner.remaining.lock();
        while *remaining > 0 {
            self.inner.condvar.wait(&mut remaining);
        }
    }

    /// Blocks up to `timeout`; returns true if the completion finished.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.inner.remaining.lock();
        while *remaining > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            if self
                .inner
                .condvar
                .wait_for(&mut remaining, left)
                .timed_out()
                && *remaining > 0
            {
                return false;
            }
        }
        true
    }

    /// Returns true if every expected signal arrived.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.inner.remaining.lock() == 0
    }
}

/// Joins a set of completions, blocking until all are done.
pub fn wait_all(completions: &[Completion]) {
    for completion in completions {
        completion.wait();
    }
}

// ---------------------------------------------------------------------------
// ParcelSender
// ---------------------------------------------------------------------------

/// Outbound action delivery.
///
/// Any implementation that reaches a remote locality is expected to call
/// [`crate::server::RuntimeSupport::dijkstra_make_black`] on its sending
/// path; the token-ring safety rule R1 depends on it.
pub trait ParcelSender: Send + Sync {
    /// Fire-and-forget delivery.
    fn apply(&self, dest: LocalityId, action: Action);

    /// Delivery with a completion that signals once the remote handler ran.
    fn apply_cb(&self, dest: LocalityId, action: Action) -> Completion;

    /// Synchronous request: blocks until the remote handler's result is back.
    fn apply_sync(&self, dest: LocalityId, action: Action) -> ActionResult;

    /// Deliver one action to many localities; the returned completion joins
    /// all of them.
    fn broadcast(&self, localities: &[LocalityId], action: Action) -> Completion;
}

// ---------------------------------------------------------------------------
// EventRegistry
// ---------------------------------------------------------------------------

/// Registry of void events awaiting a remote `set_event`.
///
/// `shutdown_async` and `terminate_async` register an event here, ship its
/// gid as `respond_to`, and join the completion; the remote stop machine
/// signals it synchronously before its address space tears down.
#[derive(Debug)]
pub struct EventRegistry {
    owner: LocalityId,
    next_sequence: AtomicU32,
    pending: Mutex<HashMap<Gid, Completion>>,
}

/// First sequence number used for events, clear of the fixed component ids.
const EVENT_SEQUENCE_BASE: u32 = 1000;

impl EventRegistry {
    /// Creates an event registry for the given locality.
    #[must_use]
    pub fn new(owner: LocalityId) -> Self {
        Self {
            owner,
            next_sequence: AtomicU32::new(EVENT_SEQUENCE_BASE),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a fresh void event; returns its gid and the completion that
    /// [`EventRegistry::set_event`] will signal.
    pub fn register(&self) -> (Gid, Completion) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let gid = Gid::new(self.owner, sequence);
        let completion = Completion::new(1);
        self.pending.lock().insert(gid, completion.clone());
        (gid, completion)
    }

    /// Signals a registered event. Returns false (and logs) for unknown gids,
    /// which can happen when an initiator timed out and forgot the event.
    pub fn set_event(&self, gid: Gid) -> bool {
        match self.pending.lock().remove(&gid) {
            Some(completion) => {
                completion.signal();
                true
            }
            None => {
                tracing::warn!(event = %gid, "set_event for unknown event");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_joins_counted_signals() {
        let completion = Completion::new(3);
        assert!(!completion.is_done());
        completion.signal();
        completion.signal();
        assert!(!completion.wait_timeout(Duration::from_millis(10)));
        completion.signal();
        completion.wait();
        assert!(completion.is_done());
    }

    #[test]
    fn zero_count_is_already_done() {
        let completion = Completion::new(0);
        assert!(completion.is_done());
        completion.wait();
    }

    #[test]
    fn completion_releases_cross_thread_waiter() {
        let completion = Completion::new(1);
        let waiter = {
            let completion = completion.clone();
            thread::spawn(move || completion.wait())
        };
        completion.signal();
        waiter.join().expect("waiter panicked");
    }

    #[test]
    fn event_registry_signals_registered_events() {
        let events = EventRegistry::new(LocalityId::CONSOLE);
        let (gid, completion) = events.register();
        assert_eq!(gid.locality(), LocalityId::CONSOLE);
        assert!(!completion.is_done());
        assert!(events.set_event(gid));
        assert!(completion.is_done());
        // second signal of the same event is unknown
        assert!(!events.set_event(gid));
    }

    #[test]
    fn event_gids_are_unique() {
        let events = EventRegistry::new(LocalityId::from_raw(2));
        let (a, _) = events.register();
        let (b, _) = events.register();
        assert_ne!(a, b);
    }
}
