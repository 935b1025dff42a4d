//! The local stop machine.
//!
//! Three monotone flags guarded by one mutex with two condition variables:
//! `stop_called` arms the machine, `stop_done` releases the waiting main
//! thread, `terminated` records that the thread manager has exited and
//! cleanup finished. Within one run no flag is ever cleared once set;
//! [`StopData::run`] starts a fresh cycle.
//!
//! The heavyweight part of stopping — draining the scheduler, unbinding the
//! locality from the resolver, acknowledging the initiator — runs with the
//! flag mutex released, between `stop_called` and `stop_done`.

use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::action::Action;
use crate::quiesce::{is_quiescent, timeout_from_seconds, wait_until_quiescent_for, yield_while};
use crate::server::RuntimeSupport;
use crate::types::Gid;

// ---------------------------------------------------------------------------
// StopData
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StopFlags {
    stop_called: bool,
    stop_done: bool,
    terminated: bool,
}

/// Stop-flag state of one locality.
#[derive(Debug, Default)]
pub struct StopData {
    flags: Mutex<StopFlags>,
    /// Signals `stop_done` to the waiting main thread.
    wait_condition: Condvar,
    /// Signals `terminated` to whoever drove the stop.
    stop_condition: Condvar,
}

impl StopData {
    /// Creates a machine in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the flags for a fresh run cycle.
    pub fn run(&self) {
        let mut flags = self.flags.lock();
        flags.stop_called = false;
        flags.stop_done = false;
        flags.terminated = false;
    }

    /// Blocks the calling (main) thread until the stop sequence finished.
    pub fn wait(&self) {
        let mut flags = self.flags.lock();
        while !flags.stop_done {
            tracing::info!("about to enter wait state");
            self.wait_condition.wait(&mut flags);
            tracing::info!("exiting wait state");
        }
    }

    /// Records that the thread manager has exited; wakes the stop driver.
    pub fn stopped(&self) {
        let mut flags = self.flags.lock();
        if !flags.terminated {
            flags.terminated = true;
            self.stop_condition.notify_all();
        }
    }

    /// Short-circuit for an early exit request: flips `stop_called` and
    /// `stop_done` together without draining, wakes the waiting main thread,
    /// then still blocks until cleanup finished. Startup/shutdown hooks are
    /// not run on this path; hook delivery belongs to the orchestrator.
    pub fn notify_waiting_main(&self) {
        let mut flags = self.flags.lock();
        if !flags.stop_called {
            flags.stop_called = true;
            flags.stop_done = true;
            self.wait_condition.notify_all();
            while !flags.terminated {
                self.stop_condition.wait(&mut flags);
            }
        }
    }

    /// The stop sequence. Runs `teardown` with the flag mutex released, then
    /// marks `stop_done`, wakes the waiter and blocks until [`StopData::stopped`]
    /// reports cleanup. Idempotent: a second entrant observes `stop_called`
    /// and returns false without side effects.
    pub fn stop_with<F: FnOnce()>(&self, teardown: F) -> bool {
        let mut flags = self.flags.lock();
        if flags.stop_called {
            return false;
        }
        debug_assert!(!flags.terminated);
        flags.stop_called = true;

        MutexGuard::unlocked(&mut flags, teardown);

        flags.stop_done = true;
        self.wait_condition.notify_all();
        while !flags.terminated {
            self.stop_condition.wait(&mut flags);
        }
        true
    }

    /// Snapshot of `(stop_called, stop_done, terminated)`.
    #[must_use]
    pub fn snapshot(&self) -> (bool, bool, bool) {
        let flags = self.flags.lock();
        (flags.stop_called, flags.stop_done, flags.terminated)
    }
}

// ---------------------------------------------------------------------------
// Stop sequence of the server
// ---------------------------------------------------------------------------

impl RuntimeSupport {
    /// Resets the stop machine and the orchestration latch for a fresh run.
    pub fn run(&self) {
        self.stop_data.run();
        self.shutdown_all_invoked
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Blocks the main thread until the stop sequence finished.
    pub fn wait(&self) {
        self.stop_data.wait();
    }

    /// Called after the thread manager has exited.
    pub fn stopped(&self) {
        self.stop_data.stopped();
    }

    /// Early-exit short circuit; see [`StopData::notify_waiting_main`].
    pub fn notify_waiting_main(&self) {
        self.stop_data.notify_waiting_main();
    }

    /// Snapshot of `(stop_called, stop_done, terminated)`.
    #[must_use]
    pub fn stop_state(&self) -> (bool, bool, bool) {
        self.stop_data.snapshot()
    }

    /// The remote `shutdown` action: stop and acknowledge the initiator.
    pub fn shutdown(&self, timeout: f64, respond_to: Option<Gid>) {
        self.stop(timeout, respond_to, false);
    }

    /// Stops this locality.
    ///
    /// Drains without coercion first; once the wall-clock budget expires, a
    /// second loop aborts suspended tasks on every iteration. The server and
    /// memory addresses are always unbound before the initiator is
    /// acknowledged, so no parcel can reach a half-dead locality.
    pub fn stop(&self, timeout: f64, respond_to: Option<Gid>, remove_from_remote_caches: bool) {
        let entered = self.stop_data.stop_with(|| {
            self.deps.runtime.flush_logs();

            let tm = self.deps.tm.as_ref();
            let yielder = self.deps.yielder.as_ref();
            let budget = timeout_from_seconds(timeout);

            let timed_out = wait_until_quiescent_for(tm, yielder, budget);
            if timed_out {
                tracing::warn!(timeout, "drain budget expired, aborting suspended tasks");
                let start = Instant::now();
                yield_while(
                    || {
                        tm.abort_all_suspended_threads();
                        tm.cleanup_terminated(true);
                        if let Some(b) = budget {
                            if start.elapsed() > b {
                                return false;
                            }
                        }
                        !is_quiescent(tm)
                    },
                    yielder,
                );
            }

            // drop the locality from the partition table
            let agas = self.deps.agas.as_ref();
            if let Err(e) = agas.unbind_local(Gid::runtime_support_of(self.here)) {
                tracing::debug!(error = %e, "unbinding runtime-support address failed");
            }
            if let Err(e) = agas.unbind_local(Gid::memory_of(self.here)) {
                tracing::debug!(error = %e, "unbinding memory address failed");
            }

            if remove_from_remote_caches {
                self.remove_here_from_connection_cache();
            }

            if let Err(e) = agas.unregister_locality(self.here) {
                tracing::debug!(error = %e, "unregistering locality failed");
            }

            if remove_from_remote_caches {
                self.remove_here_from_console_connection_cache();
            }

            if let Some(event) = respond_to {
                // synchronous: the initiator must see the ack while this
                // address space is still alive
                let _ = self
                    .deps
                    .sender
                    .apply_sync(event.locality(), Action::SetEvent { event });
            }
        });

        if !entered {
            tracing::debug!("stop already in progress, returning");
        }
    }

    /// Asks every other non-console locality to drop this one from its
    /// connection cache; joins the eviction acknowledgments.
    pub(crate) fn remove_here_from_connection_cache(&self) {
        let endpoints = self.deps.runtime.endpoints();
        let here_gid = Gid::of_locality(self.here);

        let mut callbacks = Vec::new();
        for id in self.deps.agas.localities() {
            // the console is handled separately
            if id == self.here || id.is_console() {
                continue;
            }
            callbacks.push(self.deps.sender.apply_cb(
                id,
                Action::RemoveFromConnectionCache {
                    gid: here_gid,
                    endpoints: endpoints.clone(),
                },
            ));
        }
        crate::services::wait_all(&callbacks);
    }

    /// Console variant of the cache eviction.
    pub(crate) fn remove_here_from_console_connection_cache(&self) {
        if self.here.is_console() {
            return;
        }
        let endpoints = self.deps.runtime.endpoints();
        let callback = self.deps.sender.apply_cb(
            crate::types::LocalityId::CONSOLE,
            Action::RemoveFromConnectionCache {
                gid: Gid::of_locality(self.here),
                endpoints,
            },
        );
        callback.wait();
    }
}
