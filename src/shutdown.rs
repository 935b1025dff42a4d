//! The cluster-wide shutdown orchestrator.
//!
//! Runs on the root locality only. The sequence: drain in-flight work with a
//! first termination-detection round, broadcast the pre-shutdown and
//! shutdown hook phases, drain the work those hooks spawned with a second
//! round, then take the peers down in reverse id order and stop locally
//! last.
//!
//! The reverse fan-out is not a broadcast: each peer's stop sends an
//! acknowledgment parcel back, and that parcel needs a live destination.
//! Keeping the root alive until every ack arrived is the point of the
//! explicit fan-out plus join barrier.

use std::sync::atomic::Ordering;

use crate::action::Action;
use crate::error::{Error, ErrorKind, Result};
use crate::server::RuntimeSupport;
use crate::services::{wait_all, Completion};
use crate::types::{Gid, LocalityId};

impl RuntimeSupport {
    /// Orchestrates the cluster shutdown. Root locality only; concurrent
    /// calls race on an at-most-once latch, the losers return quietly.
    pub fn shutdown_all(&self, timeout: f64) -> Result<()> {
        if !self.here.is_console() {
            return Err(Error::new(ErrorKind::InvalidStatus)
                .with_context("shutdown_all should be invoked on the root locality only"));
        }

        if self
            .shutdown_all_invoked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        tracing::info!("initializing application shutdown");

        self.deps.agas.start_shutdown();
        self.deps.runtime.disable_counter_evaluation();
        self.deps.tm.resume();

        let localities = self.deps.agas.localities();

        let count = self.token_ring().termination_detection(&localities);
        tracing::info!(probes = count, "passed first termination detection");

        // registered shutdown functions run on every locality
        self.invoke_shutdown_functions(&localities, true);
        self.invoke_shutdown_functions(&localities, false);
        tracing::info!("invoked shutdown functions");

        // a second round synchronizes with any work the hooks triggered
        let count = self.token_ring().termination_detection(&localities);
        tracing::info!(probes = count, "passed second termination detection");

        // Take the peers down in reverse order, the root last, so returning
        // acknowledgment parcels always find a live destination. Not a
        // broadcast on purpose.
        let mut reversed = localities;
        reversed.reverse();
        let mut pending: Vec<Completion> = Vec::new();
        for id in reversed {
            if id != self.here {
                pending.push(self.shutdown_async(id, timeout));
            }
        }
        wait_all(&pending);
        tracing::info!("all localities have been shut down");

        // no initiator to respond to: the root stops on its own behalf
        self.stop(timeout, None, false);
        Ok(())
    }

    /// Asks one peer to stop; the returned completion signals when the
    /// peer's stop sequence acknowledged.
    pub fn shutdown_async(&self, dest: LocalityId, timeout: f64) -> Completion {
        let (event, completion) = self.events.register();
        self.deps.sender.apply(
            dest,
            Action::Shutdown {
                timeout,
                respond_to: Some(event),
            },
        );
        completion
    }

    /// Aborts every locality, peers first in reverse order, then this one.
    pub fn terminate_all(&self) {
        let mut localities = self.deps.agas.localities();
        localities.reverse();

        let mut pending: Vec<Completion> = Vec::new();
        for id in localities {
            if id != self.here {
                pending.push(self.terminate_async(id));
            }
        }
        wait_all(&pending);

        // good night
        self.terminate(None);
    }

    /// Asks one peer to abort; the completion signals once the peer
    /// acknowledged, immediately before it aborts.
    pub fn terminate_async(&self, dest: LocalityId) -> Completion {
        let (event, completion) = self.events.register();
        self.deps.sender.apply(
            dest,
            Action::Terminate {
                respond_to: Some(event),
            },
        );
        completion
    }

    /// Aborts this locality: flush pending logs, acknowledge synchronously
    /// if asked, then tear the process down.
    pub fn terminate(&self, respond_to: Option<Gid>) {
        self.deps.runtime.flush_logs();

        if let Some(event) = respond_to {
            // the ack must be on the wire before the process dies
            let _ = self
                .deps
                .sender
                .apply_sync(event.locality(), Action::SetEvent { event });
        }

        self.deps.terminator.terminate();
    }

    fn invoke_shutdown_functions(&self, localities: &[LocalityId], pre_shutdown: bool) {
        self.deps
            .sender
            .broadcast(localities, Action::CallShutdownFunctions { pre_shutdown })
            .wait();
    }
}
