//! Startup/shutdown hook registry.
//!
//! Plugins contribute nullary hooks into four insertion-ordered lists:
//! pre-startup, startup, pre-shutdown, shutdown. Registration is append-only
//! during load; each phase drains its list in order.
//!
//! Failure policy differs by direction: a failing startup hook aborts
//! bootstrap (the error propagates), while a failing or panicking shutdown
//! hook is captured and reported so one faulty hook cannot stop the rest of
//! the teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::services::RuntimeHandle;
use crate::types::RuntimeState;

/// A nullary hook contributed by a plugin.
pub type Hook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// The four ordered hook lists of one locality.
#[derive(Default)]
pub struct HookRegistry {
    pre_startup: Vec<Hook>,
    startup: Vec<Hook>,
    pre_shutdown: Vec<Hook>,
    shutdown: Vec<Hook>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("pre_startup", &self.pre_startup.len())
            .field("startup", &self.startup.len())
            .field("pre_shutdown", &self.pre_shutdown.len())
            .field("shutdown", &self.shutdown.len())
            .finish()
    }
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a startup hook to the selected phase.
    pub fn add_startup(&mut self, hook: Hook, pre_startup: bool) {
        if pre_startup {
            self.pre_startup.push(hook);
        } else {
            self.startup.push(hook);
        }
    }

    /// Appends a shutdown hook to the selected phase.
    pub fn add_shutdown(&mut self, hook: Hook, pre_shutdown: bool) {
        if pre_shutdown {
            self.pre_shutdown.push(hook);
        } else {
            self.shutdown.push(hook);
        }
    }

    /// Clones out the selected startup phase in registration order.
    #[must_use]
    pub fn startup_hooks(&self, pre_startup: bool) -> Vec<Hook> {
        if pre_startup {
            self.pre_startup.clone()
        } else {
            self.startup.clone()
        }
    }

    /// Clones out the selected shutdown phase in registration order.
    #[must_use]
    pub fn shutdown_hooks(&self, pre_shutdown: bool) -> Vec<Hook> {
        if pre_shutdown {
            self.pre_shutdown.clone()
        } else {
            self.shutdown.clone()
        }
    }

    /// Drops every registered hook from all four lists.
    pub fn delete_function_lists(&mut self) {
        self.pre_startup.clear();
        self.startup.clear();
        self.pre_shutdown.clear();
        self.shutdown.clear();
    }

    /// Total number of registered hooks across all phases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pre_startup.len() + self.startup.len() + self.pre_shutdown.len() + self.shutdown.len()
    }

    /// Returns true if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs one startup phase: sets the runtime state and invokes each hook in
/// order. The first failing hook aborts the phase.
pub fn run_startup_phase(
    hooks: &[Hook],
    pre_startup: bool,
    runtime: &dyn RuntimeHandle,
) -> Result<()> {
    runtime.set_state(if pre_startup {
        RuntimeState::PreStartup
    } else {
        RuntimeState::Startup
    });
    for hook in hooks {
        hook()?;
    }
    Ok(())
}

/// Runs one shutdown phase: sets the runtime state and invokes each hook in
/// order, capturing failures and panics and forwarding them to the runtime's
/// error reporter.
pub fn run_shutdown_phase(hooks: &[Hook], pre_shutdown: bool, runtime: &dyn RuntimeHandle) {
    runtime.set_state(if pre_shutdown {
        RuntimeState::PreShutdown
    } else {
        RuntimeState::Shutdown
    });
    for hook in hooks {
        match catch_unwind(AssertUnwindSafe(|| hook())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => runtime.report_error(err),
            Err(payload) => runtime.report_error(
                Error::new(ErrorKind::Internal)
                    .with_context(format!("shutdown hook panicked: {}", panic_message(&payload))),
            ),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
