//! Test utilities for Ringdown.
//!
//! Shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Scriptable doubles for the consumed services
//! - An in-memory cluster fixture wiring `N` servers over the mesh
//!
//! # Example
//! ```
//! use ringdown::test_utils::{init_test_logging, TestCluster};
//!
//! init_test_logging();
//! let cluster = TestCluster::new(1);
//! assert_eq!(cluster.servers[0].here().raw(), 0);
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::action::Action;
use crate::config::Section;
use crate::error::{Error, Result};
use crate::net::{build_mesh, MeshNode};
use crate::quiesce::ThreadYield;
use crate::registry::module::{ModuleLoader, StaticModuleLoader};
use crate::registry::static_data::StaticRegistry;
use crate::server::{RuntimeSupport, ServerServices};
use crate::services::{
    AddressingService, Completion, ParcelHandler, ParcelSender, RuntimeHandle, Terminator,
    ThreadManager,
};
use crate::types::{CounterInfo, Endpoints, Gid, LocalityId, RuntimeState};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

// ---------------------------------------------------------------------------
// Service doubles
// ---------------------------------------------------------------------------

/// A scriptable thread manager double.
///
/// The live count is a plain atomic the test can move; aborting suspended
/// tasks optionally drops the count to the housekeeping floor so timeout
/// coercion can be observed.
#[derive(Debug)]
pub struct QuietThreads {
    live: AtomicI64,
    background: AtomicI64,
    cleanup_calls: AtomicUsize,
    abort_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    abort_releases: AtomicBool,
}

impl QuietThreads {
    /// Creates a double with the given live and background counts.
    #[must_use]
    pub fn new(live: i64, background: i64) -> Self {
        Self {
            live: AtomicI64::new(live),
            background: AtomicI64::new(background),
            cleanup_calls: AtomicUsize::new(0),
            abort_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            abort_releases: AtomicBool::new(true),
        }
    }

    /// Sets the live thread count.
    pub fn set_live(&self, live: i64) {
        self.live.store(live, Ordering::SeqCst);
    }

    /// When false, aborting suspended tasks does not drain the live count.
    pub fn set_abort_releases(&self, releases: bool) {
        self.abort_releases.store(releases, Ordering::SeqCst);
    }

    /// Number of `abort_all_suspended_threads` calls so far.
    #[must_use]
    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// Number of `resume` calls so far.
    #[must_use]
    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    /// Number of `cleanup_terminated` calls so far.
    #[must_use]
    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }
}

impl ThreadManager for QuietThreads {
    fn cleanup_terminated(&self, _full: bool) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn thread_count(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    fn background_thread_count(&self) -> i64 {
        self.background.load(Ordering::SeqCst)
    }

    fn abort_all_suspended_threads(&self) {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if self.abort_releases.load(Ordering::SeqCst) {
            let floor = 1 + self.background.load(Ordering::SeqCst);
            self.live.store(floor, Ordering::SeqCst);
        }
    }

    fn resume(&self) {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// An addressing-service double for a fixed-size cluster.
#[derive(Debug)]
pub struct StubAgas {
    num_localities: u32,
    here: LocalityId,
    shutdown_started: AtomicBool,
    gc_calls: AtomicUsize,
    unbound: Mutex<Vec<Gid>>,
    unregistered: Mutex<Vec<LocalityId>>,
}

impl StubAgas {
    /// A cluster of `n` localities, seen from the console.
    #[must_use]
    pub fn new(n: u32) -> Self {
        Self::at(n, LocalityId::CONSOLE)
    }

    /// A cluster of `n` localities, seen from `here`.
    #[must_use]
    pub fn at(n: u32, here: LocalityId) -> Self {
        Self {
            num_localities: n,
            here,
            shutdown_started: AtomicBool::new(false),
            gc_calls: AtomicUsize::new(0),
            unbound: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
        }
    }

    /// True once `start_shutdown` was called.
    #[must_use]
    pub fn shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    /// Number of garbage-collection requests so far.
    #[must_use]
    pub fn gc_calls(&self) -> usize {
        self.gc_calls.load(Ordering::SeqCst)
    }

    /// Gids unbound so far, in order.
    #[must_use]
    pub fn unbound(&self) -> Vec<Gid> {
        self.unbound.lock().clone()
    }

    /// Localities unregistered so far, in order.
    #[must_use]
    pub fn unregistered(&self) -> Vec<LocalityId> {
        self.unregistered.lock().clone()
    }
}

impl AddressingService for StubAgas {
    fn localities(&self) -> Vec<LocalityId> {
        (0..self.num_localities).map(LocalityId::from_raw).collect()
    }

    fn local_locality(&self) -> LocalityId {
        self.here
    }

    fn unbind_local(&self, gid: Gid) -> Result<()> {
        self.unbound.lock().push(gid);
        Ok(())
    }

    fn unregister_locality(&self, locality: LocalityId) -> Result<()> {
        self.unregistered.lock().push(locality);
        Ok(())
    }

    fn start_shutdown(&self) {
        self.shutdown_started.store(true, Ordering::SeqCst);
    }

    fn garbage_collect_non_blocking(&self) {
        self.gc_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_local_address_cached(&self, _gid: Gid) -> bool {
        false
    }
}

/// A parcel-handler double recording flushes and cache evictions.
#[derive(Debug, Default)]
pub struct StubParcels {
    flushes: AtomicUsize,
    evicted: Mutex<Vec<(Gid, Endpoints)>>,
}

impl StubParcels {
    /// True once `flush_parcels` was called.
    #[must_use]
    pub fn flushed(&self) -> bool {
        self.flushes.load(Ordering::SeqCst) > 0
    }

    /// Recorded cache evictions, in order.
    #[must_use]
    pub fn evicted(&self) -> Vec<(Gid, Endpoints)> {
        self.evicted.lock().clone()
    }
}

impl ParcelHandler for StubParcels {
    fn flush_parcels(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_from_connection_cache(&self, gid: Gid, endpoints: &Endpoints) {
        self.evicted.lock().push((gid, endpoints.clone()));
    }
}

/// A runtime double recording state transitions and reported errors.
#[derive(Debug)]
pub struct RecordingRuntime {
    here: LocalityId,
    states: Mutex<Vec<RuntimeState>>,
    errors: Mutex<Vec<Error>>,
    log_flushes: AtomicUsize,
    counters_disabled: AtomicBool,
    next_counter: AtomicU32,
}

impl RecordingRuntime {
    /// Creates a runtime double for the given locality.
    #[must_use]
    pub fn new(here: LocalityId) -> Self {
        Self {
            here,
            states: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            log_flushes: AtomicUsize::new(0),
            counters_disabled: AtomicBool::new(false),
            next_counter: AtomicU32::new(5000),
        }
    }

    /// Recorded state transitions, in order.
    #[must_use]
    pub fn states(&self) -> Vec<RuntimeState> {
        self.states.lock().clone()
    }

    /// Errors reported by shutdown hooks, in order.
    #[must_use]
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// Number of log flushes so far.
    #[must_use]
    pub fn log_flushes(&self) -> usize {
        self.log_flushes.load(Ordering::SeqCst)
    }

    /// True once counter evaluation was disabled.
    #[must_use]
    pub fn counters_disabled(&self) -> bool {
        self.counters_disabled.load(Ordering::SeqCst)
    }
}

impl RuntimeHandle for RecordingRuntime {
    fn set_state(&self, state: RuntimeState) {
        self.states.lock().push(state);
    }

    fn report_error(&self, error: Error) {
        self.errors.lock().push(error);
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints::new(vec![format!("mem://{}", self.here)])
    }

    fn flush_logs(&self) {
        self.log_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn disable_counter_evaluation(&self) {
        self.counters_disabled.store(true, Ordering::SeqCst);
    }

    fn create_performance_counter(&self, _info: &CounterInfo) -> Result<Gid> {
        let seq = self.next_counter.fetch_add(1, Ordering::SeqCst);
        Ok(Gid::new(self.here, seq))
    }
}

/// A terminator double that records instead of aborting.
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    terminations: AtomicUsize,
}

impl RecordingTerminator {
    /// Number of terminate calls so far.
    #[must_use]
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

/// A sender double recording applied actions without delivering them.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(LocalityId, Action)>>,
}

impl RecordingSender {
    /// Recorded sends, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<(LocalityId, Action)> {
        self.sent.lock().clone()
    }
}

impl ParcelSender for RecordingSender {
    fn apply(&self, dest: LocalityId, action: Action) {
        self.sent.lock().push((dest, action));
    }

    fn apply_cb(&self, dest: LocalityId, action: Action) -> Completion {
        self.sent.lock().push((dest, action));
        Completion::new(0)
    }

    fn apply_sync(&self, dest: LocalityId, action: Action) -> crate::action::ActionResult {
        self.sent.lock().push((dest, action));
        crate::action::ActionResult::Ack
    }

    fn broadcast(&self, localities: &[LocalityId], action: Action) -> Completion {
        let mut sent = self.sent.lock();
        for dest in localities {
            sent.push((*dest, action.clone()));
        }
        Completion::new(0)
    }
}

// ---------------------------------------------------------------------------
// In-memory cluster
// ---------------------------------------------------------------------------

/// An in-process cluster of `N` runtime-support servers wired over the mesh.
pub struct TestCluster {
    /// The mesh endpoints, one per locality.
    pub nodes: Vec<Arc<MeshNode>>,
    /// The servers, one per locality.
    pub servers: Vec<Arc<RuntimeSupport>>,
    /// The thread-manager doubles.
    pub threads: Vec<Arc<QuietThreads>>,
    /// The addressing-service doubles.
    pub agas: Vec<Arc<StubAgas>>,
    /// The parcel-handler doubles.
    pub parcels: Vec<Arc<StubParcels>>,
    /// The runtime doubles.
    pub runtimes: Vec<Arc<RecordingRuntime>>,
    /// The terminator doubles.
    pub terminators: Vec<Arc<RecordingTerminator>>,
}

impl TestCluster {
    /// Builds a cluster with empty configurations and registries.
    #[must_use]
    pub fn new(n: u32) -> Self {
        Self::with_setup(n, |_| (Section::new("root"), Arc::new(StaticRegistry::new())))
    }

    /// Builds a cluster; `setup` supplies each locality's configuration and
    /// static registration tables.
    #[must_use]
    pub fn with_setup<F>(n: u32, setup: F) -> Self
    where
        F: Fn(u32) -> (Section, Arc<StaticRegistry>),
    {
        let nodes = build_mesh(n);
        let mut servers = Vec::with_capacity(n as usize);
        let mut threads = Vec::with_capacity(n as usize);
        let mut agas_list = Vec::with_capacity(n as usize);
        let mut parcels_list = Vec::with_capacity(n as usize);
        let mut runtimes = Vec::with_capacity(n as usize);
        let mut terminators = Vec::with_capacity(n as usize);

        for (i, node) in nodes.iter().enumerate() {
            let i = u32::try_from(i).expect("cluster size fits u32");
            let here = LocalityId::from_raw(i);
            let (config, statics) = setup(i);

            let tm = Arc::new(QuietThreads::new(1, 0));
            let agas = Arc::new(StubAgas::at(n, here));
            let parcels = Arc::new(StubParcels::default());
            let runtime = Arc::new(RecordingRuntime::new(here));
            let terminator = Arc::new(RecordingTerminator::default());

            let services = ServerServices {
                tm: tm.clone(),
                agas: agas.clone(),
                parcels: parcels.clone(),
                runtime: runtime.clone(),
                sender: node.clone(),
                yielder: Arc::new(ThreadYield),
                terminator: terminator.clone(),
            };
            let loader: Arc<dyn ModuleLoader> =
                Arc::new(StaticModuleLoader::new(statics.clone()));
            let server = RuntimeSupport::new(config, services, statics, loader);
            node.attach(server.clone());

            servers.push(server);
            threads.push(tm);
            agas_list.push(agas);
            parcels_list.push(parcels);
            runtimes.push(runtime);
            terminators.push(terminator);
        }

        Self {
            nodes,
            servers,
            threads,
            agas: agas_list,
            parcels: parcels_list,
            runtimes,
            terminators,
        }
    }

    /// Spawns each locality's "main thread": block in `wait()` until the
    /// stop sequence finished, then report the thread manager's exit via
    /// `stopped()`.
    #[must_use]
    pub fn start_main_threads(&self) -> Vec<JoinHandle<()>> {
        self.servers
            .iter()
            .map(|server| {
                let server = server.clone();
                std::thread::Builder::new()
                    .name(format!("main-{}", server.here()))
                    .spawn(move || {
                        server.wait();
                        server.stopped();
                    })
                    .expect("failed to spawn main thread")
            })
            .collect()
    }

    /// Closes every mesh inbox.
    pub fn close(&self) {
        for node in &self.nodes {
            node.close();
        }
    }
}
