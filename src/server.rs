//! The per-locality runtime-support server.
//!
//! One instance per locality, created during bootstrap with the locality's
//! configuration and handles to the services it coordinates. The server owns
//! the plugin/module registry, the hook registry, the termination-detection
//! state and the stop machine, and exposes the remotely invocable action
//! surface through [`RuntimeSupport::handle`].

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::action::{Action, ActionResult};
use crate::cmdline::{self, OptionSet, SecondaryOutcome};
use crate::config::Section;
use crate::dijkstra::{DijkstraData, TokenRing};
use crate::error::{Error, ErrorKind, Result};
use crate::hooks::{self, Hook, HookRegistry};
use crate::quiesce::Yielder;
use crate::registry::loader::Registry;
use crate::registry::module::ModuleLoader;
use crate::registry::plugin::{BinaryFilter, MessageHandler};
use crate::registry::static_data::StaticRegistry;
use crate::services::{
    AddressingService, EventRegistry, ParcelHandler, ParcelSender, RuntimeHandle, Terminator,
    ThreadManager,
};
use crate::stop::StopData;
use crate::types::{CounterInfo, Endpoints, Gid, LocalityId};

/// The service handles one runtime-support server coordinates.
pub struct ServerServices {
    /// The local scheduler.
    pub tm: Arc<dyn ThreadManager>,
    /// The address-resolution service.
    pub agas: Arc<dyn AddressingService>,
    /// The parcel layer's cache-maintenance surface.
    pub parcels: Arc<dyn ParcelHandler>,
    /// The surrounding runtime instance.
    pub runtime: Arc<dyn RuntimeHandle>,
    /// Outbound action delivery.
    pub sender: Arc<dyn ParcelSender>,
    /// Cooperative yield seam.
    pub yielder: Arc<dyn Yielder>,
    /// Abnormal-exit seam.
    pub terminator: Arc<dyn Terminator>,
}

/// The per-locality runtime-support server.
pub struct RuntimeSupport {
    pub(crate) config: Mutex<Section>,
    pub(crate) here: LocalityId,
    pub(crate) stop_data: StopData,
    pub(crate) dijkstra: DijkstraData,
    pub(crate) hooks: Mutex<HookRegistry>,
    pub(crate) registry: Registry,
    pub(crate) shutdown_all_invoked: AtomicBool,
    pub(crate) load_result: Mutex<Option<i32>>,
    pub(crate) events: EventRegistry,
    pub(crate) deps: ServerServices,
}

impl std::fmt::Debug for RuntimeSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSupport")
            .field("here", &self.here)
            .field("stop", &self.stop_data.snapshot())
            .field("registry", &self.registry)
            .finish()
    }
}

impl RuntimeSupport {
    /// Creates the server for this locality.
    #[must_use]
    pub fn new(
        config: Section,
        services: ServerServices,
        statics: Arc<StaticRegistry>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Arc<Self> {
        let here = services.agas.local_locality();
        Arc::new(Self {
            config: Mutex::new(config),
            here,
            stop_data: StopData::new(),
            dijkstra: DijkstraData::new(),
            hooks: Mutex::new(HookRegistry::new()),
            registry: Registry::new(statics, loader),
            shutdown_all_invoked: AtomicBool::new(false),
            load_result: Mutex::new(None),
            events: EventRegistry::new(here),
            deps: services,
        })
    }

    /// This locality's id.
    #[must_use]
    pub fn here(&self) -> LocalityId {
        self.here
    }

    /// The plugin/module registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Signals a registered void event; the inbound path of `set_event`.
    pub fn set_event(&self, event: Gid) {
        self.events.set_event(event);
    }

    /// Rule 1 of the token ring: any outgoing remote apply blackens this
    /// locality. Transport implementations call this on their send path.
    pub fn dijkstra_make_black(&self) {
        self.dijkstra.make_black();
    }

    /// The token-ring protocol bound to this locality's services.
    #[must_use]
    pub(crate) fn token_ring(&self) -> TokenRing<'_> {
        TokenRing {
            data: &self.dijkstra,
            here: self.here,
            tm: self.deps.tm.as_ref(),
            agas: self.deps.agas.as_ref(),
            parcels: self.deps.parcels.as_ref(),
            sender: self.deps.sender.as_ref(),
            yielder: self.deps.yielder.as_ref(),
        }
    }

    /// Runs termination detection as the initiator over the given locality
    /// set; returns the probe count.
    pub fn dijkstra_termination_detection(&self, localities: &[LocalityId]) -> usize {
        self.token_ring().termination_detection(localities)
    }

    /// Non-initiator (and returning-token) handler of the ring step.
    pub fn dijkstra_termination(
        &self,
        initiator: LocalityId,
        num_localities: u32,
        token_is_black: bool,
    ) {
        self.token_ring()
            .on_token(initiator, num_localities, token_is_black);
    }

    // -- action dispatch ----------------------------------------------------

    /// Executes one wire action and returns its tagged result.
    pub fn handle(&self, action: Action) -> ActionResult {
        match action {
            Action::LoadComponents => ActionResult::LoadComponents(self.load_components()),
            Action::CallStartupFunctions { pre_startup } => {
                match self.call_startup_functions(pre_startup) {
                    Ok(()) => ActionResult::Ack,
                    Err(e) => e.into(),
                }
            }
            Action::CallShutdownFunctions { pre_shutdown } => {
                self.call_shutdown_functions(pre_shutdown);
                ActionResult::Ack
            }
            Action::Shutdown {
                timeout,
                respond_to,
            } => {
                self.shutdown(timeout, respond_to);
                ActionResult::Ack
            }
            Action::ShutdownAll { timeout } => match self.shutdown_all(timeout) {
                Ok(()) => ActionResult::Ack,
                Err(e) => e.into(),
            },
            Action::Terminate { respond_to } => {
                self.terminate(respond_to);
                ActionResult::Ack
            }
            Action::TerminateAll => {
                self.terminate_all();
                ActionResult::Ack
            }
            Action::GetConfig => ActionResult::Config(self.get_config()),
            Action::GarbageCollect => {
                self.garbage_collect();
                ActionResult::Ack
            }
            Action::CreatePerformanceCounter { info } => {
                match self.create_performance_counter(&info) {
                    Ok(gid) => ActionResult::Counter(gid),
                    Err(e) => e.into(),
                }
            }
            Action::RemoveFromConnectionCache { gid, endpoints } => {
                self.remove_from_connection_cache(gid, &endpoints);
                ActionResult::Ack
            }
            Action::DijkstraTermination {
                initiator,
                num_localities,
                token_is_black,
            } => {
                self.dijkstra_termination(initiator, num_localities, token_is_black);
                ActionResult::Ack
            }
            Action::SetEvent { event } => {
                self.set_event(event);
                ActionResult::Ack
            }
        }
    }

    // -- loading ------------------------------------------------------------

    /// Runs the loader on the first call; later calls return the cached
    /// result. 0 success, -1 command-line failure, -2 duplicate plugin
    /// instance, 1 early exit requested.
    pub fn load_components(&self) -> i32 {
        let mut cache = self.load_result.lock();
        if let Some(result) = *cache {
            return result;
        }
        let result = self.load_components_once();
        *cache = Some(result);
        result
    }

    fn load_components_once(&self) -> i32 {
        let mut config = self.config.lock();

        // statically linked modules first; dynamic modules must not register
        // statically from here on
        self.registry.statics().contribute_default_sections(&mut config);
        self.registry.statics().freeze();

        // every module gets asked for startup/shutdown functions only once
        let mut startup_handled: HashSet<String> = HashSet::new();
        let mut options = OptionSet::new();

        let mut result = {
            let mut hooks = self.hooks.lock();
            let mut result =
                self.registry
                    .load_components(&config, &mut hooks, &mut options, &mut startup_handled);
            if !self
                .registry
                .load_plugins(&config, &mut hooks, &mut options, &mut startup_handled)
            {
                result = -2;
            }
            result
        };

        // secondary command-line processing, validity of options only
        match cmdline::process_secondary(&mut config, &options) {
            Ok(SecondaryOutcome::Continue) => {}
            Ok(SecondaryOutcome::ExitRequested) => result = 1,
            Err(e) => {
                eprintln!("load_components: command line processing: {e}");
                result = -1;
            }
        }
        result
    }

    // -- hooks ---------------------------------------------------------------

    /// Invokes the selected startup hook phase; failures propagate and abort
    /// bootstrap.
    pub fn call_startup_functions(&self, pre_startup: bool) -> Result<()> {
        let phase: Vec<Hook> = self.hooks.lock().startup_hooks(pre_startup);
        hooks::run_startup_phase(&phase, pre_startup, self.deps.runtime.as_ref())
    }

    /// Invokes the selected shutdown hook phase; failures are reported, not
    /// propagated.
    pub fn call_shutdown_functions(&self, pre_shutdown: bool) {
        let phase: Vec<Hook> = self.hooks.lock().shutdown_hooks(pre_shutdown);
        hooks::run_shutdown_phase(&phase, pre_shutdown, self.deps.runtime.as_ref());
    }

    /// Drops every registered hook.
    pub fn delete_function_lists(&self) {
        self.hooks.lock().delete_function_lists();
    }

    /// Releases plugins, then modules, in that order.
    pub fn tidy(&self) {
        self.registry.tidy();
    }

    // -- small actions -------------------------------------------------------

    /// Returns the `application` configuration subtree.
    #[must_use]
    pub fn get_config(&self) -> Section {
        self.config
            .lock()
            .get_section("application")
            .cloned()
            .unwrap_or_else(|| Section::new("application"))
    }

    /// Forces a garbage-collection pass in the resolver.
    pub fn garbage_collect(&self) {
        self.deps.agas.garbage_collect_non_blocking();
    }

    /// Creates the given performance counter locally.
    pub fn create_performance_counter(&self, info: &CounterInfo) -> Result<Gid> {
        self.deps.runtime.create_performance_counter(info)
    }

    /// Evicts a peer from the local connection cache.
    pub fn remove_from_connection_cache(&self, gid: Gid, endpoints: &Endpoints) {
        self.deps.parcels.remove_from_connection_cache(gid, endpoints);
    }

    // -- plugin capabilities --------------------------------------------------

    /// Registers an action with a message-handler plugin.
    pub fn register_message_handler(&self, handler_type: &str, action: &str) -> Result<()> {
        let factory = self.registry.plugins().factory(handler_type)?;
        let handler_factory = factory.as_message_handler_factory().ok_or_else(|| {
            Error::new(ErrorKind::BadPluginType).with_context(format!(
                "plugin instance is not a message-handler factory: {handler_type}"
            ))
        })?;
        handler_factory.register_action(action)?;
        tracing::info!(handler_type, action, "registered message handler");
        Ok(())
    }

    /// Creates a message handler through the named plugin.
    pub fn create_message_handler(
        &self,
        handler_type: &str,
        action: &str,
        num_messages: usize,
        interval: u64,
    ) -> Result<Box<dyn MessageHandler>> {
        let factory = self.registry.plugins().factory(handler_type)?;
        let handler_factory = factory.as_message_handler_factory().ok_or_else(|| {
            Error::new(ErrorKind::BadPluginType).with_context(format!(
                "plugin instance is not a message-handler factory: {handler_type}"
            ))
        })?;
        let handler = handler_factory.create(action, num_messages, interval)?;
        tracing::info!(handler_type, "created message handler plugin");
        Ok(handler)
    }

    /// Creates a binary filter through the named plugin.
    pub fn create_binary_filter(
        &self,
        filter_type: &str,
        compress: bool,
        next: Option<Box<dyn BinaryFilter>>,
    ) -> Result<Box<dyn BinaryFilter>> {
        let factory = self.registry.plugins().factory(filter_type)?;
        let filter_factory = factory.as_binary_filter_factory().ok_or_else(|| {
            Error::new(ErrorKind::BadPluginType).with_context(format!(
                "plugin instance is not a binary-filter factory: {filter_type}"
            ))
        })?;
        let filter = filter_factory.create(compress, next)?;
        tracing::info!(filter_type, "created binary filter plugin");
        Ok(filter)
    }
}
