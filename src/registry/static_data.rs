//! One-shot static registration tables.
//!
//! Modules linked into the image register themselves here during bootstrap,
//! before the loader runs. The tables are consulted exactly once, by
//! `load_components`; the `initial_static_loading` gate is cleared at that
//! point and every later registration attempt is refused. After the gate
//! closes the tables are effectively immutable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cmdline::OptionSet;
use crate::config::Section;
use crate::error::Result;
use crate::hooks::Hook;
use crate::registry::plugin::PluginFactory;

/// Constructs a plugin factory from the global settings section, the
/// instance's own section (if any), and the enabled flag.
pub type FactoryConstructor =
    Arc<dyn Fn(&Section, Option<&Section>, bool) -> Result<Arc<dyn PluginFactory>> + Send + Sync>;

/// Produces the command-line options a module contributes.
pub type CommandlineProvider = Arc<dyn Fn() -> OptionSet + Send + Sync>;

/// Produces the startup/shutdown hooks a module contributes.
pub type StartupShutdownProvider = Arc<dyn Fn() -> StartupShutdownFunctions + Send + Sync>;

/// Hooks contributed by one module, each tagged with its phase.
#[derive(Default)]
pub struct StartupShutdownFunctions {
    /// Startup hook and its `pre_startup` flag.
    pub startup: Option<(Hook, bool)>,
    /// Shutdown hook and its `pre_shutdown` flag.
    pub shutdown: Option<(Hook, bool)>,
}

/// Registration record of a statically linked module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticModuleData {
    /// Component name; also the generated section name.
    pub name: String,
}

#[derive(Default)]
struct StaticTables {
    modules: Vec<StaticModuleData>,
    factories: HashMap<String, FactoryConstructor>,
    commandline: HashMap<String, CommandlineProvider>,
    startup_shutdown: HashMap<String, StartupShutdownProvider>,
}

/// The explicit static registration table.
///
/// Replaces image-construction-time global maps: the server owns one
/// instance, bootstrap code registers into it, and `load_components` freezes
/// it before consulting it.
pub struct StaticRegistry {
    initial_static_loading: AtomicBool,
    tables: Mutex<StaticTables>,
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("StaticRegistry")
            .field("frozen", &self.is_frozen())
            .field("modules", &tables.modules.len())
            .field("factories", &tables.factories.len())
            .finish()
    }
}

impl StaticRegistry {
    /// Creates an open registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_static_loading: AtomicBool::new(true),
            tables: Mutex::new(StaticTables::default()),
        }
    }

    /// Returns true once the one-shot loading window has closed.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        !self.initial_static_loading.load(Ordering::Acquire)
    }

    /// Closes the loading window; later registrations are refused.
    pub fn freeze(&self) {
        self.initial_static_loading.store(false, Ordering::Release);
    }

    /// Registers a statically linked module. Returns false once frozen.
    pub fn register_module(&self, data: StaticModuleData) -> bool {
        if self.is_frozen() {
            tracing::debug!(module = %data.name, "static module registration after freeze refused");
            return false;
        }
        self.tables.lock().modules.push(data);
        true
    }

    /// Registers a factory constructor under a component name.
    pub fn register_factory(&self, name: impl Into<String>, ctor: FactoryConstructor) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.tables.lock().factories.insert(name.into(), ctor);
        true
    }

    /// Registers a command-line provider under a component name.
    pub fn register_commandline(
        &self,
        name: impl Into<String>,
        provider: CommandlineProvider,
    ) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.tables.lock().commandline.insert(name.into(), provider);
        true
    }

    /// Registers a startup/shutdown provider under a component name.
    pub fn register_startup_shutdown(
        &self,
        name: impl Into<String>,
        provider: StartupShutdownProvider,
    ) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.tables
            .lock()
            .startup_shutdown
            .insert(name.into(), provider);
        true
    }

    /// Looks up a static factory constructor.
    #[must_use]
    pub fn factory(&self, name: &str) -> Option<FactoryConstructor> {
        self.tables.lock().factories.get(name).cloned()
    }

    /// Looks up a static command-line provider.
    #[must_use]
    pub fn commandline(&self, name: &str) -> Option<CommandlineProvider> {
        self.tables.lock().commandline.get(name).cloned()
    }

    /// Looks up a static startup/shutdown provider.
    #[must_use]
    pub fn startup_shutdown(&self, name: &str) -> Option<StartupShutdownProvider> {
        self.tables.lock().startup_shutdown.get(name).cloned()
    }

    /// Names of all registered static modules, in registration order.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        self.tables
            .lock()
            .modules
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Generates `components.<name>` sections for registered static modules
    /// that the configuration does not already describe.
    pub fn contribute_default_sections(&self, config: &mut Section) {
        for name in self.module_names() {
            let path = format!("components.{name}");
            if config.has_section(&path) {
                continue;
            }
            let section = config.get_section_mut(&path);
            section.add_entry("name", name.clone());
            section.add_entry("static", "1");
            section.add_entry("isdefault", "true");
            tracing::debug!(component = %name, "generated section for static module");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    impl PluginFactory for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
    }

    fn dummy_ctor() -> FactoryConstructor {
        Arc::new(|_, _, _| Ok(Arc::new(Dummy) as Arc<dyn PluginFactory>))
    }

    #[test]
    fn freeze_refuses_later_registrations() {
        let registry = StaticRegistry::new();
        assert!(registry.register_factory("early", dummy_ctor()));
        registry.freeze();
        assert!(registry.is_frozen());
        assert!(!registry.register_factory("late", dummy_ctor()));
        assert!(!registry.register_module(StaticModuleData {
            name: "late".to_string(),
        }));
        assert!(registry.factory("early").is_some());
        assert!(registry.factory("late").is_none());
    }

    #[test]
    fn contribute_skips_existing_sections() {
        let registry = StaticRegistry::new();
        registry.register_module(StaticModuleData {
            name: "io_pool".to_string(),
        });
        registry.register_module(StaticModuleData {
            name: "memory".to_string(),
        });

        let mut config = Section::new("root");
        config.set("components.memory.name", "custom_memory");
        registry.contribute_default_sections(&mut config);

        assert_eq!(config.get("components.io_pool.static"), Some("1"));
        assert_eq!(config.get("components.io_pool.isdefault"), Some("true"));
        // the pre-existing section is untouched
        assert_eq!(config.get("components.memory.name"), Some("custom_memory"));
        assert_eq!(config.get("components.memory.static"), None);
    }
}
