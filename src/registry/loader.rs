//! Config-driven component and plugin loading.
//!
//! The loader walks the `components.<instance>` and `plugins.<instance>`
//! configuration sections, resolves each module through the search path and
//! the module table, calls factories, and — exactly once per module — merges
//! command-line contributions and startup/shutdown hooks.
//!
//! Failure policy: a failing instance is logged and skipped; loading
//! continues with the rest. The one fatal condition is a duplicate plugin
//! instance name, which stops plugin loading and fails upward.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cmdline::OptionSet;
use crate::config::{flag_enabled, Section};
use crate::error::{Error, ErrorKind, Result};
use crate::hooks::HookRegistry;
use crate::registry::module::{
    library_file_name, mangled_name, ModuleHandle, ModuleLoader, ModuleTable,
};
use crate::registry::plugin::{PluginEntry, PluginMap};
use crate::registry::static_data::{StartupShutdownFunctions, StaticRegistry};

/// Delimiter between entries of a library search path list.
pub const PATH_DELIMITER: char = ':';

/// Search path used when neither the instance section nor the configuration
/// names one.
pub const DEFAULT_COMPONENT_PATH: &str = ".";

/// The plugin/module registry of one locality.
pub struct Registry {
    statics: Arc<StaticRegistry>,
    loader: Arc<dyn ModuleLoader>,
    modules: Mutex<ModuleTable>,
    plugins: PluginMap,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.modules.lock().len())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

impl Registry {
    /// Creates a registry over the given static tables and loader seam.
    #[must_use]
    pub fn new(statics: Arc<StaticRegistry>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            statics,
            loader,
            modules: Mutex::new(ModuleTable::new()),
            plugins: PluginMap::new(),
        }
    }

    /// The static registration tables.
    #[must_use]
    pub fn statics(&self) -> &StaticRegistry {
        &self.statics
    }

    /// The instance → factory map.
    #[must_use]
    pub fn plugins(&self) -> &PluginMap {
        &self.plugins
    }

    /// Number of loaded modules.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.lock().len()
    }

    /// Loads every component described by `components.<instance>` sections.
    ///
    /// Always returns 0: per-instance failures are logged and skipped.
    pub fn load_components(
        &self,
        config: &Section,
        hooks: &mut HookRegistry,
        options: &mut OptionSet,
        startup_handled: &mut HashSet<String>,
    ) -> i32 {
        let Some(components) = config.get_section("components") else {
            tracing::info!(
                "no components found/loaded, the runtime will be mostly non-functional"
            );
            return 0;
        };

        for sect in components.sections() {
            let instance = sect.name().to_string();
            let component = sect.get_entry_or("name", &instance).to_string();

            if !flag_enabled(sect.get_entry("enabled")) {
                tracing::info!(%instance, "component factory disabled");
                continue;
            }

            let lib_dir = self.resolve_library_dir(config, sect, &component);
            let result = if sect.get_entry_or("static", "0") == "1" {
                self.load_component_static(
                    config,
                    &instance,
                    &component,
                    sect,
                    hooks,
                    options,
                    startup_handled,
                )
            } else {
                self.load_component_dynamic(
                    config,
                    &instance,
                    &component,
                    lib_dir.as_deref(),
                    sect,
                    hooks,
                    options,
                    startup_handled,
                )
            };

            if let Err(e) = result {
                tracing::warn!(%instance, error = %e, "caught error while loading component");
                if e.kind() == ErrorKind::CommandLineOptionError {
                    eprintln!(
                        "load_components: invalid command line option(s) to \
                         {instance} component: {e}"
                    );
                }
            }
        }
        0
    }

    /// Loads every plugin described by `plugins.<instance>` sections.
    ///
    /// Returns false only on a duplicate plugin instance name; any other
    /// per-instance failure is logged and skipped.
    pub fn load_plugins(
        &self,
        config: &Section,
        hooks: &mut HookRegistry,
        options: &mut OptionSet,
        startup_handled: &mut HashSet<String>,
    ) -> bool {
        let Some(plugins) = config.get_section("plugins") else {
            tracing::info!("no plugins found/loaded");
            return true;
        };

        for sect in plugins.sections() {
            let instance = sect.name().to_string();
            let plugin = sect.get_entry_or("name", &instance).to_string();
            let enabled = flag_enabled(sect.get_entry("enabled"));
            if !enabled {
                tracing::info!(%instance, "plugin factory disabled");
            }

            let lib_dir = self.resolve_library_dir(config, sect, &plugin);
            let result = if sect.get_entry_or("static", "0") == "1" {
                Err(Error::new(ErrorKind::ServiceUnavailable).with_context(format!(
                    "static loading of plugin '{instance}' is not supported"
                )))
            } else {
                self.load_plugin_dynamic(
                    config,
                    &instance,
                    &plugin,
                    lib_dir.as_deref(),
                    sect,
                    enabled,
                    hooks,
                    options,
                    startup_handled,
                )
            };

            if let Err(e) = result {
                if e.kind() == ErrorKind::DuplicatePluginName {
                    tracing::error!(%instance, "duplicate plugin type");
                    return false;
                }
                tracing::warn!(%instance, error = %e, "caught error while loading plugin");
                if e.kind() == ErrorKind::CommandLineOptionError {
                    eprintln!(
                        "load_plugins: invalid command line option(s) to \
                         {instance} plugin: {e}"
                    );
                }
            }
        }
        true
    }

    /// Clears plugins, then modules. The order matters: a module must stay
    /// loaded until every factory that came out of it is gone.
    pub fn tidy(&self) {
        self.plugins.clear();
        self.modules.lock().clear();
        tracing::debug!("registry tidied: plugins and modules released");
    }

    // -- internals ----------------------------------------------------------

    fn resolve_library_dir(
        &self,
        config: &Section,
        sect: &Section,
        component: &str,
    ) -> Option<PathBuf> {
        let path_list = sect
            .get_entry("path")
            .unwrap_or_else(|| config.get_or("runtime.component_path", DEFAULT_COMPONENT_PATH));
        for dir in path_list.split(PATH_DELIMITER).filter(|d| !d.is_empty()) {
            let dir = Path::new(dir);
            if dir.join(library_file_name(component)).exists() {
                return Some(dir.to_path_buf());
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn load_component_static(
        &self,
        config: &Section,
        instance: &str,
        component: &str,
        sect: &Section,
        hooks: &mut HookRegistry,
        options: &mut OptionSet,
        startup_handled: &mut HashSet<String>,
    ) -> Result<()> {
        if sect.get_entry_or("no_factory", "0") == "0" {
            let Some(ctor) = self.statics.factory(component) else {
                tracing::warn!(
                    instance,
                    component,
                    "static loading failed: no factory in the static registry"
                );
                return Ok(());
            };
            let settings = default_settings(config);
            // the component factory's product is consumed by callers outside
            // the shutdown path; it is not retained here
            let _factory = ctor(settings, Some(sect), true)?;
            tracing::info!(%instance, "static loading succeeded");
        }

        // startup/shutdown and command-line registration run once per
        // component for static modules
        if startup_handled.insert(component.to_string()) {
            if let Some(provider) = self.statics.commandline(component) {
                options.merge(provider());
            } else {
                tracing::debug!(
                    component,
                    "no static command-line contributions for this module"
                );
            }
            if let Some(provider) = self.statics.startup_shutdown(component) {
                append_hooks(hooks, provider());
            } else {
                tracing::debug!(component, "no static startup/shutdown functions");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn load_component_dynamic(
        &self,
        config: &Section,
        instance: &str,
        component: &str,
        lib_dir: Option<&Path>,
        sect: &Section,
        hooks: &mut HookRegistry,
        options: &mut OptionSet,
        startup_handled: &mut HashSet<String>,
    ) -> Result<()> {
        let mangled = mangled_name(component);
        let handle = self.get_or_load_module(&mangled, lib_dir)?;

        if sect.get_entry_or("no_factory", "0") == "0" {
            let Some(ctor) = handle.symbols().factory.clone() else {
                tracing::warn!(
                    instance,
                    module = handle.name(),
                    "dynamic loading failed: module exposes no factory"
                );
                return Ok(());
            };
            let settings = default_settings(config);
            let _factory = ctor(settings, Some(sect), true)?;
            tracing::info!(%instance, module = handle.name(), "dynamic loading succeeded");
        }

        self.handle_module_registration(&handle, hooks, options, startup_handled);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn load_plugin_dynamic(
        &self,
        config: &Section,
        instance: &str,
        plugin: &str,
        lib_dir: Option<&Path>,
        sect: &Section,
        enabled: bool,
        hooks: &mut HookRegistry,
        options: &mut OptionSet,
        startup_handled: &mut HashSet<String>,
    ) -> Result<()> {
        let mangled = mangled_name(plugin);
        let handle = self.get_or_load_module(&mangled, lib_dir)?;

        if sect.get_entry_or("no_factory", "0") == "0" {
            let Some(ctor) = handle.symbols().factory.clone() else {
                tracing::warn!(
                    instance,
                    module = handle.name(),
                    "dynamic loading failed: module exposes no plugin factory"
                );
                return Ok(());
            };
            let settings = default_settings(config);
            match ctor(settings, Some(sect), enabled) {
                Ok(factory) => {
                    let entry = PluginEntry {
                        factory,
                        module: handle.clone(),
                        enabled,
                    };
                    // the map is keyed by the plugin name: that is what the
                    // create/register operations look plugins up by
                    if !self.plugins.insert(plugin, entry) {
                        return Err(Error::new(ErrorKind::DuplicatePluginName)
                            .with_context(plugin.to_string()));
                    }
                    tracing::info!(%instance, module = handle.name(), "dynamic loading succeeded");
                }
                Err(e) => {
                    tracing::warn!(
                        instance,
                        error = %e,
                        "dynamic loading of plugin factory failed"
                    );
                }
            }
        }

        self.handle_module_registration(&handle, hooks, options, startup_handled);
        Ok(())
    }

    fn get_or_load_module(&self, mangled: &str, lib_dir: Option<&Path>) -> Result<ModuleHandle> {
        let mut modules = self.modules.lock();
        modules.get_or_load(mangled, || self.loader.load(lib_dir, mangled))
    }

    /// Startup/shutdown and command-line registration run once per module
    /// for dynamic modules, keyed by the mangled module name.
    fn handle_module_registration(
        &self,
        handle: &ModuleHandle,
        hooks: &mut HookRegistry,
        options: &mut OptionSet,
        startup_handled: &mut HashSet<String>,
    ) {
        if !startup_handled.insert(handle.name().to_string()) {
            return;
        }
        if let Some(provider) = &handle.symbols().commandline {
            options.merge(provider());
        } else {
            tracing::debug!(
                module = handle.name(),
                "no command-line contributions for this module"
            );
        }
        if let Some(provider) = &handle.symbols().startup_shutdown {
            append_hooks(hooks, provider());
        } else {
            tracing::debug!(module = handle.name(), "no startup/shutdown functions");
        }
    }
}

fn append_hooks(hooks: &mut HookRegistry, functions: StartupShutdownFunctions) {
    if let Some((hook, pre_startup)) = functions.startup {
        hooks.add_startup(hook, pre_startup);
    }
    if let Some((hook, pre_shutdown)) = functions.shutdown {
        hooks.add_shutdown(hook, pre_shutdown);
    }
}

fn default_settings(config: &Section) -> &Section {
    static EMPTY: std::sync::OnceLock<Section> = std::sync::OnceLock::new();
    config
        .get_section("settings")
        .unwrap_or_else(|| EMPTY.get_or_init(|| Section::new("settings")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::OptionDescriptor;
    use crate::registry::module::StaticModuleLoader;
    use crate::registry::plugin::PluginFactory;
    use crate::registry::static_data::StaticModuleData;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestFactory {
        name: String,
    }

    impl PluginFactory for TestFactory {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn statics_with_module(
        name: &'static str,
        factory_calls: Arc<AtomicUsize>,
    ) -> Arc<StaticRegistry> {
        let statics = Arc::new(StaticRegistry::new());
        statics.register_factory(
            name,
            Arc::new(move |_settings, _ini, _enabled| {
                factory_calls.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(TestFactory {
                    name: name.to_string(),
                }) as Arc<dyn PluginFactory>)
            }),
        );
        statics.register_commandline(name, {
            Arc::new(move || {
                let mut set = OptionSet::new();
                set.add(OptionDescriptor::flag(name, "contributed"));
                set
            })
        });
        statics.register_startup_shutdown(name, {
            Arc::new(|| StartupShutdownFunctions {
                startup: Some((Arc::new(|| Ok(())), false)),
                shutdown: Some((Arc::new(|| Ok(())), true)),
            })
        });
        statics
    }

    fn registry_over(statics: Arc<StaticRegistry>) -> Registry {
        let loader = Arc::new(StaticModuleLoader::new(statics.clone()));
        Registry::new(statics, loader)
    }

    fn load_all(registry: &Registry, config: &Section) -> (i32, bool, HookRegistry, OptionSet) {
        let mut hooks = HookRegistry::new();
        let mut options = OptionSet::new();
        let mut startup_handled = HashSet::new();
        let components =
            registry.load_components(config, &mut hooks, &mut options, &mut startup_handled);
        let plugins_ok =
            registry.load_plugins(config, &mut hooks, &mut options, &mut startup_handled);
        (components, plugins_ok, hooks, options)
    }

    #[test]
    fn registration_runs_once_per_module() {
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("parquet", factory_calls.clone());
        let registry = registry_over(statics);

        // two instances backed by the same module
        let config = Section::parse(
            "root",
            r"
[components.reader]
name = parquet
[components.writer]
name = parquet
",
        )
        .expect("config");

        let (result, plugins_ok, hooks, options) = load_all(&registry, &config);
        assert_eq!(result, 0);
        assert!(plugins_ok);
        // the factory is consulted per instance...
        assert_eq!(factory_calls.load(Ordering::Relaxed), 2);
        // ...but hook and option registration is per module
        assert_eq!(hooks.len(), 2);
        assert_eq!(options.len(), 1);
        assert_eq!(registry.module_count(), 1);
    }

    #[test]
    fn failing_factory_is_not_fatal() {
        let statics = Arc::new(StaticRegistry::new());
        statics.register_factory(
            "broken",
            Arc::new(|_, _, _| {
                Err(Error::new(ErrorKind::Internal).with_context("factory blew up"))
            }),
        );
        let healthy_calls = Arc::new(AtomicUsize::new(0));
        {
            let healthy_calls = healthy_calls.clone();
            statics.register_factory(
                "healthy",
                Arc::new(move |_, _, _| {
                    healthy_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(Arc::new(TestFactory {
                        name: "healthy".to_string(),
                    }) as Arc<dyn PluginFactory>)
                }),
            );
        }
        let registry = registry_over(statics);

        let config = Section::parse(
            "root",
            r"
[plugins.first]
name = broken
[plugins.second]
name = healthy
",
        )
        .expect("config");

        let (result, plugins_ok, _, _) = load_all(&registry, &config);
        assert_eq!(result, 0);
        assert!(plugins_ok);
        assert_eq!(healthy_calls.load(Ordering::Relaxed), 1);
        assert!(registry.plugins().contains("healthy"));
        assert!(!registry.plugins().contains("broken"));
    }

    #[test]
    fn duplicate_plugin_instance_stops_loading() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("lz4", calls);
        let registry = registry_over(statics);

        // section names are unique, so the duplicate comes from two sections
        // loading the same instance via a prior insert
        let config = Section::parse(
            "root",
            r"
[plugins.lz4]
name = lz4
",
        )
        .expect("config");

        let mut hooks = HookRegistry::new();
        let mut options = OptionSet::new();
        let mut handled = HashSet::new();
        assert!(registry.load_plugins(&config, &mut hooks, &mut options, &mut handled));
        // loading the same config again re-registers the same instance name
        let ok = registry.load_plugins(&config, &mut hooks, &mut options, &mut handled);
        assert!(!ok);
    }

    #[test]
    fn disabled_component_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("parquet", calls.clone());
        let registry = registry_over(statics);

        let config = Section::parse(
            "root",
            r"
[components.reader]
name = parquet
enabled = no
",
        )
        .expect("config");

        let (result, _, hooks, _) = load_all(&registry, &config);
        assert_eq!(result, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert!(hooks.is_empty());
    }

    #[test]
    fn disabled_plugin_entry_is_kept_but_unusable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("lz4", calls);
        let registry = registry_over(statics);

        let config = Section::parse(
            "root",
            r"
[plugins.lz4]
name = lz4
enabled = no
",
        )
        .expect("config");

        let (_, plugins_ok, _, _) = load_all(&registry, &config);
        assert!(plugins_ok);
        assert!(registry.plugins().contains("lz4"));
        let err = registry.plugins().factory("lz4").expect_err("disabled");
        assert_eq!(err.kind(), ErrorKind::BadPluginType);
    }

    #[test]
    fn static_plugin_sections_are_unsupported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("lz4", calls);
        let registry = registry_over(statics);

        let config = Section::parse(
            "root",
            r"
[plugins.lz4]
name = lz4
static = 1
",
        )
        .expect("config");

        let (_, plugins_ok, _, _) = load_all(&registry, &config);
        // logged and skipped, not fatal
        assert!(plugins_ok);
        assert!(!registry.plugins().contains("lz4"));
    }

    #[test]
    fn search_path_takes_first_existing_candidate() {
        let base = std::env::temp_dir().join(format!(
            "ringdown-loader-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let missing = base.join("missing");
        let first = base.join("first");
        let second = base.join("second");
        std::fs::create_dir_all(&first).expect("mkdir");
        std::fs::create_dir_all(&second).expect("mkdir");
        std::fs::write(first.join(library_file_name("parquet")), b"").expect("touch");
        std::fs::write(second.join(library_file_name("parquet")), b"").expect("touch");

        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("parquet", calls);
        let registry = registry_over(statics);

        let config = Section::new("root");
        let mut sect = Section::new("reader");
        sect.add_entry("name", "parquet");
        sect.add_entry(
            "path",
            format!(
                "{}:{}:{}",
                missing.display(),
                first.display(),
                second.display()
            ),
        );

        let resolved = registry
            .resolve_library_dir(&config, &sect, "parquet")
            .expect("must resolve");
        assert_eq!(resolved, first);

        std::fs::remove_dir_all(&base).expect("cleanup");
    }

    #[test]
    fn tidy_releases_plugins_and_modules() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("lz4", calls);
        let registry = registry_over(statics);

        let config = Section::parse("root", "[plugins.lz4]\nname = lz4\n").expect("config");
        let (_, plugins_ok, _, _) = load_all(&registry, &config);
        assert!(plugins_ok);
        assert_eq!(registry.plugins().len(), 1);
        assert_eq!(registry.module_count(), 1);

        registry.tidy();
        assert!(registry.plugins().is_empty());
        assert_eq!(registry.module_count(), 0);
    }

    #[test]
    fn generated_static_sections_load_through_static_path() {
        let calls = Arc::new(AtomicUsize::new(0));
        let statics = statics_with_module("memory", calls.clone());
        statics.register_module(StaticModuleData {
            name: "memory".to_string(),
        });
        let registry = registry_over(statics);

        let mut config = Section::new("root");
        registry.statics().contribute_default_sections(&mut config);
        registry.statics().freeze();

        let (result, _, hooks, options) = load_all(&registry, &config);
        assert_eq!(result, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.len(), 2);
        assert_eq!(options.len(), 1);
        // static loading bypasses the module table
        assert_eq!(registry.module_count(), 0);
    }
}
