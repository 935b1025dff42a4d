//! The module table.
//!
//! A module is one loadable library. The table maps the mangled component
//! name to an opaque handle; an entry is inserted once per unique name and
//! later lookups return the existing handle — a module is never reloaded.
//!
//! Actual library loading is behind the [`ModuleLoader`] seam. The in-tree
//! [`StaticModuleLoader`] resolves handles from the static registration
//! tables; a deployment with real shared objects supplies a dyld-backed
//! loader instead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::registry::static_data::{
    CommandlineProvider, FactoryConstructor, StartupShutdownProvider, StaticRegistry,
};

/// Returns the mangled module name of a component.
#[must_use]
pub fn mangled_name(component: &str) -> String {
    format!("lib{component}")
}

/// Returns the library file name the search path is probed for.
#[must_use]
pub fn library_file_name(component: &str) -> String {
    format!("lib{component}.so")
}

/// The symbols a loaded module exposes to the registry.
#[derive(Clone, Default)]
pub struct ModuleSymbols {
    /// The `factory` entry point.
    pub factory: Option<FactoryConstructor>,
    /// The `commandline_options` entry point.
    pub commandline: Option<CommandlineProvider>,
    /// The `startup_shutdown` entry point.
    pub startup_shutdown: Option<StartupShutdownProvider>,
}

struct ModuleInner {
    name: String,
    symbols: ModuleSymbols,
}

/// Opaque handle to a loaded module.
///
/// Handles are cheap to clone; the underlying module stays loaded while any
/// handle (including the ones held by plugin entries) is alive.
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<ModuleInner>,
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl ModuleHandle {
    /// Creates a handle over resolved symbols.
    #[must_use]
    pub fn new(name: impl Into<String>, symbols: ModuleSymbols) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                name: name.into(),
                symbols,
            }),
        }
    }

    /// The mangled module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The module's symbols.
    #[must_use]
    pub fn symbols(&self) -> &ModuleSymbols {
        &self.inner.symbols
    }
}

/// Library loading seam.
pub trait ModuleLoader: Send + Sync {
    /// Loads (or resolves) the module with the given mangled name. The
    /// directory, when known, is where the search path found the library.
    fn load(&self, directory: Option<&Path>, mangled: &str) -> Result<ModuleHandle>;
}

/// Resolves modules from the static registration tables.
///
/// The component name is recovered by stripping the mangling prefix; symbols
/// come from whatever the module registered during bootstrap.
pub struct StaticModuleLoader {
    statics: Arc<StaticRegistry>,
}

impl StaticModuleLoader {
    /// Creates a loader over the given registration tables.
    #[must_use]
    pub fn new(statics: Arc<StaticRegistry>) -> Self {
        Self { statics }
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, _directory: Option<&Path>, mangled: &str) -> Result<ModuleHandle> {
        let component = mangled.strip_prefix("lib").unwrap_or(mangled);
        let symbols = ModuleSymbols {
            factory: self.statics.factory(component),
            commandline: self.statics.commandline(component),
            startup_shutdown: self.statics.startup_shutdown(component),
        };
        if symbols.factory.is_none()
            && symbols.commandline.is_none()
            && symbols.startup_shutdown.is_none()
        {
            return Err(Error::new(ErrorKind::BadPluginType)
                .with_context(format!("no registered module named {mangled}")));
        }
        Ok(ModuleHandle::new(mangled, symbols))
    }
}

/// Mangled name → handle, insert-once.
#[derive(Default)]
pub struct ModuleTable {
    map: HashMap<String, ModuleHandle>,
}

impl std::fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleTable")
            .field("len", &self.map.len())
            .finish()
    }
}

impl ModuleTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for a mangled name, if already loaded.
    #[must_use]
    pub fn get(&self, mangled: &str) -> Option<ModuleHandle> {
        self.map.get(mangled).cloned()
    }

    /// Returns the existing handle or loads the module with `load`.
    pub fn get_or_load<F>(&mut self, mangled: &str, load: F) -> Result<ModuleHandle>
    where
        F: FnOnce() -> Result<ModuleHandle>,
    {
        if let Some(handle) = self.map.get(mangled) {
            return Ok(handle.clone());
        }
        let handle = load()?;
        self.map.insert(mangled.to_string(), handle.clone());
        Ok(handle)
    }

    /// Number of loaded modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no modules are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Releases all modules. Must run after the plugin map was cleared.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}
