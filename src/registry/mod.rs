//! The plugin/module registry.
//!
//! Maps instance names to plugin factories, tracks loaded modules, and owns
//! the one-shot static registration tables. The loader walks the
//! configuration, resolves modules through the search path, and records each
//! module's startup/shutdown hooks and command-line contributions exactly
//! once.

pub mod loader;
pub mod module;
pub mod plugin;
pub mod static_data;

pub use loader::Registry;
pub use module::{ModuleHandle, ModuleLoader, ModuleTable, StaticModuleLoader};
pub use plugin::{
    BinaryFilter, BinaryFilterFactory, ComponentFactory, MessageHandler, MessageHandlerFactory,
    PluginEntry, PluginFactory, PluginMap,
};
pub use static_data::{StaticModuleData, StaticRegistry};
