//! Plugin factories and the instance map.
//!
//! A plugin factory is a trait object with the capability set
//! `{create, register_action, name}`. Three disjoint variants exist, selected
//! by the configuration section prefix: component factories, message-handler
//! factories and binary-filter factories. The variant is recovered from the
//! trait object through the `as_*` accessors; a failed recovery is the
//! `BadPluginType` condition.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::registry::module::ModuleHandle;
use crate::types::Gid;

/// A live message handler produced by a message-handler factory.
///
/// The control plane only owns the lifetime; the parcel layer drives it.
pub trait MessageHandler: Send + Sync {
    /// Name of the action this handler coalesces.
    fn action(&self) -> &str;
}

impl std::fmt::Debug for dyn MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("action", &self.action())
            .finish()
    }
}

/// A serialization filter produced by a binary-filter factory.
pub trait BinaryFilter: Send + Sync {
    /// True if this filter compresses.
    fn is_compressing(&self) -> bool;
}

/// Component factories create component instances on this locality.
pub trait ComponentFactory: Send + Sync {
    /// Creates `count` component instances; returns the gid of the first.
    fn create(&self, count: usize) -> Result<Gid>;
}

/// Message-handler factories coalesce parcel traffic for selected actions.
pub trait MessageHandlerFactory: Send + Sync {
    /// Registers an action for coalescing with this handler type.
    fn register_action(&self, action: &str) -> Result<()>;

    /// Creates a handler for `action` batching up to `num_messages` parcels
    /// or `interval` microseconds, whichever comes first.
    fn create(&self, action: &str, num_messages: usize, interval: u64)
        -> Result<Box<dyn MessageHandler>>;
}

/// Binary-filter factories build serialization filter chains.
pub trait BinaryFilterFactory: Send + Sync {
    /// Creates a filter, optionally chained in front of `next`.
    fn create(
        &self,
        compress: bool,
        next: Option<Box<dyn BinaryFilter>>,
    ) -> Result<Box<dyn BinaryFilter>>;
}

/// A loaded plugin factory.
pub trait PluginFactory: Send + Sync {
    /// The factory's own name (usually the module name).
    fn name(&self) -> &str;

    /// The component-factory capability, if this factory has it.
    fn as_component_factory(&self) -> Option<&dyn ComponentFactory> {
        None
    }

    /// The message-handler capability, if this factory has it.
    fn as_message_handler_factory(&self) -> Option<&dyn MessageHandlerFactory> {
        None
    }

    /// The binary-filter capability, if this factory has it.
    fn as_binary_filter_factory(&self) -> Option<&dyn BinaryFilterFactory> {
        None
    }
}

impl std::fmt::Debug for dyn PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFactory")
            .field("name", &self.name())
            .finish()
    }
}

/// One registered plugin instance.
///
/// The owning module handle is kept alive here so the module strictly
/// outlives the factory that came out of it.
pub struct PluginEntry {
    /// The factory object.
    pub factory: Arc<dyn PluginFactory>,
    /// The module that supplied the factory.
    pub module: ModuleHandle,
    /// False if the configuration disabled this instance.
    pub enabled: bool,
}

impl std::fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginEntry")
            .field("factory", &self.factory.name())
            .field("module", &self.module.name())
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// The instance-name → factory map.
///
/// The interior mutex is never held across a call into a factory: lookups
/// clone the `Arc` out and release the lock first.
#[derive(Default)]
pub struct PluginMap {
    inner: Mutex<HashMap<String, PluginEntry>>,
}

impl std::fmt::Debug for PluginMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMap")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

impl PluginMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry; returns false if the instance name is taken.
    pub fn insert(&self, instance: impl Into<String>, entry: PluginEntry) -> bool {
        let mut map = self.inner.lock();
        match map.entry(instance.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Looks up an enabled factory by instance name.
    ///
    /// The lock is released before the factory `Arc` is returned.
    pub fn factory(&self, instance: &str) -> Result<Arc<dyn PluginFactory>> {
        let map = self.inner.lock();
        match map.get(instance) {
            Some(entry) if entry.enabled => Ok(Arc::clone(&entry.factory)),
            Some(_) => Err(Error::new(ErrorKind::BadPluginType)
                .with_context(format!("plugin instance is disabled: {instance}"))),
            None => Err(Error::new(ErrorKind::BadPluginType).with_context(format!(
                "attempt to use plugin instance of invalid/unknown type: {instance}"
            ))),
        }
    }

    /// Returns true if the instance name is registered.
    #[must_use]
    pub fn contains(&self, instance: &str) -> bool {
        self.inner.lock().contains_key(instance)
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no instances are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drops every entry. Factories go first; their owning modules are
    /// released by the module table afterwards.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::module::{ModuleHandle, ModuleSymbols};

    struct NamedFactory(&'static str);

    impl PluginFactory for NamedFactory {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn entry(name: &'static str, enabled: bool) -> PluginEntry {
        PluginEntry {
            factory: Arc::new(NamedFactory(name)),
            module: ModuleHandle::new("libtest", ModuleSymbols::default()),
            enabled,
        }
    }

    #[test]
    fn duplicate_instance_is_rejected() {
        let map = PluginMap::new();
        assert!(map.insert("lz4", entry("lz4", true)));
        assert!(!map.insert("lz4", entry("lz4", true)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn unknown_instance_is_bad_plugin_type() {
        let map = PluginMap::new();
        let err = map.factory("missing").expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::BadPluginType);
    }

    #[test]
    fn disabled_instance_is_bad_plugin_type() {
        let map = PluginMap::new();
        assert!(map.insert("snappy", entry("snappy", false)));
        let err = map.factory("snappy").expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::BadPluginType);
    }

    #[test]
    fn clear_empties_the_map() {
        let map = PluginMap::new();
        assert!(map.insert("lz4", entry("lz4", true)));
        map.clear();
        assert!(map.is_empty());
    }
}
