//! Name-keyed plugin registries.

use crate::error::{BenchError, BenchResult, PluginKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Registry of plugin factories of one kind.
///
/// Built-ins are registered when the registry is created; further plugins
/// can be registered at runtime and are visible to the next lookup.
pub struct Registry<F: ?Sized> {
    kind: PluginKind,
    entries: Arc<RwLock<HashMap<String, Arc<F>>>>,
}

impl<F: ?Sized> Clone for Registry<F> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, entries: Arc::clone(&self.entries) }
    }
}

impl<F: ?Sized> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("kind", &self.kind).field("names", &self.list_names()).finish()
    }
}

impl<F: ?Sized> Registry<F> {
    /// Creates an empty registry for plugins of `kind`.
    pub fn new(kind: PluginKind) -> Self {
        Self { kind, entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Registers a plugin factory.
    ///
    /// # Arguments
    /// * `name` - Name the plugin is selected by
    /// * `factory` - Factory to register
    ///
    /// # Returns
    /// The factory previously registered under `name`, if any
    pub fn register(&self, name: impl Into<String>, factory: Arc<F>) -> Option<Arc<F>> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let previous = entries.insert(name.clone(), factory);
        if previous.is_some() {
            warn!(kind = %self.kind, name = %name, "replaced registered plugin");
        } else {
            debug!(kind = %self.kind, name = %name, "registered plugin");
        }
        previous
    }

    /// Removes a plugin.
    ///
    /// # Returns
    /// The removed factory, if `name` was registered
    pub fn unregister(&self, name: &str) -> Option<Arc<F>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    /// Names currently registered, read fresh on every call.
    pub fn list_names(&self) -> BTreeSet<String> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Looks up the factory registered as `name`.
    ///
    /// # Arguments
    /// * `name` - Plugin name
    ///
    /// # Errors
    /// `UnknownPlugin` naming the kind, the requested name and what is available.
    pub fn import(&self, name: &str) -> BenchResult<Arc<F>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).cloned().ok_or_else(|| {
            let mut available: Vec<&str> = entries.keys().map(String::as_str).collect();
            available.sort_unstable();
            BenchError::UnknownPlugin { kind: self.kind, name: name.to_string(), available: available.join(", ") }
        })
    }

    /// Checks if a plugin is registered.
    ///
    /// # Arguments
    /// * `name` - Plugin name
    ///
    /// # Returns
    /// True if `name` is registered
    pub fn has(&self, name: &str) -> bool {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Number of registered plugins.
    pub fn count(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
