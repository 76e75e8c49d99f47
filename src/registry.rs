//! Registry of active module instances.

use std::any::{Any, TypeId};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::lifecycle::ModuleState;
use crate::module::{Module, ModuleFactory, ModuleInstance};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for the module registry.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of simultaneously active modules.
    pub max_modules: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_modules: 256 }
    }
}

impl RegistryConfig {
    /// Create a new registry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of modules.
    pub fn with_max_modules(mut self, max: usize) -> Self {
        self.max_modules = max;
        self
    }
}

/// Snapshot of a module's descriptor.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Unique instance ID; a reloaded module gets a new one.
    pub id: u64,
    /// Module name.
    pub name: String,
    /// Concrete implementation type.
    pub type_name: &'static str,
    /// Archive the module came from, if any.
    pub archive: Option<PathBuf>,
    /// Declared "load after" dependency.
    pub load_after: Option<String>,
    /// Current lifecycle state.
    pub state: ModuleState,
    /// When the instance was created.
    pub created_at: Instant,
}

struct ModuleEntry {
    id: u64,
    name: String,
    archive: Option<PathBuf>,
    load_after: Option<String>,
    type_id: TypeId,
    type_name: &'static str,
    instance: ModuleInstance,
    state: RwLock<ModuleState>,
    created_at: Instant,
}

/// Shared handle to a module descriptor and its live instance.
///
/// Two handles are equal when their module names are equal.
#[derive(Clone)]
pub struct ModuleHandle {
    entry: Arc<ModuleEntry>,
}

impl ModuleHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        factory: &ModuleFactory,
        archive: Option<PathBuf>,
        load_after: Option<String>,
    ) -> Self {
        Self {
            entry: Arc::new(ModuleEntry {
                id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                archive,
                load_after,
                type_id: factory.concrete_type(),
                type_name: factory.type_name(),
                instance: factory.instantiate(),
                state: RwLock::new(ModuleState::Unloaded),
                created_at: Instant::now(),
            }),
        }
    }

    /// Unique instance ID.
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Archive the module came from, if any.
    pub fn archive(&self) -> Option<&Path> {
        self.entry.archive.as_deref()
    }

    /// Declared "load after" dependency.
    pub fn load_after(&self) -> Option<&str> {
        self.entry.load_after.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModuleState {
        *self.entry.state.read()
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        *self.entry.state.write() = state;
    }

    /// Move from `from` to `to`, failing if the module is elsewhere.
    pub(crate) fn transition(&self, from: ModuleState, to: ModuleState) -> Result<()> {
        let mut state = self.entry.state.write();
        if *state != from {
            return Err(Error::invalid_state(from.to_string(), state.to_string()));
        }
        *state = to;
        Ok(())
    }

    /// `TypeId` of the concrete implementation.
    pub fn concrete_type(&self) -> TypeId {
        self.entry.type_id
    }

    /// Name of the concrete implementation type.
    pub fn type_name(&self) -> &'static str {
        self.entry.type_name
    }

    /// The live module.
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.entry.instance.module
    }

    /// The live module as its concrete type.
    pub fn downcast<T: Module>(&self) -> Option<Arc<T>> {
        let any: Arc<dyn Any + Send + Sync> = self.entry.instance.any.clone();
        any.downcast::<T>().ok()
    }

    /// Whether both handles point at the same instance, not merely the
    /// same name.
    pub fn same_instance(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// Descriptor snapshot.
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.entry.id,
            name: self.entry.name.clone(),
            type_name: self.entry.type_name,
            archive: self.entry.archive.clone(),
            load_after: self.entry.load_after.clone(),
            state: self.state(),
            created_at: self.entry.created_at,
        }
    }
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        self.entry.name == other.entry.name
    }
}

impl Eq for ModuleHandle {}

impl std::hash::Hash for ModuleHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.entry.name.hash(state);
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.entry.id)
            .field("name", &self.entry.name)
            .field("type", &self.entry.type_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Total modules registered.
    pub total: usize,
    /// Modules still enabling.
    pub enabling: usize,
    /// Modules enabled.
    pub enabled: usize,
    /// Modules being disabled.
    pub disabling: usize,
    /// Modules that came from an archive.
    pub from_archives: usize,
}

/// Active modules keyed by unique name.
pub struct ModuleRegistry {
    config: RegistryConfig,
    modules: DashMap<String, ModuleHandle>,
    /// Slots taken against `max_modules`, reserved before insertion.
    reserved: AtomicUsize,
}

impl ModuleRegistry {
    /// Create a new module registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            modules: DashMap::new(),
            reserved: AtomicUsize::new(0),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a module under its name.
    ///
    /// Fails with [`Error::DuplicateModule`] if the name is taken; the
    /// existing entry is left untouched.
    pub fn register(&self, module: ModuleHandle) -> Result<()> {
        let max = self.config.max_modules;
        if self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then(|| n + 1))
            .is_err()
        {
            return Err(Error::Registry(format!("registry full: max {} modules", max)));
        }

        match self.modules.entry(module.name().to_string()) {
            Entry::Occupied(existing) => {
                self.reserved.fetch_sub(1, Ordering::SeqCst);
                Err(Error::DuplicateModule(existing.key().clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(module);
                Ok(())
            }
        }
    }

    /// Remove a module by name.
    pub fn remove(&self, name: &str) -> Option<ModuleHandle> {
        let removed = self.modules.remove(name).map(|(_, m)| m);
        if removed.is_some() {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Remove `module` only if the registered entry is that very instance.
    pub(crate) fn remove_instance(&self, module: &ModuleHandle) -> bool {
        let removed = self
            .modules
            .remove_if(module.name(), |_, m| m.same_instance(module))
            .is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Get a module by name.
    pub fn get(&self, name: &str) -> Option<ModuleHandle> {
        self.modules.get(name).map(|r| r.clone())
    }

    /// Get a module by concrete type.
    pub fn get_by_type<T: Module>(&self) -> Option<ModuleHandle> {
        self.get_by_type_id(TypeId::of::<T>())
    }

    /// Get a module by concrete `TypeId`.
    pub fn get_by_type_id(&self, type_id: TypeId) -> Option<ModuleHandle> {
        self.modules
            .iter()
            .find(|r| r.value().concrete_type() == type_id)
            .map(|r| r.value().clone())
    }

    /// Check if a module is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Check if a module is registered and fully enabled.
    pub fn is_active(&self, name: &str) -> bool {
        self.modules
            .get(name)
            .map(|m| m.state() == ModuleState::Enabled)
            .unwrap_or(false)
    }

    /// Snapshot of all modules, in creation order.
    pub fn all(&self) -> Vec<ModuleHandle> {
        let mut all: Vec<ModuleHandle> = self.modules.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(ModuleHandle::id);
        all
    }

    /// Snapshot of all module names, in creation order.
    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|m| m.name().to_string()).collect()
    }

    /// Modules that came from `archive`.
    pub fn from_archive(&self, archive: &Path) -> Vec<ModuleHandle> {
        self.all()
            .into_iter()
            .filter(|m| m.archive() == Some(archive))
            .collect()
    }

    /// Get module count.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.modules.len(),
            ..Default::default()
        };

        for entry in self.modules.iter() {
            match entry.state() {
                ModuleState::Enabling => stats.enabling += 1,
                ModuleState::Enabled => stats.enabled += 1,
                ModuleState::Disabling => stats.disabling += 1,
                ModuleState::Unloaded => {}
            }
            if entry.archive().is_some() {
                stats.from_archives += 1;
            }
        }

        stats
    }

    /// Get all module descriptors.
    pub fn info(&self) -> Vec<ModuleInfo> {
        self.all().iter().map(ModuleHandle::info).collect()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("config", &self.config)
            .field("module_count", &self.modules.len())
            .finish()
    }
}
