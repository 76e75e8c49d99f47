//! Module lifecycle management.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::{panic_message, Error, Result};
use crate::module::{ModuleContext, Services};
use crate::registry::ModuleHandle;
use crate::unit::UnitArena;

/// Module lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    /// Not registered, or removed after disable.
    Unloaded,
    /// Name reserved, enable hook running.
    Enabling,
    /// Enabled and visible to lookups.
    Enabled,
    /// Teardown in progress.
    Disabling,
}

impl ModuleState {
    /// Check if the module can be enabled.
    pub fn can_enable(&self) -> bool {
        matches!(self, Self::Unloaded)
    }

    /// Check if the module can be disabled.
    pub fn can_disable(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Check if the module counts as active for dependency checks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Check if a lifecycle transition is in progress.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Enabling | Self::Disabling)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unloaded => "Module not loaded",
            Self::Enabling => "Module is being enabled",
            Self::Enabled => "Module enabled",
            Self::Disabling => "Module is being disabled",
        }
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Enabling => "enabling",
            Self::Enabled => "enabled",
            Self::Disabling => "disabling",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle event for hooks.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Module name reserved, enable hook about to run.
    Enabling {
        /// Module name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Module enabled.
    Enabled {
        /// Module name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Module teardown started.
    Disabling {
        /// Module name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Module removed from the registry.
    Unloaded {
        /// Module name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Archive parked until a dependency is active.
    Deferred {
        /// Archive path.
        archive: PathBuf,
        /// Dependency name.
        dependency: String,
        /// Event time.
        at: Instant,
    },
    /// A module or archive failed.
    Error {
        /// Module name, or archive path for load failures.
        name: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
}

impl LifecycleEvent {
    /// Module name, or archive path for deferrals.
    pub fn subject(&self) -> String {
        match self {
            Self::Enabling { name, .. }
            | Self::Enabled { name, .. }
            | Self::Disabling { name, .. }
            | Self::Unloaded { name, .. }
            | Self::Error { name, .. } => name.clone(),
            Self::Deferred { archive, .. } => archive.display().to_string(),
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Enabling { at, .. }
            | Self::Enabled { at, .. }
            | Self::Disabling { at, .. }
            | Self::Unloaded { at, .. }
            | Self::Deferred { at, .. }
            | Self::Error { at, .. } => *at,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enabling { .. } => "enabling",
            Self::Enabled { .. } => "enabled",
            Self::Disabling { .. } => "disabling",
            Self::Unloaded { .. } => "unloaded",
            Self::Deferred { .. } => "deferred",
            Self::Error { .. } => "error",
        }
    }
}

type EventHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Hooks for lifecycle events.
///
/// Handlers may be added while events are being emitted; they see events
/// emitted after they were added.
pub struct LifecycleHooks {
    handlers: RwLock<Vec<EventHandler>>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Emit a lifecycle event.
    pub fn emit(&self, event: LifecycleEvent) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Emit an enabling event.
    pub fn emit_enabling(&self, name: &str) {
        self.emit(LifecycleEvent::Enabling {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an enabled event.
    pub fn emit_enabled(&self, name: &str) {
        self.emit(LifecycleEvent::Enabled {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a disabling event.
    pub fn emit_disabling(&self, name: &str) {
        self.emit(LifecycleEvent::Disabling {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an unloaded event.
    pub fn emit_unloaded(&self, name: &str) {
        self.emit(LifecycleEvent::Unloaded {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a deferred event.
    pub fn emit_deferred(&self, archive: &Path, dependency: &str) {
        self.emit(LifecycleEvent::Deferred {
            archive: archive.to_path_buf(),
            dependency: dependency.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an error event.
    pub fn emit_error(&self, name: &str, message: &str) {
        self.emit(LifecycleEvent::Error {
            name: name.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.read().len())
            .finish()
    }
}

/// What a disable released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    /// Listeners unregistered.
    pub listeners: usize,
    /// Commands unregistered.
    pub commands: usize,
    /// Schedulers closed.
    pub schedulers: usize,
    /// Whether the module's archive unit was released.
    pub unit_released: bool,
    /// The module's own disable hook failure, if any.
    pub hook_error: Option<String>,
}

/// Drives modules through enable and disable.
pub struct LifecycleManager {
    services: Services,
    units: Arc<UnitArena>,
    hooks: Arc<LifecycleHooks>,
}

impl LifecycleManager {
    pub(crate) fn new(services: Services, units: Arc<UnitArena>, hooks: Arc<LifecycleHooks>) -> Self {
        Self {
            services,
            units,
            hooks,
        }
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn hooks(&self) -> &Arc<LifecycleHooks> {
        &self.hooks
    }

    /// Context handed to the module's hooks.
    pub(crate) fn context(&self, name: &str) -> ModuleContext {
        ModuleContext::new(name, self.services.clone())
    }

    /// Reserve the module's name, run its enable hook, and mark it enabled.
    ///
    /// On failure anything the module registered is released and the name
    /// is freed again.
    pub fn enable(&self, module: &ModuleHandle) -> Result<()> {
        let name = module.name();
        module.transition(ModuleState::Unloaded, ModuleState::Enabling)?;

        if let Err(e) = self.services.registry.register(module.clone()) {
            module.set_state(ModuleState::Unloaded);
            return Err(e);
        }
        self.hooks.emit_enabling(name);

        let ctx = self.context(name);
        let result = match catch_unwind(AssertUnwindSafe(|| module.module().enable(&ctx))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::enable_failed(name, e.to_string())),
            Err(payload) => Err(Error::enable_failed(name, panic_message(payload))),
        };

        if let Err(e) = result {
            tracing::error!("Failed to enable module {}: {}", name, e);
            self.release_registrations(name);
            self.services.registry.remove_instance(module);
            module.set_state(ModuleState::Unloaded);
            self.hooks.emit_error(name, &e.to_string());
            return Err(e);
        }

        module.set_state(ModuleState::Enabled);
        tracing::info!("Enabled module {} ({})", name, module.type_name());
        self.hooks.emit_enabled(name);
        Ok(())
    }

    /// Tear a module down and remove it from the registry.
    ///
    /// Registrations are released before the module's own disable hook
    /// runs. A failing hook is logged and reported in the result; the
    /// module is unloaded either way.
    pub fn disable(&self, module: &ModuleHandle) -> Result<Teardown> {
        let name = module.name();
        module.transition(ModuleState::Enabled, ModuleState::Disabling)?;
        self.hooks.emit_disabling(name);

        let (listeners, commands, schedulers) = self.release_registrations(name);
        let mut teardown = Teardown {
            listeners,
            commands,
            schedulers,
            ..Default::default()
        };

        let ctx = self.context(name);
        let hook = match catch_unwind(AssertUnwindSafe(|| module.module().disable(&ctx))) {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(payload) => Err(panic_message(payload)),
        };
        if let Err(message) = hook {
            let err = Error::teardown(name, message.clone());
            tracing::warn!("{}", err);
            self.hooks.emit_error(name, &err.to_string());
            teardown.hook_error = Some(message);
        }

        if let Some(archive) = module.archive() {
            if let Some(unit) = self.units.get(archive) {
                if unit.detach_module(name) == 0 {
                    teardown.unit_released = self.units.release(archive).is_some();
                }
            }
        }

        self.services.registry.remove_instance(module);
        module.set_state(ModuleState::Unloaded);
        self.services.console.output(&format!("Unload {}", name));
        tracing::info!(
            "Disabled module {} ({} listeners, {} commands, {} schedulers)",
            name,
            teardown.listeners,
            teardown.commands,
            teardown.schedulers
        );
        self.hooks.emit_unloaded(name);
        Ok(teardown)
    }

    fn release_registrations(&self, name: &str) -> (usize, usize, usize) {
        let listeners = self.services.listeners.unregister_all(name);
        let commands = self.services.commands.unregister_all(name);
        let schedulers = self.services.schedulers.close_all(name);
        (listeners, commands, schedulers)
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("registry", &self.services.registry)
            .field("units", &self.units)
            .finish()
    }
}
