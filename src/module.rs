//! The module capability and the context handed to module code.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use crate::command::{Command, CommandRegistry};
use crate::console::OutputSink;
use crate::error::{Error, Result};
use crate::event::{Listener, ListenerRegistry};
use crate::registry::{ModuleHandle, ModuleRegistry};
use crate::scanner::{HandlerRegistry, ScanPass, TagHandler, TagKind};
use crate::schedule::{Scheduler, SchedulerRegistry};

/// An extension module managed by the host.
///
/// Implementors are instantiated by the host from a [`ModuleFactory`] and
/// enabled once. Everything registered through the [`ModuleContext`] is
/// released by the host on disable, whatever `disable` itself does.
pub trait Module: Send + Sync + 'static {
    /// Initialize the module.
    fn enable(&self, ctx: &ModuleContext) -> Result<()>;

    /// Persist state and release anything not registered through the context.
    fn disable(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }
}

/// A freshly constructed module, viewed both as a module and as its
/// concrete type.
#[derive(Clone)]
pub(crate) struct ModuleInstance {
    pub(crate) module: Arc<dyn Module>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

/// Constructor for a module type, bound in the [`Linker`](crate::Linker).
#[derive(Clone)]
pub struct ModuleFactory {
    type_id: TypeId,
    type_name: &'static str,
    make: Arc<dyn Fn() -> ModuleInstance + Send + Sync>,
}

impl ModuleFactory {
    /// Factory for a default-constructible module type.
    pub fn of<T: Module + Default>() -> Self {
        Self::with(T::default)
    }

    /// Factory from a constructor function.
    pub fn with<T, F>(make: F) -> Self
    where
        T: Module,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            make: Arc::new(move || {
                let module = Arc::new(make());
                ModuleInstance {
                    module: module.clone(),
                    any: module,
                }
            }),
        }
    }

    /// `TypeId` of the concrete type.
    pub fn concrete_type(&self) -> TypeId {
        self.type_id
    }

    /// Name of the concrete type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn instantiate(&self) -> ModuleInstance {
        (self.make)()
    }
}

impl std::fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFactory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Shared host state that module code may reach through its context.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) commands: Arc<CommandRegistry>,
    pub(crate) schedulers: Arc<SchedulerRegistry>,
    pub(crate) console: Arc<dyn OutputSink>,
}

/// Per-module view of the host, passed to [`Module::enable`] and
/// [`Module::disable`].
#[derive(Clone)]
pub struct ModuleContext {
    name: String,
    services: Services,
}

impl ModuleContext {
    pub(crate) fn new(name: impl Into<String>, services: Services) -> Self {
        Self {
            name: name.into(),
            services,
        }
    }

    /// Name of the module this context belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an event listener owned by this module.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.services.listeners.register(&self.name, listener);
    }

    /// Register a command owned by this module.
    pub fn register_command(&self, command: Arc<dyn Command>) -> Result<()> {
        let command_name = command.name().to_string();
        if self.services.commands.register(&self.name, command) {
            Ok(())
        } else {
            Err(Error::DuplicateCommand {
                module: self.name.clone(),
                command: command_name,
            })
        }
    }

    /// Attach a scheduler that is closed when this module is disabled.
    pub fn attach_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        self.services.schedulers.attach(&self.name, scheduler);
    }

    /// Extend the metadata scanner with a new tag kind.
    pub fn register_tag_handler(
        &self,
        kind: TagKind,
        pass: ScanPass,
        handler: TagHandler,
    ) -> Result<()> {
        self.services.handlers.register(kind, pass, handler)
    }

    /// Look up another active module by name.
    pub fn get_module(&self, name: &str) -> Option<ModuleHandle> {
        self.services.registry.get(name)
    }

    /// Look up an active module by concrete type.
    pub fn get_module_by_type<T: Module>(&self) -> Option<ModuleHandle> {
        self.services.registry.get_by_type::<T>()
    }

    /// Write to the operator console.
    pub fn output(&self, text: &str) {
        self.services.console.output(text);
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .finish()
    }
}
