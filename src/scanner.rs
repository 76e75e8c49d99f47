//! Metadata scanning: routing class tags to registered handlers.
//!
//! Handlers are keyed by [`TagKind`] and bound to one of two passes. The
//! declare pass runs over each class as it is loaded and may stop the
//! archive (deferral). The register pass runs after every module of the
//! archive is enabled, so its handlers can rely on their owners existing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::archive::{ClassBody, ClassDefinition, Tag, TagData};
use crate::command::CommandRegistry;
use crate::deferral::DeferralTable;
use crate::error::{panic_message, Error, Result};
use crate::module::ModuleFactory;
use crate::registry::{ModuleHandle, ModuleRegistry};
use crate::unit::LoadingUnit;

pub use crate::archive::TagKind;

/// Which scan pass a handler runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanPass {
    /// First pass, class by class while the archive loads.
    Declare,
    /// Second pass, after the archive's modules are enabled.
    Register,
}

/// What the scan should do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFlow {
    /// Keep scanning.
    Continue,
    /// Stop processing this archive.
    Stop,
}

/// A tag handler.
pub type TagHandler =
    Arc<dyn Fn(&ClassDefinition, &TagData, &mut ScanContext<'_>) -> Result<ScanFlow> + Send + Sync>;

/// Wrap a closure as a [`TagHandler`].
pub fn tag_handler<F>(handler: F) -> TagHandler
where
    F: Fn(&ClassDefinition, &TagData, &mut ScanContext<'_>) -> Result<ScanFlow>
        + Send
        + Sync
        + 'static,
{
    Arc::new(handler)
}

/// Tags of a class as `(kind, data)` pairs, in declaration order.
pub fn classify(class: &ClassDefinition) -> Vec<&Tag> {
    class.tags.iter().collect()
}

/// State of one archive's scan, shared by every handler invocation.
pub struct ScanContext<'a> {
    unit: &'a LoadingUnit,
    registry: &'a ModuleRegistry,
    deferrals: &'a DeferralTable,
    commands: &'a CommandRegistry,
    declared: Vec<ModuleHandle>,
    deferred_on: Option<String>,
}

impl<'a> ScanContext<'a> {
    pub(crate) fn new(
        unit: &'a LoadingUnit,
        registry: &'a ModuleRegistry,
        deferrals: &'a DeferralTable,
        commands: &'a CommandRegistry,
    ) -> Self {
        Self {
            unit,
            registry,
            deferrals,
            commands,
            declared: Vec::new(),
            deferred_on: None,
        }
    }

    /// Path of the archive being scanned.
    pub fn archive(&self) -> &Path {
        self.unit.archive()
    }

    /// The archive's loading unit.
    pub fn unit(&self) -> &LoadingUnit {
        self.unit
    }

    /// Look up an active module.
    pub fn get_module(&self, name: &str) -> Option<ModuleHandle> {
        self.registry.get(name)
    }

    /// Whether `name` is registered and fully enabled.
    pub fn is_active(&self, name: &str) -> bool {
        self.registry.is_active(name)
    }

    /// Instantiate a module declared by this archive. It is enabled once
    /// the declare pass finishes.
    pub fn declare_module(
        &mut self,
        name: &str,
        factory: &ModuleFactory,
        load_after: Option<&str>,
    ) -> Result<()> {
        if self.registry.contains(name) || self.declared.iter().any(|m| m.name() == name) {
            return Err(Error::DuplicateModule(name.to_string()));
        }
        let module = ModuleHandle::new(
            name,
            factory,
            Some(self.unit.archive().to_path_buf()),
            load_after.map(str::to_string),
        );
        tracing::debug!(
            "Declared module {} ({}) in {}",
            name,
            module.type_name(),
            self.unit.archive().display()
        );
        self.declared.push(module);
        Ok(())
    }

    /// Park the archive until `dependency` is active.
    ///
    /// Returns false if the dependency became active while deferring, in
    /// which case nothing is recorded.
    pub fn defer(&mut self, dependency: &str) -> bool {
        self.deferrals.defer(dependency, self.unit.archive());
        if self.registry.is_active(dependency) {
            self.deferrals.cancel(self.unit.archive());
            return false;
        }
        self.deferred_on = Some(dependency.to_string());
        true
    }

    /// Register a command instance against an active module.
    pub fn register_command(
        &mut self,
        owner: &str,
        command: Arc<dyn crate::command::Command>,
    ) -> Result<()> {
        let command_name = command.name().to_string();
        if self.commands.register(owner, command) {
            Ok(())
        } else {
            Err(Error::DuplicateCommand {
                module: owner.to_string(),
                command: command_name,
            })
        }
    }

    pub(crate) fn take_declared(&mut self) -> Vec<ModuleHandle> {
        std::mem::take(&mut self.declared)
    }

    pub(crate) fn deferred_on(&self) -> Option<&str> {
        self.deferred_on.as_deref()
    }
}

struct HandlerEntry {
    kind: TagKind,
    pass: ScanPass,
    handler: TagHandler,
}

/// Tag handlers in registration order.
pub struct HandlerRegistry {
    entries: RwLock<Vec<HandlerEntry>>,
}

impl HandlerRegistry {
    /// A registry with no handlers.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// A registry with the module and command handlers installed.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.entries.write().extend([
            HandlerEntry {
                kind: TagKind::MODULE,
                pass: ScanPass::Declare,
                handler: Arc::new(handle_module_tag),
            },
            HandlerEntry {
                kind: TagKind::COMMAND,
                pass: ScanPass::Register,
                handler: Arc::new(handle_command_tag),
            },
        ]);
        registry
    }

    /// Add a handler for a new tag kind.
    pub fn register(&self, kind: TagKind, pass: ScanPass, handler: TagHandler) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.kind == kind) {
            return Err(Error::HandlerAlreadyRegistered(kind.to_string()));
        }
        tracing::debug!("Registered tag handler for {} ({:?})", kind, pass);
        entries.push(HandlerEntry {
            kind,
            pass,
            handler,
        });
        Ok(())
    }

    /// Whether a handler exists for `kind`.
    pub fn contains(&self, kind: &TagKind) -> bool {
        self.entries.read().iter().any(|e| &e.kind == kind)
    }

    /// Registered kinds in order.
    pub fn kinds(&self) -> Vec<TagKind> {
        self.entries.read().iter().map(|e| e.kind.clone()).collect()
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn handlers_for(&self, pass: ScanPass) -> Vec<(TagKind, TagHandler)> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.pass == pass)
            .map(|e| (e.kind.clone(), e.handler.clone()))
            .collect()
    }

    /// Run every handler of `pass` over the tags of `class`.
    ///
    /// Stops at the first handler that returns [`ScanFlow::Stop`] or fails.
    pub fn scan(
        &self,
        pass: ScanPass,
        class: &ClassDefinition,
        ctx: &mut ScanContext<'_>,
    ) -> Result<ScanFlow> {
        let tags = classify(class);
        for (kind, handler) in self.handlers_for(pass) {
            for tag in tags.iter().filter(|t| t.kind == kind) {
                let data = &tag.data;
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(class, data, ctx)))
                    .map_err(|payload| {
                        Error::module(format!(
                            "{} handler panicked on {}: {}",
                            kind,
                            class.name,
                            panic_message(payload)
                        ))
                    })??;
                if outcome == ScanFlow::Stop {
                    return Ok(ScanFlow::Stop);
                }
            }
        }
        Ok(ScanFlow::Continue)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn handle_module_tag(
    class: &ClassDefinition,
    data: &TagData,
    ctx: &mut ScanContext<'_>,
) -> Result<ScanFlow> {
    let name = data
        .non_empty("name")
        .ok_or_else(|| Error::invalid_declaration(&class.name, "module tag has no name"))?;
    let load_after = data.non_empty("load_after");

    if let Some(dependency) = load_after {
        if !ctx.is_active(dependency) {
            tracing::debug!(
                "{} needs {}, which is not active",
                ctx.archive().display(),
                dependency
            );
            if ctx.defer(dependency) {
                tracing::info!(
                    "Deferred {} until {} is active",
                    ctx.archive().display(),
                    dependency
                );
                return Ok(ScanFlow::Stop);
            }
        }
    }

    let factory = match &class.body {
        _ if class.is_abstract => {
            return Err(Error::invalid_declaration(&class.name, "class is abstract"))
        }
        ClassBody::Module(factory) => factory,
        other => {
            return Err(Error::invalid_declaration(
                &class.name,
                format!("expected a module implementation, found {}", other.describe()),
            ))
        }
    };

    ctx.declare_module(name, factory, load_after)?;
    Ok(ScanFlow::Continue)
}

fn handle_command_tag(
    class: &ClassDefinition,
    data: &TagData,
    ctx: &mut ScanContext<'_>,
) -> Result<ScanFlow> {
    let owner = data
        .non_empty("module")
        .ok_or_else(|| Error::invalid_declaration(&class.name, "command tag has no module"))?;

    let factory = match &class.body {
        _ if class.is_abstract => {
            return Err(Error::invalid_declaration(&class.name, "class is abstract"))
        }
        ClassBody::Command(factory) => factory,
        other => {
            return Err(Error::invalid_declaration(
                &class.name,
                format!("expected a command implementation, found {}", other.describe()),
            ))
        }
    };

    if ctx.get_module(owner).is_none() {
        return Err(Error::InvalidTarget {
            class: class.name.clone(),
            module: owner.to_string(),
        });
    }

    ctx.register_command(owner, factory.instantiate())?;
    Ok(ScanFlow::Continue)
}
