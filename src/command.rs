//! Command registrations owned by modules and concurrent dispatch.

use std::any::type_name;
use std::sync::Arc;

use dashmap::DashMap;

use crate::console::OutputSink;
use crate::error::{Error, Result};

/// Result of executing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command accepted and handled the invocation.
    Allow,
    /// The command rejected the invocation.
    Refuse,
}

/// A command implementation registered against a module.
pub trait Command: Send + Sync + 'static {
    /// Name the command is invoked by.
    fn name(&self) -> &str;

    /// Execute with the given arguments.
    fn execute(&self, args: &[String], out: &dyn OutputSink) -> Result<CommandOutcome>;
}

/// Constructor for a command type, bound in the [`Linker`](crate::Linker).
#[derive(Clone)]
pub struct CommandFactory {
    type_name: &'static str,
    make: Arc<dyn Fn() -> Arc<dyn Command> + Send + Sync>,
}

impl CommandFactory {
    /// Factory for a default-constructible command type.
    pub fn of<T: Command + Default>() -> Self {
        Self::with(T::default)
    }

    /// Factory from a constructor function.
    pub fn with<T, F>(make: F) -> Self
    where
        T: Command,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            type_name: type_name::<T>(),
            make: Arc::new(move || Arc::new(make()) as Arc<dyn Command>),
        }
    }

    /// Name of the concrete type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Create a fresh command instance.
    pub fn instantiate(&self) -> Arc<dyn Command> {
        (self.make)()
    }
}

impl std::fmt::Debug for CommandFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFactory")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Per-handler results of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// `(owning module, result)` for every handler that ran.
    pub results: Vec<(String, Result<CommandOutcome>)>,
}

impl DispatchReport {
    /// Whether no registered command matched.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Combined outcome: `Allow` if any handler allowed.
    pub fn outcome(&self) -> CommandOutcome {
        if self
            .results
            .iter()
            .any(|(_, r)| matches!(r, Ok(CommandOutcome::Allow)))
        {
            CommandOutcome::Allow
        } else {
            CommandOutcome::Refuse
        }
    }

    /// Owners whose handler ran.
    pub fn owners(&self) -> Vec<&str> {
        self.results.iter().map(|(o, _)| o.as_str()).collect()
    }
}

/// Command registrations grouped by owning module.
#[derive(Default)]
pub struct CommandRegistry {
    commands: DashMap<String, Vec<Arc<dyn Command>>>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command against `owner`.
    ///
    /// Returns false without changing anything if `owner` already has a
    /// command with the same name.
    pub fn register(&self, owner: &str, command: Arc<dyn Command>) -> bool {
        let mut entry = self.commands.entry(owner.to_string()).or_default();
        if entry.iter().any(|c| c.name() == command.name()) {
            return false;
        }
        entry.push(command);
        true
    }

    /// Remove every command of `owner`, returning how many were removed.
    pub fn unregister_all(&self, owner: &str) -> usize {
        self.commands
            .remove(owner)
            .map(|(_, commands)| commands.len())
            .unwrap_or(0)
    }

    /// Names of the commands registered against `owner`.
    pub fn commands_of(&self, owner: &str) -> Vec<String> {
        self.commands
            .get(owner)
            .map(|c| c.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Whether any module has a command called `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.commands
            .iter()
            .any(|entry| entry.value().iter().any(|c| c.name() == name))
    }

    /// Run every command called `name` on the blocking worker pool.
    ///
    /// Handlers run concurrently; the report holds each handler's result.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Vec<String>,
        out: Arc<dyn OutputSink>,
    ) -> DispatchReport {
        let matching: Vec<(String, Arc<dyn Command>)> = self
            .commands
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|c| c.name() == name)
                    .map(|c| (entry.key().clone(), c.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let args: Arc<[String]> = args.into();
        let tasks: Vec<_> = matching
            .into_iter()
            .map(|(owner, command)| {
                let args = args.clone();
                let out = out.clone();
                let task =
                    tokio::task::spawn_blocking(move || command.execute(&args, out.as_ref()));
                (owner, task)
            })
            .collect();

        let mut report = DispatchReport::default();
        for (owner, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Join(e.to_string())),
            };
            if let Err(ref e) = result {
                tracing::warn!("Command {} of {} failed: {}", name, owner, e);
            }
            report.results.push((owner, result));
        }
        report
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("owners", &self.commands.len())
            .finish()
    }
}
