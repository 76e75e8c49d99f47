//! The module host: one object wiring the loader, registries, and
//! lifecycle together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::archive::{ArchiveReader, Linker, ManifestReader};
use crate::command::{CommandRegistry, DispatchReport};
use crate::console::{OutputSink, TracingSink};
use crate::deferral::DeferralTable;
use crate::error::{Error, Result};
use crate::event::{Event, ListenerRegistry};
use crate::lifecycle::{LifecycleEvent, LifecycleHooks, LifecycleManager, Teardown};
use crate::loader::{ArchiveLoader, LoadOutcome, LoaderConfig};
use crate::module::{Module, ModuleFactory, Services};
use crate::registry::{ModuleHandle, ModuleInfo, ModuleRegistry, RegistryConfig, RegistryStats};
use crate::scanner::{HandlerRegistry, ScanPass, TagHandler, TagKind};
use crate::schedule::SchedulerRegistry;
use crate::unit::{ClassRef, LoadingUnit, UnitArena};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::{HostMetrics, MetricsConfig};

/// Configuration for the module host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Loader configuration.
    pub loader: LoaderConfig,
    /// Registry configuration.
    pub registry: RegistryConfig,
    /// Directory scanned by [`ModuleHost::discover`].
    pub plugin_dir: PathBuf,
    /// Class names provided by the host itself.
    pub core_classes: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            registry: RegistryConfig::default(),
            plugin_dir: PathBuf::from("plugins"),
            core_classes: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Create a new host configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Set the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Set the registry configuration.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Set the plugin directory.
    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    /// Add a core class name.
    pub fn with_core_class(mut self, class: impl Into<String>) -> Self {
        self.core_classes.push(class.into());
        self
    }
}

/// Builder for a [`ModuleHost`] with custom collaborators.
pub struct HostBuilder {
    config: HostConfig,
    linker: Option<Arc<Linker>>,
    reader: Option<Arc<dyn ArchiveReader>>,
    console: Option<Arc<dyn OutputSink>>,
}

impl HostBuilder {
    /// Use an existing symbol table.
    pub fn linker(mut self, linker: Arc<Linker>) -> Self {
        self.linker = Some(linker);
        self
    }

    /// Read archives with a custom reader instead of TOML manifests.
    pub fn reader(mut self, reader: Arc<dyn ArchiveReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Send console output somewhere other than the log.
    pub fn console(mut self, console: Arc<dyn OutputSink>) -> Self {
        self.console = Some(console);
        self
    }

    /// Build the host.
    pub fn build(self) -> Result<ModuleHost> {
        let linker = self.linker.unwrap_or_default();
        let reader: Arc<dyn ArchiveReader> = match self.reader {
            Some(reader) => reader,
            None => Arc::new(ManifestReader::new(
                linker.clone(),
                self.config.loader.strict_validation,
            )),
        };
        let console: Arc<dyn OutputSink> = match self.console {
            Some(console) => console,
            None => Arc::new(TracingSink),
        };

        let services = Services {
            registry: Arc::new(ModuleRegistry::new(self.config.registry.clone())),
            handlers: Arc::new(HandlerRegistry::with_builtins()),
            listeners: Arc::new(ListenerRegistry::new()),
            commands: Arc::new(CommandRegistry::new()),
            schedulers: Arc::new(SchedulerRegistry::new()),
            console,
        };
        let units = Arc::new(UnitArena::new(self.config.core_classes.iter().cloned()));
        let deferrals = Arc::new(DeferralTable::new());
        let hooks = Arc::new(LifecycleHooks::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            services.clone(),
            units.clone(),
            hooks.clone(),
        ));

        #[allow(unused_mut)]
        let mut loader = ArchiveLoader::new(
            self.config.loader.clone(),
            reader,
            units.clone(),
            deferrals.clone(),
            lifecycle.clone(),
        );

        #[cfg(feature = "metrics-prometheus")]
        let metrics = {
            let metrics = Arc::new(
                HostMetrics::new(MetricsConfig::default())
                    .map_err(|e| Error::Config(format!("metrics: {}", e)))?,
            );
            loader.set_metrics(metrics.clone());
            let observer = metrics.clone();
            hooks.on_event(move |event| {
                if let LifecycleEvent::Unloaded { .. } = event {
                    observer.record_unload();
                }
            });
            metrics
        };

        tracing::debug!(
            "Module host ready (plugin dir {})",
            self.config.plugin_dir.display()
        );

        Ok(ModuleHost {
            config: self.config,
            linker,
            services,
            units,
            deferrals,
            hooks,
            lifecycle,
            loader: Arc::new(loader),
            #[cfg(feature = "metrics-prometheus")]
            metrics,
        })
    }
}

/// Loads archives and manages the modules they declare.
pub struct ModuleHost {
    config: HostConfig,
    linker: Arc<Linker>,
    services: Services,
    units: Arc<UnitArena>,
    deferrals: Arc<DeferralTable>,
    hooks: Arc<LifecycleHooks>,
    lifecycle: Arc<LifecycleManager>,
    loader: Arc<ArchiveLoader>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Arc<HostMetrics>,
}

impl ModuleHost {
    /// Create a host that reads TOML manifests and logs console output.
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Create with default configuration.
    pub fn default_config() -> Result<Self> {
        Self::new(HostConfig::default())
    }

    /// Start building a host with custom collaborators.
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder {
            config,
            linker: None,
            reader: None,
            console: None,
        }
    }

    /// Get the host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Symbol table used to bind archive entries.
    pub fn linker(&self) -> &Arc<Linker> {
        &self.linker
    }

    /// Get the module registry.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.services.registry
    }

    /// Get the listener registry.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.services.listeners
    }

    /// Get the command registry.
    pub fn commands(&self) -> &CommandRegistry {
        &self.services.commands
    }

    /// Get the scheduler registry.
    pub fn schedulers(&self) -> &SchedulerRegistry {
        &self.services.schedulers
    }

    /// Get the metrics collector.
    #[cfg(feature = "metrics-prometheus")]
    pub fn metrics(&self) -> &HostMetrics {
        &self.metrics
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.hooks.on_event(handler);
    }

    /// Load an archive.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<LoadOutcome> {
        self.loader.load(path.as_ref())
    }

    /// Load an archive on the blocking worker pool.
    pub async fn load_async(&self, path: impl Into<PathBuf>) -> Result<LoadOutcome> {
        let loader = self.loader.clone();
        let path = path.into();
        tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| Error::Join(e.to_string()))?
    }

    /// Enable a module compiled into the host rather than shipped in an
    /// archive. Archives waiting on it are loaded afterwards.
    pub fn install(&self, name: &str, factory: ModuleFactory) -> Result<ModuleHandle> {
        let module = ModuleHandle::new(name, &factory, None, None);
        self.lifecycle.enable(&module)?;

        for (path, outcome) in self.loader.resume(name) {
            if let Err(e) = outcome {
                tracing::warn!("Waiting archive {} failed to load: {}", path.display(), e);
            }
        }
        Ok(module)
    }

    /// Load every archive in the plugin directory, in file name order.
    ///
    /// A missing directory yields nothing; individual failures are logged
    /// and returned alongside the successes.
    pub fn discover(&self) -> Result<Vec<(PathBuf, Result<LoadOutcome>)>> {
        let dir = &self.config.plugin_dir;
        if !dir.exists() {
            tracing::warn!("Plugin directory does not exist: {}", dir.display());
            return Ok(Vec::new());
        }

        let mut archives = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && self.config.loader.is_archive(&path) {
                archives.push(path);
            }
        }
        archives.sort();

        let mut results = Vec::with_capacity(archives.len());
        for path in archives {
            if self.units.is_published(&path) {
                continue;
            }
            let outcome = self.loader.load(&path);
            match &outcome {
                Ok(LoadOutcome::Loaded(report)) => {
                    tracing::info!("Discovered {} ({:?})", path.display(), report.modules)
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Failed to load {}: {}", path.display(), e),
            }
            results.push((path, outcome));
        }
        Ok(results)
    }

    /// Get an enabled module by name.
    pub fn get_module(&self, name: &str) -> Option<ModuleHandle> {
        self.services
            .registry
            .get(name)
            .filter(|m| m.state().is_active())
    }

    /// Get an enabled module by concrete type.
    pub fn get_module_by_type<T: Module>(&self) -> Option<ModuleHandle> {
        self.services
            .registry
            .get_by_type::<T>()
            .filter(|m| m.state().is_active())
    }

    /// Check if a module is enabled.
    pub fn has_module(&self, name: &str) -> bool {
        self.services.registry.is_active(name)
    }

    /// Descriptors of every registered module.
    pub fn list_modules(&self) -> Vec<ModuleInfo> {
        self.services.registry.info()
    }

    /// Get module count.
    pub fn module_count(&self) -> usize {
        self.services.registry.len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.services.registry.stats()
    }

    /// Disable a module by name.
    pub fn disable(&self, name: &str) -> Result<Teardown> {
        let module = self
            .services
            .registry
            .get(name)
            .ok_or_else(|| Error::module_not_found(name))?;
        self.lifecycle.disable(&module)
    }

    /// Disable every module of an archive and release its unit.
    ///
    /// Returns the names of the disabled modules. An archive that is only
    /// waiting on a dependency is forgotten.
    pub fn unload_archive(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let path = path.as_ref();
        let modules = self.services.registry.from_archive(path);

        if modules.is_empty() && !self.units.is_published(path) {
            return match self.deferrals.cancel(path) {
                Some(dependency) => {
                    tracing::info!("Dropped {} (was waiting for {})", path.display(), dependency);
                    Ok(Vec::new())
                }
                None => Err(Error::Registry(format!(
                    "archive not loaded: {}",
                    path.display()
                ))),
            };
        }

        let mut disabled = Vec::new();
        let mut remaining = 0;
        for module in modules.iter().rev() {
            match self.lifecycle.disable(module) {
                Ok(_) => disabled.push(module.name().to_string()),
                Err(e) => {
                    tracing::warn!("Could not disable {}: {}", module.name(), e);
                    remaining += 1;
                }
            }
        }
        disabled.reverse();

        if remaining > 0 {
            tracing::warn!(
                "Keeping unit of {}: {} module(s) still registered",
                path.display(),
                remaining
            );
            return Ok(disabled);
        }

        self.units.release(path);
        tracing::info!("Unloaded archive {}", path.display());
        Ok(disabled)
    }

    /// Resolve a class name against the host and every published unit.
    pub fn resolve_class(&self, name: &str) -> Result<ClassRef> {
        self.units.resolve(name)
    }

    /// The published unit of an archive.
    pub fn unit(&self, path: impl AsRef<Path>) -> Option<Arc<LoadingUnit>> {
        self.units.get(path.as_ref())
    }

    /// Archives waiting on a dependency, grouped by dependency name.
    pub fn pending_deferrals(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.deferrals.pending()
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

    /// Deliver an event to every listener.
    pub fn dispatch_event(&self, event: &Event) -> usize {
        self.services.listeners.dispatch(event)
    }

    /// Run every command called `name`.
    pub async fn dispatch_command(&self, name: &str, args: Vec<String>) -> DispatchReport {
        self.services
            .commands
            .dispatch(name, args, self.services.console.clone())
            .await
    }

    /// Disable every module: archive modules first, newest first, then
    /// modules installed in-process.
    pub fn shutdown(&self) {
        let all = self.services.registry.all();
        let (from_archives, installed): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|m| m.archive().is_some());

        for module in from_archives.iter().rev().chain(installed.iter().rev()) {
            if let Err(e) = self.lifecycle.disable(module) {
                tracing::warn!("Could not disable {} on shutdown: {}", module.name(), e);
            }
        }

        for unit in self.units.units() {
            self.units.release(unit.archive());
        }
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("config", &self.config)
            .field("module_count", &self.services.registry.len())
            .field("units", &self.units.len())
            .field("deferred", &self.deferrals.len())
            .finish()
    }
}

impl Drop for ModuleHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferSink;
    use crate::lifecycle::ModuleState;
    use crate::module::ModuleContext;

    #[derive(Default)]
    struct Main;

    impl Module for Main {
        fn enable(&self, ctx: &ModuleContext) -> Result<()> {
            ctx.output("main up");
            Ok(())
        }
    }

    #[test]
    fn test_host_creation() {
        let host = ModuleHost::default_config().unwrap();
        assert_eq!(host.module_count(), 0);
        assert_eq!(host.stats().total, 0);
    }

    #[test]
    fn test_host_config_builder() {
        let config = HostConfig::new()
            .with_plugin_dir("/srv/plugins")
            .with_core_class("host.Api")
            .with_registry(RegistryConfig::new().with_max_modules(8));

        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.core_classes, vec!["host.Api"]);
        assert_eq!(config.registry.max_modules, 8);
    }

    #[test]
    fn test_host_config_from_toml() {
        let config = HostConfig::from_toml(
            r#"
plugin_dir = "mods"
core_classes = ["host.Api"]

[loader]
archive_extension = "jar"

[registry]
max_modules = 4
"#,
        )
        .unwrap();

        assert_eq!(config.plugin_dir, PathBuf::from("mods"));
        assert_eq!(config.loader.archive_extension, "jar");
        assert!(config.loader.strict_validation);
        assert_eq!(config.registry.max_modules, 4);

        assert!(matches!(
            HostConfig::from_toml("plugin_dir = 3"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_install_and_shutdown() {
        let console = Arc::new(BufferSink::new());
        let host = ModuleHost::builder(HostConfig::default())
            .console(console.clone())
            .build()
            .unwrap();

        let module = host.install("Main", ModuleFactory::of::<Main>()).unwrap();
        assert!(module.archive().is_none());
        assert!(host.get_module_by_type::<Main>().is_some());
        assert!(console.contains("main up"));

        host.shutdown();
        assert!(host.get_module("Main").is_none());
        assert!(console.contains("Unload Main"));
    }

    #[test]
    fn test_unload_archive_keeps_unit_while_module_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.pkg");
        std::fs::write(
            &path,
            r#"
[[class]]
name = "main.Main"
entry = "main_module"

[class.tags.module]
name = "Main"
"#,
        )
        .unwrap();

        let host = ModuleHost::default_config().unwrap();
        host.linker().define_module::<Main>("main_module");
        assert!(host.load(&path).unwrap().is_loaded());

        let module = host.registry().get("Main").unwrap();
        module.set_state(ModuleState::Disabling);

        assert!(host.unload_archive(&path).unwrap().is_empty());
        assert!(host.registry().contains("Main"));
        assert!(host.unit(&path).is_some());

        module.set_state(ModuleState::Enabled);
        assert_eq!(host.unload_archive(&path).unwrap(), vec!["Main"]);
        assert!(host.unit(&path).is_none());
        assert!(!host.registry().contains("Main"));
    }

    #[test]
    fn test_disable_unknown_module() {
        let host = ModuleHost::default_config().unwrap();
        assert!(matches!(
            host.disable("Ghost"),
            Err(Error::ModuleNotFound(_))
        ));
        assert!(host.unload_archive("ghost.pkg").is_err());
    }
}
