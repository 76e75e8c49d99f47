//! Archive loading.
//!
//! Loading an archive creates its [`LoadingUnit`], runs the declare pass
//! over every class, enables the declared modules, runs the register pass,
//! and finally publishes the unit. Archives that were waiting on one of the
//! newly enabled modules are then loaded in turn.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::archive::ArchiveReader;
use crate::deferral::DeferralTable;
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleManager;
use crate::registry::ModuleHandle;
use crate::scanner::{ScanContext, ScanFlow, ScanPass};
use crate::unit::{LoadingUnit, UnitArena};

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::HostMetrics;

/// Configuration for the archive loader.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// File extension of archives picked up by discovery.
    pub archive_extension: String,
    /// Whether to validate manifests before binding them.
    pub strict_validation: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            archive_extension: "pkg".to_string(),
            strict_validation: true,
        }
    }
}

impl LoaderConfig {
    /// Create a new loader configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the archive extension.
    pub fn with_archive_extension(mut self, extension: impl Into<String>) -> Self {
        self.archive_extension = extension.into();
        self
    }

    /// Set strict validation.
    pub fn with_strict_validation(mut self, strict: bool) -> Self {
        self.strict_validation = strict;
        self
    }

    /// Whether `path` carries the archive extension.
    pub fn is_archive(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e == self.archive_extension)
            .unwrap_or(false)
    }
}

/// A class that failed without abandoning its archive.
#[derive(Debug)]
pub struct ClassFailure {
    /// Class name.
    pub class: String,
    /// Why it failed.
    pub error: Error,
}

/// Result of an archive that loaded.
#[derive(Debug)]
pub struct LoadReport {
    /// Archive path.
    pub archive: PathBuf,
    /// Modules enabled from this archive, in order.
    pub modules: Vec<String>,
    /// Classes that failed on their own.
    pub failures: Vec<ClassFailure>,
    /// Archives that were waiting on this one, with their outcomes.
    pub chained: Vec<(PathBuf, Result<LoadOutcome>)>,
}

impl LoadReport {
    fn new(archive: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            modules: Vec::new(),
            failures: Vec::new(),
            chained: Vec::new(),
        }
    }
}

/// What happened to an archive passed to [`ArchiveLoader::load`].
#[derive(Debug)]
pub enum LoadOutcome {
    /// The archive loaded.
    Loaded(LoadReport),
    /// The archive waits until `dependency` is active.
    Deferred {
        /// Name of the missing module.
        dependency: String,
    },
    /// A tag handler stopped the archive without deferring it.
    Halted {
        /// Class whose handler stopped the scan.
        class: String,
    },
    /// The archive was still loading on another thread when its dependency
    /// became active. That thread loads it again once it finishes.
    Resubmitted,
}

impl LoadOutcome {
    /// Whether the archive loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// The load report, if the archive loaded.
    pub fn report(&self) -> Option<&LoadReport> {
        match self {
            Self::Loaded(report) => Some(report),
            _ => None,
        }
    }

    /// Every module enabled by this load, chained loads included, in
    /// enable order.
    pub fn enabled_modules(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Self::Loaded(report) = self {
            names.extend(report.modules.iter().cloned());
            for (_, chained) in &report.chained {
                if let Ok(outcome) = chained {
                    names.extend(outcome.enabled_modules());
                }
            }
        }
        names
    }
}

#[derive(Default)]
struct Loading {
    active: HashSet<PathBuf>,
    resubmit: HashSet<PathBuf>,
}

struct InFlight<'a> {
    loading: &'a Mutex<Loading>,
    path: PathBuf,
    left: bool,
}

impl<'a> InFlight<'a> {
    /// Mark `path` as loading. If it already is and `resubmit` is set, the
    /// current owner is asked to load it again when it leaves.
    fn enter(loading: &'a Mutex<Loading>, path: &Path, resubmit: bool) -> Option<Self> {
        let mut state = loading.lock();
        if !state.active.insert(path.to_path_buf()) {
            if resubmit {
                state.resubmit.insert(path.to_path_buf());
            }
            return None;
        }
        Some(Self {
            loading,
            path: path.to_path_buf(),
            left: false,
        })
    }

    /// Stop loading, returning whether the archive was resubmitted meanwhile.
    fn leave(mut self) -> bool {
        self.left = true;
        let mut state = self.loading.lock();
        state.active.remove(&self.path);
        state.resubmit.remove(&self.path)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.left {
            let mut state = self.loading.lock();
            state.active.remove(&self.path);
            state.resubmit.remove(&self.path);
        }
    }
}

/// Loads archives into the host.
pub struct ArchiveLoader {
    config: LoaderConfig,
    reader: Arc<dyn ArchiveReader>,
    units: Arc<UnitArena>,
    deferrals: Arc<DeferralTable>,
    lifecycle: Arc<LifecycleManager>,
    loading: Mutex<Loading>,
    #[cfg(feature = "metrics-prometheus")]
    metrics: Option<Arc<HostMetrics>>,
}

impl ArchiveLoader {
    pub(crate) fn new(
        config: LoaderConfig,
        reader: Arc<dyn ArchiveReader>,
        units: Arc<UnitArena>,
        deferrals: Arc<DeferralTable>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            config,
            reader,
            units,
            deferrals,
            lifecycle,
            loading: Mutex::new(Loading::default()),
            #[cfg(feature = "metrics-prometheus")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics-prometheus")]
    pub(crate) fn set_metrics(&mut self, metrics: Arc<HostMetrics>) {
        self.metrics = Some(metrics);
    }

    /// Get the loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Load the archive at `path`, then every archive that was waiting on
    /// a module it enabled.
    pub fn load(&self, path: &Path) -> Result<LoadOutcome> {
        self.submit(path, false)
    }

    fn submit(&self, path: &Path, resubmit: bool) -> Result<LoadOutcome> {
        let started = Instant::now();
        let result = match InFlight::enter(&self.loading, path, resubmit) {
            Some(flight) => {
                let result = self.load_archive(path);
                if flight.leave() && matches!(result, Ok(LoadOutcome::Deferred { .. })) {
                    tracing::debug!(
                        "{} was resubmitted while deferring, loading it again",
                        path.display()
                    );
                    return self.submit(path, false);
                }
                result
            }
            None if resubmit => Ok(LoadOutcome::Resubmitted),
            None => Err(Error::ArchiveAlreadyLoaded(path.to_path_buf())),
        };

        let console = &self.lifecycle.services().console;
        let hooks = self.lifecycle.hooks();
        match result {
            Ok(LoadOutcome::Loaded(mut report)) => {
                tracing::info!(
                    "Loaded {} ({} modules) in {:?}",
                    path.display(),
                    report.modules.len(),
                    started.elapsed()
                );
                console.output(&format!("Load {}", display_name(path)));
                #[cfg(feature = "metrics-prometheus")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_load(report.modules.len(), started.elapsed().as_secs_f64());
                }

                for module in report.modules.clone() {
                    let chained = self.resume(&module);
                    report.chained.extend(chained);
                }
                Ok(LoadOutcome::Loaded(report))
            }
            Ok(LoadOutcome::Deferred { dependency }) => {
                tracing::warn!("{} waits for module {}", path.display(), dependency);
                hooks.emit_deferred(path, &dependency);
                #[cfg(feature = "metrics-prometheus")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_deferral();
                }
                Ok(LoadOutcome::Deferred { dependency })
            }
            Ok(halted @ LoadOutcome::Halted { .. }) => {
                tracing::warn!("Loading {} was stopped by a tag handler", path.display());
                Ok(halted)
            }
            Ok(LoadOutcome::Resubmitted) => {
                tracing::debug!("{} is still loading and will be retried", path.display());
                Ok(LoadOutcome::Resubmitted)
            }
            Err(e) => {
                tracing::error!("Failed to load {}: {}", path.display(), e);
                console.output(&format!("Failed to load {}: {}", display_name(path), e));
                hooks.emit_error(&path.display().to_string(), &e.to_string());
                #[cfg(feature = "metrics-prometheus")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_error();
                }
                Err(e)
            }
        }
    }

    /// Load every archive that was waiting for `module`.
    pub fn resume(&self, module: &str) -> Vec<(PathBuf, Result<LoadOutcome>)> {
        self.deferrals
            .resolve(module)
            .into_iter()
            .map(|waiting| {
                tracing::debug!("Resubmitting {} after {}", waiting.display(), module);
                let outcome = self.submit(&waiting, true);
                (waiting, outcome)
            })
            .collect()
    }

    fn load_archive(&self, path: &Path) -> Result<LoadOutcome> {
        if self.units.is_published(path) {
            return Err(Error::ArchiveAlreadyLoaded(path.to_path_buf()));
        }
        self.deferrals.cancel(path);

        let image = self.reader.read(path)?;
        let unit = Arc::new(LoadingUnit::new(image));
        tracing::debug!("Created loading unit {} for {}", unit.id(), path.display());

        let services = self.lifecycle.services();
        let mut ctx = ScanContext::new(
            &unit,
            &services.registry,
            &self.deferrals,
            &services.commands,
        );
        let mut report = LoadReport::new(path);

        for class in unit.classes() {
            for required in &class.requires {
                self.units.resolve_for(&unit, &class.name, required)?;
            }

            match services.handlers.scan(ScanPass::Declare, &class, &mut ctx) {
                Ok(ScanFlow::Continue) => {}
                Ok(ScanFlow::Stop) => {
                    return Ok(match ctx.deferred_on() {
                        Some(dependency) => LoadOutcome::Deferred {
                            dependency: dependency.to_string(),
                        },
                        None => LoadOutcome::Halted {
                            class: class.name.clone(),
                        },
                    });
                }
                Err(e) if e.is_per_class() => {
                    tracing::warn!("Skipping class {}: {}", class.name, e);
                    report.failures.push(ClassFailure {
                        class: class.name.clone(),
                        error: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let mut enabled: Vec<ModuleHandle> = Vec::new();
        for module in ctx.take_declared() {
            if let Err(e) = self.lifecycle.enable(&module) {
                self.roll_back(&enabled);
                return Err(e);
            }
            unit.attach_module(module.name());
            enabled.push(module);
        }

        for class in unit.classes() {
            match services.handlers.scan(ScanPass::Register, &class, &mut ctx) {
                Ok(ScanFlow::Continue) => {}
                Ok(ScanFlow::Stop) => break,
                Err(e) if e.is_per_class() => {
                    tracing::warn!("Skipping class {}: {}", class.name, e);
                    report.failures.push(ClassFailure {
                        class: class.name.clone(),
                        error: e,
                    });
                }
                Err(e) => {
                    self.roll_back(&enabled);
                    return Err(e);
                }
            }
        }
        drop(ctx);

        if let Err(e) = self.units.publish(unit) {
            self.roll_back(&enabled);
            return Err(e);
        }

        report.modules = enabled.iter().map(|m| m.name().to_string()).collect();
        Ok(LoadOutcome::Loaded(report))
    }

    fn roll_back(&self, enabled: &[ModuleHandle]) {
        for module in enabled.iter().rev() {
            tracing::debug!("Rolling back module {}", module.name());
            if let Err(e) = self.lifecycle.disable(module) {
                tracing::warn!("Rollback of {} failed: {}", module.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for ArchiveLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveLoader")
            .field("config", &self.config)
            .field("units", &self.units)
            .field("deferrals", &self.deferrals)
            .finish()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
