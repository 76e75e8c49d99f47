//! # modhost
//!
//! Extension module host: loads packaged archives of classes at runtime,
//! wires the modules they declare into the host, and tears them down again.
//!
//! This crate provides:
//! - **Archive Loading** - Read TOML archive manifests and bind their classes
//!   through a host-owned symbol table
//! - **Isolated Loading Units** - One namespace per archive, with cross-unit
//!   resolution across published units
//! - **Metadata Scanning** - Route class tags to pluggable handlers
//! - **Dependency Deferral** - Park archives until the module they load after
//!   is active, then load them automatically
//! - **Lifecycle Management** - Enable and disable modules, releasing their
//!   listeners, commands, and schedulers
//! - **Metrics Hooks** - Track loads, deferrals, and failures
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use modhost::{HostConfig, Module, ModuleContext, ModuleHost};
//!
//! #[derive(Default)]
//! struct Core;
//!
//! impl Module for Core {
//!     fn enable(&self, ctx: &ModuleContext) -> modhost::Result<()> {
//!         ctx.output("core ready");
//!         Ok(())
//!     }
//! }
//!
//! let host = ModuleHost::new(HostConfig::default())?;
//! host.linker().define_module::<Core>("core_module");
//!
//! // plugins/core.pkg declares a class with entry = "core_module"
//! // and a [class.tags.module] table naming it "Core".
//! let outcome = host.load("plugins/core.pkg")?;
//! assert!(outcome.is_loaded());
//! ```
//!
//! ## Feature Flags
//!
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod archive;
mod command;
mod console;
mod deferral;
mod error;
mod event;
mod host;
mod lifecycle;
mod loader;
mod module;
mod registry;
mod scanner;
mod schedule;
mod unit;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use archive::{
    ArchiveImage, ArchiveManifest, ArchiveReader, ClassBody, ClassDefinition, ClassEntry, Linker,
    ManifestReader, Tag, TagData, TagKind,
};
pub use command::{Command, CommandFactory, CommandOutcome, CommandRegistry, DispatchReport};
pub use console::{BufferSink, OutputSink, TracingSink};
pub use deferral::DeferralTable;
pub use error::{Error, Result};
pub use event::{Event, Listener, ListenerRegistry};
pub use host::{HostBuilder, HostConfig, ModuleHost};
pub use lifecycle::{LifecycleEvent, LifecycleHooks, LifecycleManager, ModuleState, Teardown};
pub use loader::{ArchiveLoader, ClassFailure, LoadOutcome, LoadReport, LoaderConfig};
pub use module::{Module, ModuleContext, ModuleFactory};
pub use registry::{ModuleHandle, ModuleInfo, ModuleRegistry, RegistryConfig, RegistryStats};
pub use scanner::{classify, tag_handler, HandlerRegistry, ScanContext, ScanFlow, ScanPass, TagHandler};
pub use schedule::{IntervalScheduler, Scheduler, SchedulerRegistry};
pub use unit::{ClassOrigin, ClassRef, LoadingUnit, UnitArena};

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{HostMetrics, MetricsConfig};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
