//! Integration tests for modhost.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use modhost::{
    tag_handler, BufferSink, ClassBody, ClassOrigin, Command, CommandOutcome, Error, Event,
    HostConfig, IntervalScheduler, LifecycleEvent, Listener, LoadOutcome, Module, ModuleContext,
    ModuleFactory, ModuleHost, ModuleState, OutputSink, ScanFlow, ScanPass, Scheduler, TagKind,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: &'static str,
    journal: Journal,
}

impl Module for Recorder {
    fn enable(&self, _ctx: &ModuleContext) -> modhost::Result<()> {
        self.journal.lock().push(format!("enable {}", self.name));
        Ok(())
    }

    fn disable(&self, _ctx: &ModuleContext) -> modhost::Result<()> {
        self.journal.lock().push(format!("disable {}", self.name));
        Ok(())
    }
}

fn recorder(name: &'static str, journal: &Journal) -> ClassBody {
    let journal = journal.clone();
    ClassBody::Module(ModuleFactory::with(move || Recorder {
        name,
        journal: journal.clone(),
    }))
}

struct Fixture {
    dir: TempDir,
    console: Arc<BufferSink>,
    host: ModuleHost,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let console = Arc::new(BufferSink::new());
        let config = HostConfig::new()
            .with_plugin_dir(dir.path())
            .with_core_class("host.Api");
        let host = ModuleHost::builder(config)
            .console(console.clone())
            .build()
            .unwrap();
        Self { dir, console, host }
    }

    fn archive(&self, file: &str, manifest: &str) -> PathBuf {
        let path = self.dir.path().join(file);
        std::fs::write(&path, manifest).unwrap();
        path
    }
}

fn module_archive(class: &str, entry: &str, module: &str) -> String {
    format!(
        r#"
[[class]]
name = "{class}"
entry = "{entry}"

[class.tags.module]
name = "{module}"
"#
    )
}

fn dependent_archive(class: &str, entry: &str, module: &str, after: &str) -> String {
    format!(
        r#"
[[class]]
name = "{class}"
entry = "{entry}"

[class.tags.module]
name = "{module}"
load_after = "{after}"
"#
    )
}

#[test]
fn test_deferred_archive_enables_after_dependency() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("core_main", recorder("Core", &journal));
    fx.host.linker().define("ext_main", recorder("Ext", &journal));

    let ext = fx.archive("ext.pkg", &dependent_archive("ext.Main", "ext_main", "Ext", "Core"));
    let core = fx.archive("core.pkg", &module_archive("core.Main", "core_main", "Core"));

    let outcome = fx.host.load(&ext).unwrap();
    assert!(matches!(outcome, LoadOutcome::Deferred { ref dependency } if dependency == "Core"));
    assert!(fx.host.get_module("Ext").is_none());
    assert_eq!(fx.host.pending_deferrals(), vec![("Core".to_string(), vec![ext.clone()])]);

    let outcome = fx.host.load(&core).unwrap();
    assert_eq!(outcome.enabled_modules(), vec!["Core", "Ext"]);
    assert_eq!(*journal.lock(), vec!["enable Core", "enable Ext"]);
    assert!(fx.host.pending_deferrals().is_empty());
    assert_eq!(fx.console.lines(), vec!["Load core.pkg", "Load ext.pkg"]);
}

#[test]
fn test_discover_loads_in_name_order_and_chains_deferrals() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("core_main", recorder("Core", &journal));
    fx.host.linker().define("ext_main", recorder("Ext", &journal));

    fx.archive("a-ext.pkg", &dependent_archive("ext.Main", "ext_main", "Ext", "Core"));
    fx.archive("b-core.pkg", &module_archive("core.Main", "core_main", "Core"));
    fx.archive("notes.txt", "not an archive");

    let results = fx.host.discover().unwrap();
    let names: Vec<String> = results
        .iter()
        .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["a-ext.pkg", "b-core.pkg"]);
    assert!(!results[0].1.as_ref().unwrap().is_loaded());
    assert!(results[1].1.as_ref().unwrap().is_loaded());

    assert!(fx.host.has_module("Core"));
    assert!(fx.host.has_module("Ext"));
    assert_eq!(*journal.lock(), vec!["enable Core", "enable Ext"]);
}

#[test]
fn test_duplicate_module_name_keeps_first() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("x_one", recorder("X1", &journal));
    fx.host.linker().define("x_two", recorder("X2", &journal));

    let first = fx.archive("one.pkg", &module_archive("one.X", "x_one", "X"));
    let second = fx.archive("two.pkg", &module_archive("two.X", "x_two", "X"));

    fx.host.load(&first).unwrap();
    let original = fx.host.get_module("X").unwrap();

    let err = fx.host.load(&second).unwrap_err();
    assert!(matches!(err, Error::DuplicateModule(ref name) if name == "X"));
    assert!(fx.host.get_module("X").unwrap().same_instance(&original));
    assert!(fx.host.unit(&second).is_none());
    assert_eq!(*journal.lock(), vec!["enable X1"]);
}

struct Counter(Arc<AtomicUsize>);

impl Listener for Counter {
    fn on_event(&self, _event: &Event) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Ping;

impl Command for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn execute(&self, _args: &[String], out: &dyn OutputSink) -> modhost::Result<CommandOutcome> {
        out.output("pong");
        Ok(CommandOutcome::Allow)
    }
}

#[derive(Default)]
struct Busy {
    events: Arc<AtomicUsize>,
    ticks: Arc<AtomicUsize>,
    scheduler: Mutex<Option<Arc<IntervalScheduler>>>,
}

impl Module for Busy {
    fn enable(&self, ctx: &ModuleContext) -> modhost::Result<()> {
        ctx.register_listener(Arc::new(Counter(self.events.clone())));
        ctx.register_command(Arc::new(Ping))?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::module(e.to_string()))?;
        let ticks = self.ticks.clone();
        let scheduler = IntervalScheduler::spawn(&handle, "tick", Duration::from_millis(5), move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        });
        ctx.attach_scheduler(scheduler.clone());
        *self.scheduler.lock() = Some(scheduler);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_releases_registrations() {
    let fx = Fixture::new();
    fx.host.linker().define_module::<Busy>("busy_main");
    let path = fx.archive("busy.pkg", &module_archive("busy.Main", "busy_main", "Busy"));

    fx.host.load(&path).unwrap();
    let module = fx.host.get_module_by_type::<Busy>().unwrap();
    let busy = module.downcast::<Busy>().unwrap();

    assert_eq!(fx.host.dispatch_event(&Event::new("tick")), 1);
    let report = fx.host.dispatch_command("ping", vec![]).await;
    assert_eq!(report.outcome(), CommandOutcome::Allow);
    assert!(fx.console.contains("pong"));

    let teardown = fx.host.disable("Busy").unwrap();
    assert_eq!((teardown.listeners, teardown.commands, teardown.schedulers), (1, 1, 1));
    assert!(teardown.unit_released);
    assert_eq!(module.state(), ModuleState::Unloaded);

    assert_eq!(fx.host.dispatch_event(&Event::new("tick")), 0);
    assert_eq!(busy.events.load(Ordering::SeqCst), 1);
    assert!(fx.host.dispatch_command("ping", vec![]).await.is_empty());

    let scheduler = busy.scheduler.lock().clone().unwrap();
    assert!(scheduler.is_closed());
    let ticks = busy.ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(busy.ticks.load(Ordering::SeqCst), ticks);

    assert!(fx.host.unit(&path).is_none());
    assert!(fx.host.resolve_class("busy.Main").is_err());
    assert!(fx.console.contains("Unload Busy"));
}

#[test]
fn test_reload_creates_fresh_instance() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("core_main", recorder("Core", &journal));
    let path = fx.archive("core.pkg", &module_archive("core.Main", "core_main", "Core"));

    fx.host.load(&path).unwrap();
    let first = fx.host.get_module("Core").unwrap();

    assert_eq!(fx.host.unload_archive(&path).unwrap(), vec!["Core"]);
    assert!(fx.host.get_module("Core").is_none());

    fx.host.load(&path).unwrap();
    let second = fx.host.get_module("Core").unwrap();

    assert!(!second.same_instance(&first));
    assert_ne!(second.id(), first.id());
    assert_eq!(
        *journal.lock(),
        vec!["enable Core", "disable Core", "enable Core"]
    );
}

#[test]
fn test_cross_archive_resolution() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("a_main", recorder("A", &journal));
    fx.host.linker().define("b_main", recorder("B", &journal));

    let a = fx.archive(
        "a.pkg",
        r#"
[[class]]
name = "a.Main"
entry = "a_main"
requires = ["a.Shared", "host.Api"]

[class.tags.module]
name = "A"

[[class]]
name = "a.Shared"
"#,
    );
    let b = fx.archive(
        "b.pkg",
        r#"
[[class]]
name = "b.Main"
entry = "b_main"
requires = ["a.Shared"]

[class.tags.module]
name = "B"

[[class]]
name = "b.Shared"
"#,
    );
    let needs_b = fx.archive(
        "c.pkg",
        r#"
[[class]]
name = "c.User"
requires = ["b.Shared"]
"#,
    );

    let err = fx.host.load(&needs_b).unwrap_err();
    assert!(matches!(err, Error::IsolationViolation { ref symbol, .. } if symbol == "b.Shared"));

    fx.host.load(&a).unwrap();
    fx.host.load(&b).unwrap();
    fx.host.load(&needs_b).unwrap();

    let found = fx.host.resolve_class("a.Shared").unwrap();
    assert_eq!(found.origin, ClassOrigin::Unit(a.clone()));
    let found = fx.host.resolve_class("b.Shared").unwrap();
    assert_eq!(found.origin, ClassOrigin::Unit(b.clone()));
    assert_eq!(fx.host.resolve_class("host.Api").unwrap().origin, ClassOrigin::Core);
}

#[test]
fn test_unknown_entry_symbol() {
    let fx = Fixture::new();
    let path = fx.archive("bad.pkg", &module_archive("bad.Main", "not_linked", "Bad"));

    let err = fx.host.load(&path).unwrap_err();
    assert!(matches!(err, Error::IsolationViolation { ref symbol, .. } if symbol == "not_linked"));
    assert!(fx.host.registry().is_empty());
}

#[test]
fn test_concurrent_loads_of_same_module_name() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("same_main", recorder("Same", &journal));

    let paths: Vec<PathBuf> = (0..16)
        .map(|i| {
            fx.archive(
                &format!("same-{:02}.pkg", i),
                &module_archive(&format!("same{}.Main", i), "same_main", "Same"),
            )
        })
        .collect();

    let host = &fx.host;
    let results: Vec<modhost::Result<LoadOutcome>> = std::thread::scope(|scope| {
        let handles: Vec<_> = paths
            .iter()
            .map(|path| scope.spawn(move || host.load(path)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let loaded = results.iter().filter(|r| matches!(r, Ok(o) if o.is_loaded())).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(Error::DuplicateModule(_))))
        .count();

    assert_eq!(loaded, 1);
    assert_eq!(duplicates, 15);
    assert_eq!(fx.host.module_count(), 1);
    assert_eq!(journal.lock().len(), 1);
}

#[derive(Default)]
struct Stubborn {
    events: Arc<AtomicUsize>,
}

impl Module for Stubborn {
    fn enable(&self, ctx: &ModuleContext) -> modhost::Result<()> {
        ctx.register_listener(Arc::new(Counter(self.events.clone())));
        Ok(())
    }

    fn disable(&self, _ctx: &ModuleContext) -> modhost::Result<()> {
        panic!("cannot save");
    }
}

#[test]
fn test_teardown_failure_still_releases() {
    let fx = Fixture::new();
    fx.host.linker().define_module::<Stubborn>("stubborn_main");
    let path = fx.archive(
        "stubborn.pkg",
        &module_archive("stubborn.Main", "stubborn_main", "Stubborn"),
    );

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    fx.host.on_event(move |event| {
        if let LifecycleEvent::Error { message, .. } = event {
            sink.lock().push(message.clone());
        }
    });

    fx.host.load(&path).unwrap();
    let teardown = fx.host.disable("Stubborn").unwrap();

    assert_eq!(teardown.hook_error.as_deref(), Some("cannot save"));
    assert!(teardown.unit_released);
    assert_eq!(fx.host.listeners().count("Stubborn"), 0);
    assert!(fx.host.get_module("Stubborn").is_none());
    assert_eq!(errors.lock().len(), 1);
}

#[test]
fn test_custom_tag_handler() {
    let fx = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    fx.host
        .register_tag_handler(
            TagKind::new("route"),
            ScanPass::Register,
            tag_handler(move |class, data, ctx| {
                let owner = data.get("module").unwrap_or_default();
                if ctx.get_module(owner).is_none() {
                    return Err(Error::InvalidTarget {
                        class: class.name.clone(),
                        module: owner.to_string(),
                    });
                }
                sink.lock()
                    .push(format!("{} -> {}", data.get("path").unwrap_or("/"), owner));
                Ok(ScanFlow::Continue)
            }),
        )
        .unwrap();
    assert!(matches!(
        fx.host.register_tag_handler(
            TagKind::MODULE,
            ScanPass::Declare,
            tag_handler(|_, _, _| Ok(ScanFlow::Continue)),
        ),
        Err(Error::HandlerAlreadyRegistered(_))
    ));

    let journal = Journal::default();
    fx.host.linker().define("web_main", recorder("Web", &journal));
    let path = fx.archive(
        "web.pkg",
        r#"
[[class]]
name = "web.Main"
entry = "web_main"

[class.tags.module]
name = "Web"

[[class]]
name = "web.Index"

[class.tags.route]
module = "Web"
path = "/index"

[[class]]
name = "web.Stray"

[class.tags.route]
module = "Nobody"
"#,
    );

    let outcome = fx.host.load(&path).unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(*seen.lock(), vec!["/index -> Web"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].class, "web.Stray");
}

#[test]
fn test_install_unblocks_waiting_archive() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("ext_main", recorder("Ext", &journal));
    let ext = fx.archive("ext.pkg", &dependent_archive("ext.Main", "ext_main", "Ext", "Main"));

    assert!(!fx.host.load(&ext).unwrap().is_loaded());

    let journal_for_main = journal.clone();
    fx.host
        .install(
            "Main",
            ModuleFactory::with(move || Recorder {
                name: "Main",
                journal: journal_for_main.clone(),
            }),
        )
        .unwrap();

    assert!(fx.host.has_module("Ext"));
    assert_eq!(*journal.lock(), vec!["enable Main", "enable Ext"]);

    fx.host.shutdown();
    assert_eq!(
        *journal.lock(),
        vec!["enable Main", "enable Ext", "disable Ext", "disable Main"]
    );
    assert_eq!(fx.host.module_count(), 0);
}

#[tokio::test]
async fn test_load_async() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("core_main", recorder("Core", &journal));
    let path = fx.archive("core.pkg", &module_archive("core.Main", "core_main", "Core"));

    let outcome = fx.host.load_async(path.clone()).await.unwrap();
    assert!(outcome.is_loaded());
    assert!(fx.host.has_module("Core"));

    let err = fx.host.load_async(path).await.unwrap_err();
    assert!(matches!(err, Error::ArchiveAlreadyLoaded(_)));
}

#[test]
fn test_unload_waiting_archive() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("ext_main", recorder("Ext", &journal));
    let ext = fx.archive("ext.pkg", &dependent_archive("ext.Main", "ext_main", "Ext", "Core"));

    fx.host.load(&ext).unwrap();
    assert!(fx.host.unload_archive(&ext).unwrap().is_empty());
    assert!(fx.host.pending_deferrals().is_empty());
    assert!(fx.host.unload_archive(Path::new("missing.pkg")).is_err());
}

/// Parks the first thread that logs a line containing `marker` until the
/// test releases it.
struct Gate {
    marker: &'static str,
    armed: AtomicBool,
    reached: Barrier,
    release: Barrier,
}

impl Gate {
    fn new(marker: &'static str) -> Arc<Self> {
        Arc::new(Self {
            marker,
            armed: AtomicBool::new(true),
            reached: Barrier::new(2),
            release: Barrier::new(2),
        })
    }

    fn run<T>(self: &Arc<Self>, f: impl FnOnce() -> T) -> T {
        let subscriber = Registry::default().with(GateLayer(self.clone()));
        tracing::subscriber::with_default(subscriber, f)
    }
}

struct GateLayer(Arc<Gate>);

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for GateLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        if message.0.contains(self.0.marker) && self.0.armed.swap(false, Ordering::SeqCst) {
            self.0.reached.wait();
            self.0.release.wait();
        }
    }
}

#[test]
fn test_dependency_enabled_while_dependent_is_deferring() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("core_main", recorder("Core", &journal));
    fx.host.linker().define("ext_main", recorder("Ext", &journal));
    let ext = fx.archive("ext.pkg", &dependent_archive("ext.Main", "ext_main", "Ext", "Core"));
    let core = fx.archive("core.pkg", &module_archive("core.Main", "core_main", "Core"));

    let gate = Gate::new("Deferred ");
    let ext_outcome = std::thread::scope(|scope| {
        let loading = scope.spawn(|| gate.run(|| fx.host.load(&ext)));

        // ext.pkg has recorded its deferral and is still loading.
        gate.reached.wait();
        let outcome = fx.host.load(&core).unwrap();
        let chained = &outcome.report().unwrap().chained;
        assert_eq!(chained.len(), 1);
        assert_eq!(chained[0].0, ext);
        assert!(matches!(chained[0].1, Ok(LoadOutcome::Resubmitted)));
        assert!(!fx.host.has_module("Ext"));

        gate.release.wait();
        loading.join().unwrap()
    });

    assert!(ext_outcome.unwrap().is_loaded());
    assert!(fx.host.has_module("Ext"));
    assert!(fx.host.pending_deferrals().is_empty());
    assert_eq!(*journal.lock(), vec!["enable Core", "enable Ext"]);
}

#[test]
fn test_dependency_enabled_before_deferral_is_recorded() {
    let fx = Fixture::new();
    let journal = Journal::default();
    fx.host.linker().define("core_main", recorder("Core", &journal));
    fx.host.linker().define("ext_main", recorder("Ext", &journal));
    let ext = fx.archive("ext.pkg", &dependent_archive("ext.Main", "ext_main", "Ext", "Core"));
    let core = fx.archive("core.pkg", &module_archive("core.Main", "core_main", "Core"));

    let gate = Gate::new("which is not active");
    let ext_outcome = std::thread::scope(|scope| {
        let loading = scope.spawn(|| gate.run(|| fx.host.load(&ext)));

        // ext.pkg saw Core inactive but has not deferred yet.
        gate.reached.wait();
        let outcome = fx.host.load(&core).unwrap();
        assert!(outcome.report().unwrap().chained.is_empty());

        gate.release.wait();
        loading.join().unwrap()
    });

    assert!(ext_outcome.unwrap().is_loaded());
    assert!(fx.host.has_module("Ext"));
    assert!(fx.host.pending_deferrals().is_empty());
    assert_eq!(*journal.lock(), vec!["enable Core", "enable Ext"]);
}
