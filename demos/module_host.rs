//! Example demonstrating archive discovery, deferral, and teardown.

use modhost::{
    ArchiveManifest, ClassEntry, Command, CommandFactory, CommandOutcome, HostConfig, Module,
    ModuleContext, ModuleHost, OutputSink, TagData,
};

#[derive(Default)]
struct Core;

impl Module for Core {
    fn enable(&self, ctx: &ModuleContext) -> modhost::Result<()> {
        ctx.output("core services ready");
        Ok(())
    }
}

#[derive(Default)]
struct Greeter;

impl Module for Greeter {
    fn enable(&self, ctx: &ModuleContext) -> modhost::Result<()> {
        let core = ctx.get_module("Core").map(|m| m.id());
        ctx.output(&format!("greeter sees core instance {:?}", core));
        Ok(())
    }

    fn disable(&self, ctx: &ModuleContext) -> modhost::Result<()> {
        ctx.output("greeter saying goodbye");
        Ok(())
    }
}

#[derive(Default)]
struct Hello;

impl Command for Hello {
    fn name(&self) -> &str {
        "hello"
    }

    fn execute(&self, args: &[String], out: &dyn OutputSink) -> modhost::Result<CommandOutcome> {
        out.output(&format!("hello, {}", args.join(" ")));
        Ok(CommandOutcome::Allow)
    }
}

fn class(name: &str, entry: Option<&str>, kind: &str, tag: TagData) -> ClassEntry {
    ClassEntry {
        name: name.to_string(),
        entry: entry.map(str::to_string),
        is_abstract: false,
        requires: Vec::new(),
        tags: [(kind.to_string(), tag)].into_iter().collect(),
    }
}

#[tokio::main]
async fn main() -> modhost::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Module Host Example ===\n");

    let dir = tempfile::tempdir()?;

    // Written so that the dependent archive sorts first and has to wait.
    let greeter = ArchiveManifest {
        name: Some("greeter".into()),
        version: Some("1.0.0".into()),
        classes: vec![
            class(
                "greeter.Main",
                Some("greeter_main"),
                "module",
                TagData::new().with("name", "Greeter").with("load_after", "Core"),
            ),
            class(
                "greeter.Hello",
                Some("hello_cmd"),
                "command",
                TagData::new().with("module", "Greeter"),
            ),
        ],
    };
    let core = ArchiveManifest {
        name: Some("core".into()),
        version: Some("1.0.0".into()),
        classes: vec![class(
            "core.Main",
            Some("core_main"),
            "module",
            TagData::new().with("name", "Core"),
        )],
    };
    std::fs::write(dir.path().join("a-greeter.pkg"), greeter.to_toml()?)?;
    std::fs::write(dir.path().join("b-core.pkg"), core.to_toml()?)?;

    let host = ModuleHost::new(HostConfig::new().with_plugin_dir(dir.path()))?;
    host.linker().define_module::<Core>("core_main");
    host.linker().define_module::<Greeter>("greeter_main");
    host.linker()
        .define("hello_cmd", modhost::ClassBody::Command(CommandFactory::of::<Hello>()));

    host.on_event(|event| println!("  [{}] {}", event.event_name(), event.subject()));

    println!("=== Discovery ===");
    for (path, outcome) in host.discover()? {
        match outcome {
            Ok(outcome) => println!("{}: loaded = {}", path.display(), outcome.is_loaded()),
            Err(e) => println!("{}: failed: {}", path.display(), e),
        }
    }

    println!("\n=== Modules ===");
    for info in host.list_modules() {
        println!("  {} ({}) from {:?}", info.name, info.state, info.archive);
    }

    println!("\n=== Commands ===");
    let report = host
        .dispatch_command("hello", vec!["world".to_string()])
        .await;
    println!("hello -> {:?}", report.outcome());

    println!("\n=== Shutdown ===");
    let teardown = host.disable("Greeter")?;
    println!("Greeter released {} commands", teardown.commands);
    host.shutdown();

    println!("Remaining modules: {}", host.stats().total);

    println!("\n=== Example Complete ===");

    Ok(())
}
