//! capbus - CLI tool for capbus deployments
//!
//! Commands:
//! - `capbus check <manifest>` - Validate a manifest and install it into a fresh bus
//! - `capbus schemas <manifest>` - Print every schema's binary descriptor
//! - `capbus demo` - Run an echo service and a pub/sub round on a private bus

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use capbus_schema::encode_descriptor;
use capbus_sdk::{
    Bus, BusManifest, FieldType, Layout, Record, RouterConfig, SchemaPair, Version,
};
use clap::{Parser, Subcommand};
use colored::Colorize;

const ECHO_SCHEMA: u32 = 0x0000_EC40;
const TEMPS_SCHEMA: u32 = 0x0000_7E30;

#[derive(Parser)]
#[command(name = "capbus")]
#[command(author = "capbus Team")]
#[command(version)]
#[command(about = "capbus - capability-mediated message bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest and boot a bus from it
    Check {
        /// Manifest path
        manifest: PathBuf,
    },

    /// Print schema descriptors
    Schemas {
        /// Manifest path
        manifest: PathBuf,
    },

    /// Run the demo system
    Demo {
        /// Publish and reply timeout in milliseconds
        #[arg(short, long, default_value_t = 250)]
        timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { manifest } => {
            check_manifest(&manifest)?;
        }

        Commands::Schemas { manifest } => {
            print_schemas(&manifest)?;
        }

        Commands::Demo { timeout_ms } => {
            run_demo(Duration::from_millis(timeout_ms))?;
        }
    }

    Ok(())
}

fn check_manifest(path: &Path) -> anyhow::Result<()> {
    println!("{} Checking {}...", "🔍".green(), path.display().to_string().bold());

    let manifest = BusManifest::load(path)?;
    let bus = Bus::from_manifest(&manifest)?;

    println!("  Schemas:");
    for id in bus.registry().schema_ids() {
        let versions: Vec<String> = bus
            .registry()
            .versions(id)
            .iter()
            .map(|v| format!("v{}", v))
            .collect();
        println!("    {:#010x}  {}", id, versions.join(", "));
    }

    println!("  Services:");
    for service in &manifest.services {
        println!(
            "    {:<24} {:#010x} -> {:#010x}",
            service.name, service.request, service.response
        );
    }

    println!("  Topics:");
    for topic in bus.router().list_topics() {
        println!("    {:<24} {:#010x}", topic.name, topic.schema_id);
    }

    bus.shutdown();
    println!("{} Manifest is valid", "✅".green());
    Ok(())
}

fn print_schemas(path: &Path) -> anyhow::Result<()> {
    let manifest = BusManifest::load(path)?;
    for layout in manifest.layouts()? {
        print_layout(&layout);
    }
    Ok(())
}

fn print_layout(layout: &Layout) {
    println!(
        "{} {:#010x} v{}",
        "schema".bold().green(),
        layout.schema_id(),
        layout.version()
    );
    println!("  descriptor: {}", hex(&encode_descriptor(layout)));
    println!("  fixed section: {} bytes", layout.fixed_len());
    for field in layout.fields() {
        println!("    @{:<5} {:<12} {}", field.offset, field.ty.to_string(), field.name);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn run_demo(timeout: Duration) -> anyhow::Result<()> {
    println!("{}", "capbus demo".bold().green());

    let bus = Bus::with_config(RouterConfig {
        publish_timeout: timeout,
        reply_timeout: timeout,
        ..RouterConfig::default()
    })?;
    let v1 = Version::new(1, 0);
    bus.registry().register_layout(
        Layout::builder(ECHO_SCHEMA, v1)
            .field("text", FieldType::String)
            .build()?,
    )?;
    bus.registry().register_layout(
        Layout::builder(TEMPS_SCHEMA, v1)
            .field("reading", FieldType::U64)
            .build()?,
    )?;

    // Echo service
    let server = bus.spawn_process("echo-server");
    let _echo = server.serve("echo", SchemaPair::symmetric(ECHO_SCHEMA), |request| {
        request.record().clone()
    })?;
    server.run()?;

    let client = bus.spawn_process("client");
    let reply = client.call("echo", &Record::new().with("text", "hello, bus"))?;
    println!(
        "{} echo replied {:?}",
        "→".cyan(),
        reply.str("text").unwrap_or_default()
    );

    // Pub/sub round
    let sensor = bus.spawn_process("sensor");
    sensor.declare_topic("temps", TEMPS_SCHEMA)?;

    let logger = bus.spawn_process("logger");
    let (tx, rx) = mpsc::channel();
    let _temps = logger.subscribe("temps", move |event| {
        let _ = tx.send(event);
    })?;
    logger.run()?;

    for reading in [19u64, 21, 23] {
        let report = sensor.publish("temps", &Record::new().with("reading", reading))?;
        println!(
            "{} published #{} to {} subscriber(s), {} failed",
            "→".cyan(),
            report.sequence,
            report.delivered.len(),
            report.failures.len()
        );
    }
    for _ in 0..3 {
        let event = rx.recv_timeout(timeout * 4)?;
        println!(
            "{} logger got #{} reading={}",
            "←".cyan(),
            event.sequence,
            event.record.u64("reading").unwrap_or_default()
        );
    }

    println!("\nServices:");
    for info in bus.router().list_services() {
        println!("  {:<16} owner {}", info.name, info.owner);
    }

    server.exit()?;
    logger.exit()?;
    match client.call("echo", &Record::new().with("text", "still there?")) {
        Ok(_) => anyhow::bail!("echo answered after its process exited"),
        Err(e) => println!("{} after exit: {} ({})", "✗".yellow(), e, e.kind()),
    }

    bus.shutdown();
    println!("{} Demo complete", "✅".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_and_padded() {
        assert_eq!(hex(&[0x00, 0x0a, 0xff]), "000aff");
    }
}
