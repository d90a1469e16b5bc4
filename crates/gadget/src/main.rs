//! ffs-gadget
//!
//! Tooling around the function engine: validate descriptor and string
//! uploads, write a sample upload pair, and run a function end to end on the
//! software loopback controller.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::setup_logging;
use gadget::config::GadgetConfig;
use gadget::demo::{run_simulation, sample_descriptors, sample_strings};
use protocol::{DescriptorTable, StringTable, parse_descriptors, parse_strings};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ffs-gadget")]
#[command(author, version, about = "FunctionFS-style USB function tooling")]
#[command(long_about = "
Validate and exercise FunctionFS-style USB function uploads.

A function is described by a descriptor upload (per-speed interface and
endpoint records, optional Microsoft OS descriptors) and a string upload.
This tool checks uploads the way the engine does, and can run a function
against a software controller that plays the USB host.

EXAMPLES:
    # Check an upload pair
    ffs-gadget inspect descs.bin --strings strs.bin

    # Same, as JSON
    ffs-gadget inspect descs.bin --strings strs.bin --json

    # Check the uploads of every configured instance
    ffs-gadget inspect

    # Write the sample loopback function
    ffs-gadget example --out-dir ./sample

    # Bind the sample on the loopback controller and echo a transfer
    ffs-gadget simulate --payload 'hello'

CONFIGURATION:
    The tool looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ffs-gadget/gadget.toml
    3. /etc/ffs-gadget/gadget.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a descriptor upload and optional string upload
    Inspect {
        /// Descriptor upload; configured instances when omitted
        descriptors: Option<PathBuf>,

        /// String upload to validate against the descriptors
        #[arg(long, value_name = "PATH")]
        strings: Option<PathBuf>,

        /// Print the parsed tables as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the sample loopback function uploads
    Example {
        #[arg(long, value_name = "DIR", default_value = ".")]
        out_dir: PathBuf,
    },
    /// Run the sample function on the loopback controller
    Simulate {
        /// Bytes the host sends through the bulk echo
        #[arg(long, default_value = "ffs-gadget")]
        payload: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save the default configuration to the default location and exit
    SaveConfig,
}

#[derive(Serialize)]
struct InspectReport<'a> {
    descriptors: &'a Path,
    table: &'a DescriptorTable,
    strings: Option<&'a [StringTable]>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig = args.command {
        let config = GadgetConfig::default();
        let path = GadgetConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        GadgetConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        GadgetConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.runtime.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ffs-gadget v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);

    match args.command {
        Command::Inspect {
            descriptors: Some(descriptors),
            strings,
            json,
        } => inspect(&descriptors, strings.as_deref(), json),
        Command::Inspect {
            descriptors: None,
            json,
            ..
        } => inspect_instances(&config, json),
        Command::Example { out_dir } => write_example(&out_dir),
        Command::Simulate { payload, json } => simulate(config, payload, json).await,
        Command::SaveConfig => Ok(()),
    }
}

fn read_upload(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read upload: {}", path.display()))
}

fn inspect(descriptors: &Path, strings: Option<&Path>, json: bool) -> Result<()> {
    let table = parse_descriptors(&read_upload(descriptors)?)
        .with_context(|| format!("Invalid descriptor upload: {}", descriptors.display()))?;
    let tables = match strings {
        Some(path) => Some(
            parse_strings(&read_upload(path)?, table.strings_count)
                .with_context(|| format!("Invalid string upload: {}", path.display()))?,
        ),
        None => None,
    };

    if json {
        let report = InspectReport {
            descriptors,
            table: &table,
            strings: tables.as_deref(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode report")?
        );
        return Ok(());
    }

    println!("{}: {:?} upload", descriptors.display(), table.format);
    let speeds: Vec<&str> = table.present_speeds().map(|s| s.name()).collect();
    println!("  speeds:      {}", speeds.join(", "));
    println!("  interfaces:  {}", table.interfaces_count);
    println!("  endpoints:   {}", table.eps_count);
    for slot in 1..=table.eps_count {
        if let Some(address) = table.eps_addrmap.address(slot) {
            println!("    ep{}: 0x{:02x}", slot, address);
        }
    }
    println!("  strings:     {}", table.strings_count);
    println!("  os groups:   {}", table.os_groups.len());
    if table.ext_props.count > 0 {
        println!(
            "  properties:  {} ({} name bytes, {} data bytes)",
            table.ext_props.count, table.ext_props.name_bytes, table.ext_props.data_bytes
        );
    }
    if table.virtual_addressing() {
        println!("  virtual endpoint addressing");
    }
    if let Some(handle) = table.notify_handle {
        println!("  notify handle: {}", handle);
    }
    if let Some(tables) = &tables {
        for lang in tables {
            println!("  language 0x{:04x}:", lang.language);
            for (n, string) in lang.strings.iter().enumerate() {
                println!("    {}: {:?}", n + 1, string.text);
            }
        }
    }
    Ok(())
}

fn inspect_instances(config: &GadgetConfig, json: bool) -> Result<()> {
    if config.instances.is_empty() {
        return Err(anyhow!("No upload given and no instances configured"));
    }
    for instance in &config.instances {
        let Some(descriptors) = &instance.descriptors else {
            warn!("Instance {} has no descriptor upload", instance.name);
            continue;
        };
        if !json {
            println!("[{}]", instance.name);
        }
        inspect(descriptors, instance.strings.as_deref(), json)?;
    }
    Ok(())
}

fn write_example(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create directory: {}", out_dir.display()))?;
    for (name, bytes) in [
        ("descriptors.bin", sample_descriptors()),
        ("strings.bin", sample_strings()),
    ] {
        let path = out_dir.join(name);
        fs::write(&path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

async fn simulate(config: GadgetConfig, payload: String, json: bool) -> Result<()> {
    let options = config.loopback_options();
    info!(
        "Simulating at {:?} (max {:?})",
        options.speed, options.max_speed
    );
    let capacity = config.runtime.work_queue_capacity;
    let tick = config.wait_tick();

    let report = tokio::task::spawn_blocking(move || {
        run_simulation(options, capacity, tick, payload.as_bytes())
    })
    .await
    .context("Simulation task failed")?
    .context("Simulation failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to encode report")?
        );
        return Ok(());
    }

    println!("Link speed:      {:?}", report.speed);
    println!("Endpoint files:  {}", report.endpoint_files.join(", "));
    if let Some(id) = report.interface_id {
        println!("Interface id:    {}", id);
    }
    let addresses: Vec<String> = report
        .endpoint_addresses
        .iter()
        .map(|a| format!("0x{:02x}", a))
        .collect();
    println!("Endpoints:       {}", addresses.join(", "));
    println!("Events:          {}", report.events.join(", "));
    println!(
        "Control reply:   {:?}",
        String::from_utf8_lossy(&report.control_reply)
    );
    println!("Bulk echo:       {} bytes", report.echoed);
    Ok(())
}
