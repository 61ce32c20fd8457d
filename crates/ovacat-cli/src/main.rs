//! ovacat CLI - generate OVF descriptors for Hyper-V disks and inspect appliances.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ovacat_core::hyperv::{attach_disks, write_ovf, VmDescriptor};
use ovacat_core::inventory::{allocation_unit_bytes, guess_source, project_vms};
use ovacat_core::ovf::ResourceKind;
use ovacat_core::vhdx::virtual_size;
use ovacat_core::{read_envelope, IdMaps, ScannedAppliance};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Tools for the OVA appliance catalog.
#[derive(Parser)]
#[command(name = "ovacat")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an OVF descriptor for a Hyper-V VM and its VHDX disks.
    Hyperv {
        /// VM descriptor (JSON).
        vm_file: PathBuf,

        /// VHDX disks, in the order of the descriptor's disks.
        #[arg(required = true)]
        disks: Vec<PathBuf>,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the virtual size recorded in a VHDX.
    VhdxSize {
        /// Path to the VHDX file.
        disk: PathBuf,

        /// Print the size in bytes only.
        #[arg(short, long)]
        bytes: bool,
    },

    /// Display the virtual systems, disks and networks of an appliance.
    Inspect {
        /// Path to an .ova or .ovf file.
        appliance: PathBuf,

        /// Print inventory records as JSON instead.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Library warnings go to stderr; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Hyperv {
            vm_file,
            disks,
            quiet,
        } => run_hyperv(&vm_file, &disks, quiet)?,
        Commands::VhdxSize { disk, bytes } => show_vhdx_size(&disk, bytes)?,
        Commands::Inspect { appliance, json } => inspect(&appliance, json)?,
    }

    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn run_hyperv(vm_file: &Path, disk_paths: &[PathBuf], quiet: bool) -> Result<()> {
    let text = std::fs::read_to_string(vm_file)
        .with_context(|| format!("Failed to read VM descriptor {}", vm_file.display()))?;
    let vm: VmDescriptor = serde_json::from_str(&text)
        .with_context(|| format!("Invalid VM descriptor {}", vm_file.display()))?;
    let disks = attach_disks(&vm, disk_paths)?;

    if !quiet {
        println!("Hyper-V OVF");
        println!("-----------");
        println!("Name:      {}", vm.name);
        println!("Guest OS:  {}", vm.guest_os.caption);
        println!("CPUs:      {}", vm.cpu_count);
        println!("Memory:    {} MB", vm.memory_mb);
        println!("Disks:     {}", disks.len());
        println!("NICs:      {}", vm.nics.len());
        println!();
    }

    let pb = if quiet {
        None
    } else {
        Some(spinner("Reading disk metadata...")?)
    };

    let fallback_dir = vm_file.parent().unwrap_or_else(|| Path::new("."));
    let result = write_ovf(&vm, &disks, fallback_dir);

    if let Some(pb) = pb {
        match &result {
            Ok(_) => pb.finish_with_message("Complete!"),
            Err(_) => pb.abandon_with_message("Failed"),
        }
    }

    let ovf_path = result?;
    println!("{}", ovf_path.display());
    Ok(())
}

fn show_vhdx_size(disk: &Path, bytes_only: bool) -> Result<()> {
    let size = virtual_size(disk)?;
    if bytes_only {
        println!("{}", size);
    } else {
        println!("{} ({} bytes)", format_bytes(u128::from(size)), size);
    }
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let envelope = read_envelope(path, &CancellationToken::new())?;
    let appliance = ScannedAppliance {
        path: path.to_path_buf(),
        envelope,
    };

    if json {
        let vms = project_vms(std::slice::from_ref(&appliance), &IdMaps::new())?;
        println!("{}", serde_json::to_string_pretty(&vms)?);
        return Ok(());
    }

    let envelope = &appliance.envelope;
    println!("Appliance Information");
    println!("=====================");
    println!();
    println!("File:      {}", path.display());
    println!("Source:    {}", guess_source(envelope));
    println!();

    for system in &envelope.virtual_systems {
        let items = &system.hardware.items;
        let count = |kind: ResourceKind| items.iter().filter(|i| i.kind() == kind).count();
        println!("Virtual system: {} ({})", system.name, system.id);
        if !system.operating_system.os_type.is_empty() {
            println!("  Guest OS:  {}", system.operating_system.os_type);
        }
        if let Some(cpu) = items.iter().find(|i| i.kind() == ResourceKind::Cpu) {
            println!("  CPUs:      {}", cpu.virtual_quantity.unwrap_or_default());
        }
        println!("  Disks:     {}", count(ResourceKind::HardDisk));
        println!("  NICs:      {}", count(ResourceKind::Ethernet));
        println!();
    }

    let disks = &envelope.disk_section.disks;
    if disks.is_empty() {
        println!("Disks:     None");
    } else {
        println!("Disks:");
        for (i, disk) in disks.iter().enumerate() {
            let file = envelope
                .references
                .iter()
                .find(|f| f.id == disk.file_ref)
                .map(|f| f.href.as_str())
                .unwrap_or("-");
            let bytes = u128::from(disk.capacity)
                .saturating_mul(allocation_unit_bytes(&disk.capacity_allocation_units));
            println!(
                "  {}. {} ({}) - {}",
                i + 1,
                file,
                disk.disk_id,
                format_bytes(bytes)
            );
        }
    }

    let networks = &envelope.network_section.networks;
    if !networks.is_empty() {
        println!();
        println!("Networks:");
        for network in networks {
            println!("  - {}", network.name);
        }
    }

    Ok(())
}

/// Render a byte count with a binary-unit suffix.
fn format_bytes(bytes: u128) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
