//! dynamig CLI
//!
//! Command-line interface for creating, deleting and listing MIG slices.

mod commands;

use clap::{Parser, Subcommand};
use dynamig_core::{
    DeviceSelector, DriverBackend, DynamigConfig, GpuModel, MigError, ProfileCatalog,
};
use dynamig_driver::{DeviceDriver, SimulatedDriver};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// dynamig - dynamic MIG partition manager
#[derive(Parser, Debug)]
#[command(name = "dynamig")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Built-in profile table to use (a100, a30), overriding the config file
    #[arg(long, global = true)]
    model: Option<GpuModel>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a MIG slice (GPU instance + compute instance)
    Create {
        /// GPU index or UUID
        #[arg(short, long)]
        gpu: DeviceSelector,

        /// Profile name (e.g., 1g.5gb)
        #[arg(short, long)]
        profile: String,

        /// First placement slot
        #[arg(short, long)]
        start: u32,
    },

    /// Delete a MIG slice
    Delete {
        /// GPU index or UUID
        #[arg(short, long)]
        gpu: DeviceSelector,

        /// GPU instance id
        #[arg(long)]
        gi: u32,

        /// Compute instance id (omit to remove a GPU instance left without one)
        #[arg(long)]
        ci: Option<u32>,
    },

    /// List MIG slices on all GPUs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the active profile catalog
    Profiles,
}

fn log_level(verbose: bool, configured: &str) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    match configured.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = DynamigConfig::load(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.catalog.model = model;
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(cli.verbose, &config.logging.level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let catalog = config.catalog.build();
    debug!(catalog = catalog.name(), profiles = catalog.len(), "Profile catalog loaded");

    if let Err(err) = run(cli.command, &config, &catalog) {
        if let Some(mig) = err.downcast_ref::<MigError>() {
            eprintln!("Error [{}]: {}", mig.kind(), mig);
            if let Some(state) = mig.slice_state() {
                eprintln!("  Slice state: {}", state);
            }
            std::process::exit(1);
        }
        return Err(err);
    }

    Ok(())
}

fn run(command: Commands, config: &DynamigConfig, catalog: &ProfileCatalog) -> anyhow::Result<()> {
    if let Commands::Profiles = command {
        commands::profiles(catalog);
        return Ok(());
    }

    match config.driver.backend {
        DriverBackend::Simulated => {
            let driver = SimulatedDriver::new(
                config.driver.simulated_devices,
                config.driver.simulated_slots,
            );
            dispatch(&driver, command, catalog)
        }
        DriverBackend::Nvml => run_nvml(command, config, catalog),
    }
}

#[cfg(feature = "nvml")]
fn run_nvml(command: Commands, config: &DynamigConfig, catalog: &ProfileCatalog) -> anyhow::Result<()> {
    let driver = dynamig_driver::NvmlDriver::new(config.driver.library_path.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize NVML: {}", e))?;
    dispatch(&driver, command, catalog)
}

#[cfg(not(feature = "nvml"))]
fn run_nvml(_: Commands, _: &DynamigConfig, _: &ProfileCatalog) -> anyhow::Result<()> {
    anyhow::bail!(
        "dynamig was built without NVML support; rebuild with `--features nvml` \
         or set driver.backend = \"simulated\""
    )
}

fn dispatch<D: DeviceDriver>(
    driver: &D,
    command: Commands,
    catalog: &ProfileCatalog,
) -> anyhow::Result<()> {
    debug!(backend = driver.name(), "Driver ready");

    match command {
        Commands::Create {
            gpu,
            profile,
            start,
        } => commands::create(driver, catalog, &gpu, &profile, start),
        Commands::Delete { gpu, gi, ci } => commands::delete(driver, &gpu, gi, ci),
        Commands::List { json } => commands::list(driver, catalog, json),
        Commands::Profiles => {
            commands::profiles(catalog);
            Ok(())
        }
    }
}
