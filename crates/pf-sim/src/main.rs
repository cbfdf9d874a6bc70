//! PinForge ball tracking simulator
//!
//! Usage:
//!   pf-sim run --machine demos/machine.yaml --script demos/script.yaml
//!   pf-sim check --machine demos/machine.yaml
//!   pf-sim dump --machine demos/machine.yaml

mod script;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pf_ball::{MachineConfig, Simulator};

use script::{Report, Runner, Script};

#[derive(Parser)]
#[command(name = "pf-sim", about = "PinForge ball tracking simulator")]
struct Cli {
    /// Log machine decisions (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script against a machine
    Run {
        #[arg(short, long)]
        machine: PathBuf,
        #[arg(short, long)]
        script: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a machine description and print its devices
    Check {
        #[arg(short, long)]
        machine: PathBuf,
    },
    /// Print a machine description with every default filled in
    Dump {
        #[arg(short, long)]
        machine: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run {
            machine,
            script,
            json,
        } => run(&machine, &script, json),
        Commands::Check { machine } => check(&machine),
        Commands::Dump { machine } => dump(&machine),
    }
}

fn load_machine(path: &Path) -> Result<MachineConfig> {
    MachineConfig::load(path).with_context(|| format!("Invalid machine {}", path.display()))
}

fn run(machine: &Path, script: &Path, json: bool) -> Result<()> {
    let config = load_machine(machine)?;
    let script = Script::load(script)?;
    let sim = Simulator::new(config).context("Failed to build machine")?;
    let report = Runner::new(sim).run(&script);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if let Some(books) = &report.conservation {
        anyhow::ensure!(books.balanced, "Ball accounting does not balance: {books:?}");
    }
    Ok(())
}

fn print_report(report: &Report) {
    for timed in &report.events {
        println!("{:>8} ms  {}", timed.at_ms, timed.event.name());
    }
    for snapshot in &report.snapshots {
        println!("\n── status at {} ms", snapshot.at_ms);
        for status in &snapshot.devices {
            println!(
                "  {:<12} {:<20} balls {}/{} available {} queued {:?}",
                status.name,
                format!("{:?}", status.state),
                status.balls,
                status.capacity,
                status.available_balls,
                status.queued_ejects
            );
        }
    }
    println!("\n── ball counts");
    for (name, balls) in &report.counts {
        println!("  {name:<12} {balls}");
    }
    if let Some(books) = &report.conservation {
        println!(
            "  known {} missing {} balanced {}",
            books.num_balls_known, books.missing_balls, books.balanced
        );
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
    for refusal in &report.refusals {
        println!("  refused: {refusal}");
    }
}

fn check(machine: &Path) -> Result<()> {
    let config = load_machine(machine)?;
    println!("✓ {} is valid", machine.display());
    for pf in &config.playfields {
        println!("  playfield {} ({} activity switches)", pf.name, pf.activity_switches.len());
    }
    for device in &config.ball_devices {
        println!(
            "  {:<12} capacity {} -> {} [{}]",
            device.name,
            device.capacity(),
            device.eject_targets.join(", "),
            device.tags.join(", ")
        );
    }
    for diverter in &config.diverters {
        println!(
            "  diverter {} feeds {}",
            diverter.name,
            diverter.feeder_devices.join(", ")
        );
    }
    Ok(())
}

fn dump(machine: &Path) -> Result<()> {
    let config = load_machine(machine)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}
