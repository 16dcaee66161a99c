//! netbench entry point.
//!
//! Loads a topology description, brings the testbed up, holds it until the
//! operator interrupts, then tears it down and prints the teardown report.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netbench::sim::{SimAgent, SimFabric, SimTuner};
use netbench::{
    Endpoint, EthtoolTuner, ForwardingAgent, InterfaceTuner, LinkFabric, NetnsFabric,
    Orchestrator, ProcessAgent, RunningTopology, TestbedConfig,
};

/// Programmable-switch testbed orchestrator
#[derive(Parser, Debug)]
#[command(name = "netbench")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and start a testbed, hold it until Ctrl-C, then tear it down
    Run {
        /// Topology description (YAML)
        #[arg(short = 't', long)]
        topology: PathBuf,

        /// Controller endpoint, overriding the description
        #[arg(short = 'c', long)]
        controller: Option<Endpoint>,

        /// Use in-memory backends instead of touching the host
        #[arg(long)]
        dry_run: bool,

        /// Tear down right after startup instead of waiting for Ctrl-C
        #[arg(long)]
        no_wait: bool,
    },

    /// Check a topology description without building it
    Validate {
        /// Topology description (YAML)
        #[arg(short = 't', long)]
        topology: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

fn validate(path: &Path) -> Result<ExitCode> {
    let config = TestbedConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let builder = config.to_builder()?;
    builder.validate()?;

    println!(
        "{}: {} hosts, {} switches, {} links",
        path.display(),
        config.hosts.len(),
        config.switches.len(),
        builder.links().len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn print_summary(running: &RunningTopology) {
    let states = running.switch_states().await;
    for (switch, controller) in running.controllers() {
        let state = states
            .get(switch)
            .map(|s| s.to_string())
            .unwrap_or_default();
        println!("{:<12} {:<20} controller {}", switch, state, controller);
    }
    for link in running.topology().links() {
        println!("link {}", link);
    }
    println!(
        "{} host interfaces tuned",
        running.tuned_interfaces().len()
    );
}

async fn run(
    path: &Path,
    controller: Option<Endpoint>,
    dry_run: bool,
    no_wait: bool,
) -> Result<ExitCode> {
    let config = TestbedConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let controller = controller.unwrap_or_else(|| config.controller.clone());

    let (fabric, agent, tuner): (
        Arc<dyn LinkFabric>,
        Arc<dyn ForwardingAgent>,
        Arc<dyn InterfaceTuner>,
    ) = if dry_run {
        info!("Dry run: using in-memory backends");
        (
            Arc::new(SimFabric::new()),
            Arc::new(SimAgent::new()),
            Arc::new(SimTuner::new()),
        )
    } else {
        NetnsFabric::check_host().await?;
        EthtoolTuner::check_host().await?;
        (
            Arc::new(NetnsFabric::new()),
            Arc::new(
                ProcessAgent::new(config.agent.clone())
                    .with_poll_interval(config.ready_poll_interval()),
            ),
            Arc::new(EthtoolTuner::new()),
        )
    };

    let orchestrator =
        Orchestrator::new(fabric, agent, tuner).with_startup_timeout(config.startup_timeout());
    let builder = config.to_builder()?;

    let running = match orchestrator.build_and_start(builder, controller).await {
        Ok(running) => running,
        Err(e) => {
            if e.is_retryable() {
                warn!("Startup timed out; rerunning may succeed");
            }
            return Err(e).context("Testbed startup failed");
        }
    };
    print_summary(&running).await;

    if !no_wait {
        info!("Testbed ready, press Ctrl-C to tear down");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl-C: {}", e);
        }
    }

    let report = orchestrator.stop(running).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let result = match &args.command {
        Command::Run {
            topology,
            controller,
            dry_run,
            no_wait,
        } => run(topology, controller.clone(), *dry_run, *no_wait).await,
        Command::Validate { topology } => validate(topology),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("netbench error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
