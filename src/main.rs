//! leeca-k3s - provisions a k3s VM fleet on Proxmox and hands it to k3s-ansible

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use leeca_k3s::{
    ConfigStore, FleetOrchestrator, FleetReport, NodeSpec, PlaybookRunner, ProxmoxHypervisor,
    RandomTokens, StackConfig, allocate, persist_value, render, write_inventory,
};

#[derive(Parser, Debug)]
#[command(name = "leeca-k3s", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the nodes that would be created, without contacting Proxmox
    Plan(PlanArgs),

    /// Provision the fleet, write the inventory and run the playbook
    Up(UpArgs),
}

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Stack file holding the `config:` mapping
    #[arg(short = 'c', long = "config", default_value = "stack.yaml")]
    config_file: PathBuf,
}

#[derive(Parser, Debug)]
struct UpArgs {
    /// Stack file holding the `config:` mapping
    #[arg(short = 'c', long = "config", default_value = "stack.yaml")]
    config_file: PathBuf,

    /// Write an inventory even when fewer masters than planned are ready
    #[arg(long)]
    accept_degraded: bool,

    /// Stop after writing the inventory
    #[arg(long)]
    skip_playbook: bool,

    /// Nodes provisioned at the same time (overrides `k3s:concurrency`)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Plan(args) => run_plan(args).await,
        Commands::Up(args) => run_up(args).await,
    }
}

async fn load_stack(path: &Path) -> anyhow::Result<StackConfig> {
    let mut store = ConfigStore::load(path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    store.apply_env();
    Ok(store.stack_config().await?)
}

async fn run_plan(args: PlanArgs) -> anyhow::Result<()> {
    let stack = load_stack(&args.config_file).await?;
    let specs = allocate(&stack.plan)?;
    print_plan(&specs);
    Ok(())
}

async fn run_up(args: UpArgs) -> anyhow::Result<()> {
    let mut stack = load_stack(&args.config_file).await?;
    if let Some(concurrency) = args.concurrency {
        stack.concurrency = concurrency.max(1);
    }
    stack.inventory.accept_degraded = args.accept_degraded;
    let specs = allocate(&stack.plan)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight calls");
            on_signal.cancel();
        }
    });

    let client = Arc::new(stack.proxmox.client()?);
    client.login().await.context("logging in to Proxmox")?;
    let hypervisor = Arc::new(ProxmoxHypervisor::new(client, stack.proxmox.node.clone()));
    let orchestrator =
        FleetOrchestrator::new(hypervisor, Arc::new(stack.driver.clone()), stack.concurrency);

    info!(nodes = specs.len(), concurrency = stack.concurrency, "Provisioning fleet");
    let report = orchestrator.provision(specs, &cancel).await;
    print_report(&report);
    if cancel.is_cancelled() {
        anyhow::bail!("interrupted before the fleet was ready");
    }
    report.ensure_masters()?;
    let partial = report.partial_failure();
    if let Some(err) = &partial {
        warn!(error = %err, "Continuing with the nodes that are ready");
    }

    let inventory = render(&report.facts, &stack.extra_vars, &stack.inventory, &RandomTokens)?;
    if let Some(token) = &inventory.generated_token {
        persist_value(&args.config_file, "ansible:k3s_token", token.as_str()).await?;
    }

    let run_playbook = stack.playbook.enabled && !args.skip_playbook;
    let runner = PlaybookRunner::new(stack.playbook.clone());
    if run_playbook {
        runner.prepare_repository().await?;
    }
    write_inventory(&inventory, &stack.playbook.inventory_paths()).await?;
    if run_playbook {
        let hosts: Vec<_> = report.facts.iter().map(|node| node.ip).collect();
        runner.wait_for_hosts(&hosts, &cancel).await?;
        runner.run(&cancel).await?;
    }

    match partial {
        Some(err) => Err(err.into()),
        None => {
            info!(nodes = report.facts.len(), "Cluster ready");
            Ok(())
        }
    }
}

fn print_plan(specs: &[NodeSpec]) {
    println!("{:<24} {:<7} {:>6} {:>5} {:>8}  ADDRESS", "NAME", "ROLE", "VMID", "CORES", "MEMORY");
    for spec in specs {
        let vmid = spec
            .vm_id
            .map_or_else(|| "auto".to_string(), |id| id.to_string());
        let address = spec
            .static_ip
            .map_or_else(|| "dhcp".to_string(), |ip| format!("{}/{}", ip.address, ip.prefix_len));
        println!(
            "{:<24} {:<7} {:>6} {:>5} {:>8}  {}",
            spec.name.as_str(),
            spec.role.to_string(),
            vmid,
            spec.cores,
            format!("{}M", spec.memory_mb),
            address
        );
    }
}

fn print_report(report: &FleetReport) {
    println!("{:<24} {:<7} {:>6} {:<22} {:<16} ERROR", "NAME", "ROLE", "VMID", "PHASE", "ADDRESS");
    for outcome in &report.outcomes {
        let vmid = outcome
            .vm_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let address = outcome
            .ip
            .map_or_else(|| "-".to_string(), |ip| ip.to_string());
        let error = outcome
            .failure
            .as_ref()
            .map(|failure| format!("{}: {}", failure.kind, failure.message))
            .unwrap_or_default();
        println!(
            "{:<24} {:<7} {:>6} {:<22} {:<16} {}",
            outcome.name.as_str(),
            outcome.role.to_string(),
            vmid,
            outcome.phase.to_string(),
            address,
            error
        );
    }
    println!(
        "{} of {} nodes ready, {} masters",
        report.facts.len(),
        report.planned,
        report.surviving_masters()
    );
}
