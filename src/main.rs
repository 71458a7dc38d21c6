#![allow(dead_code)]

mod cancel;
mod client;
mod clock;
mod config;
mod db;
mod error;
mod hophints;
mod liquidity;
mod loop_in;
mod state;
mod swaps;

use crate::cancel::CancelSignal;
use crate::client::{NodeBackend, SwapServer};
use crate::clock::{Clock, SystemClock};
use crate::hophints::{HopHintSelector, MAX_HOP_HINTS};
use crate::liquidity::{LoopOutRequest, Manager, ManagerConfig};
use crate::loop_in::{LoopInOptions, LoopInPlanner};
use crate::swaps::SwapStore;
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "liquidity-boss",
    about = "Liquidity decision engine for Lightning swap clients"
)]
struct Cli {
    /// Path to liquidityboss.toml config file
    #[arg(short, long, default_value = "liquidityboss.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suggestion cycle periodically (default)
    Daemon,
    /// Run a single suggestion cycle and print the suggestions
    Suggest,
    /// Print the liquidity parameters loaded from the config file
    Params,
    /// Select route hints for an invoice paid to this node
    Hints {
        /// Invoice amount in millisatoshis
        #[arg(long)]
        amt_msat: u64,
        /// Maximum number of hints (defaults to [hop_hints] max_hints)
        #[arg(long)]
        max_hints: Option<usize>,
        /// Only hint channels with this peer
        #[arg(long)]
        last_hop: Option<String>,
    },
    /// Quote a loop in and dispatch it
    LoopIn(LoopInArgs),
}

#[derive(clap::Args)]
struct LoopInArgs {
    /// Swap amount in satoshis
    amt: u64,
    /// The htlc is published by an external wallet
    #[arg(long)]
    external: bool,
    /// Confirmation target for the htlc transaction
    #[arg(long)]
    conf_target: Option<u32>,
    /// Peer the swap payment must arrive through
    #[arg(long)]
    last_hop: Option<String>,
    #[arg(long, default_value = "")]
    label: String,
    /// Route hints as JSON: [{"hop_hints":[{"node_id":..,"chan_id":..}]}]
    #[arg(long)]
    route_hints: Option<String>,
    /// Attach route hints for our private channels
    #[arg(long)]
    private: bool,
}

impl LoopInArgs {
    fn into_options(self) -> anyhow::Result<LoopInOptions> {
        Ok(LoopInOptions {
            amount_sat: self.amt,
            external_htlc: self.external,
            htlc_conf_target: self.conf_target,
            last_hop: self.last_hop.as_deref().map(client::parse_node_id).transpose()?,
            label: self.label,
            route_hints: self
                .route_hints
                .as_deref()
                .map(client::parse_route_hints)
                .transpose()?,
            private: self.private,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = config.general.log_level.clone();
    env_logger::Builder::new()
        .filter_level(log_level.parse().unwrap_or(log::LevelFilter::Info))
        .format_timestamp_secs()
        .init();

    info!("LiquidityBoss v{} starting", env!("CARGO_PKG_VERSION"));

    if config.general.dry_run {
        warn!("DRY-RUN MODE: No swaps will be dispatched");
    }

    let command = cli.command.unwrap_or(Commands::Daemon);
    if let Commands::Params = command {
        return print_params(&config);
    }

    // Initialize components
    let node: Arc<dyn NodeBackend> = Arc::new(client::LndRestClient::new(&config.node)?);
    let swap_server: Arc<dyn SwapServer> =
        Arc::new(client::LoopdRestClient::new(&config.swap_server)?);
    let swaps: Arc<dyn SwapStore> = Arc::new(db::Database::open(&config.general.database_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let shutdown_rx = shutdown_signal();

    match command {
        Commands::Daemon => {
            if !config.general.enabled {
                warn!("Master switch is OFF -- exiting");
                return Ok(());
            }
            let manager = build_manager(&config, node, swap_server, swaps, clock).await?;
            run_daemon(&config, &manager, shutdown_rx).await
        }
        Commands::Suggest => {
            let manager = build_manager(&config, node, swap_server, swaps, clock).await?;
            let suggestions = run_cycle(&manager, &CancelSignal::from_watch(shutdown_rx)).await?;
            print_suggestions(&suggestions);
            Ok(())
        }
        Commands::Hints {
            amt_msat,
            max_hints,
            last_hop,
        } => {
            let include = last_hop
                .as_deref()
                .map(client::parse_node_id)
                .transpose()?
                .map(|hop| [hop].into_iter().collect::<HashSet<_>>());
            let max_hints = max_hints
                .unwrap_or(config.hop_hints.max_hints)
                .min(MAX_HOP_HINTS);

            let hints = HopHintSelector::new(node)
                .select_hop_hints(
                    &CancelSignal::from_watch(shutdown_rx),
                    amt_msat,
                    max_hints,
                    include.as_ref(),
                )
                .await?;

            println!("{} route hints for {} msat", hints.len(), amt_msat);
            for group in &hints {
                for hint in group {
                    println!("  {}", hint);
                }
            }
            Ok(())
        }
        Commands::LoopIn(args) => {
            let opts = args.into_options()?;
            let planner = build_planner(&config, node, swap_server);
            run_loop_in(&planner, &opts, &CancelSignal::from_watch(shutdown_rx)).await
        }
        Commands::Params => print_params(&config),
    }
}

/// Publishes `true` on ctrl-c. Doubles as the cancellation signal for
/// in-flight backend calls.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, abandoning in-flight calls...");
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

async fn build_manager(
    config: &Config,
    node: Arc<dyn NodeBackend>,
    swap_server: Arc<dyn SwapServer>,
    swaps: Arc<dyn SwapStore>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Manager> {
    let manager = Manager::new(ManagerConfig {
        node,
        swap_server,
        swaps,
        clock,
        minimum_confirmations: config.liquidity.minimum_confirmations,
    });

    let params = config.liquidity.parameters()?;
    manager
        .set_parameters(params)
        .await
        .context("Rejected [liquidity] parameters")?;
    Ok(manager)
}

fn build_planner(
    config: &Config,
    node: Arc<dyn NodeBackend>,
    swap_server: Arc<dyn SwapServer>,
) -> LoopInPlanner {
    LoopInPlanner::new(swap_server, HopHintSelector::new(node))
        .with_max_hints(config.hop_hints.max_hints)
        .with_dry_run(config.general.dry_run)
}

async fn run_daemon(
    config: &Config,
    manager: &Manager,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let cancel = CancelSignal::from_watch(shutdown_rx.clone());
    let interval = std::time::Duration::from_secs(config.general.loop_interval_secs);

    info!(
        "Entering main loop (interval: {}s)",
        config.general.loop_interval_secs
    );

    loop {
        if *shutdown_rx.borrow() {
            info!("Shutting down gracefully");
            break;
        }

        match run_cycle(manager, &cancel).await {
            Ok(_) => {}
            Err(e) if is_cancelled(&e) => {
                info!("Cycle cancelled, shutting down");
                break;
            }
            Err(e) => error!("Cycle error: {:#}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown_rx.changed() => {
                info!("Shutting down gracefully");
                break;
            }
        }
    }

    Ok(())
}

pub async fn run_cycle(
    manager: &Manager,
    cancel: &CancelSignal,
) -> anyhow::Result<Vec<LoopOutRequest>> {
    let suggestions = manager.suggest_swaps(cancel).await?;

    if suggestions.is_empty() {
        info!("No swaps suggested this cycle");
    }
    for suggestion in &suggestions {
        info!("Suggested {}", suggestion);
    }

    Ok(suggestions)
}

async fn run_loop_in(
    planner: &LoopInPlanner,
    opts: &LoopInOptions,
    cancel: &CancelSignal,
) -> anyhow::Result<()> {
    let plan = planner.quote(cancel, opts).await?;
    println!("Quote: {}", plan);

    match planner.dispatch(cancel, &plan).await? {
        Some(resp) => {
            println!("Swap initiated");
            println!("ID:           {}", resp.id);
            if let Some(np2wsh) = &resp.htlc_address_np2wsh {
                println!("HTLC address (NP2WSH): {}", np2wsh);
            }
            println!("HTLC address (P2WSH): {}", resp.htlc_address_p2wsh);
            if let Some(message) = &resp.server_message {
                println!("Server message: {}", message);
            }
        }
        None => println!("Dry run, swap not dispatched"),
    }
    Ok(())
}

fn is_cancelled(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<error::Error>(), Some(error::Error::Cancelled(_)))
}

fn print_suggestions(suggestions: &[LoopOutRequest]) {
    println!("LiquidityBoss Suggestions");
    println!("=========================");
    if suggestions.is_empty() {
        println!("No swaps suggested");
    }
    for suggestion in suggestions {
        println!("{}", suggestion);
    }
}

fn print_params(config: &Config) -> anyhow::Result<()> {
    let params = config.liquidity.parameters()?;
    params
        .validate(config.liquidity.minimum_confirmations)
        .context("Invalid [liquidity] section")?;

    println!("LiquidityBoss Parameters");
    println!("========================");
    println!("{}", params);
    println!("Max hop hints:          {}", config.hop_hints.max_hints);
    println!("Dry run:                {}", config.general.dry_run);
    Ok(())
}
