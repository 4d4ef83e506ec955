//! Fleet Warmer CLI
//!
//! Ledger administration and a loopback simulation of a device fleet.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use fleet_warmer::catalog::{MessageCatalog, SharedCatalog};
use fleet_warmer::config::{Config, DelayRange};
use fleet_warmer::engine::Orchestrator;
use fleet_warmer::events::SessionEvent;
use fleet_warmer::identity::{DeviceId, Identity};
use fleet_warmer::ledger::{AccountStatus, CreditLedger};
use fleet_warmer::transport::loopback::LoopbackNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Fleet Warmer - credit ledger and conversation simulator
#[derive(Parser)]
#[command(name = "fleet-warmer")]
#[command(about = "Manage fleet credit balances and run loopback simulations")]
struct Cli {
    /// Ledger database (defaults to ~/.fleet-warmer/ledger.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Message catalog JSON (defaults to ~/.fleet-warmer/chatsimulation.json)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show paths and storage health
    Status,

    /// Show the balance of a number
    Balance {
        /// Phone number (country + area + local)
        number: Identity,
    },

    /// Add credit minutes to a number
    Credit {
        number: Identity,

        /// Minutes to add
        minutes: f64,
    },

    /// Show the full account record of a number
    Account { number: Identity },

    /// List all accounts
    Accounts {
        /// Only active accounts with a positive balance
        #[arg(long)]
        funded: bool,
    },

    /// Mark an account active
    Activate { number: Identity },

    /// Mark an account inactive
    Deactivate { number: Identity },

    /// Run loopback devices talking to each other
    Simulate {
        /// Number of devices
        #[arg(short = 'n', long, default_value = "3")]
        devices: usize,

        /// How long to run
        #[arg(short = 's', long, default_value = "120")]
        seconds: u64,

        /// Compress pacing to a few seconds per message
        #[arg(long)]
        fast: bool,

        /// Use the configured ledger instead of a scratch one
        #[arg(long)]
        persist: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::default();
    if let Some(db) = cli.db {
        config.ledger_db = db;
    }
    if let Some(catalog) = cli.catalog {
        config.catalog_file = catalog;
    }
    config.validate()?;

    match cli.command {
        Commands::Status => cmd_status(&config),
        Commands::Balance { number } => cmd_balance(&config, &number),
        Commands::Credit { number, minutes } => cmd_credit(&config, &number, minutes),
        Commands::Account { number } => cmd_account(&config, &number),
        Commands::Accounts { funded } => cmd_accounts(&config, funded),
        Commands::Activate { number } => cmd_set_status(&config, &number, AccountStatus::Active),
        Commands::Deactivate { number } => {
            cmd_set_status(&config, &number, AccountStatus::Inactive)
        }
        Commands::Simulate {
            devices,
            seconds,
            fast,
            persist,
        } => cmd_simulate(config, devices, seconds, fast, persist),
    }
}

// ============================================================================
// Ledger Commands
// ============================================================================

fn open_ledger(config: &Config) -> anyhow::Result<CreditLedger> {
    CreditLedger::open(config)
        .with_context(|| format!("opening ledger at {}", config.ledger_db.display()))
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("Data dir: {}", config.data_dir.display());
    println!("Ledger:   {}", config.ledger_db.display());
    println!("Catalog:  {}", config.catalog_file.display());

    let ledger = open_ledger(config)?;
    let healthy = ledger.is_healthy();
    println!("Storage:  {}", if healthy { "ok" } else { "unavailable" });
    if healthy {
        let accounts = ledger.accounts()?;
        println!(
            "Accounts: {} ({} funded)",
            accounts.len(),
            ledger.funded_accounts().len()
        );
    }

    match MessageCatalog::load(&config.catalog_file) {
        Ok(catalog) => println!("Messages: {}", catalog.len()),
        Err(e) => println!("Messages: unavailable ({})", e),
    }
    Ok(())
}

fn cmd_balance(config: &Config, number: &Identity) -> anyhow::Result<()> {
    let ledger = open_ledger(config)?;
    println!("{} {:.4}", number, ledger.get_balance(number));
    Ok(())
}

fn cmd_credit(config: &Config, number: &Identity, minutes: f64) -> anyhow::Result<()> {
    if !minutes.is_finite() || minutes <= 0.0 {
        bail!("minutes must be a positive number, got {}", minutes);
    }
    let ledger = open_ledger(config)?;
    if !ledger.credit(number, minutes) {
        bail!("credit for {} was not recorded", number);
    }
    println!("{} {:.4}", number, ledger.get_balance(number));
    Ok(())
}

fn cmd_account(config: &Config, number: &Identity) -> anyhow::Result<()> {
    let ledger = open_ledger(config)?;
    match ledger.account(number)? {
        Some(account) => println!("{}", serde_json::to_string_pretty(&account)?),
        None => println!("No account for {}", number),
    }
    Ok(())
}

fn cmd_accounts(config: &Config, funded_only: bool) -> anyhow::Result<()> {
    let ledger = open_ledger(config)?;
    let accounts = ledger.accounts()?;

    let mut shown = 0;
    for account in accounts {
        if funded_only && !(account.status == AccountStatus::Active && account.balance_minutes > 0.0) {
            continue;
        }
        println!(
            "{:<16} {:<8} {:>10.4} min  {:>6} sent  {:>2} active",
            account.identity.to_string(),
            account.status.as_str(),
            account.balance_minutes,
            account.total_messages_sent,
            account.total_active_conversations
        );
        shown += 1;
    }

    if shown == 0 {
        println!("No accounts");
    }
    Ok(())
}

fn cmd_set_status(config: &Config, number: &Identity, status: AccountStatus) -> anyhow::Result<()> {
    let ledger = open_ledger(config)?;
    if !ledger.set_status(number, status) {
        bail!("no account for {}", number);
    }
    println!("{} {}", number, status.as_str());
    Ok(())
}

// ============================================================================
// Simulation
// ============================================================================

const FALLBACK_MESSAGES: &[&str] = &[
    "Oi, tudo bem?",
    "Bom dia!",
    "Como foi o fim de semana?",
    "Vamos marcar aquele café?",
    "Até mais tarde!",
];

fn cmd_simulate(
    mut config: Config,
    devices: usize,
    seconds: u64,
    fast: bool,
    persist: bool,
) -> anyhow::Result<()> {
    if devices == 0 || devices > 99 {
        bail!("devices must be between 1 and 99");
    }

    config.auto_start = true;
    if fast {
        config.tick_interval = DelayRange::from_secs(2, 5);
        config.send_delay = DelayRange::from_secs(0, 1);
    }

    let ledger = if persist {
        open_ledger(&config)?
    } else {
        CreditLedger::in_memory(config.starter_balance_minutes)?
    };

    let catalog = SharedCatalog::from_path(&config.catalog_file);
    let catalog = if catalog.get().is_empty() {
        warn!("Using built-in messages");
        SharedCatalog::preloaded(MessageCatalog::new(
            FALLBACK_MESSAGES.iter().map(|m| m.to_string()).collect(),
        ))
    } else {
        catalog
    };

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(simulate(config, Arc::new(ledger), Arc::new(catalog), devices, seconds))
}

async fn simulate(
    config: Config,
    ledger: Arc<CreditLedger>,
    catalog: Arc<SharedCatalog>,
    devices: usize,
    seconds: u64,
) -> anyhow::Result<()> {
    let network = LoopbackNetwork::new();
    let fleet = Orchestrator::new(&config, Arc::new(network.clone()), ledger, catalog);

    let mut events = fleet.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Ready { device_id, identity, .. } => {
                    info!(device = %device_id, identity = %identity, "Device ready")
                }
                SessionEvent::LowBalance {
                    identity,
                    balance_minutes,
                    ..
                } => warn!(identity = %identity, balance_minutes, "Low balance"),
                SessionEvent::Disconnected { device_id, reason } => {
                    info!(device = %device_id, reason = %reason, "Device disconnected")
                }
                _ => {}
            }
        }
    });

    let mut fleet_devices = Vec::with_capacity(devices);
    for n in 1..=devices {
        let device_id = DeviceId::new(format!("sim_{:02}", n));
        let identity = Identity::parse(&format!("55119000000{:02}", n))?;
        network.provision(device_id.clone(), identity.clone());
        fleet.initialize_session(&device_id, Some(identity.clone()), false).await?;
        fleet_devices.push((device_id, identity));
    }

    info!(devices, seconds, "Simulation running");
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    for job in fleet.conversation_status() {
        println!(
            "{} -> {} targets, message cursor {}",
            job.identity,
            job.targets.len(),
            job.cursor_message
        );
    }

    for (device_id, identity) in &fleet_devices {
        fleet.disconnect_session(device_id).await?;
        println!("{} {:.4}", identity, fleet.get_balance(identity));
    }
    Ok(())
}
