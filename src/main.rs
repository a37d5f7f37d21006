//! VRTEX Ledger command-line adapter
//!
//! Translates one command into one ledger operation and prints the result as
//! JSON. Useful for operating a deployment by hand and for running the
//! upkeep scheduler.
//!
//! ## Usage
//!
//! ```bash
//! # Balances and transfers
//! vrtex-ledger balance 42
//! vrtex-ledger transfer 42 77 500
//!
//! # Rewards (community-scoped work claim)
//! vrtex-ledger --community 9001 work 42
//! vrtex-ledger claim 42 daily
//!
//! # Premium keys
//! vrtex-ledger issue-key --level staff 1 42 3
//! vrtex-ledger redeem ABCD-EFGH-JKLM-NPQR 9001
//!
//! # Bill upkeep once a day until interrupted
//! vrtex-ledger upkeep --every 86400
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vrtex_ledger::services::events::log_event;
use vrtex_ledger::services::RewardKind;
use vrtex_ledger::config::{BusinessSpec, JobSpec};
use vrtex_ledger::{Config, Economy, LedgerError, PermissionLevel};

#[derive(Parser, Debug)]
#[command(name = "vrtex-ledger")]
#[command(about = "Persistent economy ledger for chat communities")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "VRTEX_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "VRTEX_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Log level for this crate (trace, debug, info, warn, error)
    #[arg(long, env = "VRTEX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "VRTEX_LOG_JSON")]
    log_json: bool,

    /// Acting community; commands disabled there are refused
    #[arg(long, env = "VRTEX_COMMUNITY")]
    community: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show a user's balances and holdings
    Balance { user: String },

    /// Move wallet funds into the bank
    Deposit { user: String, amount: u64 },

    /// Move bank funds into the wallet
    Withdraw { user: String, amount: u64 },

    /// Pay another user from the wallet
    Transfer { from: String, to: String, amount: u64 },

    /// Hourly work claim in the acting community
    Work { user: String },

    /// Daily, weekly or monthly payout
    Claim { user: String, reward: RewardKind },

    /// Start a job from the catalog
    TakeJob { user: String, job: String },

    /// Leave the current job
    QuitJob { user: String },

    /// Buy a business from the catalog
    Buy { user: String, business: String },

    /// Collect profit from owned businesses
    Collect { user: String },

    /// Bill business upkeep for one user, or for every owner
    Upkeep {
        /// Only this user
        #[arg(long)]
        user: Option<String>,
        /// Repeat every N seconds until interrupted
        #[arg(long)]
        every: Option<u64>,
    },

    /// Issue a premium key
    IssueKey {
        issuer: String,
        target: String,
        months: u32,
        /// Caller's permission level
        #[arg(long, default_value = "member")]
        level: PermissionLevel,
    },

    /// Redeem a premium key for a community
    Redeem { code: String, community: String },

    /// Premium subscription status of a community
    Status { community: String },

    /// Premium keys issued to a user
    Keys { user: String },

    /// Jobs and businesses on offer
    Catalog,

    /// Richest users
    Leaderboard {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Enable or disable a command in a community
    Toggle {
        community: String,
        command: String,
        #[arg(long, default_value = "member")]
        level: PermissionLevel,
    },

    /// Register a community with default settings
    Join { community: String },

    /// Write the effective configuration to the storage directory
    InitConfig,
}

impl Commands {
    /// Front-end command name checked against a community's disabled set
    fn gated_name(&self) -> Option<&'static str> {
        match self {
            Commands::Work { .. } => Some("vework"),
            Commands::Balance { .. } => Some("vebalance"),
            Commands::Buy { .. } | Commands::Collect { .. } => Some("vebusiness"),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Catalog<'a> {
    jobs: BTreeMap<&'a String, &'a JobSpec>,
    businesses: &'a BTreeMap<String, BusinessSpec>,
}

impl<'a> Catalog<'a> {
    fn of(economy: &'a Economy) -> Self {
        Self {
            jobs: economy.rewards.jobs().collect(),
            businesses: economy.business.catalog(),
        }
    }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(path) = &cli.config {
        Config::load(path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = dir.clone();
    }

    if cli.config.is_none() && config.config_path().exists() {
        let storage_dir = config.storage_dir.clone();
        config = Config::load(config.config_path())?;
        config.storage_dir = storage_dir;
    }
    Ok(config)
}

async fn run_upkeep_loop(economy: &Economy, every: u64) -> anyhow::Result<()> {
    let mut events = economy.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Audit listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut interval = tokio::time::interval(Duration::from_secs(every.max(1)));
    info!(every_secs = every, "Upkeep scheduler started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let business = economy.business.clone();
                match tokio::task::spawn_blocking(move || business.run_upkeep_cycle()).await? {
                    Ok(summary) => print(&summary)?,
                    Err(e) => error!(error = %e, "Upkeep cycle failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Upkeep scheduler stopped");
                return Ok(());
            }
        }
    }
}

async fn execute(economy: &Economy, cli: Cli) -> Result<(), anyhow::Error> {
    if let (Some(community), Some(name)) = (&cli.community, cli.command.gated_name()) {
        economy.policy.ensure_enabled(community, name)?;
    }

    match cli.command {
        Commands::Balance { user } => print(&economy.ledger.profile(&user)?),
        Commands::Deposit { user, amount } => print(&economy.ledger.deposit(&user, amount)?),
        Commands::Withdraw { user, amount } => print(&economy.ledger.withdraw(&user, amount)?),
        Commands::Transfer { from, to, amount } => {
            print(&economy.ledger.transfer(&from, &to, amount)?)
        }
        Commands::Work { user } => {
            let community = cli.community.as_deref().unwrap_or_default();
            print(&economy.rewards.work(&user, community)?)
        }
        Commands::Claim { user, reward } => print(&economy.rewards.claim(&user, reward)?),
        Commands::TakeJob { user, job } => print(&economy.rewards.take_job(&user, &job)?.salary),
        Commands::QuitJob { user } => print(&economy.rewards.quit_job(&user)?),
        Commands::Buy { user, business } => print(&economy.business.purchase(&user, &business)?),
        Commands::Collect { user } => print(&economy.business.collect(&user)?),
        Commands::Upkeep { user, every } => match (user, every) {
            (Some(user), _) => print(&economy.business.charge_upkeep(&user)?),
            (None, Some(every)) => run_upkeep_loop(economy, every).await,
            (None, None) => print(&economy.business.run_upkeep_cycle()?),
        },
        Commands::IssueKey { issuer, target, months, level } => {
            print(&economy.premium.issue(&issuer, level, &target, months)?)
        }
        Commands::Redeem { code, community } => {
            print(&economy.premium.redeem(&code, &community)?)
        }
        Commands::Status { community } => {
            print(&economy.premium.subscription_status(&community)?)
        }
        Commands::Keys { user } => print(&economy.premium.list_keys_issued_to(&user)?),
        Commands::Catalog => print(&Catalog::of(economy)),
        Commands::Leaderboard { limit } => print(&economy.ledger.leaderboard(limit)?),
        Commands::Toggle { community, command, level } => {
            print(&economy.policy.toggle_command(&community, level, &command)?)
        }
        Commands::Join { community } => print(&economy.policy.on_community_join(&community)?),
        Commands::InitConfig => {
            let path = economy.config.config_path();
            economy.config.save(&path)?;
            info!(path = %path.display(), "Wrote config");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("vrtex_ledger={}", cli.log_level).parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(&cli)?;
    std::fs::create_dir_all(&config.storage_dir)?;
    info!(storage_dir = %config.storage_dir.display(), "Starting vrtex-ledger");

    let economy = Economy::open(config)?;
    let heals_before = economy.store.heal_count();

    let result = execute(&economy, cli).await;

    if economy.store.heal_count() > heals_before {
        warn!(
            heals = economy.store.heal_count() - heals_before,
            "Store reset corrupted collections during this run"
        );
    }

    if let Err(e) = result {
        match e.downcast_ref::<LedgerError>() {
            Some(rejection) if rejection.is_rejection() => {
                eprintln!("Rejected: {}", rejection);
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_issue_key() {
        let cli = Cli::parse_from([
            "vrtex-ledger",
            "issue-key",
            "--level",
            "staff",
            "1",
            "42",
            "3",
        ]);
        match cli.command {
            Commands::IssueKey { months, level, .. } => {
                assert_eq!(months, 3);
                assert_eq!(level, PermissionLevel::Staff);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_reward_kind() {
        let cli = Cli::parse_from(["vrtex-ledger", "claim", "42", "weekly"]);
        assert!(matches!(
            cli.command,
            Commands::Claim { reward: RewardKind::Weekly, .. }
        ));
    }

    #[test]
    fn test_catalog_lists_default_offerings() {
        let store = vrtex_ledger::EntityStore::temporary(Default::default()).unwrap();
        let economy = Economy::new(
            std::sync::Arc::new(store),
            std::sync::Arc::new(vrtex_ledger::ManualClock::at_epoch()),
            Config::default(),
        );
        let catalog = Catalog::of(&economy);
        assert!(catalog.businesses.contains_key("Mine"));
        assert!(!catalog.jobs.is_empty());
        assert!(serde_json::to_string(&catalog).unwrap().contains("Bakery"));
    }

    #[test]
    fn test_work_is_gated() {
        let cli = Cli::parse_from(["vrtex-ledger", "--community", "g", "work", "1"]);
        assert_eq!(cli.command.gated_name(), Some("vework"));
    }
}
