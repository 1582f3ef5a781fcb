//! Referral Core Daemon
//!
//! Hosts the referral engine over a local SQLite database and offers a few
//! operator commands against the same database.
//!
//! ## Usage
//!
//! ```bash
//! # Run the engine (periodic admin pool refresh + event logging)
//! referral-core serve
//!
//! # Use a custom config or data directory
//! referral-core --config /path/to/config.toml --data-dir /data/referral serve
//!
//! # Manage reviewing admins
//! referral-core admin add reviewer-1 --level low
//! referral-core admin deactivate reviewer-1
//!
//! # Register a user under an inviter
//! referral-core user add bob --inviter alice
//!
//! # Pending requests for an admin
//! referral-core requests --admin reviewer-1 --status pending
//!
//! # Database statistics
//! referral-core stats
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use referral_core::services::events::spawn_logging_listener;
use referral_core::{AdminLevel, Config, ReferralEngine, RequestStatus};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "referral-core")]
#[command(about = "Referral bonus cascade and request distribution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "REFERRAL_CORE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (database and default config location)
    #[arg(long, env = "REFERRAL_CORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until Ctrl+C
    Serve,

    /// Manage admins
    Admin {
        #[command(subcommand)]
        action: AdminCommand,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommand,
    },

    /// List requests assigned to an admin
    Requests {
        /// Admin ID
        #[arg(long)]
        admin: String,

        /// Only requests in this status (pending, approved, rejected)
        #[arg(long)]
        status: Option<RequestStatus>,
    },

    /// Print database statistics as JSON
    Stats,
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Add an admin
    Add {
        id: String,

        /// high (reviews by override) or low (in rotation)
        #[arg(long, default_value = "low")]
        level: AdminLevel,

        /// Create the admin inactive
        #[arg(long)]
        inactive: bool,
    },
    /// Put an admin back into service
    Activate { id: String },
    /// Take an admin out of service
    Deactivate { id: String },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Register a user, optionally under an inviter
    Add {
        id: String,

        #[arg(long)]
        inviter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("referral_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load config
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let engine = ReferralEngine::open(config)?;

    match cli.command {
        Command::Serve => serve(engine).await?,
        Command::Admin { action } => {
            let admin = match action {
                AdminCommand::Add { id, level, inactive } => engine.add_admin(&id, level, !inactive).await?,
                AdminCommand::Activate { id } => engine.set_admin_active(&id, true).await?,
                AdminCommand::Deactivate { id } => engine.set_admin_active(&id, false).await?,
            };
            println!("{}", serde_json::to_string_pretty(&admin)?);
        }
        Command::User { action: UserCommand::Add { id, inviter } } => {
            let user = engine.register_user(&id, inviter.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::Requests { admin, status } => {
            let requests = engine.get_assigned_requests(&admin, status).await?;
            println!("{}", serde_json::to_string_pretty(&requests)?);
        }
        Command::Stats => {
            let stats = engine.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn serve(engine: ReferralEngine) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = engine.config();
    info!(
        data_dir = %config.data_dir.display(),
        refresh_secs = config.pool_refresh_interval_secs,
        "Starting referral-core"
    );

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let listener = spawn_logging_listener(engine.events());
    let refresher = engine.spawn_pool_refresh();

    let snapshot = engine.services().pool.snapshot();
    info!(admins = ?snapshot.admin_ids(), "Admin rotation ready");
    info!("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    refresher.abort();
    listener.abort();

    // Print stats before exit
    if let Ok(stats) = engine.stats().await {
        info!(
            users = stats.db.user_count,
            pending = stats.db.pending_requests,
            bonuses_paid = %stats.db.bonus_total,
            "Final engine stats"
        );
    }

    Ok(())
}
