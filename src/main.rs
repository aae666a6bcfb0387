//! Copy-trading replication engine.
//!
//! Mirrors every trade on a master Bybit account onto copier accounts,
//! sized by each copier's capital, reconciles drift, and settles the
//! platform's profit share weekly.

mod api;
mod db;
mod engine;
mod error;
mod listener;
mod models;
mod status;
mod trading;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{
    with_timeout, BybitConfig, BybitConnectorFactory, BybitStreamSource, ConnectorFactory,
};
use crate::db::Database;
use crate::engine::Engine;
use crate::models::{
    ApiCredentials, CopierAccount, CopierSettings, CopyStatus, MasterConfig, SyncMethod, SyncState,
    SyncStatusRecord, MASTER_ACCOUNT_ID,
};
use crate::status::{ConnectionStatus, StatusEvent};
use crate::trading::EngineConfig;

/// Copy-trading replication engine CLI.
#[derive(Parser)]
#[command(name = "mirrorcopy")]
#[command(about = "Mirror a master Bybit account onto copier accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(
        short,
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:./mirrorcopy.db?mode=rwc"
    )]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Bybit REST endpoint
    #[arg(long, env = "BYBIT_REST_URL", default_value = api::BYBIT_REST_URL)]
    rest_url: String,

    /// Bybit websocket endpoint
    #[arg(long, env = "BYBIT_WS_URL", default_value = api::BYBIT_WS_URL)]
    ws_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication engine until Ctrl+C (SIGHUP retries the master stream)
    Run,

    /// Master account configuration
    Master {
        #[command(subcommand)]
        command: MasterCommands,
    },

    /// Copier account registry
    Copier {
        #[command(subcommand)]
        command: CopierCommands,
    },

    /// Run one reconciliation pass
    Sync,

    /// Run one profit settlement for every active copier
    Settle,

    /// Show recent replication tasks
    Tasks {
        /// Number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show master connectivity, queue and per-copier sync status
    Status,

    /// Show recent audit log entries
    Audit {
        /// Only entries for this account
        #[arg(long)]
        account: Option<String>,

        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum MasterCommands {
    /// Store master credentials and the settlement account
    Set {
        #[arg(long, env = "MASTER_API_KEY")]
        api_key: String,

        #[arg(long, env = "MASTER_API_SECRET", hide_env_values = true)]
        api_secret: String,

        /// Exchange account ID that receives the platform's profit share
        #[arg(long, env = "SETTLEMENT_ACCOUNT_ID")]
        settlement_account: String,
    },
}

#[derive(Subcommand)]
enum CopierCommands {
    /// Register a copier after validating its keys
    Add(AddCopier),

    /// List registered copiers
    List,

    /// Change a copier's replication status (active, paused, inactive)
    SetStatus { id: String, status: CopyStatus },

    /// Update a copier's risk settings
    Settings {
        id: String,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Re-check a copier's keys and lift a credential suspension
    Validate { id: String },
}

#[derive(Args)]
struct AddCopier {
    /// Copier ID (generated when omitted)
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    user_id: String,

    #[arg(long)]
    api_key: String,

    #[arg(long)]
    api_secret: String,

    /// Capital dedicated to copying, in USD
    #[arg(long)]
    capital: Decimal,

    #[arg(long, default_value = "2")]
    max_risk_percent: Decimal,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(Args)]
struct SettingsArgs {
    /// Maximum notional per opened position (0 = unlimited)
    #[arg(long)]
    max_position_size: Option<Decimal>,

    /// Only copy these symbols (comma separated)
    #[arg(long, value_delimiter = ',')]
    allowed: Option<Vec<String>>,

    /// Never copy these symbols (comma separated)
    #[arg(long, value_delimiter = ',')]
    blocked: Option<Vec<String>>,

    #[arg(long)]
    multiplier: Option<Decimal>,

    /// Remove the allowed/blocked symbol lists
    #[arg(long)]
    clear_symbols: bool,
}

impl SettingsArgs {
    fn apply(self, settings: &mut CopierSettings) {
        if self.clear_symbols {
            settings.allowed_symbols = None;
            settings.blocked_symbols = None;
        }
        if let Some(size) = self.max_position_size {
            settings.max_position_size = size;
        }
        if let Some(allowed) = self.allowed {
            settings.allowed_symbols = Some(normalize_symbols(allowed));
        }
        if let Some(blocked) = self.blocked {
            settings.blocked_symbols = Some(normalize_symbols(blocked));
        }
        if let Some(multiplier) = self.multiplier {
            settings.copy_multiplier = multiplier;
        }
    }
}

fn normalize_symbols(symbols: Vec<String>) -> Vec<String> {
    symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::new(&cli.database).await?;
    let config = EngineConfig::default();
    let bybit = BybitConfig {
        rest_url: cli.rest_url.clone(),
        request_timeout: config.request_timeout(),
        ..Default::default()
    };
    let factory: Arc<dyn ConnectorFactory> = Arc::new(BybitConnectorFactory::new(bybit)?);
    let source = Arc::new(BybitStreamSource::new(cli.ws_url.clone()));

    match cli.command {
        Commands::Run => {
            let engine = Arc::new(Engine::new(db.clone(), factory, source, config));
            let cancel = CancellationToken::new();

            // Register shutdown handler
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                shutdown.cancel();
            });

            #[cfg(unix)]
            spawn_reconnect_on_hangup(engine.clone());

            // Tell the operator when the stream stops retrying on its own
            let mut stream = engine.watch_status();
            tokio::spawn(async move {
                while stream.changed().await.is_ok() {
                    let status = stream.borrow_and_update().clone();
                    match status.state {
                        ConnectionStatus::Error => {
                            warn!("Master stream stopped, fix the master keys and send SIGHUP")
                        }
                        ConnectionStatus::Disconnected if status.reconnect_attempts > 0 => {
                            warn!(
                                attempts = status.reconnect_attempts,
                                "Master stream gave up, running on reconciliation until SIGHUP"
                            )
                        }
                        _ => {}
                    }
                }
            });

            // Echo connectivity and replication events to the operator
            let mut events = engine.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(
                            event @ (StatusEvent::CopyTradingStatus { .. }
                            | StatusEvent::ReplicationComplete { .. }),
                        ) => {
                            if let Ok(line) = serde_json::to_string(&event) {
                                println!("{}", line);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(lag)) => {
                            warn!(lag = lag, "status subscriber lagged");
                        }
                    }
                }
            });

            let copiers = db.list_active_copiers().await?;
            println!("\n=== Copy-Trading Replication Engine ===");
            println!("Active copiers: {}", copiers.len());
            println!("\nPress Ctrl+C to stop.\n");

            engine.run(cancel).await?;

            let status = engine.status();
            println!(
                "\nMaster stream: {:?}, {} open master positions",
                status.state, status.active_positions
            );
        }

        Commands::Master {
            command:
                MasterCommands::Set {
                    api_key,
                    api_secret,
                    settlement_account,
                },
        } => {
            let credentials = ApiCredentials::new(api_key, api_secret);
            let account_id = with_timeout(
                config.request_timeout(),
                factory.connector(&credentials)?.validate_credentials(),
            )
            .await
            .context("Master credentials were rejected")?;

            db.save_master_config(&MasterConfig {
                credentials,
                settlement_account_id: settlement_account.clone(),
            })
            .await?;
            info!(account = %account_id, "Master account configured");
            println!(
                "Master account {} saved (settlement account {})",
                account_id, settlement_account
            );
        }

        Commands::Copier { command } => {
            let engine = Engine::new(db.clone(), factory.clone(), source, config.clone());
            run_copier_command(command, &db, factory.as_ref(), &engine, &config).await?
        }

        Commands::Sync => {
            let engine = Engine::new(db.clone(), factory, source, config);
            let summary = engine.reconciler().sync_positions().await?;
            println!("\n=== Reconciliation ===");
            println!("Copiers checked:   {}", summary.copiers_checked);
            println!("Tasks queued:      {}", summary.tasks_created);
            println!("Copiers failed:    {}", summary.copiers_failed);
            println!("Disconnects done:  {}", summary.disconnects_completed);
            println!("\nQueued tasks run on the next `mirrorcopy run`.");
        }

        Commands::Settle => {
            let engine = Engine::new(db.clone(), factory, source, config);
            let summary = engine.settlement().process_settlements().await?;
            println!("\n=== Profit Settlement ===");
            println!("Completed:    {}", summary.completed);
            println!("Skipped:      {}", summary.skipped);
            println!("Failed:       {}", summary.failed);
            println!("Transferred:  {}", summary.transferred);
        }

        Commands::Tasks { limit } => {
            let tasks = db.recent_tasks(limit).await?;
            if tasks.is_empty() {
                println!("No replication tasks yet.");
                return Ok(());
            }

            println!(
                "\n{:<10} {:<14} {:<6} {:<12} {:<5} {:>14} {:<10} {:>5}",
                "TASK", "COPIER", "TYPE", "SYMBOL", "SIDE", "QTY", "STATUS", "TRY"
            );
            println!("{}", "-".repeat(86));
            for task in tasks {
                println!(
                    "{:<10} {:<14} {:<6} {:<12} {:<5} {:>14} {:<10} {:>5}",
                    truncate(&task.id, 10),
                    truncate(&task.copier_account_id, 14),
                    task.task_type.as_str(),
                    task.symbol,
                    task.side.as_str(),
                    task.quantity.to_string(),
                    task.status.as_str(),
                    task.retry_count
                );
                if let Some(error) = &task.metadata.last_error {
                    println!("           last error: {}", error);
                }
            }
        }

        Commands::Status => {
            let master = db.get_sync_status(MASTER_ACCOUNT_ID).await?;
            let stats = db.queue_stats().await?;

            println!("\n=== Master Stream ===");
            match master {
                Some(row) => {
                    println!("Status:           {}", row.sync_status.as_str());
                    println!("Last Heartbeat:   {}", row.last_heartbeat);
                    if let Some(error) = row.last_error {
                        println!("Last Error:       {}", error);
                    }
                }
                None => {
                    println!("Never connected. Run 'mirrorcopy run' to start the engine.")
                }
            }

            println!("\n=== Task Queue ===");
            println!("Pending:          {}", stats.pending);
            println!("Processing:       {}", stats.processing);
            println!("Completed:        {}", stats.completed);
            println!("Failed:           {}", stats.failed);

            let rows: Vec<SyncStatusRecord> = db
                .list_sync_status()
                .await?
                .into_iter()
                .filter(|r| r.account_id != MASTER_ACCOUNT_ID)
                .collect();
            if !rows.is_empty() {
                println!("\n=== Copiers ===");
                for row in rows {
                    let age = (Utc::now() - row.last_heartbeat).num_seconds();
                    println!(
                        "  {:<14} {:<16} via {:<14} {}s ago{}",
                        truncate(&row.account_id, 14),
                        row.sync_status.as_str(),
                        row.sync_method.as_str(),
                        age,
                        row.last_error.map(|e| format!(" ({})", e)).unwrap_or_default()
                    );
                }
            }
        }

        Commands::Audit { account, limit } => {
            let actions = db.recent_actions(account.as_deref(), limit).await?;
            if actions.is_empty() {
                println!("No audit entries.");
                return Ok(());
            }

            println!("\n{:>6} {:<20} {:<14} {:<22} DETAILS", "ID", "TIME", "ACCOUNT", "ACTION");
            println!("{}", "-".repeat(86));
            for action in actions {
                println!(
                    "{:>6} {:<20} {:<14} {:<22} {}",
                    action.id,
                    action.created_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&action.account_id, 14),
                    action.action,
                    action.details
                );
            }
        }
    }

    Ok(())
}

/// Retry the master stream on SIGHUP after it gave up or hit an error.
#[cfg(unix)]
fn spawn_reconnect_on_hangup(engine: Arc<Engine>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reconnecting master stream");
            engine.request_reconnect();
        }
    });
}

async fn run_copier_command(
    command: CopierCommands,
    db: &Database,
    factory: &dyn ConnectorFactory,
    engine: &Engine,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        CopierCommands::Add(args) => {
            let credentials = ApiCredentials::new(args.api_key, args.api_secret);
            let account_id = with_timeout(
                config.request_timeout(),
                factory.connector(&credentials)?.validate_credentials(),
            )
            .await
            .context("Copier credentials were rejected")?;

            let mut settings = CopierSettings {
                max_position_size: Decimal::ZERO,
                allowed_symbols: None,
                blocked_symbols: None,
                copy_multiplier: dec!(1),
            };
            args.settings.apply(&mut settings);

            let copier = CopierAccount {
                id: args.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                user_id: args.user_id,
                credentials,
                exchange_account_id: Some(account_id.clone()),
                capital: args.capital,
                max_risk_percent: args.max_risk_percent,
                copy_status: CopyStatus::Active,
                settings,
                created_at: Utc::now(),
            };
            db.save_copier(&copier).await?;
            info!(copier = %copier.id, account = %account_id, "Copier registered");
            println!("Copier {} registered (exchange account {})", copier.id, account_id);
        }

        CopierCommands::List => {
            let copiers = db.list_copiers().await?;
            if copiers.is_empty() {
                println!("No copiers registered. Use 'mirrorcopy copier add' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<14} {:<12} {:>12} {:>6} {:<9} {:>10} {:<16}",
                "ID", "USER", "CAPITAL", "MULT", "STATUS", "MAX POS", "ACCOUNT"
            );
            println!("{}", "-".repeat(86));
            for copier in copiers {
                println!(
                    "{:<14} {:<12} {:>12} {:>6} {:<9} {:>10} {:<16}",
                    truncate(&copier.id, 14),
                    truncate(&copier.user_id, 12),
                    copier.capital.to_string(),
                    copier.settings.copy_multiplier.to_string(),
                    copier.copy_status.as_str(),
                    copier.settings.max_position_size.to_string(),
                    copier.exchange_account_id.as_deref().unwrap_or("-")
                );
                if let Some(allowed) = &copier.settings.allowed_symbols {
                    println!("  allowed: {}", allowed.join(","));
                }
                if let Some(blocked) = &copier.settings.blocked_symbols {
                    println!("  blocked: {}", blocked.join(","));
                }
            }
        }

        CopierCommands::SetStatus { id, status } => {
            let current = db
                .get_copier(&id)
                .await?
                .with_context(|| format!("Copier {} not found", id))?;
            if current.copy_status == status {
                println!("Copier {} is already {}", id, status);
                return Ok(());
            }

            engine.reconciler().set_copier_status(&id, status).await?;
            db.log_action(&id, "status_changed", &serde_json::json!({ "status": status }))
                .await?;
            println!("Copier {} is now {}", id, status);
            if status == CopyStatus::Inactive {
                let closing = db.in_flight_symbols(&id).await?.len();
                println!("Closing {} position(s), profits settle once flat.", closing);
            }
        }

        CopierCommands::Settings { id, settings: args } => {
            let mut settings = db
                .get_copier_settings(&id)
                .await?
                .with_context(|| format!("Copier {} not found", id))?;
            args.apply(&mut settings);
            db.update_copier_settings(&id, &settings).await?;
            println!("Settings for {} updated:", id);
            println!("  Max Position Size:  {}", settings.max_position_size);
            println!("  Copy Multiplier:    {}", settings.copy_multiplier);
            let allowed = settings.allowed_symbols.map(|s| s.join(","));
            let blocked = settings.blocked_symbols.map(|s| s.join(","));
            println!("  Allowed Symbols:    {}", allowed.as_deref().unwrap_or("all"));
            println!("  Blocked Symbols:    {}", blocked.as_deref().unwrap_or("none"));
        }

        CopierCommands::Validate { id } => {
            let copier = db
                .get_copier(&id)
                .await?
                .with_context(|| format!("Copier {} not found", id))?;
            let account_id = with_timeout(
                config.request_timeout(),
                factory.connector(&copier.credentials)?.validate_credentials(),
            )
            .await
            .context("Copier credentials are still rejected")?;

            db.set_exchange_account_id(&id, &account_id).await?;
            let synced = SyncStatusRecord::new(&id, SyncMethod::Reconciliation, SyncState::Synced);
            db.upsert_sync_status(&synced).await?;
            let details = serde_json::json!({ "accountId": account_id });
            db.log_action(&id, "credentials_validated", &details).await?;
            println!("Copier {} validated (exchange account {})", id, account_id);
        }
    }

    Ok(())
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
