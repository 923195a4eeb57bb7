//! CLI binary for vault-sync.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vault_sync::{
    JsonFileStore, Notice, NotificationSink, SchedulerConfig, SchedulerHandle, SettingsPatch,
    StopPolicy, SyncOutcome, SyncScheduler,
};

/// Scheduled vault synchronization.
#[derive(Parser)]
#[command(name = "vault-sync", version, about)]
struct Cli {
    /// Vault root the sync script runs in.
    #[arg(long, env = "VAULT_SYNC_VAULT", default_value = ".")]
    vault: PathBuf,

    /// Settings document (defaults to the platform config directory).
    #[arg(long, env = "VAULT_SYNC_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler in the foreground until Ctrl+C.
    Run,

    /// Sync once now.
    Sync {
        /// Commit message (defaults to a timestamp).
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show auto-sync state, last sync and total syncs.
    Status,

    /// Turn auto-sync on or off.
    Toggle,

    /// Set the auto-sync interval in minutes (1-60).
    Interval { minutes: u32 },

    /// Reset the sync counter.
    Reset,

    /// Show settings, or apply a JSON patch such as '{"showNotifications":false}'.
    Config {
        #[arg(long, value_name = "JSON")]
        set: Option<String>,
    },
}

/// Prints notices to the terminal.
struct ConsoleSink;

impl NotificationSink for ConsoleSink {
    fn notify(&self, notice: &Notice) {
        println!("{}", notice.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Command::Run => "vault_sync=info",
        _ => "vault_sync=warn",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let store = match &cli.settings {
        Some(path) => JsonFileStore::new(path),
        None => JsonFileStore::default_location(),
    };
    let mut config =
        SchedulerConfig::new(&cli.vault, Arc::new(store)).with_sink(Arc::new(ConsoleSink));
    if !matches!(cli.command, Command::Run) {
        config = config.without_startup_sync();
    }

    let scheduler = SyncScheduler::start(config).context("cannot load settings")?;
    let result = run_command(&scheduler, cli.command).await;
    scheduler.stop(StopPolicy::Drain).await?;
    result
}

async fn run_command(scheduler: &SchedulerHandle, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run => run_foreground(scheduler).await,
        Command::Sync { message } => match scheduler.manual_sync(message).await? {
            SyncOutcome::Failure { error_message } => {
                anyhow::bail!("sync failed: {error_message}")
            }
            SyncOutcome::Success { .. } => Ok(()),
        },
        Command::Status => {
            scheduler.show_status().await?;
            Ok(())
        }
        Command::Toggle => {
            scheduler.toggle_auto().await?;
            Ok(())
        }
        Command::Interval { minutes } => {
            scheduler.change_interval(minutes).await?;
            println!("Auto-sync interval set to {minutes} minutes");
            Ok(())
        }
        Command::Reset => {
            scheduler.reset_counter().await?;
            Ok(())
        }
        Command::Config { set: None } => {
            let settings = scheduler.settings().await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Config { set: Some(raw) } => {
            let patch: SettingsPatch =
                serde_json::from_str(&raw).context("invalid settings patch")?;
            let settings = scheduler.update_settings(patch).await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run_foreground(scheduler: &SchedulerHandle) -> anyhow::Result<()> {
    let status = scheduler.status().await?;
    println!("vault-sync v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", status.status_line());
    println!("Press Ctrl+C to stop.");

    let cancel = scheduler.shutdown_token();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("cannot listen for Ctrl+C")?;
            info!("received Ctrl+C, shutting down...");
        }
        () = cancel.cancelled() => {}
    }
    Ok(())
}
