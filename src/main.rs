//! idle-sync - run mbsync when IMAP IDLE reports new mail.

use clap::Parser;
use idle_sync::{MbsyncConfig, Supervisor, WatcherConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Watch IMAP mailboxes with IDLE and sync them with mbsync on new mail.
#[derive(Debug, Parser)]
#[command(name = "idle-sync", version, about)]
struct Cli {
    /// mbsync configuration file to read accounts from and pass to mbsync.
    #[arg(short = 'c', long = "config", default_value = "~/.mbsyncrc")]
    config: String,

    /// The sync program to run.
    #[arg(long = "mbsync", default_value = "mbsync")]
    mbsync: PathBuf,

    /// Run a full sync after this long without new mail.
    #[arg(long, default_value = "3m", value_parser = humantime::parse_duration)]
    idle_timeout: Duration,

    /// How long to collect further new-mail signals before syncing.
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    settle: Duration,

    /// Do not run a full sync before watching.
    #[arg(long)]
    no_initial_sync: bool,

    /// Show a desktop notification (notify-send) after syncing new mail.
    #[arg(long)]
    notify: bool,

    /// Mailboxes to watch, as `account` (INBOX) or `account:mailbox`.
    /// Defaults to the INBOX of every IMAP account.
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> idle_sync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("idle_sync=info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = PathBuf::from(shellexpand::tilde(&cli.config).as_ref());
    let mbsyncrc = MbsyncConfig::load(&config_path).await?;
    let accounts = mbsyncrc.accounts(&cli.targets).await?;

    info!(
        config = %config_path.display(),
        targets = accounts.len(),
        "Loaded accounts"
    );

    let config = WatcherConfig {
        idle_timeout: cli.idle_timeout,
        settle_window: cli.settle,
        initial_sync: !cli.no_initial_sync,
        sync_program: cli.mbsync,
        notify_program: cli.notify.then(|| PathBuf::from("notify-send")),
        ..WatcherConfig::default()
    };

    Supervisor::new(config, mbsyncrc.source(), accounts)
        .run(shutdown_signal())
        .await
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
        () = terminate => {}
    }
}
