//! Debouncing of new-mail signals into sync batches.
//!
//! All watch sessions feed one unbounded channel. The [`EventCoordinator`]
//! is its only consumer:
//!
//! 1. Wait up to the idle timeout for a signal. None arriving means a full
//!    sync ([`TriggerBatch::All`]).
//! 2. The first signal opens a settle window with a fixed end time. Signals
//!    received before that deadline join the batch; later ones do not move
//!    it.
//! 3. The deduplicated batch is handed to the [`SyncAction`], and the next
//!    cycle only starts once that call has returned.

use crate::error::Result;
use crate::invoker::SyncReport;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// "New mail observed" for one account/mailbox pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal {
    account: String,
    mailbox: String,
}

impl Signal {
    /// Creates a signal for `mailbox` of `account`.
    pub fn new(account: impl Into<String>, mailbox: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            mailbox: mailbox.into(),
        }
    }

    /// The account identifier.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// The mailbox name.
    #[must_use]
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }
}

/// Formats as `account:mailbox`, the sync program's target syntax.
impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account, self.mailbox)
    }
}

/// What one sync invocation should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerBatch {
    /// Every configured account.
    All,
    /// The listed targets, each exactly once.
    Targets(BTreeSet<Signal>),
}

impl TriggerBatch {
    /// Returns `true` for the full-sync batch.
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, TriggerBatch::All)
    }

    /// Target arguments for the sync program: `-a` or `account:mailbox...`.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        match self {
            TriggerBatch::All => vec!["-a".to_string()],
            TriggerBatch::Targets(targets) => targets.iter().map(Signal::to_string).collect(),
        }
    }
}

impl fmt::Display for TriggerBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerBatch::All => f.write_str("all"),
            TriggerBatch::Targets(_) => f.write_str(&self.args().join(" ")),
        }
    }
}

/// The downstream action run for every batch.
pub trait SyncAction: Send {
    /// Synchronizes `batch`. Returns once the sync has finished.
    fn sync(&mut self, batch: &TriggerBatch) -> impl Future<Output = Result<SyncReport>> + Send;
}

/// Single consumer of the signal channel.
pub struct EventCoordinator<A> {
    signals: mpsc::UnboundedReceiver<Signal>,
    action: A,
    idle_timeout: Duration,
    settle_window: Duration,
    closed: bool,
}

impl<A: SyncAction> EventCoordinator<A> {
    /// Creates a coordinator draining `signals` into `action`.
    pub fn new(
        signals: mpsc::UnboundedReceiver<Signal>,
        action: A,
        idle_timeout: Duration,
        settle_window: Duration,
    ) -> Self {
        Self {
            signals,
            action,
            idle_timeout,
            settle_window,
            closed: false,
        }
    }

    /// Runs cycles until `stop` is cancelled.
    ///
    /// A stop only interrupts the wait for signals; a sync that is already
    /// running is allowed to finish.
    #[instrument(name = "EventCoordinator::run", skip_all)]
    pub async fn run(mut self, stop: CancellationToken) {
        info!(
            idle_timeout = ?self.idle_timeout,
            settle_window = ?self.settle_window,
            "Coordinator started"
        );

        loop {
            let batch = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                batch = self.next_batch() => batch,
            };
            self.dispatch(&batch).await;
        }

        info!("Coordinator stopped");
    }

    /// Collects the next batch.
    ///
    /// Once every sender is gone the channel can never yield again, so each
    /// call simply waits out the idle timeout and returns a full sync.
    pub async fn next_batch(&mut self) -> TriggerBatch {
        let idle_deadline = Instant::now() + self.idle_timeout;

        let first = if self.closed {
            None
        } else {
            match tokio::time::timeout_at(idle_deadline, self.signals.recv()).await {
                Ok(Some(signal)) => Some(signal),
                Ok(None) => {
                    warn!("All watch sessions have exited, falling back to periodic full sync");
                    self.closed = true;
                    None
                }
                Err(_) => None,
            }
        };

        let Some(first) = first else {
            tokio::time::sleep_until(idle_deadline).await;
            debug!("No signals within idle timeout");
            return TriggerBatch::All;
        };

        debug!(signal = %first, "Opening settle window");

        let settle_deadline = Instant::now() + self.settle_window;
        let mut targets = BTreeSet::from([first]);

        loop {
            match tokio::time::timeout_at(settle_deadline, self.signals.recv()).await {
                Ok(Some(signal)) => {
                    debug!(signal = %signal, "Signal joined batch");
                    targets.insert(signal);
                }
                Ok(None) => {
                    self.closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        TriggerBatch::Targets(targets)
    }

    async fn dispatch(&mut self, batch: &TriggerBatch) {
        info!(targets = %batch, "Running sync");

        match self.action.sync(batch).await {
            Ok(report) if report.success => {
                info!(targets = %batch, "Sync finished");
            }
            Ok(report) => {
                warn!(targets = %batch, exit_code = ?report.exit_code, "Sync program failed");
            }
            Err(e) => {
                error!(
                    targets = %batch,
                    error = %e,
                    category = %e.category(),
                    "Sync invocation failed"
                );
            }
        }
    }
}
