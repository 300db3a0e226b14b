//! Per-mailbox watch sessions.
//!
//! A [`WatchSession`] connects to one account, opens one mailbox read-only
//! and sits in IMAP IDLE. Whenever IDLE returns it checks for `\Recent`
//! messages and, if there are any, sends one [`Signal`] to the coordinator.
//!
//! # Failure policy
//!
//! Failing to connect, verify the certificate, log in or open the mailbox
//! ends the session for good. Losing the connection while waiting leads to
//! one reconnect through the same steps, so a server that comes back with a
//! different certificate is not retried either.

use crate::config::AccountConfig;
use crate::coordinator::Signal;
use crate::error::{Error, Result};
use crate::transport::{MailboxSession, Transport, WaitOutcome};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Where a watch session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchSessionState {
    /// No connection. Initial state, and the state a failed session ends in.
    Disconnected,
    /// Opening the TCP connection and verifying the server certificate.
    Connecting,
    /// Logging in.
    Authenticating,
    /// Opening the mailbox read-only.
    SelectingMailbox,
    /// Blocked in IDLE.
    Waiting,
    /// IDLE returned; checking for recent messages.
    SignalPending,
    /// Stop requested, logging out.
    Stopping,
    /// Stopped on request.
    Stopped,
}

impl fmt::Display for WatchSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchSessionState::Disconnected => "disconnected",
            WatchSessionState::Connecting => "connecting",
            WatchSessionState::Authenticating => "authenticating",
            WatchSessionState::SelectingMailbox => "selecting-mailbox",
            WatchSessionState::Waiting => "waiting",
            WatchSessionState::SignalPending => "signal-pending",
            WatchSessionState::Stopping => "stopping",
            WatchSessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How [`WatchSession::run`] ended.
#[derive(Debug)]
pub enum SessionExit {
    /// A stop was requested.
    Stopped,
    /// The session gave up; the mailbox is no longer watched.
    Failed(Error),
}

/// Watches one mailbox of one account.
pub struct WatchSession<T: Transport> {
    account: AccountConfig,
    transport: Arc<T>,
    signals: mpsc::UnboundedSender<Signal>,
    stop: CancellationToken,
    state: watch::Sender<WatchSessionState>,
}

impl<T: Transport> fmt::Debug for WatchSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSession")
            .field("account", &self.account.id())
            .field("mailbox", &self.account.mailbox())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> WatchSession<T> {
    /// Creates a session that reports to `signals` and ends when `stop` is
    /// cancelled.
    pub fn new(
        account: AccountConfig,
        transport: Arc<T>,
        signals: mpsc::UnboundedSender<Signal>,
        stop: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WatchSessionState::Disconnected);
        Self {
            account,
            transport,
            signals,
            stop,
            state,
        }
    }

    /// Observes state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WatchSessionState> {
        self.state.subscribe()
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> WatchSessionState {
        *self.state.borrow()
    }

    /// Runs the session until it is stopped or gives up.
    #[instrument(
        name = "WatchSession::run",
        skip_all,
        fields(account = %self.account.id(), mailbox = %self.account.mailbox())
    )]
    pub async fn run(self) -> SessionExit {
        info!(imap_host = %self.account.host(), "Watch session starting");

        loop {
            let mut session = match self.open().await {
                Ok(Some(session)) => session,
                Ok(None) => {
                    self.transition(WatchSessionState::Stopped);
                    return SessionExit::Stopped;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        category = %e.category(),
                        "Watch session giving up"
                    );
                    self.transition(WatchSessionState::Disconnected);
                    return SessionExit::Failed(e);
                }
            };

            match self.watch(&mut session).await {
                Ok(()) => {
                    self.transition(WatchSessionState::Stopping);
                    if let Err(e) = session.logout().await {
                        debug!(error = %e, "Logout failed");
                    }
                    self.transition(WatchSessionState::Stopped);
                    info!("Watch session stopped");
                    return SessionExit::Stopped;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        category = %e.category(),
                        "Connection lost, reconnecting"
                    );
                    self.transition(WatchSessionState::Disconnected);
                }
            }
        }
    }

    /// Connects, logs in and opens the mailbox. `None` if stopped meanwhile.
    async fn open(&self) -> Result<Option<T::Session>> {
        self.transition(WatchSessionState::Connecting);
        let Some(connection) = self
            .until_stopped(self.transport.connect(&self.account))
            .await?
        else {
            return Ok(None);
        };

        self.transition(WatchSessionState::Authenticating);
        let Some(mut session) = self
            .until_stopped(self.transport.login(connection, &self.account))
            .await?
        else {
            return Ok(None);
        };

        self.transition(WatchSessionState::SelectingMailbox);
        if self
            .until_stopped(session.examine(self.account.mailbox()))
            .await?
            .is_none()
        {
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// IDLE loop. Returns `Ok` once stopped, `Err` when the connection broke.
    async fn watch(&self, session: &mut T::Session) -> Result<()> {
        loop {
            self.transition(WatchSessionState::Waiting);

            let outcome = match session.idle(&self.stop).await {
                Ok(outcome) => outcome,
                Err(_) if self.stop.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            };
            if outcome == WaitOutcome::Stopped || self.stop.is_cancelled() {
                return Ok(());
            }

            self.transition(WatchSessionState::SignalPending);
            let recent = session.recent_count().await?;
            debug!(recent, ?outcome, "IDLE returned");

            if recent > 0 && !self.stop.is_cancelled() {
                info!(recent, "New mail");
                let signal = Signal::new(self.account.id(), self.account.mailbox());
                if self.signals.send(signal).is_err() {
                    debug!("Coordinator is gone, signal dropped");
                }
            }
        }
    }

    async fn until_stopped<O>(&self, operation: impl Future<Output = Result<O>>) -> Result<Option<O>> {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Ok(None),
            result = operation => result.map(Some),
        }
    }

    fn transition(&self, next: WatchSessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, state = %next, "State transition");
        }
    }
}
