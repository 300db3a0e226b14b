//! The network seam of a watch session.
//!
//! [`WatchSession`](crate::watch::WatchSession) drives its state machine
//! against the [`Transport`] and [`MailboxSession`] traits. [`ImapTransport`]
//! is the real implementation; tests substitute scripted ones.

use crate::config::{AccountConfig, TimeoutConfig};
use crate::connection::{self, TlsStream};
use crate::error::{Error, Result};
use crate::session::{self, AuthConfig, ImapSession};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub use crate::session::WaitOutcome;

/// Opens authenticated sessions to an account's server.
pub trait Transport: Send + Sync + 'static {
    /// A secured connection that has not logged in yet.
    type Connection: Send;
    /// An authenticated session.
    type Session: MailboxSession;

    /// Connects to the server and completes the TLS handshake, including
    /// certificate pinning.
    fn connect(
        &self,
        account: &AccountConfig,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Logs in on a connection.
    fn login(
        &self,
        connection: Self::Connection,
        account: &AccountConfig,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// Mailbox operations a watch session needs once logged in.
pub trait MailboxSession: Send + 'static {
    /// Opens `mailbox` read-only.
    fn examine(&mut self, mailbox: &str) -> impl Future<Output = Result<()>> + Send;

    /// Waits in IDLE until the server reports activity, the refresh interval
    /// elapses, or `stop` is cancelled.
    fn idle(&mut self, stop: &CancellationToken)
        -> impl Future<Output = Result<WaitOutcome>> + Send;

    /// Number of `\Recent` messages in the open mailbox.
    fn recent_count(&mut self) -> impl Future<Output = Result<usize>> + Send;

    /// Ends the session.
    fn logout(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// [`Transport`] over TCP with pinned TLS and async-imap.
#[derive(Debug, Clone, Default)]
pub struct ImapTransport {
    timeouts: TimeoutConfig,
}

impl ImapTransport {
    /// Creates a transport using the given timeouts.
    #[must_use]
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self { timeouts }
    }
}

impl Transport for ImapTransport {
    type Connection = TlsStream;
    type Session = ImapMailbox;

    #[instrument(name = "ImapTransport::connect", skip_all, fields(account = %account.id()))]
    async fn connect(&self, account: &AccountConfig) -> Result<TlsStream> {
        let target_addr = account.server_address();
        let timeout = self.timeouts.connect;

        let tls_stream =
            tokio::time::timeout(timeout, connection::establish_tls_connection(account))
                .await
                .map_err(|_| Error::ConnectTimeout {
                    target: target_addr,
                    timeout,
                })??;

        debug!("TLS connection established");
        Ok(tls_stream)
    }

    #[instrument(name = "ImapTransport::login", skip_all, fields(account = %account.id()))]
    async fn login(&self, connection: TlsStream, account: &AccountConfig) -> Result<ImapMailbox> {
        let auth_config = AuthConfig {
            username: account.username(),
            password: account.password(),
        };
        let timeout = self.timeouts.auth;

        let session = tokio::time::timeout(timeout, session::authenticate(connection, &auth_config))
            .await
            .map_err(|_| Error::AuthTimeout {
                user: account.username().to_string(),
                timeout,
            })??;

        debug!("Authenticated");

        Ok(ImapMailbox {
            session: Some(session),
            mailbox: account.mailbox().to_string(),
            timeouts: self.timeouts.clone(),
        })
    }
}

/// An authenticated async-imap session.
///
/// A failed IDLE leaves the session without a connection; every further
/// operation then returns [`Error::SessionClosed`].
pub struct ImapMailbox {
    session: Option<ImapSession>,
    mailbox: String,
    timeouts: TimeoutConfig,
}

impl std::fmt::Debug for ImapMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailbox")
            .field("mailbox", &self.mailbox)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl ImapMailbox {
    fn session(&mut self) -> Result<&mut ImapSession> {
        self.session.as_mut().ok_or_else(|| Error::SessionClosed {
            mailbox: self.mailbox.clone(),
        })
    }
}

impl MailboxSession for ImapMailbox {
    async fn examine(&mut self, mailbox: &str) -> Result<()> {
        let timeout = self.timeouts.select;
        let session = self.session()?;

        tokio::time::timeout(timeout, session::examine_mailbox(session, mailbox))
            .await
            .map_err(|_| Error::SelectTimeout {
                mailbox: mailbox.to_string(),
                timeout,
            })??;

        self.mailbox = mailbox.to_string();
        Ok(())
    }

    async fn idle(&mut self, stop: &CancellationToken) -> Result<WaitOutcome> {
        let session = self.session.take().ok_or_else(|| Error::SessionClosed {
            mailbox: self.mailbox.clone(),
        })?;

        let (session, outcome) = session::idle(
            session,
            self.timeouts.idle_refresh,
            self.timeouts.logout,
            stop,
        )
        .await?;
        self.session = Some(session);
        Ok(outcome)
    }

    async fn recent_count(&mut self) -> Result<usize> {
        let timeout = self.timeouts.recent;
        let session = self.session()?;

        tokio::time::timeout(timeout, session::recent_count(session))
            .await
            .map_err(|_| Error::RecentTimeout { timeout })?
    }

    async fn logout(&mut self) -> Result<()> {
        let timeout = self.timeouts.logout;
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        tokio::time::timeout(timeout, session::logout(&mut session))
            .await
            .map_err(|_| Error::LogoutTimeout { timeout })?
    }
}
