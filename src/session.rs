//! Internal IMAP session management.
//!
//! This module wraps async-imap operations with proper error handling.

use crate::connection::TlsStream;
use crate::error::{Error, Result};
use async_imap::extensions::idle::IdleResponse;
use async_imap::Session;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Type alias for IMAP session over TLS.
pub(crate) type ImapSession = Session<TlsStream>;

/// How a single IDLE wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The server pushed an untagged response.
    NewData,
    /// The refresh interval elapsed without server activity.
    TimedOut,
    /// A stop was requested while waiting.
    Stopped,
}

/// Authentication configuration for IMAP.
pub(crate) struct AuthConfig<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Authenticates to IMAP server and returns a session.
#[instrument(
    name = "session::authenticate",
    skip_all,
    fields(username = %config.username)
)]
pub(crate) async fn authenticate(
    tls_stream: TlsStream,
    config: &AuthConfig<'_>,
) -> Result<ImapSession> {
    let client = async_imap::Client::new(tls_stream);

    debug!("Authenticating to IMAP server");

    client
        .login(config.username, config.password)
        .await
        .map_err(|e| Error::ImapLogin {
            user: config.username.to_string(),
            source: e.0,
        })
}

/// Opens a mailbox read-only.
#[instrument(name = "session::examine", skip(session), fields(mailbox = %mailbox))]
pub(crate) async fn examine_mailbox(session: &mut ImapSession, mailbox: &str) -> Result<()> {
    debug!("Examining mailbox");

    let status = session
        .examine(mailbox)
        .await
        .map_err(|source| Error::SelectMailbox {
            mailbox: mailbox.to_string(),
            source,
        })?;

    debug!(exists = status.exists, recent = status.recent, "Mailbox opened");

    Ok(())
}

/// Runs one IDLE cycle.
///
/// Returns the session together with the outcome; the session is unusable
/// if this fails. Ending IDLE with `DONE` is bounded by `done_timeout`.
#[instrument(name = "session::idle", skip_all, fields(refresh = ?refresh))]
pub(crate) async fn idle(
    session: ImapSession,
    refresh: Duration,
    done_timeout: Duration,
    stop: &CancellationToken,
) -> Result<(ImapSession, WaitOutcome)> {
    let mut handle = session.idle();
    handle.init().await.map_err(|source| Error::Idle { source })?;

    debug!("IDLE started");

    let outcome = {
        let (idle_wait, interrupt) = handle.wait_with_timeout(refresh);
        let mut idle_wait = std::pin::pin!(idle_wait);

        let response = tokio::select! {
            biased;
            () = stop.cancelled() => {
                drop(interrupt);
                idle_wait.await.map(|_| WaitOutcome::Stopped)
            }
            response = &mut idle_wait => response.map(|response| match response {
                IdleResponse::NewData(_) => WaitOutcome::NewData,
                IdleResponse::Timeout => WaitOutcome::TimedOut,
                IdleResponse::ManualInterrupt => WaitOutcome::Stopped,
            }),
        };
        response.map_err(|source| Error::Idle { source })?
    };

    let session = tokio::time::timeout(done_timeout, handle.done())
        .await
        .map_err(|_| Error::LogoutTimeout {
            timeout: done_timeout,
        })?
        .map_err(|source| Error::Idle { source })?;

    debug!(?outcome, "IDLE finished");

    Ok((session, outcome))
}

/// Counts the messages flagged `\Recent` in the open mailbox.
#[instrument(name = "session::recent_count", skip(session))]
pub(crate) async fn recent_count(session: &mut ImapSession) -> Result<usize> {
    // NOOP to ensure we have latest state
    session
        .noop()
        .await
        .map_err(|source| Error::ImapNoop { source })?;

    let recent = session
        .search("RECENT")
        .await
        .map_err(|source| Error::ImapSearch { source })?;

    debug!(recent = recent.len(), "Retrieved recent count");

    Ok(recent.len())
}

/// Logs out from IMAP session.
#[instrument(name = "session::logout", skip(session))]
pub(crate) async fn logout(session: &mut ImapSession) -> Result<()> {
    debug!("Logging out");

    session
        .logout()
        .await
        .map_err(|source| Error::ImapLogout { source })?;

    Ok(())
}
