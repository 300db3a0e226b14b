//! Error types for the idle-sync crate.
//!
//! All errors implement [`std::error::Error`] and carry the account, mailbox or
//! path they relate to. Errors are grouped by [`ErrorCategory`] for structured
//! logging, see [`Error::category`].

use crate::verify::VerificationError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while watching mailboxes or running the sync program.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid configuration provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration file {}", path.display())]
    ReadConfig {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The password command of an account could not be executed.
    #[error("failed to run password command for account '{account}'")]
    PasswordCommand {
        /// The account whose `PassCmd` failed.
        account: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The password command of an account exited unsuccessfully.
    #[error("password command for account '{account}' exited with {status}")]
    PasswordCommandFailed {
        /// The account whose `PassCmd` failed.
        account: String,
        /// Exit status of the command.
        status: std::process::ExitStatus,
    },

    /// The pinned certificate file could not be read.
    #[error("failed to read pinned certificate {}", path.display())]
    LoadCertificate {
        /// Path of the certificate file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The pinned certificate file does not hold a usable certificate.
    #[error("invalid pinned certificate {}: {reason}", path.display())]
    InvalidCertificate {
        /// Path of the certificate file.
        path: PathBuf,
        /// Why the certificate could not be used.
        reason: VerificationError,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Network / connection errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server refused to upgrade the plaintext connection.
    #[error("STARTTLS rejected by {target}")]
    StartTls {
        /// The target address.
        target: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Certificate verification errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The server certificate did not match the pinned certificate or host.
    #[error("certificate of {host} rejected: {reason}")]
    CertificateRejected {
        /// The configured server host.
        host: String,
        /// Which check failed.
        reason: VerificationError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Timeout errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Authentication timeout.
    #[error("authentication timeout for {user} after {timeout:?}")]
    AuthTimeout {
        /// The user name used for authentication.
        user: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Mailbox selection timeout.
    #[error("mailbox selection timeout for '{mailbox}' after {timeout:?}")]
    SelectTimeout {
        /// The mailbox name.
        mailbox: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Timeout while querying the recent count after IDLE.
    #[error("recent count query timeout after {timeout:?}")]
    RecentTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Logout timeout (not critical).
    #[error("logout timeout after {timeout:?}")]
    LogoutTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors
    // ─────────────────────────────────────────────────────────────────────────
    /// IMAP login failed.
    #[error("IMAP login failed for {user}")]
    ImapLogin {
        /// The user name used for login.
        user: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to open the mailbox read-only.
    #[error("failed to select mailbox '{mailbox}'")]
    SelectMailbox {
        /// The mailbox name.
        mailbox: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IDLE failed or the connection dropped while idling.
    #[error("IMAP IDLE failed")]
    Idle {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// The session was used after its connection was lost.
    #[error("IMAP session for '{mailbox}' is no longer connected")]
    SessionClosed {
        /// The mailbox the session had open.
        mailbox: String,
    },

    /// IMAP NOOP failed.
    #[error("IMAP NOOP command failed")]
    ImapNoop {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP search failed.
    #[error("IMAP search failed")]
    ImapSearch {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Sync invocation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The private directory or the named pipe could not be created.
    #[error("failed to create configuration conduit in {}", path.display())]
    CreateConduit {
        /// The directory or pipe path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the rewritten configuration into the conduit failed.
    #[error("failed to write configuration into conduit {}", path.display())]
    WriteConduit {
        /// The pipe path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The conduit writer task panicked or was cancelled.
    #[error("conduit writer task failed")]
    ConduitTask {
        /// The underlying join error.
        #[source]
        source: tokio::task::JoinError,
    },

    /// The sync program could not be started or waited on.
    #[error("failed to run sync program {}", program.display())]
    SpawnSync {
        /// The sync program path.
        program: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidConfig { .. }
            | Error::ReadConfig { .. }
            | Error::PasswordCommand { .. }
            | Error::PasswordCommandFailed { .. }
            | Error::LoadCertificate { .. }
            | Error::InvalidCertificate { .. }
            | Error::InvalidDnsName { .. } => ErrorCategory::Configuration,

            Error::TcpConnect { .. } | Error::TlsConnect { .. } | Error::StartTls { .. } => {
                ErrorCategory::Network
            }

            Error::CertificateRejected { .. } => ErrorCategory::Verification,

            Error::ConnectTimeout { .. }
            | Error::AuthTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::RecentTimeout { .. }
            | Error::LogoutTimeout { .. } => ErrorCategory::Timeout,

            Error::ImapLogin { .. }
            | Error::SelectMailbox { .. }
            | Error::Idle { .. }
            | Error::SessionClosed { .. }
            | Error::ImapNoop { .. }
            | Error::ImapSearch { .. }
            | Error::ImapLogout { .. } => ErrorCategory::Protocol,

            Error::CreateConduit { .. }
            | Error::WriteConduit { .. }
            | Error::ConduitTask { .. }
            | Error::SpawnSync { .. } => ErrorCategory::Sync,
        }
    }

    /// Returns the verification failure if this error is a rejected certificate.
    #[must_use]
    pub fn verification_failure(&self) -> Option<&VerificationError> {
        match self {
            Error::CertificateRejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Error categories for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration or validation errors.
    Configuration,
    /// Network connectivity errors.
    Network,
    /// Server certificate did not pass pinning or hostname checks.
    Verification,
    /// Timeout errors.
    Timeout,
    /// IMAP protocol errors.
    Protocol,
    /// Failures around the external sync program and its conduit.
    Sync,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Verification => write!(f, "verification"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Sync => write!(f, "sync"),
        }
    }
}
