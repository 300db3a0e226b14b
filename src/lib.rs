//! # idle-sync
//!
//! Watches IMAP mailboxes with IDLE and runs `mbsync` in batches when new
//! mail arrives, instead of polling on a fixed interval.
//!
//! This crate provides:
//! - One long-lived [`WatchSession`] per watched mailbox, trusting the server
//!   only if it presents a pinned certificate ([`verify`])
//! - An [`EventCoordinator`] that debounces new-mail signals from all
//!   sessions into one sync per burst, with a periodic full sync when
//!   nothing happens
//! - A [`SyncInvoker`] that hands passwords to the sync program through a
//!   named pipe in a private directory, never through a file on disk
//!
//! ## Quick Start
//!
//! ```no_run
//! use idle_sync::{MbsyncConfig, Supervisor, WatcherConfig};
//!
//! # async fn example() -> idle_sync::Result<()> {
//! // Accounts come from the sync program's own configuration file
//! let mbsyncrc = MbsyncConfig::load("/home/me/.mbsyncrc").await?;
//! let accounts = mbsyncrc.accounts(&["work:INBOX".to_string()]).await?;
//!
//! let supervisor = Supervisor::new(WatcherConfig::default(), mbsyncrc.source(), accounts);
//! supervisor.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Running a Single Sync
//!
//! ```no_run
//! use idle_sync::{MbsyncConfig, Signal, SyncInvoker, TriggerBatch};
//! use std::collections::BTreeSet;
//!
//! # async fn example() -> idle_sync::Result<()> {
//! let mbsyncrc = MbsyncConfig::load("/home/me/.mbsyncrc").await?;
//! let accounts = mbsyncrc.accounts(&[]).await?;
//! let invoker = SyncInvoker::new("mbsync", mbsyncrc.source(), accounts);
//!
//! let batch = TriggerBatch::Targets(BTreeSet::from([Signal::new("work", "INBOX")]));
//! let report = invoker.invoke(&batch).await?;
//! println!("mbsync exited with {:?}", report.exit_code);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All errors implement `std::error::Error` and provide context. Use
//! [`Error::category`] as a structured log field, and
//! [`Error::verification_failure`] to tell why a certificate was refused:
//!
//! ```
//! use idle_sync::Error;
//!
//! fn handle_error(error: &Error) {
//!     match error.verification_failure() {
//!         Some(reason) => println!("Untrusted server: {reason}"),
//!         None => println!("{} error: {error}", error.category()),
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation. All major operations emit
//! spans with structured fields.
//!
//! ### Span Naming Convention
//!
//! - `Supervisor::run` - Process lifetime
//! - `WatchSession::run` - One watched mailbox
//! - `EventCoordinator::run` - Debounce loop
//! - `SyncInvoker::invoke` - One sync program run
//! - `ImapTransport::connect` / `ImapTransport::login` - Session setup
//! - `connection::establish_tls` - TLS connection with pinning
//! - `session::idle` - One IDLE cycle
//!
//! ### Standard Fields
//!
//! - `account` - Account identifier
//! - `mailbox` - Mailbox name
//! - `imap_host` - IMAP server hostname
//! - `targets` - Sync targets of a batch
//! - `category` - [`ErrorCategory`] of a logged error

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod config;
pub mod coordinator;
pub mod error;
pub mod invoker;
pub mod mbsyncrc;
pub mod supervisor;
pub mod transport;
pub mod verify;
pub mod watch;

// Internal modules
mod connection;
mod session;

// Re-exports for ergonomic API
pub use config::{
    AccountConfig, AccountConfigBuilder, CredentialMap, SecurityMode, TimeoutConfig, WatcherConfig,
};
pub use coordinator::{EventCoordinator, Signal, SyncAction, TriggerBatch};
pub use error::{Error, ErrorCategory, Result};
pub use invoker::{Notifier, SyncInvoker, SyncReport};
pub use mbsyncrc::{substitute_credentials, MbsyncConfig};
pub use supervisor::Supervisor;
pub use transport::{ImapTransport, MailboxSession, Transport, WaitOutcome};
pub use verify::{CertificateVerifier, PinnedCertificate, VerificationError};
pub use watch::{SessionExit, WatchSession, WatchSessionState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_api_accessible() {
        // Ensure all public types are accessible
        let _ = AccountConfig::builder();
        let _ = WatcherConfig::default();
        let _ = TriggerBatch::All.args();
        let _ = Signal::new("work", "INBOX");
    }
}
