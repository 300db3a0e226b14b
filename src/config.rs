//! Configuration for watched accounts and for the watcher itself.
//!
//! Use [`AccountConfigBuilder`] to create a validated account record:
//!
//! ```
//! use idle_sync::{AccountConfig, SecurityMode};
//!
//! let account = AccountConfig::builder()
//!     .id("work")
//!     .host("imap.example.org")
//!     .security(SecurityMode::ImplicitTls)
//!     .certificate_file("/home/me/.certs/imap.example.org.pem")
//!     .username("me@example.org")
//!     .password("secret")
//!     .mailbox("INBOX")
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(account.port(), 993);
//! ```

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the connection is secured before authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    /// Connect in plaintext and upgrade with `STARTTLS` (usually port 143).
    StartTls,
    /// Perform the TLS handshake immediately after connecting (usually port 993).
    ImplicitTls,
}

impl SecurityMode {
    /// Default IMAP port for this mode.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            SecurityMode::StartTls => 143,
            SecurityMode::ImplicitTls => 993,
        }
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::StartTls => write!(f, "starttls"),
            SecurityMode::ImplicitTls => write!(f, "implicit-tls"),
        }
    }
}

/// One watched (account, mailbox) pair.
///
/// Created once at startup and never mutated. The `password` is already
/// resolved and is stored as a [`SecretString`] so it cannot be logged by
/// accident.
#[derive(Clone)]
pub struct AccountConfig {
    id: String,
    host: String,
    port: u16,
    security: SecurityMode,
    certificate_file: PathBuf,
    username: String,
    password: SecretString,
    mailbox: String,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("certificate_file", &self.certificate_file)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

impl AccountConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> AccountConfigBuilder {
        AccountConfigBuilder::default()
    }

    /// Account identifier (also the sync program's channel name).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// IMAP server host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// IMAP server port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connection security mode.
    #[must_use]
    pub fn security(&self) -> SecurityMode {
        self.security
    }

    /// Path of the pinned server certificate.
    #[must_use]
    pub fn certificate_file(&self) -> &Path {
        &self.certificate_file
    }

    /// User name for login.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password as a string slice.
    ///
    /// Use this method only when handing the password to authentication or to
    /// the credential conduit.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Mailbox watched by this record.
    #[must_use]
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Returns the server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for [`AccountConfig`].
#[derive(Debug, Default)]
pub struct AccountConfigBuilder {
    id: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    security: Option<SecurityMode>,
    certificate_file: Option<PathBuf>,
    username: Option<String>,
    password: Option<SecretString>,
    mailbox: Option<String>,
}

impl AccountConfigBuilder {
    /// Sets the account identifier (required).
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the IMAP server host name (required).
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the IMAP server port.
    ///
    /// Defaults to the port of the security mode.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode (default: STARTTLS).
    #[must_use]
    pub fn security(mut self, security: SecurityMode) -> Self {
        self.security = Some(security);
        self
    }

    /// Sets the pinned certificate file (required).
    #[must_use]
    pub fn certificate_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_file = Some(path.into());
        self
    }

    /// Sets the login user name (required).
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the resolved password (required).
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Sets the mailbox to watch (default: `INBOX`).
    #[must_use]
    pub fn mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing or empty.
    pub fn build(self) -> Result<AccountConfig> {
        let id = required(self.id, "account identifier")?;
        let host = required(self.host, &format!("host of account '{id}'"))?;
        let username = required(self.username, &format!("user of account '{id}'"))?;
        let mailbox = self.mailbox.unwrap_or_else(|| "INBOX".to_string());
        if mailbox.is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("mailbox of account '{id}' is empty"),
            });
        }

        let password = self.password.ok_or_else(|| Error::InvalidConfig {
            message: format!("password of account '{id}' is required"),
        })?;

        let certificate_file = self.certificate_file.ok_or_else(|| Error::InvalidConfig {
            message: format!("certificate file of account '{id}' is required"),
        })?;

        let security = self.security.unwrap_or(SecurityMode::StartTls);

        Ok(AccountConfig {
            port: self.port.unwrap_or_else(|| security.default_port()),
            id,
            host,
            security,
            certificate_file,
            username,
            password,
            mailbox,
        })
    }
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::InvalidConfig {
            message: format!("{what} is required"),
        }),
    }
}

/// Account passwords keyed by account identifier.
///
/// Built fresh for each sync invocation and dropped right after it.
#[derive(Default)]
pub struct CredentialMap {
    passwords: HashMap<String, SecretString>,
}

impl CredentialMap {
    /// Collects the password of every account, one entry per identifier.
    #[must_use]
    pub fn from_accounts(accounts: &[AccountConfig]) -> Self {
        let passwords = accounts
            .iter()
            .map(|account| (account.id.clone(), account.password.clone()))
            .collect();
        Self { passwords }
    }

    /// Adds or replaces the password of an account.
    pub fn insert(&mut self, account: impl Into<String>, password: impl Into<String>) {
        self.passwords
            .insert(account.into(), SecretString::from(password.into()));
    }

    /// Returns the password of an account.
    #[must_use]
    pub fn get(&self, account: &str) -> Option<&str> {
        self.passwords.get(account).map(|password| password.expose_secret())
    }

    /// Returns `true` if the account has a password in the map.
    #[must_use]
    pub fn contains(&self, account: &str) -> bool {
        self.passwords.contains_key(account)
    }

    /// Number of accounts in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    /// Returns `true` if the map holds no passwords.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }
}

impl std::fmt::Debug for CredentialMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.passwords.keys()).finish()
    }
}

/// Timeout configuration for the phases of a watch session.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for opening the mailbox.
    pub select: Duration,
    /// Timeout for the recent-count query after IDLE returns.
    pub recent: Duration,
    /// Timeout for logout operation.
    pub logout: Duration,
    /// How long a single IDLE may run before it is re-issued.
    pub idle_refresh: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(20),
            auth: Duration::from_secs(30),
            select: Duration::from_secs(10),
            recent: Duration::from_secs(10),
            logout: Duration::from_secs(5),
            idle_refresh: Duration::from_secs(29 * 60),
        }
    }
}

/// Settings of the watcher process as a whole.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Longest wait for a signal before a full sync is triggered.
    pub idle_timeout: Duration,
    /// Window after the first signal during which further signals join the batch.
    pub settle_window: Duration,
    /// Delay between starting consecutive watch sessions.
    pub start_stagger: Duration,
    /// Run a full sync before the watch sessions start.
    pub initial_sync: bool,
    /// The external sync program.
    pub sync_program: PathBuf,
    /// Directory under which the private conduit directory is created.
    pub runtime_dir: PathBuf,
    /// Desktop notification command run after targeted syncs.
    pub notify_program: Option<PathBuf>,
    /// Network timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3 * 60),
            settle_window: Duration::from_secs(3),
            start_stagger: Duration::from_millis(250),
            initial_sync: true,
            sync_program: PathBuf::from("mbsync"),
            runtime_dir: default_runtime_dir(),
            notify_program: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// `$XDG_RUNTIME_DIR` when set (usually a per-user tmpfs), otherwise the
/// system temporary directory.
fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(std::env::temp_dir, PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> AccountConfigBuilder {
        AccountConfig::builder()
            .id("work")
            .host("imap.example.org")
            .certificate_file("/tmp/cert.pem")
            .username("me")
            .password("secret")
    }

    #[test]
    fn test_builder_minimal() {
        let account = builder().build().unwrap();

        assert_eq!(account.id(), "work");
        assert_eq!(account.password(), "secret");
        assert_eq!(account.security(), SecurityMode::StartTls);
        assert_eq!(account.port(), 143);
        assert_eq!(account.mailbox(), "INBOX");
        assert_eq!(account.server_address(), "imap.example.org:143");
    }

    #[test]
    fn test_builder_full() {
        let account = builder()
            .security(SecurityMode::ImplicitTls)
            .port(10993)
            .mailbox("Sent")
            .build()
            .unwrap();

        assert_eq!(account.port(), 10993);
        assert_eq!(account.mailbox(), "Sent");
        assert_eq!(account.security().to_string(), "implicit-tls");
    }

    #[test]
    fn test_implicit_tls_default_port() {
        let account = builder().security(SecurityMode::ImplicitTls).build().unwrap();
        assert_eq!(account.port(), 993);
    }

    #[test]
    fn test_builder_missing_fields() {
        assert!(AccountConfig::builder().build().is_err());
        assert!(builder().id("").build().is_err());

        let missing_cert = AccountConfig::builder()
            .id("work")
            .host("imap.example.org")
            .username("me")
            .password("secret")
            .build();
        assert!(matches!(missing_cert, Err(Error::InvalidConfig { .. })));

        let missing_password = AccountConfig::builder()
            .id("work")
            .host("imap.example.org")
            .username("me")
            .certificate_file("/tmp/cert.pem")
            .build();
        assert!(missing_password.is_err());
    }

    #[test]
    fn test_password_not_in_debug() {
        let account = builder().password("super-secret-password").build().unwrap();

        let debug_str = format!("{account:?}");
        assert!(!debug_str.contains("super-secret-password"));
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn test_credential_map_deduplicates_accounts() {
        let inbox = builder().build().unwrap();
        let sent = builder().mailbox("Sent").build().unwrap();
        let other = builder().id("home").password("hunter2").build().unwrap();

        let credentials = CredentialMap::from_accounts(&[inbox, sent, other]);

        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials.get("work"), Some("secret"));
        assert_eq!(credentials.get("home"), Some("hunter2"));
        assert!(!credentials.contains("nobody"));
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn test_watcher_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.settle_window, Duration::from_secs(3));
        assert!(config.initial_sync);
    }
}
