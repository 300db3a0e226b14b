//! Reading and rewriting the sync program's configuration file.
//!
//! The watcher takes its account list from the same `~/.mbsyncrc` the sync
//! program uses. Only `IMAPAccount`/`IMAPStore` sections are of interest:
//!
//! ```text
//! IMAPAccount work
//! Host imap.example.org
//! User me@example.org
//! PassCmd "pass show mail/work"
//! SSLType IMAPS
//! CertificateFile ~/.certs/imap.example.org.pem
//! ```
//!
//! [`substitute_credentials`] produces the document that is streamed to the
//! sync program: every `PassCmd` of a known account is replaced by a literal
//! `Pass` line so the program never has to run the (possibly interactive)
//! password command itself.

use crate::config::{AccountConfig, CredentialMap, SecurityMode};
use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

const SECTION_KEYWORDS: [&str; 5] = ["maildirstore", "imapaccount", "imapstore", "channel", "group"];
const IMAP_KEYWORDS: [&str; 2] = ["imapaccount", "imapstore"];

/// Where the password of an IMAP section comes from.
#[derive(Clone)]
pub enum PasswordSource {
    /// A literal `Pass` value.
    Literal(SecretString),
    /// A `PassCmd` shell command printing the password.
    Command(String),
}

impl std::fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordSource::Literal(_) => f.write_str("Literal([REDACTED])"),
            PasswordSource::Command(command) => f.debug_tuple("Command").field(command).finish(),
        }
    }
}

/// Settings collected from one `IMAPAccount`/`IMAPStore` section.
#[derive(Debug, Clone, Default)]
pub struct ImapSection {
    /// Section name, used as the account identifier.
    pub name: String,
    /// `Host`.
    pub host: Option<String>,
    /// `Port`.
    pub port: Option<u16>,
    /// `User`.
    pub user: Option<String>,
    /// `Pass` or `PassCmd`.
    pub password: Option<PasswordSource>,
    /// `SSLType`/`TLSType`; `None` here means plaintext was not requested either.
    pub security: Option<SecurityMode>,
    /// `CertificateFile`, tilde-expanded.
    pub certificate_file: Option<PathBuf>,
}

/// A parsed configuration file together with its original text.
#[derive(Debug, Clone)]
pub struct MbsyncConfig {
    source: String,
    sections: Vec<ImapSection>,
}

impl MbsyncConfig {
    /// Reads and parses the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadConfig`] if the file cannot be read, or a parse
    /// error from [`MbsyncConfig::parse`].
    #[instrument(name = "MbsyncConfig::load", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| Error::ReadConfig {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(source)
    }

    /// Parses configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for malformed values, including an
    /// `SSLType None` IMAP section (plaintext connections are refused).
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let mut sections: Vec<ImapSection> = Vec::new();
        let mut in_imap_section = false;

        for (number, line) in source.lines().enumerate() {
            if is_comment(line) {
                continue;
            }
            let tokens = tokenize(line);
            let [keyword, value, ..] = tokens.as_slice() else {
                continue;
            };
            let keyword = keyword.to_ascii_lowercase();

            if SECTION_KEYWORDS.contains(&keyword.as_str()) {
                in_imap_section = IMAP_KEYWORDS.contains(&keyword.as_str());
                if in_imap_section {
                    sections.push(ImapSection {
                        name: value.clone(),
                        ..ImapSection::default()
                    });
                }
                continue;
            }

            let Some(section) = sections.last_mut().filter(|_| in_imap_section) else {
                continue;
            };

            match keyword.as_str() {
                "host" => section.host = Some(value.clone()),
                "port" => {
                    let port = value.parse().map_err(|_| Error::InvalidConfig {
                        message: format!("line {}: invalid port '{value}'", number + 1),
                    })?;
                    section.port = Some(port);
                }
                "user" => section.user = Some(value.clone()),
                "pass" => {
                    section.password = Some(PasswordSource::Literal(SecretString::from(
                        value.clone(),
                    )));
                }
                "passcmd" => {
                    let command = value.strip_prefix('+').unwrap_or(value);
                    section.password = Some(PasswordSource::Command(command.to_string()));
                }
                "ssltype" | "tlstype" => {
                    section.security = Some(parse_security(&section.name, value)?);
                }
                "certificatefile" => {
                    let expanded = shellexpand::tilde(value);
                    section.certificate_file = Some(PathBuf::from(expanded.as_ref()));
                }
                _ => {}
            }
        }

        debug!(sections = sections.len(), "Parsed IMAP sections");
        Ok(Self { source, sections })
    }

    /// The original configuration text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// All IMAP sections, in file order.
    #[must_use]
    pub fn sections(&self) -> &[ImapSection] {
        &self.sections
    }

    /// Resolves passwords and builds one [`AccountConfig`] per watch target.
    ///
    /// Each selection entry is `account` (watch `INBOX`) or `account:mailbox`;
    /// repeated entries are watched once. An empty selection watches `INBOX`
    /// of every IMAP section that describes a usable server; other sections,
    /// such as an `IMAPStore` that only references an account, are logged and
    /// skipped. Every `PassCmd` involved runs exactly once, even when several
    /// mailboxes of the same account are watched.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or incomplete selected accounts, or
    /// failing password commands of selected accounts.
    #[instrument(name = "MbsyncConfig::accounts", skip_all, fields(selection = selection.len()))]
    pub async fn accounts(&self, selection: &[String]) -> Result<Vec<AccountConfig>> {
        if selection.is_empty() {
            return Ok(self.all_accounts().await);
        }

        let mut seen = HashSet::new();
        let targets: Vec<(&str, &str)> = selection
            .iter()
            .map(|entry| entry.split_once(':').unwrap_or((entry.as_str(), "INBOX")))
            .filter(|target| seen.insert(*target))
            .collect();

        let mut passwords: HashMap<&str, SecretString> = HashMap::new();
        let mut accounts = Vec::with_capacity(targets.len());

        for (name, mailbox) in targets {
            let section = self.section(name).ok_or_else(|| Error::InvalidConfig {
                message: format!("no IMAPAccount or IMAPStore named '{name}'"),
            })?;

            let password = match passwords.get(name) {
                Some(password) => password.clone(),
                None => {
                    let password = resolve_password(section).await?;
                    passwords.insert(name, password.clone());
                    password
                }
            };

            accounts.push(section_to_account(section, mailbox, &password)?);
        }

        Ok(accounts)
    }

    async fn all_accounts(&self) -> Vec<AccountConfig> {
        let mut seen = HashSet::new();
        let mut accounts = Vec::new();

        for section in &self.sections {
            if !seen.insert(section.name.as_str()) {
                continue;
            }
            if section.host.is_none() {
                debug!(section = %section.name, "Skipping section without Host");
                continue;
            }

            let account = resolve_password(section)
                .await
                .and_then(|password| section_to_account(section, "INBOX", &password));
            match account {
                Ok(account) => accounts.push(account),
                Err(e) => {
                    warn!(section = %section.name, error = %e, "Skipping unusable IMAP section");
                }
            }
        }

        accounts
    }

    fn section(&self, name: &str) -> Option<&ImapSection> {
        self.sections.iter().find(|section| section.name == name)
    }
}

fn section_to_account(
    section: &ImapSection,
    mailbox: &str,
    password: &SecretString,
) -> Result<AccountConfig> {
    let mut builder = AccountConfig::builder()
        .id(&section.name)
        .mailbox(mailbox)
        .password(password.expose_secret());

    if let Some(host) = &section.host {
        builder = builder.host(host);
    }
    if let Some(port) = section.port {
        builder = builder.port(port);
    }
    if let Some(user) = &section.user {
        builder = builder.username(user);
    }
    if let Some(security) = section.security {
        builder = builder.security(security);
    }
    if let Some(certificate_file) = &section.certificate_file {
        builder = builder.certificate_file(certificate_file);
    }

    builder.build()
}

fn parse_security(section: &str, value: &str) -> Result<SecurityMode> {
    match value.to_ascii_lowercase().as_str() {
        "starttls" => Ok(SecurityMode::StartTls),
        "imaps" => Ok(SecurityMode::ImplicitTls),
        "none" => Err(Error::InvalidConfig {
            message: format!("account '{section}' disables TLS, refusing to go unencrypted"),
        }),
        other => Err(Error::InvalidConfig {
            message: format!("account '{section}' has unsupported SSLType '{other}'"),
        }),
    }
}

/// Runs `PassCmd` through the shell once; a single trailing newline is dropped.
#[instrument(name = "mbsyncrc::resolve_password", skip_all, fields(account = %section.name))]
async fn resolve_password(section: &ImapSection) -> Result<SecretString> {
    let command = match &section.password {
        Some(PasswordSource::Literal(password)) => return Ok(password.clone()),
        Some(PasswordSource::Command(command)) => command,
        None => {
            return Err(Error::InvalidConfig {
                message: format!("account '{}' has neither Pass nor PassCmd", section.name),
            })
        }
    };

    debug!("Running password command");

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .output()
        .await
        .map_err(|source| Error::PasswordCommand {
            account: section.name.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(Error::PasswordCommandFailed {
            account: section.name.clone(),
            status: output.status,
        });
    }

    let mut password = String::from_utf8_lossy(&output.stdout).into_owned();
    if password.ends_with('\n') {
        password.pop();
    }
    Ok(SecretString::from(password))
}

/// Rewrites configuration text for the sync program.
///
/// Inside an IMAP section whose name is in `credentials`, each `PassCmd` line
/// is replaced by `Pass "<secret>"` with the original line terminator. All
/// other bytes are copied unchanged.
#[must_use]
pub fn substitute_credentials(source: &str, credentials: &CredentialMap) -> String {
    let mut out = String::with_capacity(source.len());
    let mut section: Option<&str> = None;

    for line in source.split_inclusive('\n') {
        if is_comment(line) {
            out.push_str(line);
            continue;
        }

        let tokens = tokenize(line);
        let Some(keyword) = tokens.first().map(|k| k.to_ascii_lowercase()) else {
            out.push_str(line);
            continue;
        };

        if SECTION_KEYWORDS.contains(&keyword.as_str()) {
            section = match tokens.get(1) {
                Some(name) if IMAP_KEYWORDS.contains(&keyword.as_str()) => {
                    credentials.get(name)
                }
                _ => None,
            };
            out.push_str(line);
            continue;
        }

        match section {
            Some(password) if keyword == "passcmd" => {
                out.push_str("Pass ");
                out.push_str(&quote(password));
                out.push_str(line_terminator(line));
            }
            _ => out.push_str(line),
        }
    }

    out
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn line_terminator(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

/// Quotes a value so [`tokenize`] reads it back verbatim.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Splits a line into whitespace-separated tokens; double quotes group, a
/// backslash escapes the next character.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
                in_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    tokens
}
