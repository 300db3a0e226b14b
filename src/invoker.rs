//! Running the external sync program with in-memory credentials.
//!
//! Each invocation creates a private directory (mode 0700) holding a named
//! pipe (mode 0600). A blocking writer streams the credential-substituted
//! configuration into the pipe while the sync program reads it as its
//! configuration file via `-c`. The directory is removed when the call
//! returns, on every path.

use crate::config::{AccountConfig, CredentialMap, WatcherConfig};
use crate::coordinator::{SyncAction, TriggerBatch};
use crate::error::{Error, Result};
use crate::mbsyncrc::substitute_credentials;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use secrecy::{ExposeSecret, SecretString};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const CONDUIT_NAME: &str = "mbsyncrc";
const WRITER_RELEASE_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one sync program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Exit code, `None` if the program was killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the program exited successfully.
    pub success: bool,
}

/// Desktop notification after a targeted sync.
#[derive(Debug, Clone)]
pub struct Notifier {
    program: PathBuf,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new("notify-send")
    }
}

impl Notifier {
    /// Creates a notifier running `program` with `notify-send` arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Notification body for a batch: `in mailbox(es) acct/box, ...`.
    #[must_use]
    pub fn message(batch: &TriggerBatch) -> Option<String> {
        let TriggerBatch::Targets(targets) = batch else {
            return None;
        };
        let mailboxes: Vec<String> = targets
            .iter()
            .map(|signal| format!("{}/{}", signal.account(), signal.mailbox()))
            .collect();
        Some(format!("in mailbox(es) {}", mailboxes.join(", ")))
    }

    /// Shows a notification for `batch`. Failures are only logged.
    #[instrument(name = "Notifier::notify", skip_all)]
    pub async fn notify(&self, batch: &TriggerBatch) {
        let Some(message) = Self::message(batch) else {
            return;
        };

        let result = tokio::process::Command::new(&self.program)
            .args(["-i", "indicator-messages-new", "New Mail"])
            .arg(&message)
            .status()
            .await;

        match result {
            Ok(status) if status.success() => debug!(%message, "Notification sent"),
            Ok(status) => warn!(program = %self.program.display(), %status, "Notifier failed"),
            Err(e) => warn!(program = %self.program.display(), error = %e, "Notifier could not be started"),
        }
    }
}

/// Runs the sync program for trigger batches.
pub struct SyncInvoker {
    program: PathBuf,
    config_source: Arc<str>,
    accounts: Arc<[AccountConfig]>,
    runtime_dir: PathBuf,
    notifier: Option<Notifier>,
}

impl std::fmt::Debug for SyncInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncInvoker")
            .field("program", &self.program)
            .field("accounts", &self.accounts.len())
            .field("runtime_dir", &self.runtime_dir)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl SyncInvoker {
    /// Creates an invoker for `program`.
    ///
    /// `config_source` is the original configuration text; `accounts` supply
    /// the passwords substituted into it.
    pub fn new(
        program: impl Into<PathBuf>,
        config_source: impl Into<Arc<str>>,
        accounts: impl Into<Arc<[AccountConfig]>>,
    ) -> Self {
        Self {
            program: program.into(),
            config_source: config_source.into(),
            accounts: accounts.into(),
            runtime_dir: std::env::temp_dir(),
            notifier: None,
        }
    }

    /// Creates an invoker using the program, directory and notifier of `config`.
    pub fn from_config(
        config: &WatcherConfig,
        config_source: impl Into<Arc<str>>,
        accounts: impl Into<Arc<[AccountConfig]>>,
    ) -> Self {
        let mut invoker = Self::new(&config.sync_program, config_source, accounts)
            .runtime_dir(&config.runtime_dir);
        if let Some(program) = &config.notify_program {
            invoker = invoker.notifier(Notifier::new(program));
        }
        invoker
    }

    /// Directory under which the private conduit directory is created.
    #[must_use]
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Notify after successful targeted syncs.
    #[must_use]
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Runs the sync program once for `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the conduit cannot be set up, the program cannot
    /// be started, or the configuration could not be delivered to a program
    /// that then reported success. A nonzero exit is not an error; see
    /// [`SyncReport::success`].
    #[instrument(name = "SyncInvoker::invoke", skip_all, fields(targets = %batch))]
    pub async fn invoke(&self, batch: &TriggerBatch) -> Result<SyncReport> {
        let credentials = CredentialMap::from_accounts(&self.accounts);
        let document = SecretString::from(substitute_credentials(&self.config_source, &credentials));

        let dir = tempfile::Builder::new()
            .prefix("idle-sync-")
            .tempdir_in(&self.runtime_dir)
            .map_err(|source| Error::CreateConduit {
                path: self.runtime_dir.clone(),
                source,
            })?;
        let conduit = dir.path().join(CONDUIT_NAME);

        nix::unistd::mkfifo(&conduit, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
            Error::CreateConduit {
                path: conduit.clone(),
                source: errno.into(),
            }
        })?;

        debug!(conduit = %conduit.display(), "Created conduit");

        let writer = {
            let conduit = conduit.clone();
            tokio::task::spawn_blocking(move || write_conduit(&conduit, &document))
        };
        // Declared after `dir` so an abandoned call releases the writer before
        // the conduit is removed.
        let mut abandoned = WriterGuard(Some(conduit.clone()));

        let status = tokio::process::Command::new(&self.program)
            .arg("-c")
            .arg(&conduit)
            .args(batch.args())
            .kill_on_drop(true)
            .status()
            .await;

        let written = join_writer(&conduit, writer).await;
        abandoned.disarm();
        let written = written?;

        let status = status.map_err(|source| Error::SpawnSync {
            program: self.program.clone(),
            source,
        })?;

        let report = SyncReport {
            exit_code: status.code(),
            success: status.success(),
        };

        match written {
            Ok(()) => {}
            Err(source) if report.success => {
                return Err(Error::WriteConduit {
                    path: conduit,
                    source,
                });
            }
            Err(e) => debug!(error = %e, "Conduit was not fully read"),
        }

        if let Err(e) = dir.close() {
            warn!(error = %e, "Failed to remove conduit directory");
        }

        info!(exit_code = ?report.exit_code, success = report.success, "Sync program exited");

        if report.success {
            if let Some(notifier) = &self.notifier {
                notifier.notify(batch).await;
            }
        }

        Ok(report)
    }
}

impl SyncAction for SyncInvoker {
    async fn sync(&mut self, batch: &TriggerBatch) -> Result<SyncReport> {
        self.invoke(batch).await
    }
}

/// Blocks until a reader opens the pipe, then writes the whole document.
fn write_conduit(conduit: &Path, document: &SecretString) -> std::io::Result<()> {
    let mut pipe = std::fs::OpenOptions::new().write(true).open(conduit)?;
    pipe.write_all(document.expose_secret().as_bytes())?;
    pipe.flush()
}

/// Waits for the writer once the program has exited.
///
/// A writer that has not opened the conduit yet, or is blocked in `open()`
/// because the program never read it, is released by briefly opening the read
/// end. This repeats until the writer returns, so a writer thread that starts
/// late cannot block forever.
async fn join_writer(
    conduit: &Path,
    mut writer: JoinHandle<std::io::Result<()>>,
) -> Result<std::io::Result<()>> {
    loop {
        release_writer(conduit);
        match tokio::time::timeout(WRITER_RELEASE_INTERVAL, &mut writer).await {
            Ok(joined) => return joined.map_err(|source| Error::ConduitTask { source }),
            Err(_) => debug!("Conduit writer still pending"),
        }
    }
}

/// Releases the writer when an invocation is dropped before it was joined.
struct WriterGuard(Option<PathBuf>);

impl WriterGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Some(conduit) = &self.0 {
            release_writer(conduit);
        }
    }
}

/// Opens and immediately closes the read end so a writer blocked in `open()` can finish.
fn release_writer(conduit: &Path) {
    let opened = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(conduit);
    if let Err(e) = opened {
        debug!(error = %e, "Could not open conduit read end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Signal;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;

    const SOURCE: &str = "\
IMAPAccount work
Host imap.example.org
User me
PassCmd \"pass show work\"
CertificateFile /etc/certs/work.pem

MaildirStore local
Path ~/Mail/
";

    struct Fixture {
        scripts: tempfile::TempDir,
        runtime: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                scripts: tempfile::tempdir().unwrap(),
                runtime: tempfile::tempdir().unwrap(),
            }
        }

        fn out(&self, name: &str) -> PathBuf {
            self.scripts.path().join(name)
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.scripts.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn invoker(&self, program: &Path) -> SyncInvoker {
            let account = AccountConfig::builder()
                .id("work")
                .host("imap.example.org")
                .certificate_file("/etc/certs/work.pem")
                .username("me")
                .password("s3cr\"et")
                .build()
                .unwrap();
            SyncInvoker::new(program, SOURCE, vec![account]).runtime_dir(self.runtime.path())
        }

        fn runtime_is_empty(&self) -> bool {
            std::fs::read_dir(self.runtime.path()).unwrap().next().is_none()
        }

        fn recording_script(&self) -> PathBuf {
            let out = self.scripts.path().display();
            self.script(
                "fake-mbsync",
                &format!(
                    "stat -c %a \"$(dirname \"$2\")\" > {out}/dir_mode\n\
                     stat -c %a \"$2\" > {out}/fifo_mode\n\
                     cat \"$2\" > {out}/config\n\
                     echo \"$@\" > {out}/args"
                ),
            )
        }
    }

    fn inbox_batch() -> TriggerBatch {
        TriggerBatch::Targets(BTreeSet::from([Signal::new("work", "INBOX")]))
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_passes_credentials_through_conduit() {
        let fixture = Fixture::new();
        let program = fixture.recording_script();

        let report = fixture.invoker(&program).invoke(&inbox_batch()).await.unwrap();

        assert_eq!(
            report,
            SyncReport {
                exit_code: Some(0),
                success: true
            }
        );
        let config = read(fixture.out("config"));
        assert_eq!(
            config,
            SOURCE.replace("PassCmd \"pass show work\"", "Pass \"s3cr\\\"et\"")
        );
        assert_eq!(read(fixture.out("dir_mode")).trim(), "700");
        assert_eq!(read(fixture.out("fifo_mode")).trim(), "600");

        let args = read(fixture.out("args"));
        let args: Vec<&str> = args.split_whitespace().collect();
        assert_eq!(args[0], "-c");
        assert!(args[1].starts_with(fixture.runtime.path().to_str().unwrap()));
        assert_eq!(&args[2..], ["work:INBOX"]);

        assert!(!Path::new(args[1]).exists());
        assert!(fixture.runtime_is_empty());
    }

    #[tokio::test]
    async fn test_full_sync_passes_all_flag() {
        let fixture = Fixture::new();
        let program = fixture.recording_script();

        fixture.invoker(&program).invoke(&TriggerBatch::All).await.unwrap();

        let args = read(fixture.out("args"));
        assert_eq!(args.split_whitespace().nth(2), Some("-a"));
        assert_eq!(args.split_whitespace().count(), 3);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let fixture = Fixture::new();
        let program = fixture.script("failing", "cat \"$2\" > /dev/null\nexit 4");

        let report = fixture.invoker(&program).invoke(&inbox_batch()).await.unwrap();

        assert_eq!(report.exit_code, Some(4));
        assert!(!report.success);
        assert!(fixture.runtime_is_empty());
    }

    #[tokio::test]
    async fn test_program_ignoring_conduit_does_not_hang() {
        let fixture = Fixture::new();
        let program = fixture.script("ignores", "exit 3");

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            fixture.invoker(&program).invoke(&TriggerBatch::All),
        )
        .await
        .expect("invocation hung")
        .unwrap();

        assert_eq!(report.exit_code, Some(3));
        assert!(fixture.runtime_is_empty());
    }

    #[tokio::test]
    async fn test_late_writer_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let conduit = dir.path().join(CONDUIT_NAME);
        nix::unistd::mkfifo(&conduit, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();

        // The writer thread only reaches open() after the first release.
        let writer = {
            let conduit = conduit.clone();
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(Duration::from_millis(200));
                write_conduit(&conduit, &SecretString::from("IMAPAccount work\n"))
            })
        };

        let written = tokio::time::timeout(Duration::from_secs(10), join_writer(&conduit, writer))
            .await
            .expect("writer was never released")
            .unwrap();

        // Either the data landed in the pipe or nobody was left to read it.
        if let Err(e) = written {
            assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
        }
    }

    #[tokio::test]
    async fn test_cancelled_invocation_cleans_up() {
        let fixture = Fixture::new();
        let program = fixture.script("slow", "sleep 30");

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            fixture.invoker(&program).invoke(&TriggerBatch::All),
        )
        .await;

        assert!(result.is_err());
        assert!(fixture.runtime_is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_cleans_up() {
        let fixture = Fixture::new();
        let missing = fixture.scripts.path().join("no-such-program");

        let err = fixture
            .invoker(&missing)
            .invoke(&TriggerBatch::All)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SpawnSync { .. }));
        assert!(fixture.runtime_is_empty());
    }

    #[tokio::test]
    async fn test_missing_runtime_dir() {
        let fixture = Fixture::new();
        let program = fixture.recording_script();
        let invoker = fixture
            .invoker(&program)
            .runtime_dir(fixture.runtime.path().join("absent"));

        let err = invoker.invoke(&TriggerBatch::All).await.unwrap_err();
        assert!(matches!(err, Error::CreateConduit { .. }));
    }

    #[test]
    fn test_notification_message() {
        let batch = TriggerBatch::Targets(BTreeSet::from([
            Signal::new("work", "INBOX"),
            Signal::new("home", "Sent"),
        ]));
        assert_eq!(
            Notifier::message(&batch).as_deref(),
            Some("in mailbox(es) home/Sent, work/INBOX")
        );
        assert_eq!(Notifier::message(&TriggerBatch::All), None);
    }

    #[tokio::test]
    async fn test_notifies_after_targeted_sync() {
        let fixture = Fixture::new();
        let program = fixture.recording_script();
        let notify = fixture.script(
            "fake-notify",
            &format!("echo \"$@\" > {}/notified", fixture.scripts.path().display()),
        );

        fixture
            .invoker(&program)
            .notifier(Notifier::new(notify))
            .invoke(&inbox_batch())
            .await
            .unwrap();

        assert_eq!(
            read(fixture.out("notified")).trim(),
            "-i indicator-messages-new New Mail in mailbox(es) work/INBOX"
        );
    }
}
