//! Top-level wiring of watch sessions, coordinator and sync action.

use crate::config::{AccountConfig, WatcherConfig};
use crate::coordinator::{EventCoordinator, SyncAction, TriggerBatch};
use crate::error::Result;
use crate::invoker::SyncInvoker;
use crate::transport::{ImapTransport, Transport};
use crate::watch::{SessionExit, WatchSession};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Owns the watch sessions and the coordinator for the process lifetime.
///
/// # Example
///
/// ```no_run
/// use idle_sync::{MbsyncConfig, Supervisor, WatcherConfig};
///
/// # async fn example() -> idle_sync::Result<()> {
/// let mbsyncrc = MbsyncConfig::load("/home/me/.mbsyncrc").await?;
/// let accounts = mbsyncrc.accounts(&[]).await?;
///
/// let supervisor = Supervisor::new(WatcherConfig::default(), mbsyncrc.source(), accounts);
/// supervisor.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
/// # Ok(())
/// # }
/// ```
pub struct Supervisor<T, A> {
    config: WatcherConfig,
    accounts: Vec<AccountConfig>,
    transport: Arc<T>,
    action: A,
}

impl Supervisor<ImapTransport, SyncInvoker> {
    /// Creates a supervisor watching `accounts` over IMAP and running the
    /// sync program configured in `config`.
    ///
    /// `config_source` is the sync program's original configuration text.
    pub fn new(
        config: WatcherConfig,
        config_source: impl Into<Arc<str>>,
        accounts: Vec<AccountConfig>,
    ) -> Self {
        let transport = Arc::new(ImapTransport::new(config.timeouts.clone()));
        let invoker = SyncInvoker::from_config(&config, config_source, accounts.clone());
        Self::with_parts(config, accounts, transport, invoker)
    }
}

impl<T, A> Supervisor<T, A>
where
    T: Transport,
    A: SyncAction + 'static,
{
    /// Creates a supervisor from explicit parts.
    pub fn with_parts(
        config: WatcherConfig,
        accounts: Vec<AccountConfig>,
        transport: Arc<T>,
        action: A,
    ) -> Self {
        Self {
            config,
            accounts,
            transport,
            action,
        }
    }

    /// Runs until `shutdown` completes, then stops and joins everything.
    ///
    /// Sessions that give up are logged and not restarted; the coordinator
    /// keeps running full syncs on its idle timeout regardless.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; failures of individual parts are logged.
    #[instrument(name = "Supervisor::run", skip_all, fields(targets = self.accounts.len()))]
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if self.accounts.is_empty() {
            warn!("No mailboxes to watch");
            return Ok(());
        }

        let mut shutdown = std::pin::pin!(shutdown);
        let stop = CancellationToken::new();

        if self.config.initial_sync {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested during initial sync");
                    return Ok(());
                }
                () = self.initial_sync() => {}
            }
        }

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let coordinator = EventCoordinator::new(
            signals_rx,
            self.action,
            self.config.idle_timeout,
            self.config.settle_window,
        );
        let coordinator = tokio::spawn(coordinator.run(stop.clone()));

        let mut sessions = JoinSet::new();
        for (index, account) in self.accounts.into_iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    () = &mut shutdown => {
                        stop.cancel();
                        break;
                    }
                    () = tokio::time::sleep(self.config.start_stagger) => {}
                }
            }

            let target = format!("{}:{}", account.id(), account.mailbox());
            let session = WatchSession::new(
                account,
                Arc::clone(&self.transport),
                signals_tx.clone(),
                stop.child_token(),
            );
            debug!(%target, "Starting watch session");
            sessions.spawn(async move { (target, session.run().await) });
        }
        drop(signals_tx);

        while !stop.is_cancelled() {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    stop.cancel();
                }
                Some(joined) = sessions.join_next() => log_session_exit(joined),
            }
        }

        while let Some(joined) = sessions.join_next().await {
            log_session_exit(joined);
        }
        if let Err(e) = coordinator.await {
            error!(error = %e, "Coordinator task failed");
        }

        info!("All watch sessions stopped");
        Ok(())
    }

    async fn initial_sync(&mut self) {
        info!("Running initial full sync");
        match self.action.sync(&TriggerBatch::All).await {
            Ok(report) if report.success => debug!("Initial sync finished"),
            Ok(report) => warn!(exit_code = ?report.exit_code, "Initial sync failed"),
            Err(e) => error!(error = %e, category = %e.category(), "Initial sync could not run"),
        }
    }
}

fn log_session_exit(joined: std::result::Result<(String, SessionExit), JoinError>) {
    match joined {
        Ok((target, SessionExit::Stopped)) => debug!(%target, "Watch session finished"),
        Ok((target, SessionExit::Failed(e))) => {
            warn!(%target, error = %e, "Mailbox is no longer watched");
        }
        Err(e) => error!(error = %e, "Watch session task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::invoker::SyncReport;
    use crate::transport::{MailboxSession, WaitOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    #[derive(Default)]
    struct Counters {
        logins: AtomicUsize,
        logouts: AtomicUsize,
        waiting: Notify,
    }

    /// Sessions that idle until stopped, or refuse to connect at all.
    struct FakeTransport {
        counters: Arc<Counters>,
        refuse: bool,
    }

    struct FakeSession(Arc<Counters>);

    impl Transport for FakeTransport {
        type Connection = ();
        type Session = FakeSession;

        async fn connect(&self, account: &AccountConfig) -> Result<()> {
            if self.refuse {
                return Err(Error::TcpConnect {
                    target: account.server_address(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            Ok(())
        }

        async fn login(&self, _connection: (), _account: &AccountConfig) -> Result<FakeSession> {
            self.counters.logins.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession(Arc::clone(&self.counters)))
        }
    }

    impl MailboxSession for FakeSession {
        async fn examine(&mut self, _mailbox: &str) -> Result<()> {
            Ok(())
        }

        async fn idle(&mut self, stop: &CancellationToken) -> Result<WaitOutcome> {
            self.0.waiting.notify_one();
            stop.cancelled().await;
            Ok(WaitOutcome::Stopped)
        }

        async fn recent_count(&mut self) -> Result<usize> {
            Ok(0)
        }

        async fn logout(&mut self) -> Result<()> {
            self.0.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<TriggerBatch>>>);

    impl SyncAction for Recorder {
        async fn sync(&mut self, batch: &TriggerBatch) -> Result<SyncReport> {
            self.0.lock().unwrap().push(batch.clone());
            Ok(SyncReport {
                exit_code: Some(0),
                success: true,
            })
        }
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A sync that never finishes on its own.
    struct Hanging(Arc<AtomicUsize>);

    impl SyncAction for Hanging {
        async fn sync(&mut self, _batch: &TriggerBatch) -> Result<SyncReport> {
            let _guard = DropCounter(Arc::clone(&self.0));
            std::future::pending().await
        }
    }

    fn account(id: &str) -> AccountConfig {
        AccountConfig::builder()
            .id(id)
            .host("imap.example.org")
            .certificate_file("/etc/certs/pinned.pem")
            .username("me")
            .password("pw")
            .build()
            .unwrap()
    }

    fn supervisor(
        accounts: Vec<AccountConfig>,
        refuse: bool,
    ) -> (Supervisor<FakeTransport, Recorder>, Arc<Counters>, Recorder) {
        let counters = Arc::new(Counters::default());
        let recorder = Recorder::default();
        let config = WatcherConfig {
            idle_timeout: Duration::from_secs(60),
            ..WatcherConfig::default()
        };
        let transport = Arc::new(FakeTransport {
            counters: Arc::clone(&counters),
            refuse,
        });
        let supervisor = Supervisor::with_parts(config, accounts, transport, recorder.clone());
        (supervisor, counters, recorder)
    }

    #[tokio::test]
    async fn test_no_targets_returns_immediately() {
        let (supervisor, _, recorder) = supervisor(vec![], false);

        supervisor.run(std::future::pending()).await.unwrap();

        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_joins_sessions() {
        let (supervisor, counters, recorder) =
            supervisor(vec![account("work"), account("home")], false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(supervisor.run(async {
            shutdown_rx.await.ok();
        }));

        counters.waiting.notified().await;
        counters.waiting.notified().await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(counters.logins.load(Ordering::SeqCst), 2);
        assert_eq!(counters.logouts.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.0.lock().unwrap().first(), Some(&TriggerBatch::All));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_initial_sync() {
        let counters = Arc::new(Counters::default());
        let dropped = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(FakeTransport {
            counters: Arc::clone(&counters),
            refuse: false,
        });
        let supervisor = Supervisor::with_parts(
            WatcherConfig::default(),
            vec![account("work")],
            transport,
            Hanging(Arc::clone(&dropped)),
        );

        tokio::time::timeout(
            Duration::from_secs(60),
            supervisor.run(tokio::time::sleep(Duration::from_secs(5))),
        )
        .await
        .expect("shutdown waited for the initial sync")
        .unwrap();

        // The running sync was abandoned and no session was started.
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(counters.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sync_continues_without_sessions() {
        let (supervisor, counters, recorder) = supervisor(vec![account("work")], true);

        supervisor
            .run(tokio::time::sleep(Duration::from_secs(130)))
            .await
            .unwrap();

        assert_eq!(counters.logins.load(Ordering::SeqCst), 0);
        // Initial sync plus one per idle timeout.
        assert_eq!(
            *recorder.0.lock().unwrap(),
            [TriggerBatch::All, TriggerBatch::All, TriggerBatch::All]
        );
    }
}
