//! Background sync scheduler.
//!
//! Owns two long-lived tasks: a fixed-interval timer and a connectivity
//! watcher that triggers a pass when the network comes back. Stopping the
//! scheduler stops the tasks but lets an in-flight pass run to completion.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use packrat_core::db::{Database, SettingsRepository, SqliteSettingsRepository};
use packrat_core::models::SyncState;

use crate::engine::{ConnectivityProbe, NoCallbacks, SyncEngine, SyncReport};
use crate::error::{SyncError, SyncResult};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Timer settings for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between periodic passes.
    pub interval: Duration,
    /// Time between connectivity checks.
    pub probe_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

/// The single operation the scheduler drives. Seam so scheduling can be
/// tested without a full engine.
#[async_trait::async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run_pass(&self) -> SyncResult<SyncReport>;
}

#[async_trait::async_trait]
impl SyncRunner for SyncEngine {
    async fn run_pass(&self) -> SyncResult<SyncReport> {
        self.incremental_sync(&NoCallbacks).await
    }
}

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Periodic sync driver.
pub struct SyncScheduler<R: SyncRunner = SyncEngine> {
    runner: Arc<R>,
    probe: Arc<dyn ConnectivityProbe>,
    db: Arc<StdMutex<Database>>,
    config: SchedulerConfig,
    running: StdMutex<Option<RunningTasks>>,
}

impl<R: SyncRunner> SyncScheduler<R> {
    pub fn new(
        runner: Arc<R>,
        probe: Arc<dyn ConnectivityProbe>,
        db: Arc<StdMutex<Database>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runner,
            probe,
            db,
            config,
            running: StdMutex::new(None),
        }
    }

    /// Spawn the timer and connectivity watcher. A second call while
    /// running is an error; a disabled sync setting is a quiet no-op.
    pub fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock().map_err(|_| lock_poisoned())?;
        if running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let enabled = {
            let db = self.db.lock().map_err(|_| lock_poisoned())?;
            SqliteSettingsRepository::new(db.connection()).sync_enabled()?
        };
        if !enabled {
            tracing::info!("Background sync is disabled; scheduler not started");
            return Ok(());
        }

        let (shutdown, _) = watch::channel(false);
        let handles = vec![
            self.spawn_interval_task(shutdown.subscribe()),
            self.spawn_connectivity_task(shutdown.subscribe()),
        ];
        *running = Some(RunningTasks { shutdown, handles });
        tracing::info!(
            "Sync scheduler started (every {:?})",
            self.config.interval
        );
        Ok(())
    }

    /// Signal both tasks to exit. An in-flight pass finishes first; the
    /// tasks check the signal between awaits, not inside them.
    pub fn stop(&self) -> SyncResult<()> {
        let mut running = self.running.lock().map_err(|_| lock_poisoned())?;
        if let Some(tasks) = running.take() {
            let _ = tasks.shutdown.send(true);
            tracing::info!("Sync scheduler stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    fn spawn_interval_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let runner = Arc::clone(&self.runner);
        let interval = self.config.interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(interval) => {
                        run_quietly(runner.as_ref(), "interval").await;
                    }
                }
            }
        })
    }

    fn spawn_connectivity_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let runner = Arc::clone(&self.runner);
        let probe = Arc::clone(&self.probe);
        let probe_interval = self.config.probe_interval;

        tokio::spawn(async move {
            let mut was_online = probe.is_online().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(probe_interval) => {
                        let online = probe.is_online().await;
                        if online && !was_online {
                            tracing::info!("Connectivity regained; triggering sync pass");
                            run_quietly(runner.as_ref(), "connectivity").await;
                        }
                        was_online = online;
                    }
                }
            }
        })
    }
}

impl SyncScheduler<SyncEngine> {
    /// Snapshot of the underlying engine state.
    pub fn status(&self) -> SyncResult<SyncState> {
        self.runner.status()
    }
}

async fn run_quietly<R: SyncRunner>(runner: &R, trigger: &str) {
    match runner.run_pass().await {
        Ok(report) => {
            tracing::debug!(
                "Scheduled pass ({trigger}) synced {} items in {}ms",
                report.items_synced,
                report.duration_ms
            );
        }
        // Something else is already syncing; the work is happening.
        Err(SyncError::AlreadyRunning) => {
            tracing::debug!("Scheduled pass ({trigger}) skipped: already running");
        }
        Err(error) => {
            tracing::warn!("Scheduled pass ({trigger}) failed: {error}");
        }
    }
}

fn lock_poisoned() -> SyncError {
    SyncError::Store(packrat_core::Error::InvalidInput(
        "scheduler lock poisoned".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingRunner {
        passes: AtomicU32,
    }

    #[async_trait::async_trait]
    impl SyncRunner for CountingRunner {
        async fn run_pass(&self) -> SyncResult<SyncReport> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            Ok(SyncReport::default())
        }
    }

    struct ToggleProbe {
        online: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConnectivityProbe for ToggleProbe {
        async fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    fn scheduler(
        config: SchedulerConfig,
        online: bool,
    ) -> (SyncScheduler<CountingRunner>, Arc<CountingRunner>, Arc<ToggleProbe>) {
        let runner = Arc::new(CountingRunner::default());
        let probe = Arc::new(ToggleProbe {
            online: AtomicBool::new(online),
        });
        let db = Arc::new(StdMutex::new(Database::open_in_memory().unwrap()));
        let scheduler = SyncScheduler::new(
            Arc::clone(&runner),
            Arc::clone(&probe) as Arc<dyn ConnectivityProbe>,
            db,
            config,
        );
        (scheduler, runner, probe)
    }

    async fn settle() {
        // Let spawned tasks observe advanced time.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), true);
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SyncError::AlreadyRunning)));
        scheduler.stop().unwrap();
    }

    #[tokio::test]
    async fn stop_allows_restart() {
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), true);
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());
        scheduler.start().unwrap();
        scheduler.stop().unwrap();
    }

    #[tokio::test]
    async fn disabled_sync_setting_skips_startup() {
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), true);
        {
            let db = scheduler.db.lock().unwrap();
            SqliteSettingsRepository::new(db.connection())
                .set_sync_enabled(false)
                .unwrap();
        }
        scheduler.start().unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_elapse_triggers_a_pass() {
        let config = SchedulerConfig {
            interval: Duration::from_secs(300),
            probe_interval: Duration::from_secs(3600),
        };
        let (scheduler, runner, _) = scheduler(config, true);
        scheduler.start().unwrap();
        settle().await;

        assert_eq!(runner.passes.load(Ordering::SeqCst), 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert_eq!(runner.passes.load(Ordering::SeqCst), 1);
        scheduler.stop().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_regained_triggers_a_pass() {
        let config = SchedulerConfig {
            interval: Duration::from_secs(3600),
            probe_interval: Duration::from_secs(30),
        };
        let (scheduler, runner, probe) = scheduler(config, false);
        scheduler.start().unwrap();
        settle().await;

        // Still offline after one probe: nothing happens.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(runner.passes.load(Ordering::SeqCst), 0);

        probe.online.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(runner.passes.load(Ordering::SeqCst), 1);

        // Staying online does not keep re-triggering.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(runner.passes.load(Ordering::SeqCst), 1);
        scheduler.stop().unwrap();
    }
}
