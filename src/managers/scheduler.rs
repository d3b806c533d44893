//! Periodic backups of every registered repository
//!
//! The loop wakes up every `poll_interval` and starts a pass once `interval`
//! has elapsed since the previous one. A pass backs up repositories one after
//! another; a failing repository never stops the others. Repositories that go
//! longer than `failure_threshold` without a successful backup get a
//! `backups-failing:<id>` notification.

use crate::error::BackupError;
use crate::managers::backup::Backups;
use crate::managers::notification::Notification;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long `stop()` waits for a running pass before abandoning it
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub failure_threshold: Duration,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            failure_threshold: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct SchedulerState {
    config: watch::Sender<SchedulerConfig>,
    /// Milliseconds since the Unix epoch; the staleness reference for
    /// repositories that never completed a backup
    started_at: Mutex<i64>,
    last_errors: Mutex<HashMap<String, String>>,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct BackupScheduler {
    backups: Arc<Backups>,
    state: Arc<SchedulerState>,
    running: tokio::sync::Mutex<Option<RunningLoop>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl BackupScheduler {
    pub fn new(backups: Arc<Backups>, config: SchedulerConfig) -> Self {
        let (config, _) = watch::channel(config);
        Self {
            backups,
            state: Arc::new(SchedulerState {
                config,
                started_at: Mutex::new(chrono::Utc::now().timestamp_millis()),
                last_errors: Mutex::new(HashMap::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        *self.state.config.borrow()
    }

    /// Takes effect at the loop's next wake-up
    pub fn reconfigure(&self, config: SchedulerConfig) {
        info!(
            "Scheduler reconfigured: every {:?}, alert after {:?}",
            config.interval, config.failure_threshold
        );
        self.state.config.send_replace(config);
    }

    /// Most recent failure message per repository
    pub fn last_errors(&self) -> HashMap<String, String> {
        lock(&self.state.last_errors).clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().map(|r| !r.handle.is_finished()).unwrap_or(false) {
            debug!("Scheduler already running");
            return;
        }

        *lock(&self.state.started_at) = chrono::Utc::now().timestamp_millis();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.backups),
            Arc::clone(&self.state),
            shutdown_rx,
        ));

        let config = self.config();
        info!("Scheduler started, backing up every {:?}", config.interval);
        *running = Some(RunningLoop { shutdown, handle });
    }

    /// Stop the loop, waiting a few seconds for a pass in progress
    pub async fn stop(&self) {
        let Some(RunningLoop { shutdown, mut handle }) = self.running.lock().await.take() else {
            return;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(_) => info!("Scheduler stopped"),
            Err(_) => {
                warn!("Scheduler pass did not finish within {:?}, abandoning it", STOP_TIMEOUT);
                handle.abort();
            }
        }
    }

    /// Run one pass immediately
    pub async fn run_once(&self) {
        run_pass(&self.backups, &self.state, self.config()).await;
    }
}

async fn run_loop(
    backups: Arc<Backups>,
    state: Arc<SchedulerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_pass = Instant::now();
    loop {
        let poll_interval = state.config.borrow().poll_interval;
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let config = *state.config.borrow();
        if last_pass.elapsed() < config.interval {
            continue;
        }
        last_pass = Instant::now();
        run_pass(&backups, &state, config).await;
    }
    debug!("Scheduler loop exited");
}

async fn run_pass(backups: &Backups, state: &SchedulerState, config: SchedulerConfig) {
    let repositories = match backups.get_repositories().await {
        Ok(repositories) => repositories,
        Err(e) => {
            error!("Scheduler could not list repositories: {}", e);
            return;
        }
    };
    debug!("Scheduled pass over {} repositories", repositories.len());

    for repository in repositories {
        let id = repository.id.as_str();
        if backups.is_backing_up(id) {
            info!("Backup of {} already in progress, skipping", id);
            continue;
        }

        match backups.backup(id).await {
            Ok(()) => {
                lock(&state.last_errors).remove(id);
            }
            Err(BackupError::InProgress(_)) => {
                info!("Backup of {} already in progress, skipping", id);
            }
            Err(BackupError::ShuttingDown) => {
                debug!("Engine is stopping, ending scheduled pass");
                return;
            }
            Err(e) => {
                error!("Scheduled backup of {} failed: {}", id, e);
                lock(&state.last_errors).insert(id.to_string(), e.to_string());
            }
        }

        check_staleness(backups, state, config, id).await;
    }
}

/// Raise the failing notification once a repository has been without a
/// successful backup for longer than the threshold
async fn check_staleness(backups: &Backups, state: &SchedulerState, config: SchedulerConfig, id: &str) {
    let repository = match backups.get_repository(id).await {
        Ok(repository) => repository,
        Err(e) => {
            debug!("Repository {} disappeared during the pass: {}", id, e);
            return;
        }
    };

    let since = repository.last_backup.unwrap_or_else(|| *lock(&state.started_at));
    let elapsed_ms = (chrono::Utc::now().timestamp_millis() - since).max(0) as u64;
    if elapsed_ms <= config.failure_threshold.as_millis() as u64 {
        return;
    }

    let notification = Notification::backups_failing(id, &repository.path, elapsed_ms / 1000);
    if let Err(e) = backups.notifications().add(notification).await {
        error!("Failed to raise failing notification for {}: {:#}", id, e);
    }
}
