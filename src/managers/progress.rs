//! Progress state for running backups and restores, published as events
//!
//! Subscribers get every event published after they subscribe; there is no
//! replay. A slow subscriber loses its oldest events instead of blocking the
//! publisher.

use crate::utils::restic::ToolProgress;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const BROADCAST_CAPACITY: usize = 256;

pub const BACKUP_PROGRESS_EVENT: &str = "backups:backup-progress";
pub const RESTORE_PROGRESS_EVENT: &str = "backups:restore-progress";

/// A backup in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub repository_id: String,
    /// 0.0 ..= 100.0, never decreases during a run
    pub percent: f64,
}

/// State of the most recent restore
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub running: bool,
    /// 0 ..= 100
    pub progress: u8,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_second: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<u64>,
    /// Serialized as `false` when there is no error
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<String>,
}

impl Default for RestoreStatus {
    fn default() -> Self {
        Self {
            backup_id: None,
            running: false,
            progress: 0,
            description: String::new(),
            bytes_per_second: None,
            seconds_remaining: None,
            error: None,
        }
    }
}

fn serialize_error<S: Serializer>(error: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(message) => serializer.serialize_str(message),
        None => serializer.serialize_bool(false),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    BackupProgress,
    RestoreProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum BackupEvent {
    #[serde(rename = "backups:backup-progress")]
    BackupProgress(Vec<BackupProgress>),
    #[serde(rename = "backups:restore-progress")]
    RestoreProgress(RestoreStatus),
}

impl BackupEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BackupEvent::BackupProgress(_) => BACKUP_PROGRESS_EVENT,
            BackupEvent::RestoreProgress(_) => RESTORE_PROGRESS_EVENT,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            BackupEvent::BackupProgress(_) => EventKind::BackupProgress,
            BackupEvent::RestoreProgress(_) => EventKind::RestoreProgress,
        }
    }
}

/// Fan-out of backup events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: BackupEvent) {
        debug!("Publishing {}", event.name());
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Receive every event
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: None,
        }
    }

    /// Receive only events of one kind
    pub fn subscribe_to(&self, kind: EventKind) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kind: Some(kind),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Dropping the subscription unsubscribes
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<BackupEvent>,
    kind: Option<EventKind>,
}

impl Subscription {
    fn wants(&self, event: &BackupEvent) -> bool {
        self.kind.map_or(true, |kind| event.kind() == kind)
    }

    /// Next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<BackupEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already published event without waiting
    pub fn try_recv(&mut self) -> Option<BackupEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Everything published so far that has not been received
    pub fn drain(&mut self) -> Vec<BackupEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-flight backups and their progress
#[derive(Clone)]
pub struct BackupProgressTracker {
    entries: Arc<Mutex<Vec<(u64, BackupProgress)>>>,
    next_token: Arc<AtomicU64>,
    events: EventBus,
}

impl BackupProgressTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_token: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    pub fn current(&self) -> Vec<BackupProgress> {
        lock(&self.entries).iter().map(|(_, p)| p.clone()).collect()
    }

    /// Start tracking a run at 0%; the entry goes away when the handle drops
    pub fn begin(&self, repository_id: &str) -> BackupProgressHandle {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((
            token,
            BackupProgress {
                repository_id: repository_id.to_string(),
                percent: 0.0,
            },
        ));
        self.publish();

        BackupProgressHandle {
            tracker: self.clone(),
            token,
        }
    }

    fn publish(&self) {
        self.events.publish(BackupEvent::BackupProgress(self.current()));
    }
}

pub struct BackupProgressHandle {
    tracker: BackupProgressTracker,
    token: u64,
}

impl BackupProgressHandle {
    /// Record a new sample; lower values than already reported are ignored
    pub fn update(&self, progress: &ToolProgress) {
        let changed = {
            let mut entries = lock(&self.tracker.entries);
            match entries.iter_mut().find(|(token, _)| *token == self.token) {
                Some((_, entry)) if progress.percent > entry.percent => {
                    entry.percent = progress.percent.min(100.0);
                    true
                }
                _ => false,
            }
        };

        if changed {
            self.tracker.publish();
        }
    }
}

impl Drop for BackupProgressHandle {
    fn drop(&mut self) {
        lock(&self.tracker.entries).retain(|(token, _)| *token != self.token);
        self.tracker.publish();
    }
}

/// Restore status plus the events announcing its changes
#[derive(Clone)]
pub struct RestoreProgressTracker {
    status: Arc<Mutex<RestoreStatus>>,
    events: EventBus,
}

impl RestoreProgressTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            status: Arc::new(Mutex::new(RestoreStatus::default())),
            events,
        }
    }

    pub fn current(&self) -> RestoreStatus {
        lock(&self.status).clone()
    }

    fn set(&self, status: RestoreStatus) {
        *lock(&self.status) = status.clone();
        self.events.publish(BackupEvent::RestoreProgress(status));
    }

    pub fn start(&self, backup_id: &str) {
        self.set(RestoreStatus {
            backup_id: Some(backup_id.to_string()),
            running: true,
            progress: 0,
            description: "Restoring backup".to_string(),
            ..Default::default()
        });
    }

    /// Record a new sample; progress never goes backwards
    pub fn update(&self, progress: &ToolProgress) {
        let next = {
            let status = lock(&self.status);
            if !status.running {
                return;
            }
            // 100 is reserved for a finished restore
            let percent = (progress.percent.floor() as u8).min(99);
            if percent <= status.progress
                && progress.bytes_per_second.is_none()
                && progress.seconds_remaining.is_none()
            {
                return;
            }
            RestoreStatus {
                progress: percent.max(status.progress),
                bytes_per_second: progress.bytes_per_second.or(status.bytes_per_second),
                seconds_remaining: progress.seconds_remaining.or(status.seconds_remaining),
                ..status.clone()
            }
        };
        self.set(next);
    }

    pub fn succeed(&self) {
        let backup_id = lock(&self.status).backup_id.clone();
        self.set(RestoreStatus {
            backup_id,
            running: false,
            progress: 100,
            description: "Restore complete".to_string(),
            seconds_remaining: Some(0),
            ..Default::default()
        });
    }

    pub fn fail(&self, message: &str) {
        let current = self.current();
        self.set(RestoreStatus {
            running: false,
            description: "Restore failed".to_string(),
            error: Some(message.to_string()),
            bytes_per_second: None,
            seconds_remaining: None,
            ..current
        });
    }
}
