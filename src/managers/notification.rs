//! Persistent system notifications with optional webhook delivery
//!
//! Notifications are identified by a key such as `backups-failing:<id>`.
//! Raising an already active key is a no-op; clearing removes it. Every
//! newly raised or cleared notification is also pushed to the configured
//! Discord-style webhook.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::NotificationConfig;
use crate::utils::store;

/// Key of the notification raised when a repository stops backing up
pub fn backups_failing_id(repository_id: &str) -> String {
    format!("backups-failing:{}", repository_id)
}

/// Notification manager backed by a JSON file
pub struct NotificationManager {
    config: NotificationConfig,
    store_path: PathBuf,
    lock: Mutex<()>,
}

/// Discord embed color codes (decimal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationColor {
    /// Red - for failures
    Failure = 15158332, // #E74C3C
    /// Green - for recovery
    Success = 3066993, // #2ECC71
}

impl NotificationColor {
    fn as_decimal(&self) -> u32 {
        *self as u32
    }
}

/// Notification to raise
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl Notification {
    pub fn backups_failing(repository_id: &str, repository_path: &str, since_secs: u64) -> Self {
        Self {
            id: backups_failing_id(repository_id),
            message: format!(
                "No successful backup to {} in the last {}",
                repository_path,
                format_duration(since_secs)
            ),
            fields: vec![
                ("Repository".to_string(), repository_id.to_string()),
                ("Location".to_string(), repository_path.to_string()),
            ],
        }
    }
}

/// Notification as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveNotification {
    pub id: String,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub raised_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct NotificationStore {
    notifications: Vec<ActiveNotification>,
}

/// Discord webhook payload
#[derive(Debug, Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<DiscordField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<DiscordFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

impl NotificationManager {
    /// Create a new notification manager persisting to `store_path`
    pub fn new(config: NotificationConfig, store_path: PathBuf) -> Self {
        Self {
            config,
            store_path,
            lock: Mutex::new(()),
        }
    }

    /// Whether newly raised notifications are pushed to a webhook
    pub fn webhook_enabled(&self) -> bool {
        !self.config.webhook_url.is_empty()
    }

    /// Raise a notification. Returns false if it was already active.
    pub async fn add(&self, notification: Notification) -> Result<bool> {
        let added = {
            let _guard = self.lock.lock().await;
            let raised = ActiveNotification {
                id: notification.id.clone(),
                message: notification.message.clone(),
                raised_at: chrono::Utc::now().timestamp_millis(),
            };
            store::update_json(&self.store_path, move |store: &mut NotificationStore| {
                if store.notifications.iter().any(|n| n.id == raised.id) {
                    return Ok(false);
                }
                store.notifications.push(raised);
                Ok(true)
            })
            .await
            .context("Failed to persist notification")?
        };

        if !added {
            debug!("Notification {} already active", notification.id);
            return Ok(false);
        }

        info!("Raised notification {}: {}", notification.id, notification.message);
        if self.webhook_enabled() {
            let payload = self.build_payload(&notification, NotificationColor::Failure);
            if let Err(e) = self.send_webhook(&payload).await {
                warn!("Failed to deliver notification {}: {:#}", notification.id, e);
            }
        }

        Ok(true)
    }

    /// Clear a notification. Returns false if it was not active.
    pub async fn clear(&self, id: &str) -> Result<bool> {
        let removed = {
            let _guard = self.lock.lock().await;
            let target = id.to_string();
            store::update_json(&self.store_path, move |store: &mut NotificationStore| {
                let position = store.notifications.iter().position(|n| n.id == target);
                Ok(position.map(|index| store.notifications.remove(index)))
            })
            .await
            .context("Failed to persist notification")?
        };

        let Some(removed) = removed else {
            return Ok(false);
        };

        info!("Cleared notification {}", id);
        if self.webhook_enabled() {
            let resolved = Notification {
                id: removed.id,
                message: format!("Resolved: {}", removed.message),
                fields: Vec::new(),
            };
            let payload = self.build_payload(&resolved, NotificationColor::Success);
            if let Err(e) = self.send_webhook(&payload).await {
                warn!("Failed to deliver notification {}: {:#}", id, e);
            }
        }

        Ok(true)
    }

    /// All active notifications, oldest first
    pub async fn list(&self) -> Result<Vec<ActiveNotification>> {
        let _guard = self.lock.lock().await;
        let store: NotificationStore = store::read_json(&self.store_path).await?;
        Ok(store.notifications)
    }

    pub async fn is_active(&self, id: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|n| n.id == id))
    }

    /// Build Discord webhook payload
    fn build_payload(&self, notification: &Notification, color: NotificationColor) -> DiscordPayload {
        let title = match color {
            NotificationColor::Failure => "\u{274C} Backups failing",
            NotificationColor::Success => "\u{2705} Backups recovered",
        };

        let fields = notification
            .fields
            .iter()
            .map(|(name, value)| DiscordField {
                name: name.clone(),
                value: value.clone(),
                inline: true,
            })
            .collect();

        let embed = DiscordEmbed {
            title: title.to_string(),
            description: Some(notification.message.clone()),
            color: color.as_decimal(),
            fields,
            footer: Some(DiscordFooter {
                text: "homeserver-backups".to_string(),
            }),
            timestamp: Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        };

        DiscordPayload {
            username: Some("Home Server Backups".to_string()),
            embeds: vec![embed],
        }
    }

    /// Send webhook to Discord
    async fn send_webhook(&self, payload: &DiscordPayload) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.webhook_timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .post(&self.config.webhook_url)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .context("Failed to send webhook")?;

        let status = response.status();
        if status.is_success() {
            debug!("Webhook sent successfully");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            error!("Webhook failed with status {}: {}", status, body);
            anyhow::bail!("Webhook failed with status {}: {}", status, body)
        }
    }
}

/// Format duration in human-readable form
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        let minutes = seconds / 60;
        let secs = seconds % 60;
        if secs == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, secs)
        }
    } else if seconds < 86400 {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        if minutes == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    } else {
        let days = seconds / 86400;
        let hours = (seconds % 86400) / 3600;
        if hours == 0 {
            format!("{}d", days)
        } else {
            format!("{}d {}h", days, hours)
        }
    }
}
