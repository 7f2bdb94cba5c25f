//! Notification events, their rendering and delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use crate::config::{Config, ConfigError, Timezone};
use crate::digest;
use crate::engine::UpdatedWorkload;

const TIME_FORMAT: &str = "%A, %B %-d, %Y %H:%M:%S %:z";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Dispatch(#[from] reqwest::Error),
    #[error("Unsupported notifier '{0}', expected an http or https URL")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Startup {
        endpoints: Vec<String>,
        next_run: Option<DateTime<Utc>>,
    },
    /// Monitor-only passes that found stale workloads.
    DetectedUpdates {
        endpoint: String,
        monitored: usize,
        total_updated: u64,
        updates: Vec<UpdatedWorkload>,
    },
    Updated {
        endpoint: String,
        monitored: usize,
        total_updated: u64,
        updates: Vec<UpdatedWorkload>,
    },
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub title: String,
    pub body: String,
}

/// `unix:///var/run/docker.sock` becomes `/var/run/docker.sock`.
fn socket_of(endpoint: &str) -> &str {
    endpoint.split_once("//").map_or(endpoint, |(_, rest)| rest)
}

fn update_lines(updates: &[UpdatedWorkload]) -> impl Iterator<Item = String> + '_ {
    updates.iter().map(|u| {
        format!(
            "{} updated from {} to {}",
            u.name,
            digest::short_digest(&u.old_image),
            digest::short_digest(&u.new_image)
        )
    })
}

impl NotificationEvent {
    pub fn render(&self, hostname: &str, timezone: Timezone, now: DateTime<Utc>) -> Message {
        let (title, lines): (&str, Vec<String>) = match self {
            NotificationEvent::Startup { endpoints, next_run } => {
                let next = next_run
                    .map(|at| timezone.format(at, TIME_FORMAT))
                    .unwrap_or_else(|| "none".to_string());
                (
                    "freshen has started",
                    vec![
                        format!("Host: {hostname}"),
                        format!("Endpoints: {}", endpoints.join(", ")),
                        format!("Time: {}", timezone.format(now, TIME_FORMAT)),
                        format!("Next Run: {next}"),
                    ],
                )
            }
            NotificationEvent::DetectedUpdates {
                endpoint,
                monitored,
                total_updated,
                updates,
            } => {
                let mut lines = vec![
                    format!("Host/Socket: {hostname} / {}", socket_of(endpoint)),
                    format!("Containers Monitored: {monitored}"),
                    format!("Total Containers Updated: {total_updated}"),
                ];
                lines.extend(update_lines(updates));
                ("freshen has detected updates!", lines)
            }
            NotificationEvent::Updated {
                endpoint,
                monitored,
                total_updated,
                updates,
            } => {
                let mut lines = vec![
                    format!("Host/Socket: {hostname} / {}", socket_of(endpoint)),
                    format!("Containers Monitored: {monitored}"),
                    format!("Total Containers Updated: {total_updated}"),
                    format!("Containers updated this pass: {}", updates.len()),
                ];
                lines.extend(update_lines(updates));
                ("freshen has updated containers!", lines)
            }
        };
        Message {
            title: title.to_string(),
            body: lines.join("\r\n"),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, message: &Message) -> Result<(), NotifyError>;
}

/// Writes every notification to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, message: &Message) -> Result<(), NotifyError> {
        log::info!("{}: {}", message.title, message.body.replace("\r\n", "; "));
        Ok(())
    }
}

/// POSTs `{"title": ..., "body": ...}` to a URL.
pub struct WebhookNotifier {
    url: Url,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(uri: &str) -> Result<Self, NotifyError> {
        let url = Url::parse(uri).map_err(|_| NotifyError::UnsupportedScheme(uri.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NotifyError::UnsupportedScheme(uri.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        self.url.host_str().unwrap_or("webhook")
    }

    async fn notify(&self, message: &Message) -> Result<(), NotifyError> {
        self.client
            .post(self.url.clone())
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fans events out to every configured notifier.
pub struct NotificationManager {
    notifiers: Vec<Arc<dyn Notifier>>,
    hostname: String,
    timezone: Timezone,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self {
            notifiers: vec![Arc::new(LogNotifier)],
            hostname: "freshen".to_string(),
            timezone: Timezone::Utc,
        }
    }
}

impl NotificationManager {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, hostname: &str, timezone: Timezone) -> Self {
        Self {
            notifiers,
            hostname: hostname.to_string(),
            timezone,
        }
    }

    /// Build the notifier list. Unusable URIs are logged and skipped.
    pub fn from_config(config: &Config) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        for uri in &config.notifiers {
            match WebhookNotifier::new(uri) {
                Ok(webhook) => notifiers.push(Arc::new(webhook)),
                Err(e) => {
                    let err = ConfigError::InvalidNotifier(uri.clone());
                    log::error!("{err}: {e}");
                }
            }
        }
        Self::new(notifiers, &config.hostname, config.timezone)
    }

    pub fn render(&self, event: &NotificationEvent) -> Message {
        event.render(&self.hostname, self.timezone, Utc::now())
    }

    /// Deliver in the background. Failures are logged and dropped.
    pub fn send(&self, event: NotificationEvent) {
        let message = self.render(&event);
        let notifiers = self.notifiers.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { deliver(&notifiers, &message).await });
            }
            Err(_) => log::warn!("No runtime to deliver '{}'", message.title),
        }
    }

    /// Deliver and wait for every notifier to finish.
    pub async fn dispatch(&self, event: NotificationEvent) {
        let message = self.render(&event);
        deliver(&self.notifiers, &message).await;
    }
}

async fn deliver(notifiers: &[Arc<dyn Notifier>], message: &Message) {
    for notifier in notifiers {
        if let Err(e) = notifier.notify(message).await {
            log::error!("Notifier {} failed: {e}", notifier.name());
        }
    }
}

/// Keeps every message it receives. Used by tests across the crate.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: std::sync::Mutex<Vec<Message>>,
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, message: &Message) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn web() -> UpdatedWorkload {
        UpdatedWorkload {
            name: "web".to_string(),
            old_image: "abc123".to_string(),
            new_image: "def456".to_string(),
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_render_updated() {
        let event = NotificationEvent::Updated {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            monitored: 3,
            total_updated: 5,
            updates: vec![web()],
        };
        let message = event.render("box", Timezone::Utc, at());
        assert_eq!(message.title, "freshen has updated containers!");
        assert_eq!(
            message.body,
            "Host/Socket: box / /var/run/docker.sock\r\n\
             Containers Monitored: 3\r\n\
             Total Containers Updated: 5\r\n\
             Containers updated this pass: 1\r\n\
             web updated from abc123 to def456"
        );
    }

    #[test]
    fn test_render_detected_shortens_digests() {
        let event = NotificationEvent::DetectedUpdates {
            endpoint: "tcp://10.0.0.2:2376".to_string(),
            monitored: 1,
            total_updated: 0,
            updates: vec![UpdatedWorkload {
                name: "api".to_string(),
                old_image: "0123456789abcdef".to_string(),
                new_image: "fedcba9876543210".to_string(),
            }],
        };
        let message = event.render("box", Timezone::Utc, at());
        assert_eq!(message.title, "freshen has detected updates!");
        assert!(message.body.starts_with("Host/Socket: box / 10.0.0.2:2376"));
        assert!(message.body.ends_with("api updated from 0123456789 to fedcba9876"));
    }

    #[test]
    fn test_render_startup() {
        let event = NotificationEvent::Startup {
            endpoints: vec!["unix:///var/run/docker.sock".to_string()],
            next_run: None,
        };
        let message = event.render("box", Timezone::Utc, at());
        assert_eq!(message.title, "freshen has started");
        assert!(message.body.contains("Time: Friday, March 1, 2024 12:00:00 +00:00"));
        assert!(message.body.ends_with("Next Run: none"));
    }

    #[test]
    fn test_webhook_rejects_other_schemes() {
        assert!(matches!(
            WebhookNotifier::new("slack://token/channel"),
            Err(NotifyError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            WebhookNotifier::new("not a url"),
            Err(NotifyError::UnsupportedScheme(_))
        ));
        assert!(WebhookNotifier::new("https://hooks.example.com/freshen").is_ok());
    }

    #[test]
    fn test_from_config_skips_invalid_notifiers() {
        let config = Config {
            notifiers: vec![
                "https://hooks.example.com/freshen".to_string(),
                "pushover://user@token".to_string(),
            ],
            ..Config::default()
        };
        let manager = NotificationManager::from_config(&config);
        // Log notifier plus the one valid webhook.
        assert_eq!(manager.notifiers.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_notifier() {
        let first = Arc::new(RecordingNotifier::default());
        let second = Arc::new(RecordingNotifier::default());
        let manager = NotificationManager::new(
            vec![first.clone(), second.clone()],
            "box",
            Timezone::Utc,
        );
        manager
            .dispatch(NotificationEvent::Startup {
                endpoints: vec![],
                next_run: None,
            })
            .await;
        assert_eq!(first.messages.lock().unwrap().len(), 1);
        assert_eq!(second.messages.lock().unwrap().len(), 1);
    }
}
