//! Outbound chat notifications.
//!
//! Channels implement [`Notifier`]. The orchestrator only talks to [`NotifierMux`], which fans a
//! message out to every configured channel and swallows failures after logging and counting them.

pub mod discord;
pub mod telegram;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Secrets;

pub use discord::DiscordNotifier;
pub use telegram::TelegramNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Run failure or zero-new alert.
    Alert,
    /// "Articles were added ..." summaries.
    Summary,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Alert => "alert",
            NotificationKind::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub text: String,
    pub ts: DateTime<Utc>,
}

impl Notification {
    pub fn alert(text: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Alert,
            text: text.into(),
            ts: Utc::now(),
        }
    }

    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Summary,
            text: text.into(),
            ts: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

/// Fan-out over all enabled channels.
#[derive(Clone, Default)]
pub struct NotifierMux {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    pub fn with(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Telegram and Discord when their secrets are present; a log-only channel otherwise.
    pub fn from_secrets(secrets: &Secrets, client: reqwest::Client, timeout: Duration) -> Self {
        let mut mux = Self::default();
        if let (Some(token), Some(chat)) = (&secrets.telegram_token, &secrets.chat_id) {
            mux = mux.with(Arc::new(
                TelegramNotifier::new(token.clone(), chat.clone(), client.clone()).with_timeout(timeout),
            ));
        }
        if let Some(webhook) = &secrets.discord_webhook_url {
            mux = mux.with(Arc::new(
                DiscordNotifier::new(webhook.clone())
                    .with_client(client)
                    .with_timeout(timeout),
            ));
        }
        if mux.channels.is_empty() {
            tracing::warn!("no notification channel configured, falling back to log output");
            mux = mux.with(Arc::new(LogNotifier));
        }
        mux
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver to every channel. Never fails.
    pub async fn notify(&self, notification: &Notification) {
        for ch in &self.channels {
            match ch.send(notification).await {
                Ok(()) => {
                    counter!("branding_notifications_total", "channel" => ch.name(), "outcome" => "sent")
                        .increment(1);
                }
                Err(e) => {
                    counter!("branding_notifications_total", "channel" => ch.name(), "outcome" => "failed")
                        .increment(1);
                    tracing::warn!(
                        channel = ch.name(),
                        kind = notification.kind.as_str(),
                        error = %format!("{e:#}"),
                        "notify_failed"
                    );
                }
            }
        }
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, n: &Notification) -> anyhow::Result<()> {
        tracing::info!(kind = n.kind.as_str(), text = %n.text, "notification");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Keeps every notification in memory; handy in tests and dry runs.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel that records and then reports failure.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.text).collect()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, n: &Notification) -> anyhow::Result<()> {
        self.sent.lock().expect("notifier mutex poisoned").push(n.clone());
        if self.fail {
            anyhow::bail!("recording notifier set to fail");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_channel_does_not_stop_the_others() {
        let bad = Arc::new(RecordingNotifier::failing());
        let good = Arc::new(RecordingNotifier::new());
        let mux = NotifierMux::new(vec![bad.clone(), good.clone()]);
        mux.notify(&Notification::alert("ALERT: test")).await;
        assert_eq!(bad.texts(), vec!["ALERT: test".to_string()]);
        assert_eq!(good.texts(), vec!["ALERT: test".to_string()]);
    }

    #[test]
    fn empty_secrets_fall_back_to_log() {
        let mux = NotifierMux::from_secrets(&Secrets::default(), reqwest::Client::new(), Duration::from_secs(1));
        assert_eq!(mux.channel_names(), vec!["log"]);
    }

    #[test]
    fn both_chat_channels_are_enabled_from_secrets() {
        let secrets = Secrets {
            telegram_token: Some("t".into()),
            chat_id: Some("1".into()),
            discord_webhook_url: Some("https://discord.invalid/hook".into()),
            ..Secrets::default()
        };
        let mux = NotifierMux::from_secrets(&secrets, reqwest::Client::new(), Duration::from_secs(1));
        assert_eq!(mux.channel_names(), vec!["telegram", "discord"]);
    }
}
