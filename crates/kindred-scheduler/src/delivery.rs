//! Delivery channels: where scheduled and proactive messages go.
//! Supports: HTTP webhook (POST JSON) and a log-only sink.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kindred_core::config::DeliveryConfig;
use kindred_core::error::{KindredError, Result};
use serde::{Deserialize, Serialize};

/// Why a message is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Scheduled,
    Proactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPriority {
    Low,
    Normal,
    High,
}

/// The payload pushed to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub title: String,
    pub message: String,
    pub priority: DeliveryPriority,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn scheduled(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Scheduled,
            title: "Reminder".into(),
            message: message.into(),
            priority: DeliveryPriority::High,
            timestamp: Utc::now(),
        }
    }

    pub fn proactive(message: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Proactive,
            title: "Check-in".into(),
            message: message.into(),
            priority: DeliveryPriority::Normal,
            timestamp: Utc::now(),
        }
    }
}

/// A black-box sink for outbound messages.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether anyone can currently receive a message.
    fn is_reachable(&self) -> bool;

    async fn deliver(&self, message: &OutboundMessage) -> Result<()>;
}

/// POSTs the message as JSON.
pub struct WebhookChannel {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            headers,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn is_reachable(&self) -> bool {
        !self.url.is_empty()
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(message)
            .timeout(Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| KindredError::DeliveryFailure(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook delivered to {}: {}", self.url, message.title);
            Ok(())
        } else {
            Err(KindredError::DeliveryFailure(format!(
                "Webhook error {}",
                resp.status()
            )))
        }
    }
}

/// Writes the message to the log. Always reachable.
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn is_reachable(&self) -> bool {
        true
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        tracing::info!(
            kind = ?message.kind,
            priority = ?message.priority,
            "📨 {}: {}",
            message.title,
            message.message
        );
        Ok(())
    }
}

/// Webhook when configured, log-only otherwise.
pub fn channel_from_config(config: &DeliveryConfig) -> std::sync::Arc<dyn DeliveryChannel> {
    match config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => std::sync::Arc::new(WebhookChannel::new(url, config.headers.clone())),
        None => std::sync::Arc::new(LogChannel),
    }
}
