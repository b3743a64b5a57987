//! Webhook notifications.
//!
//! A [`NotificationEvent`] is rendered into one of several receiver
//! dialects ([`PayloadFormat`]) and POSTed by a [`Webhook`]. The
//! [`Dispatcher`] sits in front of it: it filters events against the
//! configured allow-list, runs each delivery on a detached task with a
//! concurrency cap, and makes sure nothing that happens during delivery
//! (errors, timeouts, panics) reaches the code that raised the event.

use crate::config::WebhookConfig;
use crate::error::NotifyError;
use crate::metrics::MetricsSink;
use crate::{COMMIT, USER_AGENT, VERSION};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Kinds of notification the sidecar emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A NEWNYM signal was sent.
    CircuitRenewed,
    /// A readiness check found Tor unhealthy without a state change.
    BootstrapFailed,
    /// Readiness flipped between healthy and unhealthy.
    HealthChanged,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 3] = [
        EventKind::CircuitRenewed,
        EventKind::BootstrapFailed,
        EventKind::HealthChanged,
    ];

    /// Wire name, as used in `WEBHOOK_EVENTS` and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CircuitRenewed => "circuit_renewed",
            EventKind::BootstrapFailed => "bootstrap_failed",
            EventKind::HealthChanged => "health_changed",
        }
    }

    /// Parse a configured event name.
    pub fn parse(name: &str) -> Option<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name.trim()))
    }

    fn discord_color(&self) -> u32 {
        match self {
            EventKind::CircuitRenewed => 3_447_003,
            EventKind::BootstrapFailed => 15_158_332,
            EventKind::HealthChanged => 15_844_367,
        }
    }

    fn slack_color(&self) -> &'static str {
        match self {
            EventKind::CircuitRenewed => "good",
            EventKind::BootstrapFailed => "danger",
            EventKind::HealthChanged => "warning",
        }
    }

    fn gotify_priority(&self) -> u8 {
        match self {
            EventKind::CircuitRenewed => 5,
            EventKind::BootstrapFailed => 8,
            EventKind::HealthChanged => 6,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-specific data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventDetails {
    /// Bootstrap progress, for incomplete bootstraps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<u32>,
    /// Built circuits; omitted when zero.
    #[serde(skip_serializing_if = "is_zero")]
    pub circuits: u32,
    /// Health class the event reports.
    pub healthy: bool,
    /// Failure text, when the status query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// One notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEvent {
    /// What happened.
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// When it was raised.
    pub timestamp: DateTime<Utc>,
    /// Human-readable summary.
    pub message: String,
    /// Event-specific data.
    pub details: EventDetails,
}

impl NotificationEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind, message: impl Into<String>, details: EventDetails) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            message: message.into(),
            details,
        }
    }
}

/// Receiver dialect for webhook bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    /// `embeds[]` rich card.
    #[default]
    Discord,
    /// `attachments[]`.
    Slack,
    /// Priority-tagged message.
    Gotify,
    /// The event as-is plus build info.
    Json,
}

impl PayloadFormat {
    /// Parse a template name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "discord" => Some(PayloadFormat::Discord),
            "slack" => Some(PayloadFormat::Slack),
            "gotify" => Some(PayloadFormat::Gotify),
            "json" => Some(PayloadFormat::Json),
            _ => None,
        }
    }

    /// Template name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Discord => "discord",
            PayloadFormat::Slack => "slack",
            PayloadFormat::Gotify => "gotify",
            PayloadFormat::Json => "json",
        }
    }

    /// Render `event` in this dialect.
    pub fn render(&self, event: &NotificationEvent) -> Result<Value, NotifyError> {
        let footer = format!("torwatch v{}", VERSION);

        let body = match self {
            PayloadFormat::Discord => json!({
                "embeds": [{
                    "title": event.kind.as_str(),
                    "description": event.message,
                    "color": event.kind.discord_color(),
                    "timestamp": event.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    "footer": { "text": footer },
                    "fields": detail_fields(&event.details, "name", "inline"),
                }]
            }),
            PayloadFormat::Slack => json!({
                "attachments": [{
                    "title": event.kind.as_str(),
                    "text": event.message,
                    "color": event.kind.slack_color(),
                    "footer": footer,
                    "ts": event.timestamp.timestamp(),
                    "fields": detail_fields(&event.details, "title", "short"),
                }]
            }),
            PayloadFormat::Gotify => json!({
                "title": event.kind.as_str(),
                "message": event.message,
                "priority": event.kind.gotify_priority(),
                "extras": {
                    "client::display": { "contentType": "text/markdown" }
                }
            }),
            PayloadFormat::Json => {
                let mut body = serde_json::to_value(event)?;
                if let Value::Object(map) = &mut body {
                    map.insert("version".to_string(), Value::from(VERSION));
                    map.insert("commit".to_string(), Value::from(COMMIT));
                }
                body
            }
        };

        Ok(body)
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discord and Slack share a field layout under different key names.
fn detail_fields(details: &EventDetails, name_key: &str, inline_key: &str) -> Vec<Value> {
    let mut fields = Vec::new();
    let mut push = |name: &str, value: String, inline: bool| {
        let mut field = serde_json::Map::new();
        field.insert(name_key.to_string(), Value::from(name));
        field.insert("value".to_string(), Value::from(value));
        field.insert(inline_key.to_string(), Value::from(inline));
        fields.push(Value::Object(field));
    };

    if let Some(bootstrap) = details.bootstrap {
        push("Bootstrap", format!("{}%", bootstrap), true);
    }
    if details.circuits > 0 {
        push("Circuits", details.circuits.to_string(), true);
    }
    if let Some(error) = &details.error {
        push("Error", error.clone(), false);
    }

    fields
}

/// Something that can deliver one event.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Deliver `event` once.
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// HTTP webhook receiver.
pub struct Webhook {
    url: String,
    format: PayloadFormat,
    timeout: Duration,
    client: reqwest::Client,
}

impl Webhook {
    /// Build a receiver for `url`, rendering bodies as `format`.
    pub fn new(
        url: impl Into<String>,
        format: PayloadFormat,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            url: url.into(),
            format,
            timeout,
            client,
        })
    }

    /// Receiver URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Payload dialect.
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// POST `event` once, bounded by the configured timeout.
    pub async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = self.format.render(event)?;

        let request = async {
            let response = self.client.post(&self.url).json(&body).send().await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            Ok::<(), NotifyError>(())
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| NotifyError::Timeout)?
    }
}

#[async_trait]
impl Deliver for Webhook {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.send(event).await
    }
}

/// Fire-and-forget event sink used by the HTTP layer.
pub trait Notify: Send + Sync {
    /// Hand off `event`. Never blocks on delivery and never fails.
    fn notify(&self, event: NotificationEvent);
}

/// Delivers allowed events on detached tasks, at most `max_in_flight` at a time.
pub struct Dispatcher {
    target: Option<Arc<dyn Deliver>>,
    events: Vec<EventKind>,
    permits: Arc<Semaphore>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    /// Deliver `events` to `target`, at most `max_in_flight` at a time.
    pub fn new(
        target: Arc<dyn Deliver>,
        events: Vec<EventKind>,
        max_in_flight: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            target: Some(target),
            events,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            metrics,
        }
    }

    /// A dispatcher that drops everything.
    pub fn disabled(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            target: None,
            events: Vec::new(),
            permits: Arc::new(Semaphore::new(1)),
            metrics,
        }
    }

    /// Build from configuration; no URL means disabled.
    pub fn from_config(
        config: &WebhookConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, NotifyError> {
        match &config.url {
            None => Ok(Self::disabled(metrics)),
            Some(url) => {
                let webhook = Webhook::new(url.clone(), config.format, config.timeout)?;
                Ok(Self::new(
                    Arc::new(webhook),
                    config.events.clone(),
                    config.max_in_flight,
                    metrics,
                ))
            }
        }
    }

    /// Whether a webhook target is configured.
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }
}

impl Notify for Dispatcher {
    fn notify(&self, event: NotificationEvent) {
        let Some(target) = &self.target else {
            return;
        };

        if !self.events.contains(&event.kind) {
            debug!(event = %event.kind, "event not enabled, skipping webhook");
            return;
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(event = %event.kind, "too many webhook deliveries in flight, dropping event");
                self.metrics
                    .webhook_request(event.kind.as_str(), "dropped", None);
                return;
            }
        };

        let target = Arc::clone(target);
        let metrics = Arc::clone(&self.metrics);
        let kind = event.kind;

        tokio::spawn(async move {
            let _permit = permit;

            let delivery = tokio::spawn(async move {
                let start = Instant::now();
                let result = target.deliver(&event).await;
                (result, start.elapsed())
            });

            match delivery.await {
                Ok((Ok(()), elapsed)) => {
                    debug!(event = %kind, duration = ?elapsed, "webhook notification sent");
                    metrics.webhook_request(kind.as_str(), "success", Some(elapsed));
                }
                Ok((Err(err), elapsed)) => {
                    error!(event = %kind, error = %err, duration = ?elapsed, "webhook notification failed");
                    let status = match err {
                        NotifyError::Timeout => "timeout",
                        _ => "error",
                    };
                    metrics.webhook_request(kind.as_str(), status, Some(elapsed));
                }
                Err(join) if join.is_panic() => {
                    error!(event = %kind, "webhook delivery panicked");
                    metrics.webhook_request(kind.as_str(), "error", None);
                }
                Err(_) => {
                    debug!(event = %kind, "webhook delivery cancelled");
                }
            }
        });
    }
}
