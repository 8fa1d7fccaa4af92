//! Notification delivery for alerts and digests
//!
//! Delivery is best-effort: a notifier reports success as a boolean and never
//! returns an error. Message text comes from an injected [`MessageFormatter`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NotifierConfig;
use crate::error::{Error, Result};
use crate::models::{Alert, AlertDecision, DigestJob, DigestPeriod};

/// Renders alerts and digests into message text
pub trait MessageFormatter: Send + Sync {
    /// Text for one alert
    fn format_alert(&self, decision: &AlertDecision) -> String;

    /// Text for a digest whose body was already built
    fn format_digest(&self, job: &DigestJob, body: &str) -> String;
}

/// English templates with HTML markup
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl MessageFormatter for PlainFormatter {
    fn format_alert(&self, decision: &AlertDecision) -> String {
        let title = escape_html(&decision.channel_title);
        match &decision.alert {
            Alert::MassLeave { count, minutes } => {
                format!("⚠️ Mass unsubscribes in <b>{title}</b>: {count} in last {minutes} min")
            }
            Alert::AnomalySpike { count } => {
                format!("⚠️ Spike detected in <b>{title}</b>: {count} events in last hour")
            }
            Alert::AnomalyDrop { .. } => {
                format!("⚠️ Activity drop detected in <b>{title}</b>")
            }
            Alert::Milestone { milestone } => {
                format!("🎉 Milestone in <b>{title}</b>: {milestone} members!")
            }
            Alert::ChurnThreshold {
                churn_percent,
                threshold,
            } => format!(
                "⚠️ Churn alert in <b>{title}</b>: {churn_percent:.1}% (threshold {threshold})"
            ),
            Alert::VipLeft { user_id } => {
                format!("🔥 VIP left <b>{title}</b> (ID {user_id})")
            }
        }
    }

    fn format_digest(&self, job: &DigestJob, body: &str) -> String {
        let prefix = match job.period {
            DigestPeriod::Daily => "📅 Daily digest",
            DigestPeriod::Weekly => "📊 Weekly digest",
            DigestPeriod::Monthly => "📋 Monthly digest",
        };
        format!("{prefix}\n\n{body}")
    }
}

/// Escape the characters that would break HTML message markup
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Delivers alerts and digests to a chat
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one alert; `false` when delivery failed
    async fn send_alert(&self, chat_id: i64, decision: &AlertDecision) -> bool;

    /// Send a digest with prebuilt content; `false` when delivery failed
    async fn send_digest(&self, chat_id: i64, job: &DigestJob, content: &str) -> bool;
}

/// Build the notifier selected by configuration.
///
/// Without a webhook URL messages are only logged.
pub fn notifier_from_config(
    config: &NotifierConfig,
    formatter: Arc<dyn MessageFormatter>,
) -> Result<Arc<dyn Notifier>> {
    match config.webhook_url {
        Some(_) => Ok(Arc::new(WebhookNotifier::new(config, formatter)?)),
        None => {
            info!("No notifier webhook configured, notifications will only be logged");
            Ok(Arc::new(LogNotifier::new(formatter)))
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    kind: &'a str,
}

/// Posts messages to a bot gateway over HTTP
pub struct WebhookNotifier {
    client: Client,
    url: String,
    auth_token: Option<String>,
    formatter: Arc<dyn MessageFormatter>,
}

impl WebhookNotifier {
    /// Create a webhook notifier; `config.webhook_url` must be set
    pub fn new(config: &NotifierConfig, formatter: Arc<dyn MessageFormatter>) -> Result<Self> {
        let url = config
            .webhook_url
            .clone()
            .ok_or_else(|| Error::config("notifier.webhook_url is required for webhook delivery"))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            auth_token: config.auth_token.clone(),
            formatter,
        })
    }

    async fn post(&self, chat_id: i64, kind: &str, text: &str) -> bool {
        let payload = WebhookPayload {
            chat_id,
            text,
            parse_mode: "HTML",
            kind,
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(chat_id, kind, "Notification delivered");
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(chat_id, kind, %status, body = %body, "Notification rejected by gateway");
                record_failure("webhook");
                false
            }
            Err(e) => {
                warn!(chat_id, kind, error = %e, "Notification delivery failed");
                record_failure("webhook");
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_alert(&self, chat_id: i64, decision: &AlertDecision) -> bool {
        let text = self.formatter.format_alert(decision);
        self.post(chat_id, decision.kind().as_str(), &text).await
    }

    async fn send_digest(&self, chat_id: i64, job: &DigestJob, content: &str) -> bool {
        let text = self.formatter.format_digest(job, content);
        let kind = format!("digest_{}", job.period);
        self.post(chat_id, &kind, &text).await
    }
}

/// Logs messages instead of sending them
pub struct LogNotifier {
    formatter: Arc<dyn MessageFormatter>,
}

impl LogNotifier {
    /// Create a logging notifier
    pub fn new(formatter: Arc<dyn MessageFormatter>) -> Self {
        Self { formatter }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(Arc::new(PlainFormatter))
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, chat_id: i64, decision: &AlertDecision) -> bool {
        let text = self.formatter.format_alert(decision);
        info!(chat_id, kind = %decision.kind(), text = %text, "Alert");
        true
    }

    async fn send_digest(&self, chat_id: i64, job: &DigestJob, content: &str) -> bool {
        let text = self.formatter.format_digest(job, content);
        info!(chat_id, period = %job.period, text = %text, "Digest");
        true
    }
}

fn record_failure(target: &'static str) {
    metrics::counter!("churnwatch_notifications_failed_total", "target" => target).increment(1);
}
