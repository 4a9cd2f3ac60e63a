// =============================================================================
// Notifier — optional Slack delivery for operational alerts
// =============================================================================
//
// Absence of configuration makes every call a no-op, and delivery failures
// only log: notifications must never change trading correctness.
// =============================================================================

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::Config;

/// Severity of an operational alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Warn,
    Error,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warn => f.write_str("WARN"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

struct SlackTarget {
    token: String,
    channel: String,
}

/// Fire-and-forget alert sink.
pub struct Notifier {
    slack: Option<SlackTarget>,
    http: reqwest::Client,
}

impl Notifier {
    /// Build from config; missing token or channel yields a no-op notifier.
    pub fn from_config(config: &Config) -> Self {
        let slack = match (&config.slack_token, &config.slack_channel) {
            (Some(token), Some(channel)) => Some(SlackTarget {
                token: token.clone(),
                channel: channel.clone(),
            }),
            _ => None,
        };
        if slack.is_none() {
            debug!("notifier disabled — alerts will be log-only");
        }
        Self {
            slack,
            http: reqwest::Client::new(),
        }
    }

    /// A notifier that only logs. Used by tests.
    pub fn disabled() -> Self {
        Self {
            slack: None,
            http: reqwest::Client::new(),
        }
    }

    /// Emit an operational alert. Always logs; delivers to Slack when
    /// configured. Never returns an error.
    pub async fn alert(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Warn => warn!(alert = true, "{message}"),
            AlertLevel::Error => error!(alert = true, "{message}"),
        }

        let Some(ref target) = self.slack else {
            return;
        };

        let body = serde_json::json!({
            "channel": target.channel,
            "text": format!("[{level}] {message}"),
        });

        let result = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&target.token)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "slack alert delivery failed"),
            Err(e) => warn!(error = %e, "slack alert delivery failed"),
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("slack_configured", &self.slack.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_is_a_noop() {
        // Must not panic or attempt delivery.
        let notifier = Notifier::disabled();
        notifier.alert(AlertLevel::Warn, "something odd").await;
        notifier.alert(AlertLevel::Error, "something bad").await;
    }

    #[test]
    fn config_without_slack_disables_delivery() {
        let config = Config::default();
        let notifier = Notifier::from_config(&config);
        assert!(notifier.slack.is_none());
    }
}
