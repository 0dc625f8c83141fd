//! `MetricSink`: fire-and-forget emission of round outcomes to an external
//! tracking service. Grounded in the teacher's `rest::client::HttpClient` /
//! `release_stats` pattern, generalized from a single stats POST to a
//! bounded best-effort retry.
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One round's outcome, posted to the configured metric-sink endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundEvent {
    pub round_id: String,
    pub model_id: String,
    pub round_number: u64,
    pub outcome: RoundOutcome,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundOutcome {
    Completed,
    Failed,
}

/// Posts [`RoundEvent`]s to an external tracking service. Never surfaces a
/// failure to its caller: a dropped metric is logged and forgotten, never
/// allowed to fail a round.
pub struct MetricSink {
    client: Client,
    endpoint: Option<String>,
    max_attempts: u32,
}

impl MetricSink {
    /// `endpoint = None` disables emission entirely (every event is logged
    /// and dropped immediately).
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            max_attempts: 3,
        }
    }

    /// Emits `event`, retrying up to `max_attempts` times with linear
    /// backoff. Always returns; errors are logged, never propagated.
    pub async fn emit(&self, event: RoundEvent) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.post(endpoint).json(&event).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(round_id = %event.round_id, status = %resp.status(), attempt, "metric sink rejected event");
                }
                Err(err) => {
                    warn!(round_id = %event.round_id, %err, attempt, "metric sink request failed");
                }
            }
            if attempt >= self.max_attempts {
                warn!(round_id = %event.round_id, "dropping round event after exhausting retries");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200 * attempt as u64)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_sink_drops_silently() {
        let sink = MetricSink::new(None);
        sink.emit(RoundEvent {
            round_id: "r1".into(),
            model_id: "m1".into(),
            round_number: 1,
            outcome: RoundOutcome::Completed,
            metrics: serde_json::json!({}),
        })
        .await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_logged_and_dropped() {
        let sink = MetricSink::new(Some("http://127.0.0.1:1/metrics".to_string()));
        sink.emit(RoundEvent {
            round_id: "r1".into(),
            model_id: "m1".into(),
            round_number: 1,
            outcome: RoundOutcome::Failed,
            metrics: serde_json::json!({}),
        })
        .await;
    }
}
