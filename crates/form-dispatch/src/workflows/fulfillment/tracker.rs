//! Status write-back to the Airtable application table.
//!
//! Airtable allows a handful of requests per second per base and answers
//! with 429 once that budget is exhausted. Calls are spaced by a minimum
//! interval, and a 429 triggers a backoff that honors `Retry-After` when the
//! server sends one.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::config::TrackerConfig;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Transport(String),
    #[error("tracker rejected update for {record_id} with HTTP {status}: {body}")]
    Rejected {
        record_id: String,
        status: u16,
        body: String,
    },
    #[error("tracker still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
}

/// Records that a form was shared for a tracked application row.
#[async_trait]
pub trait TrackerGateway: Send + Sync + Debug {
    async fn mark_shared(&self, record_id: &str, link: &str) -> Result<(), TrackerError>;
}

/// Spacing and backoff rules for calls against a rate-limited API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicy {
    pub min_interval: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_retries: 3,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RatePolicy {
    /// Delay before retry `attempt` (1-based) after a 429.
    pub fn backoff_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        retry_after.unwrap_or(exponential).min(self.max_backoff)
    }
}

#[derive(Debug)]
pub struct RatePacer {
    policy: RatePolicy,
    next_slot: Mutex<Option<Instant>>,
}

impl RatePacer {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            next_slot: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Wait until at least `min_interval` has passed since the previous call.
    pub async fn wait_turn(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.policy.min_interval);
    }

    /// Push the next slot out after the server signalled a rate limit.
    pub async fn defer(&self, delay: Duration) {
        let mut next_slot = self.next_slot.lock().await;
        let candidate = Instant::now() + delay;
        *next_slot = Some(match *next_slot {
            Some(slot) if slot > candidate => slot,
            _ => candidate,
        });
    }
}

/// Partial row updates through the Airtable REST API.
#[derive(Debug)]
pub struct AirtableTracker {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    link_field: String,
    status_field: String,
    status_label: String,
    pacer: RatePacer,
}

impl AirtableTracker {
    pub fn new(client: reqwest::Client, config: &TrackerConfig) -> Self {
        let endpoint = format!(
            "{}/v0/{}/{}",
            config.api_url.trim_end_matches('/'),
            config.base_id,
            config.table_name
        );
        Self {
            client,
            endpoint,
            token: config.token.clone(),
            link_field: config.link_field.clone(),
            status_field: config.status_field.clone(),
            status_label: config.status_label.clone(),
            pacer: RatePacer::new(RatePolicy {
                min_interval: config.min_interval,
                max_retries: config.max_retries,
                backoff: config.backoff,
                max_backoff: config.max_backoff,
            }),
        }
    }

    /// Tracker with its own HTTP client.
    pub fn from_config(config: &TrackerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::new(client, config))
    }

    pub fn record_url(&self, record_id: &str) -> String {
        format!("{}/{}", self.endpoint, record_id)
    }

    pub fn update_body(&self, link: &str) -> Value {
        let mut fields = serde_json::Map::new();
        fields.insert(self.link_field.clone(), Value::String(link.to_string()));
        fields.insert(
            self.status_field.clone(),
            Value::String(self.status_label.clone()),
        );
        json!({ "fields": fields })
    }
}

#[async_trait]
impl TrackerGateway for AirtableTracker {
    async fn mark_shared(&self, record_id: &str, link: &str) -> Result<(), TrackerError> {
        let url = self.record_url(record_id);
        let body = self.update_body(link);
        let max_retries = self.pacer.policy().max_retries;

        for attempt in 0..=max_retries {
            self.pacer.wait_turn().await;
            info!(record_id, attempt, "updating tracker record");

            let response = self
                .client
                .patch(&url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await
                .map_err(|err| TrackerError::Transport(err.to_string()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                if attempt == max_retries {
                    break;
                }
                let delay = self.pacer.policy().backoff_for(attempt + 1, retry_after);
                warn!(record_id, delay_ms = delay.as_millis() as u64, "tracker rate limited");
                self.pacer.defer(delay).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TrackerError::Rejected {
                    record_id: record_id.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            info!(record_id, "tracker record updated");
            return Ok(());
        }

        Err(TrackerError::RateLimited {
            attempts: max_retries + 1,
        })
    }
}
