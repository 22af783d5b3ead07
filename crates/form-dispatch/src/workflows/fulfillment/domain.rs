use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Phone number recorded for an applicant whose first record carries none.
pub const PHONE_NOT_PROVIDED: &str = "Not provided";

/// One application row delivered by the webhook.
///
/// Every field is optional on the wire: records lacking an email are dropped
/// by the grouper instead of failing the whole delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub phone_number: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub qr_code_url: Option<String>,
    #[serde(default)]
    pub record_id: Option<String>,
}

impl ApplicationRecord {
    pub fn serial_label(&self) -> &str {
        self.serial_number.as_deref().unwrap_or("unknown")
    }
}

/// Body accepted by `POST /webhook`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub records: Vec<ApplicationRecord>,
}

impl WebhookPayload {
    /// Parse a delivery body: a non-empty JSON object with a non-empty
    /// `records` array.
    pub fn from_slice(body: &[u8]) -> Result<Self, PayloadError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| PayloadError::Empty)?;
        let object = match value.as_object() {
            Some(object) if !object.is_empty() => object,
            _ => return Err(PayloadError::Empty),
        };
        match object.get("records").and_then(serde_json::Value::as_array) {
            Some(records) if !records.is_empty() => {}
            _ => return Err(PayloadError::NoRecords),
        }
        serde_json::from_value(value).map_err(PayloadError::Invalid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Empty webhook payload. Please provide valid data.")]
    Empty,
    #[error("Webhook payload must contain a non-empty records array.")]
    NoRecords,
    #[error("Invalid webhook payload: {0}")]
    Invalid(#[source] serde_json::Error),
}

/// Records for a single applicant email, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicantGroup {
    pub email: String,
    pub phone_number: String,
    pub records: Vec<ApplicationRecord>,
}

/// A stamped copy of the template written for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedDocument {
    pub serial_number: String,
    pub path: PathBuf,
}

/// Serial number and shareable link pairing emitted in the summary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRow {
    pub serial_number: Option<String>,
    pub link: Option<String>,
}

/// Numeric value of a serial for ordering purposes.
///
/// Leading digits are read after trimming (`"12a"` orders as 12); anything
/// without leading digits orders as 0.
pub fn serial_ordinal(raw: &str) -> u64 {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Identifier assigned to every accepted webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept only identifiers this service could have issued.
    pub fn parse(raw: &str) -> Option<Self> {
        uuid::Uuid::parse_str(raw)
            .ok()
            .map(|id| Self(id.to_string()))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(text)) if !text.trim().is_empty() => {
            Some(text.trim().to_string())
        }
        Some(serde_json::Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}
