use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A single captured exchange, as handed to storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Interaction {
    pub protocol: String,
    pub unique_id: String,
    pub full_id: String,
    pub raw_request: String,
    pub remote_address: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
