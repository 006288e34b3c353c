//! Builds interaction records and hands them to storage.
//!
//! Recording is best effort. A record that can't be encoded or stored is
//! logged and dropped; the client has already had its reply by then.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::constants::INTERACTION_PROTOCOL;
use crate::correlation::CorrelationId;
use crate::interaction::Interaction;
use crate::storage::InteractionStorage;

pub struct InteractionRecorder {
    storage: Arc<dyn InteractionStorage>,
    token: String,
}

enum RecordKey<'a> {
    Correlation(&'a str),
    ServerToken,
}

impl InteractionRecorder {
    pub fn new(storage: Arc<dyn InteractionStorage>, token: String) -> Self {
        InteractionRecorder { storage, token }
    }

    /// The fallback token that unidentified records are stored against.
    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    /// Store a record for a probe that carried a correlation identifier.
    pub async fn record_identified(
        &self,
        correlation: &CorrelationId,
        raw_request: &str,
        remote_address: &str,
    ) {
        self.record(
            RecordKey::Correlation(correlation.correlation_key()),
            correlation.unique_id.clone(),
            correlation.full_id.clone(),
            raw_request,
            remote_address,
        )
        .await
    }

    /// Store a record for an operation without a correlation identifier.
    pub async fn record_unidentified(&self, raw_request: &str, remote_address: &str) {
        self.record(
            RecordKey::ServerToken,
            String::new(),
            String::new(),
            raw_request,
            remote_address,
        )
        .await
    }

    /// Store a diagnostic raised by the protocol layer itself.
    pub async fn record_internal(&self, message: &str) {
        self.record(
            RecordKey::ServerToken,
            String::new(),
            String::new(),
            message,
            "",
        )
        .await
    }

    async fn record(
        &self,
        key: RecordKey<'_>,
        unique_id: String,
        full_id: String,
        raw_request: &str,
        remote_address: &str,
    ) {
        let interaction = Interaction {
            protocol: INTERACTION_PROTOCOL.to_string(),
            unique_id,
            full_id,
            raw_request: raw_request.to_string(),
            remote_address: remote_address.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        };

        let mut data = match serde_json::to_vec(&interaction) {
            Ok(d) => d,
            Err(e) => {
                interaction_warn!(err = ?e, "Could not encode ldap interaction");
                return;
            }
        };
        data.push(b'\n');

        interaction_debug!(
            interaction = %String::from_utf8_lossy(&data).trim_end(),
            "LDAP Interaction"
        );

        let stored = match key {
            RecordKey::Correlation(correlation_key) => {
                self.storage.add_interaction(correlation_key, &data).await
            }
            RecordKey::ServerToken => {
                self.storage
                    .add_interaction_with_id(self.token.as_str(), &data)
                    .await
            }
        };

        if let Err(e) = stored {
            interaction_warn!(err = ?e, "Could not store ldap interaction");
        }
    }
}
