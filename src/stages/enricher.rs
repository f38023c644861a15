//! Database enricher: attaches the customer record for the extracted email.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::payload::{CustomerData, MessagePayload};
use super::{Stage, StageKind, StageOutput};
use crate::error::StageError;
use crate::lookup::CustomerLookup;

pub struct DatabaseEnricher {
    lookup: Arc<dyn CustomerLookup>,
}

impl DatabaseEnricher {
    pub fn new(lookup: Arc<dyn CustomerLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl Stage for DatabaseEnricher {
    fn kind(&self) -> StageKind {
        StageKind::Enricher
    }

    async fn process(&self, mut payload: MessagePayload) -> Result<StageOutput, StageError> {
        payload.processing_stage = "enriched".into();

        let Some(email) = payload.email().map(str::to_string) else {
            warn!(message_id = %payload.message_id, "No email address to look up");
            payload.errors.push("enrichment:no-email".into());
            payload.customer_data = Some(CustomerData::unknown());
            return Ok(StageOutput::new("enrichment-failed", payload));
        };

        // Unavailability propagates as a transient error so the delivery is retried.
        match self.lookup.find_by_key(&email).await? {
            Some(record) => {
                info!(
                    message_id = %payload.message_id,
                    customer_id = record.customer_id,
                    "Customer found"
                );
                payload.customer_data = Some(CustomerData::known(record));
                Ok(StageOutput::new("enriched", payload))
            }
            None => {
                warn!(message_id = %payload.message_id, email = %email, "Unknown customer");
                payload.customer_data = Some(CustomerData::unknown());
                Ok(StageOutput::new("unknown-customer", payload))
            }
        }
    }
}
