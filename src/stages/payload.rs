//! Message payload schema shared by every pipeline stage.
//!
//! Each stage reads the payload of the event it consumes, fills in its own
//! section, and sends the whole document on in its reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::Classification;
use crate::lookup::CustomerRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub processing_stage: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Accumulated business-level problems, e.g. `validation:<issue>`.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<ExtractedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_data: Option<CustomerData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Classification>,
}

impl MessagePayload {
    /// A freshly received message.
    pub fn received(message_id: impl Into<String>, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            content: content.into(),
            timestamp,
            processing_stage: "received".into(),
            metadata: serde_json::Map::new(),
            errors: Vec::new(),
            extracted_data: None,
            validation: None,
            customer_data: None,
            routing: None,
        }
    }

    /// The extracted email, if extraction found one.
    pub fn email(&self) -> Option<&str> {
        self.extracted_data.as_ref()?.email.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub email: Option<String>,
    pub customer_name: Option<String>,
    pub phone: Option<String>,
    pub sentiment: Sentiment,
    pub is_urgent: bool,
    pub content_length: usize,
    pub word_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub checks_performed: u32,
    pub issues_found: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerData {
    pub is_known_customer: bool,
    #[serde(flatten)]
    pub record: Option<CustomerRecord>,
}

impl CustomerData {
    pub fn unknown() -> Self {
        Self {
            is_known_customer: false,
            record: None,
        }
    }

    pub fn known(record: CustomerRecord) -> Self {
        Self {
            is_known_customer: true,
            record: Some(record),
        }
    }
}
