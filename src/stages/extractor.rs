//! Data extractor: pulls structured fields out of free text.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

use super::payload::{ExtractedData, MessagePayload, Sentiment};
use super::{Stage, StageKind, StageOutput};
use crate::error::StageError;

const URGENT_KEYWORDS: &[&str] = &[
    "urgent", "asap", "emergency", "immediately", "critical", "help", "please help", "stuck",
];
const POSITIVE_WORDS: &[&str] = &["happy", "great", "excellent", "thank", "pleased", "love", "wonderful"];
const NEGATIVE_WORDS: &[&str] = &[
    "frustrated", "angry", "disappointed", "terrible", "worst", "hate", "awful",
];

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b").expect("email pattern is valid")
});

/// Introduced name first, then any two capitalized words.
static NAMES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let ci = |pattern: &str| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("name pattern is valid")
    };
    vec![
        ci(r"(?:my name is|i am|this is)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)"),
        ci(r"([A-Z][a-z]+\s+[A-Z][a-z]+)"),
    ]
});

static PHONES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").expect("phone pattern is valid"),
        Regex::new(r"\(\d{3}\)\s*\d{3}[-.]?\d{4}").expect("phone pattern is valid"),
    ]
});

#[derive(Debug, Default, Clone, Copy)]
pub struct DataExtractor;

impl DataExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract_email(&self, text: &str) -> Option<String> {
        EMAIL.find(text).map(|m| m.as_str().to_string())
    }

    /// "My name is john doe" → "John Doe"; falls back to any two capitalized words.
    pub fn extract_name(&self, text: &str) -> Option<String> {
        NAMES
            .iter()
            .find_map(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| title_case(m.as_str().trim()))
    }

    pub fn extract_phone(&self, text: &str) -> Option<String> {
        PHONES
            .iter()
            .find_map(|re| re.find(text))
            .map(|m| m.as_str().to_string())
    }

    pub fn extract(&self, text: &str) -> ExtractedData {
        let lowered = text.to_lowercase();
        ExtractedData {
            email: self.extract_email(text),
            customer_name: self.extract_name(text),
            phone: self.extract_phone(text),
            sentiment: sentiment(&lowered),
            is_urgent: URGENT_KEYWORDS.iter().any(|k| lowered.contains(k)),
            content_length: text.chars().count(),
            word_count: text.split_whitespace().count(),
        }
    }
}

fn sentiment(lowered: &str) -> Sentiment {
    let count = |words: &[&str]| words.iter().filter(|w| lowered.contains(*w)).count();
    let positive = count(POSITIVE_WORDS);
    let negative = count(NEGATIVE_WORDS);
    match negative.cmp(&positive) {
        std::cmp::Ordering::Greater => Sentiment::Negative,
        std::cmp::Ordering::Less => Sentiment::Positive,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[async_trait]
impl Stage for DataExtractor {
    fn kind(&self) -> StageKind {
        StageKind::Extractor
    }

    async fn process(&self, mut payload: MessagePayload) -> Result<StageOutput, StageError> {
        let extracted = self.extract(&payload.content);
        let found_email = extracted.email.is_some();
        payload.extracted_data = Some(extracted);
        payload.processing_stage = "extracted".into();

        if found_email {
            info!(message_id = %payload.message_id, "Data extracted");
            Ok(StageOutput::new("extracted", payload))
        } else {
            warn!(message_id = %payload.message_id, "No email found, extraction incomplete");
            payload.errors.push("No email address found".into());
            Ok(StageOutput::new("extraction-incomplete", payload))
        }
    }
}
