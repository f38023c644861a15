//! Content validator: rule-based checks that accumulate issues.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use super::payload::{MessagePayload, ValidationReport};
use super::{Stage, StageKind, StageOutput};
use crate::error::StageError;

const SPAM_KEYWORDS: &[&str] = &[
    "viagra",
    "cialis",
    "lottery",
    "winner",
    "congratulations",
    "click here",
    "free money",
    "nigerian prince",
    "inheritance",
    "crypto",
    "bitcoin wallet",
    "investment opportunity",
];

const PROFANITY: &[&str] = &["spam", "scam", "hack", "phishing", "malware", "virus"];

const MIN_LENGTH: usize = 10;
const MAX_LENGTH: usize = 10_000;
const CAPS_MIN_LENGTH: usize = 20;
const MAX_URLS: usize = 3;
const MAX_RUN: usize = 5;

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:[a-zA-Z0-9$-_@.&+!*(),]|%[0-9a-fA-F]{2})+").expect("url pattern is valid")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct ContentValidator;

impl ContentValidator {
    pub fn new() -> Self {
        Self
    }

    /// Run every check; `checks_performed` counts checks, not issues.
    pub fn validate(&self, content: &str) -> ValidationReport {
        let lowered = content.to_lowercase();
        let mut issues = Vec::new();
        let mut checks = 0;

        checks += 1;
        let spam = found_in(&lowered, SPAM_KEYWORDS);
        if !spam.is_empty() {
            issues.push(format!("Spam keywords: {}", spam.join(", ")));
        }

        checks += 1;
        let profanity = found_in(&lowered, PROFANITY);
        if !profanity.is_empty() {
            issues.push(format!("Profanity: {}", profanity.join(", ")));
        }

        checks += 1;
        let length = content.chars().count();
        if length < MIN_LENGTH {
            issues.push(format!("Message too short (minimum {MIN_LENGTH} characters)"));
        }
        if length > MAX_LENGTH {
            issues.push("Message too long (maximum 10,000 characters)".to_string());
        }

        checks += 1;
        if length > CAPS_MIN_LENGTH {
            let upper = content.chars().filter(|c| c.is_uppercase()).count();
            if upper as f64 / length as f64 > 0.5 {
                issues.push("Excessive capitalization detected (>50%)".to_string());
            }
        }

        checks += 1;
        let urls = URL.find_iter(content).count();
        if urls > MAX_URLS {
            issues.push(format!("Too many URLs detected ({urls})"));
        }

        checks += 1;
        if has_repeated_run(content, MAX_RUN) {
            issues.push("Excessive character repetition detected".to_string());
        }

        ValidationReport {
            is_valid: issues.is_empty(),
            checks_performed: checks,
            issues_found: issues,
        }
    }
}

fn found_in<'a>(lowered: &str, words: &[&'a str]) -> Vec<&'a str> {
    words.iter().copied().filter(|w| lowered.contains(w)).collect()
}

/// Any character other than a newline repeated `run` or more times in a row.
fn has_repeated_run(text: &str, run: usize) -> bool {
    let mut previous = None;
    let mut count = 0;
    for c in text.chars() {
        if c != '\n' && previous == Some(c) {
            count += 1;
        } else {
            count = 1;
        }
        if c != '\n' && count >= run {
            return true;
        }
        previous = Some(c);
    }
    false
}

#[async_trait]
impl Stage for ContentValidator {
    fn kind(&self) -> StageKind {
        StageKind::Validator
    }

    async fn process(&self, mut payload: MessagePayload) -> Result<StageOutput, StageError> {
        let report = self.validate(&payload.content);
        payload
            .errors
            .extend(report.issues_found.iter().map(|issue| format!("validation:{issue}")));
        payload.processing_stage = "validated".into();

        let outcome = if report.is_valid {
            info!(message_id = %payload.message_id, checks = report.checks_performed, "Validation passed");
            "validated"
        } else {
            warn!(
                message_id = %payload.message_id,
                issues = ?report.issues_found,
                "Validation failed"
            );
            "validation-failed"
        };
        payload.validation = Some(report);
        Ok(StageOutput::new(outcome, payload))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn url_pattern_is_shared_across_instances() {
        assert_eq!(std::mem::size_of::<ContentValidator>(), 0);
        let links = "see http://a.io http://b.io http://c.io http://d.io for details";
        assert_eq!(
            ContentValidator::new().validate(links).is_valid,
            ContentValidator::default().validate(links).is_valid
        );
    }

    #[test]
    fn clean_message_passes_all_checks() {
        let report = ContentValidator::new().validate("Hi, I need help with billing. Email: a@b.com");
        assert!(report.is_valid);
        assert_eq!(report.checks_performed, 6);
        assert!(report.issues_found.is_empty());
    }

    #[test]
    fn spam_and_profanity_are_listed() {
        let report = ContentValidator::new().validate("Congratulations winner, this is not a scam");
        assert!(!report.is_valid);
        assert_eq!(
            report.issues_found,
            vec!["Spam keywords: winner, congratulations", "Profanity: scam"]
        );
    }

    #[test]
    fn length_bounds() {
        let validator = ContentValidator::new();
        assert_eq!(
            validator.validate("short").issues_found,
            vec!["Message too short (minimum 10 characters)"]
        );
        let long = "ab ".repeat(4000);
        assert!(validator
            .validate(&long)
            .issues_found
            .contains(&"Message too long (maximum 10,000 characters)".to_string()));
    }

    #[test]
    fn shouting_is_flagged_only_for_longer_text() {
        let validator = ContentValidator::new();
        assert!(validator
            .validate("WHY IS MY ACCOUNT LOCKED RIGHT NOW")
            .issues_found
            .contains(&"Excessive capitalization detected (>50%)".to_string()));
        assert!(validator.validate("OK THANKS ALL").is_valid);
    }

    #[test]
    fn url_count() {
        let text = "see http://a.io http://b.io https://c.io https://d.io for details";
        assert!(ContentValidator::new()
            .validate(text)
            .issues_found
            .contains(&"Too many URLs detected (4)".to_string()));
    }

    #[test]
    fn repeated_characters() {
        assert!(has_repeated_run("heeeeelp me", 5));
        assert!(!has_repeated_run("heeeelp me", 5));
        assert!(!has_repeated_run("a\n\n\n\n\nb", 5));
    }

    #[tokio::test]
    async fn failures_become_prefixed_errors_and_branch() {
        let payload = MessagePayload::received("m-2", "free money, click here!!!!!", Utc::now());
        let out = ContentValidator::new().process(payload).await.unwrap();
        assert_eq!(out.outcome, "validation-failed");
        assert_eq!(out.payload.processing_stage, "validated");
        assert!(out.payload.errors.iter().all(|e| e.starts_with("validation:")));
        assert!(out
            .payload
            .errors
            .contains(&"validation:Excessive character repetition detected".to_string()));
        assert!(!out.payload.validation.unwrap().is_valid);
    }
}
