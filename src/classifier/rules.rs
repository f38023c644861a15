//! Classification rules: weighted keyword or regex matchers per category.
//!
//! Rules can be loaded from a JSON file:
//!
//! ```json
//! [
//!   {"category": "finance", "keyword": "billing", "weight": 5},
//!   {"category": "support", "pattern": "\\bnot\\s+working\\b", "weight": 2}
//! ]
//! ```

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::error::ConfigError;

/// How a rule inspects message content. Always case-insensitive.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Substring match; stored lowercased.
    Keyword(String),
    Pattern(Regex),
}

impl Matcher {
    /// `lowered` must be the content already lowercased; `raw` is the original.
    fn is_match(&self, raw: &str, lowered: &str) -> bool {
        match self {
            Self::Keyword(keyword) => lowered.contains(keyword.as_str()),
            Self::Pattern(regex) => regex.is_match(raw),
        }
    }
}

/// `{category, keyword_or_pattern, weight}`.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub category: String,
    pub matcher: Matcher,
    pub weight: u32,
}

impl ClassificationRule {
    pub fn keyword(category: &str, keyword: &str, weight: u32) -> Self {
        Self {
            category: category.to_string(),
            matcher: Matcher::Keyword(keyword.to_lowercase()),
            weight,
        }
    }

    pub fn pattern(category: &str, pattern: &str, weight: u32) -> Result<Self, ConfigError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: format!("rule pattern for {category}"),
                message: e.to_string(),
            })?;
        Ok(Self {
            category: category.to_string(),
            matcher: Matcher::Pattern(regex),
            weight,
        })
    }

    pub(crate) fn matches(&self, raw: &str, lowered: &str) -> bool {
        self.matcher.is_match(raw, lowered)
    }
}

/// On-disk shape of one rule.
#[derive(Debug, Deserialize)]
struct RuleSpec {
    category: String,
    #[serde(default)]
    keyword: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Categories become the last segment of `routed.<category>` event types.
pub fn validate_category(category: &str) -> Result<(), ConfigError> {
    let valid = !category.is_empty()
        && !category
            .chars()
            .any(|c| c == '.' || c == '*' || c.is_whitespace());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "category".into(),
            message: format!("{category:?} must be one non-empty type segment"),
        })
    }
}

/// Parse rules from JSON text.
pub fn parse_rules(json: &str) -> Result<Vec<ClassificationRule>, ConfigError> {
    let specs: Vec<RuleSpec> =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(format!("classification rules: {e}")))?;

    specs
        .into_iter()
        .map(|spec| {
            validate_category(&spec.category)?;
            match (spec.keyword, spec.pattern) {
                (Some(keyword), None) if !keyword.is_empty() => {
                    Ok(ClassificationRule::keyword(&spec.category, &keyword, spec.weight))
                }
                (None, Some(pattern)) => ClassificationRule::pattern(&spec.category, &pattern, spec.weight),
                _ => Err(ConfigError::InvalidValue {
                    key: format!("rule for {}", spec.category),
                    message: "exactly one non-empty `keyword` or `pattern` is required".into(),
                }),
            }
        })
        .collect()
}

/// Load rules from a JSON file.
pub fn load_rules(path: &Path) -> Result<Vec<ClassificationRule>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_rules(&text)
}

/// Built-in keyword tables for the finance, support and website categories.
pub fn default_rules() -> Vec<ClassificationRule> {
    const FINANCE: &[&str] = &[
        "billing", "invoice", "payment", "refund", "charge", "subscription", "price", "cost",
        "fee", "credit card", "bank", "transaction", "receipt", "balance", "overcharged",
    ];
    const SUPPORT: &[&str] = &[
        "help", "issue", "problem", "error", "bug", "broken", "not working", "troubleshoot",
        "fix", "support", "assistance", "technical", "crash", "freeze",
    ];
    const WEBSITE: &[&str] = &[
        "login", "password", "access", "account", "sign in", "reset", "locked out", "username",
        "authentication", "forgot password", "cannot log in", "registration",
    ];

    [("finance", FINANCE), ("support", SUPPORT), ("website", WEBSITE)]
        .into_iter()
        .flat_map(|(category, keywords)| {
            keywords
                .iter()
                .map(move |keyword| ClassificationRule::keyword(category, keyword, 1))
        })
        .collect()
}
