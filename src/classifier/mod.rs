//! Content-based classifier.
//!
//! Each category's score is the sum of the weights of its rules that match
//! the content. The strictly highest score wins; ties go to the category
//! name that sorts first; if nothing scores above zero the fallback category
//! is chosen. Exactly one category comes out of every call.

pub mod rules;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use rules::{ClassificationRule, Matcher, default_rules, load_rules, parse_rules, validate_category};

/// Default category when no rule matches.
pub const DEFAULT_FALLBACK: &str = "unknown";

/// The classifier's decision, also written into the routed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    /// Winning score (0 for the fallback).
    pub confidence_score: u32,
    pub reason: String,
    /// Score of every category that has rules.
    pub all_scores: BTreeMap<String, u32>,
}

pub struct Classifier {
    rules: Vec<ClassificationRule>,
    fallback: String,
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    /// Built-in keyword tables with the default fallback.
    pub fn with_default_rules() -> Self {
        Self::new(default_rules(), DEFAULT_FALLBACK)
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// All categories that can be selected, fallback included.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.rules.iter().map(|r| r.category.clone()).collect();
        categories.push(self.fallback.clone());
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn classify(&self, content: &str) -> Classification {
        let lowered = content.to_lowercase();
        let mut all_scores: BTreeMap<String, u32> = BTreeMap::new();
        let mut matched: BTreeMap<&str, usize> = BTreeMap::new();

        for rule in &self.rules {
            let score = all_scores.entry(rule.category.clone()).or_insert(0);
            if rule.matches(content, &lowered) {
                *score = score.saturating_add(rule.weight);
                *matched.entry(rule.category.as_str()).or_insert(0) += 1;
            }
        }

        // BTreeMap iterates in name order, so `>` keeps the first of any tie.
        let mut best: Option<(&String, u32)> = None;
        for (category, &score) in &all_scores {
            if score > best.map_or(0, |(_, s)| s) {
                best = Some((category, score));
            }
        }

        let classification = match best {
            Some((category, score)) => Classification {
                category: category.clone(),
                confidence_score: score,
                reason: format!(
                    "Matched {} rules",
                    matched.get(category.as_str()).copied().unwrap_or(0)
                ),
                all_scores: all_scores.clone(),
            },
            None => Classification {
                category: self.fallback.clone(),
                confidence_score: 0,
                reason: "No rules matched".to_string(),
                all_scores: all_scores.clone(),
            },
        };

        debug!(
            category = %classification.category,
            score = classification.confidence_score,
            scores = ?classification.all_scores,
            "Classified"
        );
        classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_rules() -> Vec<ClassificationRule> {
        vec![
            ClassificationRule::keyword("finance", "billing", 5),
            ClassificationRule::keyword("support", "help", 3),
        ]
    }

    #[test]
    fn highest_weighted_category_wins() {
        let classifier = Classifier::new(scenario_rules(), "unclassified");
        let result = classifier.classify("Hi, I need help with billing. Email: a@b.com");
        assert_eq!(result.category, "finance");
        assert_eq!(result.confidence_score, 5);
        assert_eq!(result.all_scores["support"], 3);
    }

    #[test]
    fn no_match_selects_fallback() {
        let classifier = Classifier::new(scenario_rules(), "unclassified");
        let result = classifier.classify("Lovely weather today");
        assert_eq!(result.category, "unclassified");
        assert_eq!(result.confidence_score, 0);
        assert_eq!(result.all_scores.values().sum::<u32>(), 0);
    }

    #[test]
    fn empty_rule_set_selects_fallback() {
        let classifier = Classifier::new(Vec::new(), "unknown");
        assert_eq!(classifier.classify("billing").category, "unknown");
    }

    #[test]
    fn ties_go_to_lexicographically_smaller_category() {
        // Registration order puts "support" first; the tie still goes to "finance".
        let rules = vec![
            ClassificationRule::keyword("support", "help", 2),
            ClassificationRule::keyword("finance", "refund", 2),
        ];
        let classifier = Classifier::new(rules, "unknown");
        for _ in 0..10 {
            assert_eq!(classifier.classify("help me get a refund").category, "finance");
        }
    }

    #[test]
    fn weights_sum_per_category() {
        let rules = vec![
            ClassificationRule::keyword("website", "login", 1),
            ClassificationRule::keyword("website", "password", 1),
            ClassificationRule::keyword("support", "help", 1),
        ];
        let classifier = Classifier::new(rules, "unknown");
        let result = classifier.classify("Help, my login password is wrong");
        assert_eq!(result.category, "website");
        assert_eq!(result.confidence_score, 2);
        assert_eq!(result.reason, "Matched 2 rules");
    }

    #[test]
    fn default_rules_route_billing_to_finance() {
        let classifier = Classifier::with_default_rules();
        let result = classifier.classify("I was overcharged on my invoice");
        assert_eq!(result.category, "finance");
        assert_eq!(classifier.categories(), vec!["finance", "support", "unknown", "website"]);
    }
}
