//! Message router: picks the terminal category with the classifier.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::payload::MessagePayload;
use super::{Stage, StageKind, StageOutput};
use crate::classifier::Classifier;
use crate::error::StageError;

pub struct MessageRouter {
    classifier: Arc<Classifier>,
}

impl MessageRouter {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl Stage for MessageRouter {
    fn kind(&self) -> StageKind {
        StageKind::Router
    }

    async fn process(&self, mut payload: MessagePayload) -> Result<StageOutput, StageError> {
        let decision = self.classifier.classify(&payload.content);
        info!(
            message_id = %payload.message_id,
            category = %decision.category,
            score = decision.confidence_score,
            "Routing message"
        );

        let outcome = format!("routed.{}", decision.category);
        payload.routing = Some(decision);
        payload.processing_stage = "routed".into();
        Ok(StageOutput::new(outcome, payload))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::classifier::ClassificationRule;

    fn router() -> MessageRouter {
        let rules = vec![
            ClassificationRule::keyword("finance", "billing", 5),
            ClassificationRule::keyword("support", "help", 3),
        ];
        MessageRouter::new(Arc::new(Classifier::new(rules, "unclassified")))
    }

    #[tokio::test]
    async fn routes_to_highest_scoring_category() {
        let payload = MessagePayload::received("m-4", "Hi, I need help with billing. Email: a@b.com", Utc::now());
        let out = router().process(payload).await.unwrap();
        assert_eq!(out.outcome, "routed.finance");
        assert_eq!(out.payload.processing_stage, "routed");
        let routing = out.payload.routing.unwrap();
        assert_eq!(routing.confidence_score, 5);
        assert_eq!(routing.all_scores["support"], 3);
    }

    #[tokio::test]
    async fn unmatched_content_goes_to_fallback() {
        let payload = MessagePayload::received("m-5", "Lovely weather today", Utc::now());
        let out = router().process(payload).await.unwrap();
        assert_eq!(out.outcome, "routed.unclassified");
    }
}
