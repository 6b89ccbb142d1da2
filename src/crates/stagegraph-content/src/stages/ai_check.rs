use async_trait::async_trait;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, CHECK_AI, FAILED};
use crate::fields::{HumanizationMode, OrderFields, OrderPatch};
use crate::text::split_document;

pub const AI_PASSED: &str = "ai_passed";
pub const AI_DETECTED: &str = "ai_detected";
pub const AI_CHECK_FAILED: &str = "ai_check_failed";
pub const SKIPPED: &str = "skipped";

/// Scores the body of the text for machine-generated content
pub struct CheckAi {
    ctx: Arc<StageContext>,
}

impl CheckAi {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage<OrderFields> for CheckAi {
    fn id(&self) -> &str {
        CHECK_AI
    }

    fn outcomes(&self) -> &[&'static str] {
        &[AI_PASSED, AI_DETECTED, AI_CHECK_FAILED, SKIPPED, FAILED]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        let parts = split_document(fields.current_text());
        if parts.body.trim().is_empty() {
            return Ok(fail("ai_check", "no text for the authenticity check"));
        }

        let report = match self.ctx.collaborators.score(&parts.body).await {
            None => {
                return Ok(StageResult::new(SKIPPED).log("[ai_check] no scorer configured, skipped"))
            }
            Some(Err(e)) => {
                tracing::warn!(order_id = %fields.order_id, error = %e, "Authenticity check failed");
                return Ok(StageResult::new(AI_CHECK_FAILED)
                    .log(format!("[ai_check] scorer failed, continuing: {}", e)));
            }
            Some(Ok(report)) => report,
        };

        let config = &self.ctx.config;
        let score = report.ai_percentage;
        tracing::info!(order_id = %fields.order_id, score, threshold = config.ai_pass_threshold, "Authenticity scored");

        if score <= config.ai_pass_threshold {
            return Ok(StageResult::new(AI_PASSED)
                .with_patch(OrderPatch {
                    ai_score: Some(score),
                    ai_sentences: Some(Vec::new()),
                    humanization_mode: Some(HumanizationMode::None),
                    ..Default::default()
                })
                .log(format!(
                    "[ai_check] passed: {:.1}% (threshold {:.1}%)",
                    score, config.ai_pass_threshold
                )));
        }

        let mode = if score > config.ai_full_rewrite_threshold || report.ai_sentences.is_empty() {
            HumanizationMode::Full
        } else {
            HumanizationMode::Sentence
        };
        let line = format!(
            "[ai_check] detected: {:.1}%, {} flagged sentences, {} humanization",
            score,
            report.ai_sentences.len(),
            mode
        );
        Ok(StageResult::new(AI_DETECTED)
            .with_patch(OrderPatch {
                ai_score: Some(score),
                ai_sentences: Some(report.ai_sentences),
                humanization_mode: Some(mode),
                ..Default::default()
            })
            .log(line))
    }
}
