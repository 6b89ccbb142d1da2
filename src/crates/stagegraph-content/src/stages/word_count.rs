use async_trait::async_trait;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, CHECK_WORD_COUNT, FAILED};
use crate::fields::{OrderFields, OrderPatch, WriterMode};
use crate::text::{count_words, max_words};

pub const WORD_COUNT_OK: &str = "word_count_ok";
pub const WORD_COUNT_LOW: &str = "word_count_low";
pub const WORD_COUNT_HIGH: &str = "word_count_high";

/// Compares the current text against the target and the word limit
pub struct CheckWordCount {
    ctx: Arc<StageContext>,
}

impl CheckWordCount {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage<OrderFields> for CheckWordCount {
    fn id(&self) -> &str {
        CHECK_WORD_COUNT
    }

    fn outcomes(&self) -> &[&'static str] {
        &[WORD_COUNT_OK, WORD_COUNT_LOW, WORD_COUNT_HIGH, FAILED]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        let text = fields.current_text();
        if text.trim().is_empty() {
            return Ok(fail("word_count", "no text for the word count check"));
        }

        let words = count_words(text);
        let target = fields.target_word_count;
        let limit = max_words(target, fields.pages(), self.ctx.config.max_overshoot_ratio);
        tracing::debug!(order_id = %fields.order_id, words, target, limit, "Checking word count");

        let result = if words < target {
            StageResult::new(WORD_COUNT_LOW)
                .with_patch(OrderPatch {
                    word_count: Some(words),
                    word_count_ok: Some(false),
                    writer_mode: Some(WriterMode::Expand),
                    ..Default::default()
                })
                .log(format!("[word_count] low: {}/{} words, expanding", words, target))
        } else if words > limit {
            let mode = if fields.post_humanization {
                WriterMode::ShortenHumanized
            } else {
                WriterMode::Shorten
            };
            StageResult::new(WORD_COUNT_HIGH)
                .with_patch(OrderPatch {
                    word_count: Some(words),
                    word_count_ok: Some(false),
                    writer_mode: Some(mode),
                    ..Default::default()
                })
                .log(format!(
                    "[word_count] high: {} words over the limit of {}, {}",
                    words, limit, mode
                ))
        } else {
            StageResult::new(WORD_COUNT_OK)
                .with_patch(OrderPatch {
                    word_count: Some(words),
                    word_count_ok: Some(true),
                    ..Default::default()
                })
                .log(format!("[word_count] ok: {}/{} words", words, target))
        };
        Ok(result)
    }
}
