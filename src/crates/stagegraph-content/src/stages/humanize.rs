use async_trait::async_trait;
use stagegraph_core::collaborator::CollaboratorError;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, FAILED, HUMANIZE};
use crate::collaborators::CallResult;
use crate::fields::{HumanizationMode, OrderFields, OrderPatch};
use crate::loops::WORD_COUNT;
use crate::text::{count_words, split_document};

pub const HUMANIZED: &str = "humanized";
pub const HUMANIZE_FAILED: &str = "humanize_failed";
pub const SKIPPED: &str = "skipped";

/// Rewrites the body so it reads as human-written
///
/// Full mode rewrites the whole body. Sentence mode rewrites only the sentences
/// the scorer flagged and falls back to full mode when none of them can be
/// found in the body. Title and references are never sent to the humanizer.
pub struct Humanize {
    ctx: Arc<StageContext>,
}

impl Humanize {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn call(&self, prompt: &str) -> CallResult<String> {
        match self.ctx.collaborators.humanize(prompt).await {
            Some(result) => result,
            None => Err(CollaboratorError::NotConfigured("humanizer".to_string())),
        }
    }

    async fn rewrite_body(&self, body: &str) -> CallResult<String> {
        let prompt = format!(
            "Rewrite this text so it reads naturally. Keep the meaning, the paragraph \
             structure and every citation.\n\n{}",
            body
        );
        self.call(&prompt).await.map(|text| text.trim().to_string())
    }

    async fn rewrite_sentences(&self, body: &str, sentences: &[String]) -> CallResult<Option<String>> {
        let flagged: Vec<&String> = sentences
            .iter()
            .filter(|s| !s.trim().is_empty() && body.contains(s.trim()))
            .collect();
        if flagged.is_empty() {
            return Ok(None);
        }

        let mut rewritten = body.to_string();
        for sentence in flagged {
            let sentence = sentence.trim();
            let prompt = format!(
                "Rewrite this sentence so it reads naturally. Keep its meaning and any citation.\n\n{}",
                sentence
            );
            let replacement = self.call(&prompt).await?;
            let replacement = replacement.trim();
            if !replacement.is_empty() {
                rewritten = rewritten.replacen(sentence, replacement, 1);
            }
        }
        Ok(Some(rewritten))
    }
}

#[async_trait]
impl Stage<OrderFields> for Humanize {
    fn id(&self) -> &str {
        HUMANIZE
    }

    fn outcomes(&self) -> &[&'static str] {
        &[HUMANIZED, HUMANIZE_FAILED, SKIPPED, FAILED]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        let original = fields.current_text();
        let parts = split_document(original);
        if parts.body.trim().is_empty() {
            return Ok(fail("humanize", "no text to humanize"));
        }

        let mode = match fields.humanization_mode {
            HumanizationMode::None => HumanizationMode::Full,
            mode => mode,
        };
        tracing::info!(order_id = %fields.order_id, mode = %mode, score = fields.ai_score, "Humanizing text");

        let body = match mode {
            HumanizationMode::Sentence => {
                match self.rewrite_sentences(&parts.body, &fields.ai_sentences).await {
                    Ok(Some(body)) => Ok(body),
                    Ok(None) => self.rewrite_body(&parts.body).await,
                    Err(e) => Err(e),
                }
            }
            _ => self.rewrite_body(&parts.body).await,
        };

        let body = match body {
            Ok(body) if !body.is_empty() => body,
            Ok(_) => {
                return Ok(StageResult::new(HUMANIZE_FAILED)
                    .log("[humanize] humanizer returned no text"))
            }
            Err(CollaboratorError::NotConfigured(_)) => {
                return Ok(StageResult::new(SKIPPED).log("[humanize] no humanizer configured, skipped"))
            }
            Err(e) => {
                tracing::warn!(order_id = %fields.order_id, error = %e, "Humanization failed");
                return Ok(StageResult::new(HUMANIZE_FAILED)
                    .log(format!("[humanize] failed: {}", e)));
            }
        };

        let text = parts.reassemble(&body);
        let words = count_words(&text);
        let line = format!("[humanize] {} humanization done: {} words", mode, words);
        Ok(StageResult::new(HUMANIZED)
            .with_patch(OrderPatch {
                text_before_humanization: Some(original.to_string()),
                text_with_citations: Some(text),
                post_humanization: Some(true),
                word_count: Some(words),
                ..Default::default()
            })
            .log(line)
            .reset_attempts(WORD_COUNT))
    }
}
