use async_trait::async_trait;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, FAILED, WRITE};
use crate::fields::{CitationAction, OrderFields, OrderPatch, WriterMode};
use crate::text::{count_words, max_words, strip_reference_section};

pub const TEXT_WRITTEN: &str = "text_written";
pub const TEXT_REVISED: &str = "text_revised";
pub const WORD_COUNT_SHORTENING: &str = "word_count_shortening";
pub const WRITER_UNAVAILABLE: &str = "writer_unavailable";

/// Writes, expands, shortens or revises the text according to `writer_mode`
pub struct Write {
    ctx: Arc<StageContext>,
}

impl Write {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    fn limit(&self, fields: &OrderFields) -> usize {
        max_words(
            fields.target_word_count,
            fields.pages(),
            self.ctx.config.max_overshoot_ratio,
        )
    }

    fn prompt(&self, fields: &OrderFields) -> String {
        let req = &fields.requirements;
        let current = fields.current_text();
        let words = count_words(current);
        let target = fields.target_word_count;
        let limit = self.limit(fields);

        match fields.writer_mode {
            WriterMode::Initial => format!(
                "Write a {} on \"{}\" answering: {}\nTarget length: {} words. \
                 Do not add citations or a references section.\nInstructions: {}\nKey points: {}\n\nMaterial:\n{}",
                req.assignment_type,
                req.topic,
                req.main_question,
                target,
                req.specific_instructions,
                req.key_points.join("; "),
                fields.attached_files.join("\n\n")
            ),
            WriterMode::Expand => format!(
                "Expand this text from {} to at least {} words by adding sentences on \"{}\". \
                 Keep every existing sentence and citation.\n\n{}",
                words, target, req.topic, current
            ),
            WriterMode::Shorten => format!(
                "Shorten this text from {} to at most {} words. Keep the argument and the citations.\n\n{}",
                words, limit, current
            ),
            WriterMode::ShortenHumanized => format!(
                "Shorten this text from {} to at most {} words. Cut whole sentences only and keep \
                 the wording of the remaining sentences unchanged.\n\n{}",
                words, limit, current
            ),
            WriterMode::Revise => {
                let citations = match fields.citation_action {
                    CitationAction::Keep => "Keep every citation exactly where it is.",
                    CitationAction::Adjust => "Move misplaced citations into the middle of their paragraphs.",
                    CitationAction::Reinsert => "Remove all citations; they will be inserted again.",
                };
                format!(
                    "Revise this text ({} words, target {}, maximum {}). Fix these issues:\n{}\n\
                     Suggestions:\n{}\n{}\nModify existing sentences rather than adding new ones.\n\n{}",
                    words,
                    target,
                    limit,
                    bullet_list(&fields.quality_issues),
                    bullet_list(&fields.quality_suggestions),
                    citations,
                    current
                )
            }
            WriterMode::FixHumanized => format!(
                "Fix only these critical issues in the text below and keep its natural style:\n{}\n\n{}",
                bullet_list(&fields.quality_issues),
                current
            ),
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- none".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Stage<OrderFields> for Write {
    fn id(&self) -> &str {
        WRITE
    }

    fn outcomes(&self) -> &[&'static str] {
        &[
            TEXT_WRITTEN,
            TEXT_REVISED,
            WORD_COUNT_SHORTENING,
            WRITER_UNAVAILABLE,
            FAILED,
        ]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        let mode = fields.writer_mode;
        tracing::info!(order_id = %fields.order_id, mode = %mode, "Writing text");

        if mode != WriterMode::Initial && fields.current_text().is_empty() {
            return Ok(fail("writer", format!("no text to work on in '{}' mode", mode)));
        }

        let reply = match self.ctx.collaborators.write(&self.prompt(fields)).await {
            Ok(reply) => reply,
            Err(e) if e.is_transient() => {
                return Ok(StageResult::new(WRITER_UNAVAILABLE)
                    .log(format!("[writer] generator unavailable in '{}' mode: {}", mode, e)))
            }
            Err(e) => return Ok(fail("writer", format!("writing failed in '{}' mode: {}", mode, e))),
        };

        let text = strip_reference_section(&reply);
        if text.is_empty() {
            return Ok(fail("writer", format!("generator returned no text in '{}' mode", mode)));
        }
        let words = count_words(&text);
        let before = count_words(fields.current_text());

        let result = match mode {
            WriterMode::Initial => StageResult::new(TEXT_WRITTEN)
                .with_patch(OrderPatch {
                    draft_text: Some(text),
                    word_count: Some(words),
                    ..Default::default()
                })
                .log(format!("[writer] initial draft: {} words", words)),
            WriterMode::Expand | WriterMode::Shorten | WriterMode::ShortenHumanized => {
                StageResult::new(TEXT_WRITTEN)
                    .with_patch(OrderPatch {
                        draft_text: Some(text.clone()),
                        text_with_citations: Some(text),
                        word_count: Some(words),
                        ..Default::default()
                    })
                    .log(format!("[writer] {}: {} -> {} words", mode, before, words))
            }
            WriterMode::Revise => {
                let limit = self.limit(fields);
                let patch = OrderPatch {
                    draft_text: Some(text.clone()),
                    text_with_citations: Some(text),
                    word_count: Some(words),
                    ..Default::default()
                };
                if words > limit {
                    StageResult::new(WORD_COUNT_SHORTENING)
                        .with_patch(OrderPatch {
                            writer_mode: Some(WriterMode::Shorten),
                            ..patch
                        })
                        .log(format!("[writer] revised but over limit: {}/{} words", words, limit))
                } else {
                    StageResult::new(TEXT_REVISED).with_patch(patch).log(format!(
                        "[writer] revised: {} issues addressed",
                        fields.quality_issues.len()
                    ))
                }
            }
            WriterMode::FixHumanized => StageResult::new(TEXT_REVISED)
                .with_patch(OrderPatch {
                    draft_text: Some(text.clone()),
                    text_with_citations: Some(text),
                    word_count: Some(words),
                    ..Default::default()
                })
                .log(format!(
                    "[writer] fixed humanized text: {} issues",
                    fields.quality_issues.len()
                )),
        };
        Ok(result)
    }
}
