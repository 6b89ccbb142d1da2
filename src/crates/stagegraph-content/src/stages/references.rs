use async_trait::async_trait;
use stagegraph_core::{Stage, StageResult};

use super::{fail, Outcome, Snapshot, FAILED, GENERATE_REFERENCES};
use crate::fields::{OrderFields, OrderPatch};
use crate::text::{count_words, references_section, strip_reference_section};

pub const COMPLETED: &str = "completed";

/// Appends the APA references section and produces the final text
#[derive(Debug, Default)]
pub struct GenerateReferences;

impl GenerateReferences {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage<OrderFields> for GenerateReferences {
    fn id(&self) -> &str {
        GENERATE_REFERENCES
    }

    fn outcomes(&self) -> &[&'static str] {
        &[COMPLETED, FAILED]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        let text = strip_reference_section(fields.current_text());
        if text.is_empty() {
            return Ok(fail("references", "no text to finish"));
        }

        let references = references_section(&fields.sources_found);
        let final_text = if references.is_empty() {
            text.clone()
        } else {
            format!("{}\n\n{}", text, references)
        };
        let words = count_words(&text);
        tracing::info!(order_id = %fields.order_id, words, sources = fields.sources_found.len(), "Order text complete");

        Ok(StageResult::new(COMPLETED)
            .with_patch(OrderPatch {
                references: Some(references),
                final_text: Some(final_text),
                word_count: Some(words),
                ..Default::default()
            })
            .log(format!(
                "[references] {} references, final text {} words",
                fields.sources_found.len(),
                words
            )))
    }
}
