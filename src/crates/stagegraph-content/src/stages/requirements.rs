use async_trait::async_trait;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, ANALYZE_REQUIREMENTS};
use crate::fields::{OrderFields, OrderPatch, Requirements};
use crate::text::extract_json;

pub const REQUIREMENTS_EXTRACTED: &str = "requirements_extracted";
pub const INSUFFICIENT_INFO: &str = "insufficient_info";
pub const REQUIREMENTS_UNAVAILABLE: &str = "requirements_unavailable";

/// Extracts structured requirements from the order description and files
pub struct AnalyzeRequirements {
    ctx: Arc<StageContext>,
}

impl AnalyzeRequirements {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    fn prompt(fields: &OrderFields) -> String {
        let files = if fields.attached_files.is_empty() {
            "No files attached".to_string()
        } else {
            fields.attached_files.join("\n\n---\n\n")
        };
        format!(
            "Extract the assignment requirements as a JSON object with the keys \
             assignment_type, main_topic, main_question, pages_detected, required_sources, \
             search_keywords, citation_style, specific_instructions, key_points, \
             is_sufficient and missing_info.\n\nORDER DESCRIPTION:\n{}\n\nATTACHED FILES:\n{}",
            if fields.description.is_empty() {
                "Not specified"
            } else {
                fields.description.as_str()
            },
            files
        )
    }
}

#[async_trait]
impl Stage<OrderFields> for AnalyzeRequirements {
    fn id(&self) -> &str {
        ANALYZE_REQUIREMENTS
    }

    fn outcomes(&self) -> &[&'static str] {
        &[
            REQUIREMENTS_EXTRACTED,
            INSUFFICIENT_INFO,
            REQUIREMENTS_UNAVAILABLE,
            super::FAILED,
        ]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        tracing::info!(order_id = %fields.order_id, files = fields.attached_files.len(), "Analyzing requirements");

        let reply = match self.ctx.collaborators.write(&Self::prompt(fields)).await {
            Ok(reply) => reply,
            Err(e) if e.is_transient() => {
                return Ok(StageResult::new(REQUIREMENTS_UNAVAILABLE)
                    .log(format!("[requirements] generator unavailable: {}", e)))
            }
            Err(e) => return Ok(fail("requirements", format!("requirements analysis failed: {}", e))),
        };

        let Some(value) = extract_json(&reply) else {
            return Ok(fail("requirements", "could not parse requirements from the generator reply"));
        };
        let mut requirements: Requirements = match serde_json::from_value(value) {
            Ok(requirements) => requirements,
            Err(e) => return Ok(fail("requirements", format!("requirements have an unexpected shape: {}", e))),
        };

        if !requirements.is_sufficient {
            let missing = requirements
                .missing_info
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(order_id = %fields.order_id, missing = %missing, "Insufficient order information");
            return Ok(StageResult::new(INSUFFICIENT_INFO)
                .with_patch(OrderPatch {
                    requirements: Some(requirements),
                    ..Default::default()
                })
                .log(format!("[requirements] insufficient information: {}", missing))
                .with_error(format!("insufficient information: {}", missing)));
        }

        let config = &self.ctx.config;
        let pages = requirements.pages.unwrap_or(fields.pages_required).max(1);
        let target = pages as usize * config.words_per_page;
        requirements.pages = Some(pages);
        requirements.target_word_count = target;
        let required_sources = *requirements
            .required_sources
            .get_or_insert(config.default_required_sources);

        let line = format!(
            "[requirements] extracted: '{}', {} pages, {} words, {} sources",
            requirements.topic, pages, target, required_sources
        );
        Ok(StageResult::new(REQUIREMENTS_EXTRACTED)
            .with_patch(OrderPatch {
                requirements: Some(requirements),
                target_word_count: Some(target),
                ..Default::default()
            })
            .log(line))
    }
}
