//! Quality review before and after humanization
//!
//! Both stages ask the checker for the same JSON verdict:
//!
//! ```json
//! {"all_rules_passed": false,
//!  "issues": [{"rule": "R2", "problem": "no thesis", "location": "first paragraph"}],
//!  "suggestions": ["state the thesis early"],
//!  "citation_action": "keep"}
//! ```
//!
//! Issues may also be plain strings. A reply that cannot be read leaves the
//! text unchecked; the workflow proceeds.

use async_trait::async_trait;
use serde::Deserialize;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, CHECK_QUALITY, CHECK_QUALITY_POST_HUMANIZATION, FAILED};
use crate::fields::{CitationAction, OrderFields, OrderPatch, WriterMode};
use crate::text::{extract_json, truncate_chars};

pub const QUALITY_OK: &str = "quality_ok";
pub const QUALITY_REVISING: &str = "quality_revising";
pub const QUALITY_UNCHECKED: &str = "quality_unchecked";
pub const SKIPPED: &str = "skipped";

const OUTCOMES: &[&str] = &[QUALITY_OK, QUALITY_REVISING, QUALITY_UNCHECKED, SKIPPED, FAILED];

/// Characters of text sent to the checker
const REVIEW_CHARS: usize = 6000;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Issue {
    Text(String),
    Detail {
        #[serde(default)]
        rule: Option<String>,
        #[serde(default)]
        problem: Option<String>,
        #[serde(default)]
        sentence: Option<String>,
        #[serde(default)]
        citation_found: Option<String>,
        #[serde(default)]
        location: Option<String>,
    },
}

impl Issue {
    fn describe(&self) -> String {
        match self {
            Issue::Text(text) => text.clone(),
            Issue::Detail {
                rule,
                problem,
                sentence,
                citation_found,
                location,
            } => {
                let rule = rule.as_deref().unwrap_or("Unknown");
                let problem = problem.as_deref().or(sentence.as_deref()).unwrap_or("");
                let mut text = match citation_found.as_deref().filter(|c| !c.is_empty()) {
                    Some(citation) => format!("{}: {} - {}", rule, citation, problem),
                    None => format!("{}: {}", rule, problem),
                };
                if let Some(location) = location.as_deref().filter(|l| !l.is_empty()) {
                    text.push_str(&format!(" (at: {})", truncate_chars(location, 50)));
                }
                text
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default = "passed_by_default")]
    all_rules_passed: bool,
    #[serde(default)]
    issues: Vec<Issue>,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    citation_action: String,
}

fn passed_by_default() -> bool {
    true
}

/// Which review is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Review {
    Draft,
    Humanized,
}

impl Review {
    fn tag(self) -> &'static str {
        match self {
            Review::Draft => "quality",
            Review::Humanized => "quality_post_humanization",
        }
    }

    fn revision_mode(self) -> WriterMode {
        match self {
            Review::Draft => WriterMode::Revise,
            Review::Humanized => WriterMode::FixHumanized,
        }
    }

    fn prompt(self, fields: &OrderFields) -> String {
        let req = &fields.requirements;
        let sources = fields
            .sources_found
            .iter()
            .map(|s| format!("- {}: {}", s.citation, truncate_chars(&s.title, 60)))
            .collect::<Vec<_>>()
            .join("\n");
        let focus = match self {
            Review::Draft => "Check the text against every academic writing rule.",
            Review::Humanized => {
                "This text was rewritten for natural style. Report only critical problems: \
                 broken or invented citations, factual errors, off-topic passages."
            }
        };
        format!(
            "{}\nAssignment: {} ({} style)\nTopic: {}\nQuestion: {}\nSources:\n{}\n\n\
             Reply with JSON: all_rules_passed, issues, suggestions, citation_action \
             (keep, adjust or reinsert).\n\nTEXT:\n{}",
            focus,
            req.assignment_type,
            req.citation_style,
            req.topic,
            req.main_question,
            if sources.is_empty() { "none".to_string() } else { sources },
            truncate_chars(fields.current_text(), REVIEW_CHARS)
        )
    }
}

async fn review(ctx: &StageContext, review: Review, snapshot: &Snapshot) -> Outcome {
    let fields = &snapshot.fields;
    let tag = review.tag();
    if fields.current_text().trim().is_empty() {
        return Ok(fail(tag, "no text for the quality check"));
    }

    tracing::info!(order_id = %fields.order_id, review = tag, "Checking quality");

    let unchecked = |reason: String| {
        StageResult::new(QUALITY_UNCHECKED)
            .with_patch(OrderPatch {
                quality_ok: Some(false),
                quality_issues: Some(Vec::new()),
                citation_action: Some(CitationAction::Keep),
                ..Default::default()
            })
            .log(format!("[{}] unchecked: {}", tag, reason))
    };

    let reply = match ctx.collaborators.check(&review.prompt(fields)).await {
        None => {
            return Ok(StageResult::new(SKIPPED)
                .log(format!("[{}] no checker configured, skipped", tag)))
        }
        Some(Err(e)) => {
            tracing::warn!(order_id = %fields.order_id, error = %e, "Quality check unavailable");
            return Ok(unchecked(e.to_string()));
        }
        Some(Ok(reply)) => reply,
    };

    let verdict = extract_json(&reply).and_then(|value| serde_json::from_value::<Verdict>(value).ok());
    let Some(verdict) = verdict else {
        return Ok(unchecked("checker reply could not be parsed".to_string()));
    };

    if verdict.all_rules_passed {
        return Ok(StageResult::new(QUALITY_OK)
            .with_patch(OrderPatch {
                quality_ok: Some(true),
                quality_issues: Some(Vec::new()),
                quality_suggestions: Some(verdict.suggestions),
                citation_action: Some(CitationAction::Keep),
                ..Default::default()
            })
            .log(format!("[{}] passed", tag)));
    }

    let issues: Vec<String> = verdict.issues.iter().map(Issue::describe).collect();
    let action = CitationAction::parse(&verdict.citation_action);
    let line = format!(
        "[{}] {} issues, citation action {:?}, revising",
        tag,
        issues.len(),
        action
    );
    Ok(StageResult::new(QUALITY_REVISING)
        .with_patch(OrderPatch {
            quality_ok: Some(false),
            quality_issues: Some(issues),
            quality_suggestions: Some(verdict.suggestions),
            citation_action: Some(action),
            writer_mode: Some(review.revision_mode()),
            ..Default::default()
        })
        .log(line))
}

/// Reviews the cited draft
pub struct CheckQuality {
    ctx: Arc<StageContext>,
}

impl CheckQuality {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage<OrderFields> for CheckQuality {
    fn id(&self) -> &str {
        CHECK_QUALITY
    }

    fn outcomes(&self) -> &[&'static str] {
        OUTCOMES
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        review(&self.ctx, Review::Draft, snapshot).await
    }
}

/// Reviews humanized text for critical problems only
pub struct CheckQualityPostHumanization {
    ctx: Arc<StageContext>,
}

impl CheckQualityPostHumanization {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Stage<OrderFields> for CheckQualityPostHumanization {
    fn id(&self) -> &str {
        CHECK_QUALITY_POST_HUMANIZATION
    }

    fn outcomes(&self) -> &[&'static str] {
        OUTCOMES
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        review(&self.ctx, Review::Humanized, snapshot).await
    }
}
