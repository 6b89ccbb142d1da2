//! The nine stages of the order workflow
//!
//! Stages translate every collaborator failure into a status tag. Only a broken
//! invariant (no text where text must exist, a permanently misconfigured
//! collaborator) ends in `failed` with an error.

pub mod ai_check;
pub mod citations;
pub mod humanize;
pub mod quality;
pub mod references;
pub mod requirements;
pub mod word_count;
pub mod write;

pub use ai_check::CheckAi;
pub use citations::IntegrateCitations;
pub use humanize::Humanize;
pub use quality::{CheckQuality, CheckQualityPostHumanization};
pub use references::GenerateReferences;
pub use requirements::AnalyzeRequirements;
pub use word_count::CheckWordCount;
pub use write::Write;

use stagegraph_core::{StageError, StageResult, WorkflowSnapshot};
use std::sync::Arc;

use crate::collaborators::Collaborators;
use crate::config::ContentConfig;
use crate::fields::{OrderFields, OrderPatch};

pub const ANALYZE_REQUIREMENTS: &str = "analyze_requirements";
pub const WRITE: &str = "write";
pub const INTEGRATE_CITATIONS: &str = "integrate_citations";
pub const CHECK_WORD_COUNT: &str = "check_word_count";
pub const CHECK_QUALITY: &str = "check_quality";
pub const CHECK_AI: &str = "check_ai";
pub const HUMANIZE: &str = "humanize";
pub const CHECK_QUALITY_POST_HUMANIZATION: &str = "check_quality_post_humanization";
pub const GENERATE_REFERENCES: &str = "generate_references";

/// Status every stage may return for a broken invariant
pub const FAILED: &str = "failed";

/// What every content stage shares
#[derive(Debug, Clone)]
pub struct StageContext {
    pub collaborators: Collaborators,
    pub config: ContentConfig,
}

impl StageContext {
    pub fn new(collaborators: Collaborators, config: ContentConfig) -> Arc<Self> {
        Arc::new(Self {
            collaborators,
            config,
        })
    }
}

type Snapshot = WorkflowSnapshot<OrderFields>;
type Outcome = Result<StageResult<OrderPatch>, StageError>;

/// Terminal failure of `stage` with `error`
fn fail(stage: &str, error: impl Into<String>) -> StageResult<OrderPatch> {
    let error = error.into();
    StageResult::new(FAILED)
        .log(format!("[{}] ERROR: {}", stage, error))
        .with_error(error)
}
