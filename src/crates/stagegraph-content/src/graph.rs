//! Routing of the order workflow
//!
//! ```text
//! analyze_requirements -> write -> integrate_citations -> check_word_count
//!        ^   (retry)       ^  \________________________________/   |
//!        |                 |      (expand / shorten)               v
//!        |                 +---------(revise)------------- check_quality
//!        |                                                         |
//!        |          humanize <-(ai_detected)- check_ai <-----------+
//!        |              \___________________/    |
//!        |                      check_quality_post_humanization (after humanization)
//!        |                                       |
//!        +----------------------------- generate_references -> done
//! ```
//!
//! Every loop is registered in [`crate::loops`]; when a ceiling is reached the
//! workflow proceeds with the best text it has.

use stagegraph_core::{Decision, Route, Target, Workflow, WorkflowBuilder, WorkflowSnapshot};
use std::sync::Arc;

use crate::error::Result;
use crate::fields::{CitationAction, OrderFields, WriterMode};
use crate::loops::{
    self, HUMANIZATION, POST_HUMANIZATION_REVISION, QUALITY_REVISION, REQUIREMENTS_RETRY,
    WORD_COUNT, WRITER_RETRY,
};
use crate::stages::{
    ai_check, citations, humanize, quality, references, requirements, word_count, write,
    AnalyzeRequirements, CheckAi, CheckQuality, CheckQualityPostHumanization, CheckWordCount,
    GenerateReferences, Humanize, IntegrateCitations, StageContext, Write, ANALYZE_REQUIREMENTS,
    CHECK_AI, CHECK_QUALITY, CHECK_QUALITY_POST_HUMANIZATION, CHECK_WORD_COUNT, FAILED,
    GENERATE_REFERENCES, HUMANIZE, INTEGRATE_CITATIONS, WRITE,
};

/// Workflow name used in checkpoints and logs
pub const WORKFLOW_NAME: &str = "order";

type Snapshot = WorkflowSnapshot<OrderFields>;

fn after_text_written(snapshot: &Snapshot) -> Route {
    if snapshot.fields.writer_mode == WriterMode::ShortenHumanized {
        Route::stage(CHECK_WORD_COUNT)
    } else {
        Route::stage(INTEGRATE_CITATIONS)
    }
}

fn after_text_revised(snapshot: &Snapshot) -> Route {
    let fields = &snapshot.fields;
    if fields.writer_mode == WriterMode::FixHumanized && fields.post_humanization {
        Route::stage(CHECK_AI)
    } else if fields.citation_action == CitationAction::Reinsert {
        Route::stage(INTEGRATE_CITATIONS)
    } else {
        Route::stage(CHECK_QUALITY)
    }
}

fn after_shortening(snapshot: &Snapshot) -> Route {
    let fields = &snapshot.fields;
    if fields.citations_inserted && fields.citation_action != CitationAction::Reinsert {
        Route::stage(CHECK_QUALITY)
    } else {
        Route::stage(INTEGRATE_CITATIONS)
    }
}

fn after_word_count(snapshot: &Snapshot) -> Route {
    if snapshot.fields.post_humanization {
        Route::stage(GENERATE_REFERENCES)
    } else {
        Route::stage(CHECK_QUALITY)
    }
}

fn after_ai_passed(snapshot: &Snapshot) -> Route {
    if snapshot.fields.post_humanization {
        Route::stage(CHECK_QUALITY_POST_HUMANIZATION)
    } else {
        Route::stage(GENERATE_REFERENCES)
    }
}

fn word_count_metric(snapshot: &Snapshot) -> String {
    format!(
        "{} words (target {})",
        snapshot.fields.word_count, snapshot.fields.target_word_count
    )
}

fn quality_metric(snapshot: &Snapshot) -> String {
    format!("{} open issues", snapshot.fields.quality_issues.len())
}

/// The order workflow over `ctx`'s collaborators and settings
pub fn build_workflow(ctx: Arc<StageContext>) -> Result<Workflow<OrderFields>> {
    let humanization_enabled = ctx.config.humanization_enabled;

    let ai_detected = if humanization_enabled {
        Decision::looping(HUMANIZATION, HUMANIZE, Route::stage(GENERATE_REFERENCES))
            .with_metric(|s: &Snapshot| format!("ai score {:.1}%", s.fields.ai_score))
    } else {
        Decision::to(GENERATE_REFERENCES)
    };

    let workflow = WorkflowBuilder::new(WORKFLOW_NAME)
        .stage(AnalyzeRequirements::new(ctx.clone()))
        .stage(Write::new(ctx.clone()))
        .stage(IntegrateCitations::new(ctx.clone()))
        .stage(CheckWordCount::new(ctx.clone()))
        .stage(CheckQuality::new(ctx.clone()))
        .stage(CheckAi::new(ctx.clone()))
        .stage(Humanize::new(ctx.clone()))
        .stage(CheckQualityPostHumanization::new(ctx))
        .stage(GenerateReferences::new())
        .entry(ANALYZE_REQUIREMENTS)
        .loops(loops::registry())
        // requirements
        .edge(ANALYZE_REQUIREMENTS, requirements::REQUIREMENTS_EXTRACTED, Decision::to(WRITE))
        .edge(ANALYZE_REQUIREMENTS, requirements::INSUFFICIENT_INFO, Decision::terminal())
        .edge(
            ANALYZE_REQUIREMENTS,
            requirements::REQUIREMENTS_UNAVAILABLE,
            Decision::looping(
                REQUIREMENTS_RETRY,
                ANALYZE_REQUIREMENTS,
                Route::fail("requirements analysis unavailable after retries"),
            ),
        )
        .edge(ANALYZE_REQUIREMENTS, FAILED, Decision::terminal())
        // writer
        .edge(WRITE, write::TEXT_WRITTEN, Decision::branch(after_text_written))
        .edge(WRITE, write::TEXT_REVISED, Decision::branch(after_text_revised))
        .edge(WRITE, write::WORD_COUNT_SHORTENING, Decision::branch(after_shortening))
        .edge(
            WRITE,
            write::WRITER_UNAVAILABLE,
            Decision::looping(
                WRITER_RETRY,
                WRITE,
                Route::fail("writer unavailable after retries"),
            ),
        )
        .edge(WRITE, FAILED, Decision::terminal())
        // citations
        .edge(INTEGRATE_CITATIONS, citations::CITATIONS_ADDED, Decision::to(CHECK_WORD_COUNT))
        .edge(INTEGRATE_CITATIONS, citations::SKIPPED, Decision::to(CHECK_WORD_COUNT))
        .edge(INTEGRATE_CITATIONS, citations::SEARCH_FAILED, Decision::to(CHECK_WORD_COUNT))
        .edge(INTEGRATE_CITATIONS, FAILED, Decision::terminal())
        // word count
        .edge(CHECK_WORD_COUNT, word_count::WORD_COUNT_OK, Decision::branch(after_word_count))
        .edge(
            CHECK_WORD_COUNT,
            word_count::WORD_COUNT_LOW,
            Decision::looping(WORD_COUNT, WRITE, Target::computed(after_word_count))
                .with_metric(word_count_metric),
        )
        .edge(
            CHECK_WORD_COUNT,
            word_count::WORD_COUNT_HIGH,
            Decision::looping(WORD_COUNT, WRITE, Target::computed(after_word_count))
                .with_metric(word_count_metric),
        )
        .edge(CHECK_WORD_COUNT, FAILED, Decision::terminal())
        // quality
        .edge(CHECK_QUALITY, quality::QUALITY_OK, Decision::to(CHECK_AI))
        .edge(
            CHECK_QUALITY,
            quality::QUALITY_REVISING,
            Decision::looping(QUALITY_REVISION, WRITE, Route::stage(CHECK_AI))
                .with_metric(quality_metric),
        )
        .edge(CHECK_QUALITY, quality::QUALITY_UNCHECKED, Decision::to(CHECK_AI))
        .edge(CHECK_QUALITY, quality::SKIPPED, Decision::to(CHECK_AI))
        .edge(CHECK_QUALITY, FAILED, Decision::terminal())
        // authenticity
        .edge(CHECK_AI, ai_check::AI_PASSED, Decision::branch(after_ai_passed))
        .edge(CHECK_AI, ai_check::AI_DETECTED, ai_detected)
        .edge(CHECK_AI, ai_check::AI_CHECK_FAILED, Decision::to(GENERATE_REFERENCES))
        .edge(CHECK_AI, ai_check::SKIPPED, Decision::to(GENERATE_REFERENCES))
        .edge(CHECK_AI, FAILED, Decision::terminal())
        // humanization
        .edge(HUMANIZE, humanize::HUMANIZED, Decision::to(CHECK_AI))
        .edge(HUMANIZE, humanize::HUMANIZE_FAILED, Decision::to(CHECK_AI))
        .edge(HUMANIZE, humanize::SKIPPED, Decision::to(GENERATE_REFERENCES))
        .edge(HUMANIZE, FAILED, Decision::terminal())
        // post-humanization quality
        .edge(
            CHECK_QUALITY_POST_HUMANIZATION,
            quality::QUALITY_OK,
            Decision::to(CHECK_WORD_COUNT),
        )
        .edge(
            CHECK_QUALITY_POST_HUMANIZATION,
            quality::QUALITY_REVISING,
            Decision::looping(POST_HUMANIZATION_REVISION, WRITE, Route::stage(CHECK_WORD_COUNT))
                .with_metric(quality_metric),
        )
        .edge(
            CHECK_QUALITY_POST_HUMANIZATION,
            quality::QUALITY_UNCHECKED,
            Decision::to(CHECK_WORD_COUNT),
        )
        .edge(
            CHECK_QUALITY_POST_HUMANIZATION,
            quality::SKIPPED,
            Decision::to(CHECK_WORD_COUNT),
        )
        .edge(CHECK_QUALITY_POST_HUMANIZATION, FAILED, Decision::terminal())
        // output
        .edge(GENERATE_REFERENCES, references::COMPLETED, Decision::terminal())
        .edge(GENERATE_REFERENCES, FAILED, Decision::terminal())
        .build()?;

    Ok(workflow)
}
