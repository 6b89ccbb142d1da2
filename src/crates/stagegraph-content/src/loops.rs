//! Loop registry of the order workflow
//!
//! | Key | Back edge | Default | Steps per round |
//! |-----|-----------|---------|-----------------|
//! | `requirements_retry` | analyze_requirements → analyze_requirements | 3 | 1 |
//! | `writer_retry` | write → write | 3 | 1 |
//! | `word_count` | check_word_count → write | 10 | 3 (write, integrate_citations, check_word_count) |
//! | `quality_revision` | check_quality → write | 10 | 4 (write, integrate_citations, check_word_count, check_quality) |
//! | `humanization` | check_ai → humanize | 5 | 4 (humanize, check_ai, check_quality_post_humanization, check_word_count) |
//! | `post_humanization_revision` | check_quality_post_humanization → write | 50 | 3 (write, check_ai, check_quality_post_humanization) |
//!
//! `humanize` resets the `word_count` counter, so that loop gets a fresh budget
//! after every humanization round. The engine's step ceiling is derived from
//! these numbers.

use stagegraph_core::{LoopRegistry, LoopSpec};

pub const REQUIREMENTS_RETRY: &str = "requirements_retry";
pub const WRITER_RETRY: &str = "writer_retry";
pub const WORD_COUNT: &str = "word_count";
pub const QUALITY_REVISION: &str = "quality_revision";
pub const HUMANIZATION: &str = "humanization";
pub const POST_HUMANIZATION_REVISION: &str = "post_humanization_revision";

/// Every loop with its default ceiling
pub fn registry() -> LoopRegistry {
    LoopRegistry::new()
        .with(LoopSpec::new(
            REQUIREMENTS_RETRY,
            3,
            "retry requirements analysis while the generator is unavailable",
        ))
        .with(LoopSpec::new(
            WRITER_RETRY,
            3,
            "retry writing while the generator is unavailable",
        ))
        .with(
            LoopSpec::new(
                WORD_COUNT,
                10,
                "expand or shorten until the word count is within bounds",
            )
            .with_span(3)
            .reset_by(HUMANIZATION),
        )
        .with(
            LoopSpec::new(QUALITY_REVISION, 10, "revise until the quality check passes")
                .with_span(4),
        )
        .with(
            LoopSpec::new(HUMANIZATION, 5, "humanize until the authenticity check passes")
                .with_span(4),
        )
        .with(
            LoopSpec::new(
                POST_HUMANIZATION_REVISION,
                50,
                "fix critical issues introduced by humanization",
            )
            .with_span(3),
        )
}
