use async_trait::async_trait;
use stagegraph_core::{Stage, StageResult};
use std::sync::Arc;

use super::{fail, Outcome, Snapshot, StageContext, FAILED, INTEGRATE_CITATIONS};
use crate::fields::{OrderFields, OrderPatch, Source};
use crate::text::{count_citations, search_queries, strip_reference_section, truncate_chars};

pub const CITATIONS_ADDED: &str = "citations_added";
pub const SKIPPED: &str = "skipped";
pub const SEARCH_FAILED: &str = "search_failed";

/// Abstracts shorter than this are not worth citing
const MIN_ABSTRACT_CHARS: usize = 50;

/// Finds sources for the draft and inserts in-text citations
pub struct IntegrateCitations {
    ctx: Arc<StageContext>,
}

impl IntegrateCitations {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    fn required_sources(&self, fields: &OrderFields) -> usize {
        fields
            .requirements
            .required_sources
            .unwrap_or(self.ctx.config.default_required_sources)
            .max(1)
    }

    async fn is_relevant(&self, query: &str, keywords: &str, source: &Source) -> bool {
        let prompt = format!(
            "Can this paper be cited in an academic essay about \"{}\"?\n\n\
             PAPER TITLE: {}\nABSTRACT: {}\n\nAnswer YES or NO.",
            query,
            source.title,
            truncate_chars(&source.abstract_text, 500)
        );
        match self.ctx.collaborators.check(&prompt).await {
            Some(Ok(answer)) => answer.to_uppercase().contains("YES"),
            Some(Err(e)) => {
                tracing::warn!(title = %source.title, error = %e, "Relevance check failed");
                false
            }
            None => keyword_match(keywords, source),
        }
    }

    /// Relevant sources, at most `required`; `None` when every search failed
    async fn find_sources(&self, fields: &OrderFields, required: usize) -> Option<Vec<Source>> {
        let keywords = fields.requirements.search_keywords.join(" ");
        let mut relevant: Vec<Source> = Vec::new();
        let mut failures = 0;
        let queries = search_queries(&fields.requirements);

        for query in &queries {
            if relevant.len() >= required {
                break;
            }
            let found = match self.ctx.collaborators.search(query, required * 3).await {
                Some(Ok(found)) => found,
                Some(Err(e)) => {
                    tracing::warn!(query = %query, error = %e, "Source search failed");
                    failures += 1;
                    continue;
                }
                None => break,
            };

            for source in found
                .into_iter()
                .filter(|s| s.abstract_text.chars().count() > MIN_ABSTRACT_CHARS)
            {
                if relevant.len() >= required {
                    break;
                }
                if relevant.iter().any(|r| r.title == source.title) {
                    continue;
                }
                if self.is_relevant(query, &keywords, &source).await {
                    relevant.push(source);
                }
            }
        }

        if relevant.is_empty() && !queries.is_empty() && failures == queries.len() {
            None
        } else {
            Some(relevant)
        }
    }
}

/// At least two keywords appear in the title or abstract
fn keyword_match(keywords: &str, source: &Source) -> bool {
    let haystack = format!("{} {}", source.title, source.abstract_text).to_lowercase();
    let mut words: Vec<String> = keywords.to_lowercase().split_whitespace().map(String::from).collect();
    words.sort();
    words.dedup();
    words.iter().filter(|w| haystack.contains(w.as_str())).count() >= 2
}

fn citation_prompt(text: &str, sources: &[Source]) -> String {
    let listing = sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "SOURCE {}: {}\n  Title: {}\n  Abstract: {}",
                i + 1,
                s.citation,
                s.title,
                truncate_chars(&s.abstract_text, 200)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Insert APA in-text citations such as (Author, Year) into this text, before the \
         period of sentences that make claims. Cite each source at least once. Keep all of \
         the original text and do not add a references section.\n\nTEXT:\n{}\n\nSOURCES:\n{}",
        text, listing
    )
}

#[async_trait]
impl Stage<OrderFields> for IntegrateCitations {
    fn id(&self) -> &str {
        INTEGRATE_CITATIONS
    }

    fn outcomes(&self) -> &[&'static str] {
        &[CITATIONS_ADDED, SKIPPED, SEARCH_FAILED, FAILED]
    }

    async fn execute(&self, snapshot: &Snapshot) -> Outcome {
        let fields = &snapshot.fields;
        let draft = fields.draft_text.as_str();
        if draft.trim().is_empty() {
            return Ok(fail("citations", "no draft text to cite"));
        }

        let without_citations = OrderPatch {
            text_with_citations: Some(draft.to_string()),
            citations_inserted: Some(false),
            ..Default::default()
        };

        if !self.ctx.collaborators.has_search() {
            return Ok(StageResult::new(SKIPPED)
                .with_patch(without_citations)
                .log("[citations] no search service configured, skipped"));
        }

        let required = self.required_sources(fields);
        tracing::info!(order_id = %fields.order_id, required, "Searching for sources");

        let sources = match self.find_sources(fields, required).await {
            Some(sources) => sources,
            None => {
                return Ok(StageResult::new(SEARCH_FAILED)
                    .with_patch(OrderPatch {
                        sources_found: Some(Vec::new()),
                        ..without_citations
                    })
                    .log("[citations] source search unavailable, continuing without citations"))
            }
        };

        if sources.is_empty() {
            return Ok(StageResult::new(SKIPPED)
                .with_patch(OrderPatch {
                    sources_found: Some(Vec::new()),
                    ..without_citations
                })
                .log("[citations] no relevant sources found, skipped"));
        }

        match self.ctx.collaborators.write(&citation_prompt(draft, &sources)).await {
            Ok(reply) => {
                let cited = strip_reference_section(&reply);
                if cited.is_empty() {
                    return Ok(fail("citations", "generator returned no text while inserting citations"));
                }
                let count = count_citations(&cited);
                let line = format!(
                    "[citations] added {} citations from {} sources",
                    count,
                    sources.len()
                );
                Ok(StageResult::new(CITATIONS_ADDED)
                    .with_patch(OrderPatch {
                        sources_found: Some(sources),
                        text_with_citations: Some(cited),
                        citations_inserted: Some(true),
                        ..Default::default()
                    })
                    .log(line))
            }
            Err(e) => {
                tracing::warn!(order_id = %fields.order_id, error = %e, "Citation insertion failed");
                Ok(StageResult::new(CITATIONS_ADDED)
                    .with_patch(OrderPatch {
                        sources_found: Some(sources),
                        ..without_citations
                    })
                    .log(format!("[citations] insertion failed, keeping uncited text: {}", e)))
            }
        }
    }
}
