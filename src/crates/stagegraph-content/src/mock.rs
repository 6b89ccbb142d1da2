//! Scripted offline collaborators
//!
//! Used by the tests and by the CLI's offline mode. Scripted collaborators
//! answer from a queue and fall back to a fixed reply once the queue is empty;
//! without a fallback an exhausted script is a non-transient
//! [`CollaboratorError::Rejected`].

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use stagegraph_core::collaborator::CollaboratorError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::collaborators::{
    AuthenticityReport, AuthenticityScorer, CallResult, Collaborators, SourceSearch, TextGenerator,
};
use crate::fields::Source;

/// Generator answering from a script
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<CallResult<String>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.script.lock().push_back(Ok(text.into()));
        self
    }

    /// Queue a failure
    pub fn fail(self, error: CollaboratorError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Reply given whenever the script is empty
    pub fn fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Number of calls so far
    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, prompt: &str) -> CallResult<String> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(text) => Ok(text.clone()),
            None => Err(CollaboratorError::Rejected("script exhausted".to_string())),
        }
    }
}

/// Search service returning the same sources for every query
#[derive(Debug, Default)]
pub struct StaticSearch {
    sources: Vec<Source>,
    error: Option<CollaboratorError>,
    calls: AtomicUsize,
}

impl StaticSearch {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources,
            ..Self::default()
        }
    }

    /// Search that fails every query with `error`
    pub fn failing(error: CollaboratorError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceSearch for StaticSearch {
    async fn search(&self, _query: &str, limit: usize) -> CallResult<Vec<Source>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        Ok(self.sources.iter().take(limit).cloned().collect())
    }
}

/// Scorer answering from a script; the last report repeats
#[derive(Debug, Default)]
pub struct ScriptedScorer {
    script: Mutex<VecDeque<CallResult<AuthenticityReport>>>,
    last: Mutex<Option<AuthenticityReport>>,
    calls: AtomicUsize,
}

impl ScriptedScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a report with flagged sentences
    pub fn report(self, ai_percentage: f64, sentences: &[&str]) -> Self {
        self.script.lock().push_back(Ok(AuthenticityReport {
            ai_percentage,
            ai_sentences: sentences.iter().map(|s| s.to_string()).collect(),
        }));
        self
    }

    /// Queue a failure
    pub fn fail(self, error: CollaboratorError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthenticityScorer for ScriptedScorer {
    async fn score(&self, _text: &str) -> CallResult<AuthenticityReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Ok(report)) => {
                *self.last.lock() = Some(report.clone());
                Ok(report)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .clone()
                .ok_or_else(|| CollaboratorError::Rejected("script exhausted".to_string())),
        }
    }
}

fn length_hint() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:Target length:|to at least|to at most)\s+(\d+)\s+words")
            .unwrap_or_else(|e| unreachable!("length hint pattern is valid: {}", e))
    })
}

/// Writer that needs no network
///
/// Requirement prompts get a minimal sufficient requirements object built
/// from the prompt; writing prompts get filler text of the requested length.
#[derive(Debug, Default)]
pub struct OfflineWriter;

impl OfflineWriter {
    fn filler(words: usize) -> String {
        const SENTENCE: [&str; 10] = [
            "This", "section", "develops", "the", "argument", "with", "careful", "and", "clear",
            "reasoning.",
        ];
        let mut paragraphs = Vec::new();
        let mut current = Vec::with_capacity(100);
        for i in 0..words.max(1) {
            current.push(SENTENCE[i % SENTENCE.len()]);
            if current.len() == 100 {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        }
        if !current.is_empty() {
            paragraphs.push(current.join(" "));
        }
        paragraphs.join("\n\n")
    }
}

#[async_trait]
impl TextGenerator for OfflineWriter {
    async fn complete(&self, prompt: &str) -> CallResult<String> {
        if prompt.starts_with("Extract the assignment requirements") {
            let description = prompt
                .split("ORDER DESCRIPTION:\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\nATTACHED FILES:").next())
                .unwrap_or("Untitled order");
            let topic: String = description.split_whitespace().take(8).collect::<Vec<_>>().join(" ");
            let requirements = serde_json::json!({
                "assignment_type": "essay",
                "main_topic": topic,
                "main_question": description,
                "search_keywords": [topic],
                "is_sufficient": true,
            });
            return Ok(requirements.to_string());
        }

        if let Some(words) = length_hint()
            .captures(prompt)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
        {
            return Ok(Self::filler(words));
        }

        // anything else echoes the text after the last TEXT label
        let text = prompt
            .rsplit("TEXT:\n")
            .next()
            .and_then(|rest| rest.split("\n\nSOURCES:").next())
            .unwrap_or(prompt);
        Ok(text.to_string())
    }
}

/// Collaborators for offline runs: the offline writer and nothing else
pub fn offline_collaborators() -> Collaborators {
    Collaborators::new(Arc::new(OfflineWriter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::count_words;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let generator = ScriptedGenerator::new()
            .reply("one")
            .fail(CollaboratorError::Unavailable("llm".into()))
            .fallback("again");
        assert_eq!(generator.complete("a").await.unwrap(), "one");
        assert!(generator.complete("b").await.is_err());
        assert_eq!(generator.complete("c").await.unwrap(), "again");
        assert_eq!(generator.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_rejected() {
        let error = ScriptedGenerator::new().complete("x").await.unwrap_err();
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn test_scorer_repeats_last_report() {
        let scorer = ScriptedScorer::new().report(40.0, &["s"]).report(2.0, &[]);
        assert_eq!(scorer.score("t").await.unwrap().ai_percentage, 40.0);
        assert_eq!(scorer.score("t").await.unwrap().ai_percentage, 2.0);
        assert_eq!(scorer.score("t").await.unwrap().ai_percentage, 2.0);
        assert_eq!(scorer.calls(), 3);
    }

    #[tokio::test]
    async fn test_offline_writer_hits_length() {
        let text = OfflineWriter
            .complete("Write an essay.\nTarget length: 250 words. Go.")
            .await
            .unwrap();
        assert_eq!(count_words(&text), 250);
    }
}
