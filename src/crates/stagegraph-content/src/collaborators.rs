//! External collaborators of the content workflow
//!
//! Stages only see these traits. Concrete clients (language models, paper
//! search, authenticity detection) live outside this crate; [`crate::mock`]
//! provides scripted offline versions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagegraph_core::collaborator::{call_collaborator, CallPolicy, CollaboratorError};
use std::fmt;
use std::sync::Arc;

use crate::fields::Source;

/// Result of a collaborator call
pub type CallResult<T> = std::result::Result<T, CollaboratorError>;

/// Prompt-in, text-out generator
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Complete `prompt`
    async fn complete(&self, prompt: &str) -> CallResult<String>;
}

/// Academic source search
#[async_trait]
pub trait SourceSearch: Send + Sync {
    /// Up to `limit` sources matching `query`
    async fn search(&self, query: &str, limit: usize) -> CallResult<Vec<Source>>;
}

/// Verdict of an authenticity scorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuthenticityReport {
    /// Share of the text judged machine-generated, 0..=100
    pub ai_percentage: f64,
    /// Sentences flagged as machine-generated
    #[serde(default)]
    pub ai_sentences: Vec<String>,
}

/// Scores how machine-generated a text reads
#[async_trait]
pub trait AuthenticityScorer: Send + Sync {
    /// Score `text`
    async fn score(&self, text: &str) -> CallResult<AuthenticityReport>;
}

/// Call policy per collaborator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallPolicies {
    pub writer: CallPolicy,
    pub checker: CallPolicy,
    pub search: CallPolicy,
    pub scorer: CallPolicy,
    pub humanizer: CallPolicy,
}

/// The collaborators one workflow uses
///
/// Only the writer is required. A stage whose collaborator is missing returns
/// its `skipped` status and leaves the text untouched.
#[derive(Clone)]
pub struct Collaborators {
    writer: Arc<dyn TextGenerator>,
    checker: Option<Arc<dyn TextGenerator>>,
    search: Option<Arc<dyn SourceSearch>>,
    scorer: Option<Arc<dyn AuthenticityScorer>>,
    humanizer: Option<Arc<dyn TextGenerator>>,
    policies: CallPolicies,
}

impl Collaborators {
    /// Bundle with only a writer
    pub fn new(writer: Arc<dyn TextGenerator>) -> Self {
        Self {
            writer,
            checker: None,
            search: None,
            scorer: None,
            humanizer: None,
            policies: CallPolicies::default(),
        }
    }

    /// Generator used for quality checks and relevance screening
    pub fn with_checker(mut self, checker: Arc<dyn TextGenerator>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SourceSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn AuthenticityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_humanizer(mut self, humanizer: Arc<dyn TextGenerator>) -> Self {
        self.humanizer = Some(humanizer);
        self
    }

    pub fn with_policies(mut self, policies: CallPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn policies(&self) -> &CallPolicies {
        &self.policies
    }

    pub fn has_checker(&self) -> bool {
        self.checker.is_some()
    }

    pub fn has_search(&self) -> bool {
        self.search.is_some()
    }

    pub fn has_scorer(&self) -> bool {
        self.scorer.is_some()
    }

    pub fn has_humanizer(&self) -> bool {
        self.humanizer.is_some()
    }

    /// Ask the writer
    pub async fn write(&self, prompt: &str) -> CallResult<String> {
        let writer = &self.writer;
        call_collaborator("writer", &self.policies.writer, || writer.complete(prompt)).await
    }

    /// Ask the checker; `None` when no checker is configured
    pub async fn check(&self, prompt: &str) -> Option<CallResult<String>> {
        let checker = self.checker.as_ref()?;
        Some(call_collaborator("checker", &self.policies.checker, || checker.complete(prompt)).await)
    }

    /// Search for sources; `None` when no search service is configured
    pub async fn search(&self, query: &str, limit: usize) -> Option<CallResult<Vec<Source>>> {
        let search = self.search.as_ref()?;
        Some(call_collaborator("search", &self.policies.search, || search.search(query, limit)).await)
    }

    /// Score a text; `None` when no scorer is configured
    pub async fn score(&self, text: &str) -> Option<CallResult<AuthenticityReport>> {
        let scorer = self.scorer.as_ref()?;
        Some(call_collaborator("scorer", &self.policies.scorer, || scorer.score(text)).await)
    }

    /// Humanize a text; `None` when no humanizer is configured
    pub async fn humanize(&self, prompt: &str) -> Option<CallResult<String>> {
        let humanizer = self.humanizer.as_ref()?;
        Some(
            call_collaborator("humanizer", &self.policies.humanizer, || {
                humanizer.complete(prompt)
            })
            .await,
        )
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("checker", &self.has_checker())
            .field("search", &self.has_search())
            .field("scorer", &self.has_scorer())
            .field("humanizer", &self.has_humanizer())
            .finish()
    }
}
