//! `[content]` and `[collaborators]` configuration sections

use serde::{Deserialize, Serialize};
use stagegraph_core::collaborator::{CallPolicy, MAX_LOCAL_RETRIES};
use std::time::Duration;

use crate::collaborators::CallPolicies;
use crate::error::{ContentError, Result};

/// Thresholds and switches of the content workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Target words per ordered page
    pub words_per_page: usize,
    /// Sources requested when the requirements name none
    pub default_required_sources: usize,
    /// Highest machine-generated percentage that passes
    pub ai_pass_threshold: f64,
    /// Above this percentage the whole body is rewritten instead of sentences
    pub ai_full_rewrite_threshold: f64,
    /// Allowed overshoot over the target for papers longer than four pages
    pub max_overshoot_ratio: f64,
    /// When off, detected text goes straight to the references stage
    pub humanization_enabled: bool,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            words_per_page: 300,
            default_required_sources: 3,
            ai_pass_threshold: 5.0,
            ai_full_rewrite_threshold: 70.0,
            max_overshoot_ratio: 0.10,
            humanization_enabled: true,
        }
    }
}

impl ContentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.words_per_page == 0 {
            return Err(ContentError::Config("content.words_per_page must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.ai_pass_threshold)
            || !(0.0..=100.0).contains(&self.ai_full_rewrite_threshold)
        {
            return Err(ContentError::Config(
                "content AI thresholds must be percentages between 0 and 100".into(),
            ));
        }
        if self.ai_full_rewrite_threshold < self.ai_pass_threshold {
            return Err(ContentError::Config(
                "content.ai_full_rewrite_threshold must not be below ai_pass_threshold".into(),
            ));
        }
        if self.max_overshoot_ratio < 0.0 {
            return Err(ContentError::Config("content.max_overshoot_ratio must not be negative".into()));
        }
        Ok(())
    }
}

/// Timeout and local retries of one collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorSettings {
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            retries: 1,
        }
    }
}

impl CollaboratorSettings {
    pub fn policy(&self) -> CallPolicy {
        CallPolicy::new(Duration::from_secs(self.timeout_secs.max(1))).with_retries(self.retries)
    }
}

/// `[collaborators]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    pub writer: CollaboratorSettings,
    pub checker: CollaboratorSettings,
    pub search: CollaboratorSettings,
    pub scorer: CollaboratorSettings,
    pub humanizer: CollaboratorSettings,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            writer: CollaboratorSettings {
                timeout_secs: 120,
                retries: 1,
            },
            checker: CollaboratorSettings::default(),
            search: CollaboratorSettings {
                timeout_secs: 30,
                retries: 2,
            },
            scorer: CollaboratorSettings::default(),
            humanizer: CollaboratorSettings {
                timeout_secs: 120,
                retries: 1,
            },
        }
    }
}

impl CollaboratorsConfig {
    pub fn validate(&self) -> Result<()> {
        let all = [
            ("writer", &self.writer),
            ("checker", &self.checker),
            ("search", &self.search),
            ("scorer", &self.scorer),
            ("humanizer", &self.humanizer),
        ];
        for (name, settings) in all {
            if settings.retries > MAX_LOCAL_RETRIES {
                return Err(ContentError::Config(format!(
                    "collaborators.{}.retries must be at most {}",
                    name, MAX_LOCAL_RETRIES
                )));
            }
            if settings.timeout_secs == 0 {
                return Err(ContentError::Config(format!(
                    "collaborators.{}.timeout_secs must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn policies(&self) -> CallPolicies {
        CallPolicies {
            writer: self.writer.policy(),
            checker: self.checker.policy(),
            search: self.search.policy(),
            scorer: self.scorer.policy(),
            humanizer: self.humanizer.policy(),
        }
    }
}
