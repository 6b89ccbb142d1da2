//! Engine configuration (`[engine]` and `[loops]` sections)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// What happens to a checkpoint once its workflow is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep every terminal checkpoint for inspection
    #[default]
    Keep,
    /// Drop checkpoints of succeeded workflows, keep failures
    ClearOnSuccess,
    /// Drop every terminal checkpoint
    ClearOnTerminal,
}

impl RetentionPolicy {
    /// Whether a terminal checkpoint with the given outcome is dropped
    pub fn clears(self, failed: bool) -> bool {
        match self {
            RetentionPolicy::Keep => false,
            RetentionPolicy::ClearOnSuccess => !failed,
            RetentionPolicy::ClearOnTerminal => true,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global step ceiling: stage executions per workflow
    ///
    /// Unset means derived from the workflow's loop ceilings. A value below what
    /// those ceilings allow is rejected when the engine is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,

    /// Workflows processed at the same time by the scheduler
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Backstop timeout for one stage execution; 0 disables it
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// Terminal checkpoint retention
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Per-loop ceiling overrides
    #[serde(default)]
    pub loops: HashMap<String, u32>,
}

fn default_max_concurrent_workflows() -> usize {
    4
}

fn default_stage_timeout_secs() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: None,
            max_concurrent_workflows: default_max_concurrent_workflows(),
            stage_timeout_secs: default_stage_timeout_secs(),
            retention: RetentionPolicy::default(),
            loops: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Stage backstop timeout, `None` when disabled
    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }

    /// Reject values that would disable a safety bound
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == Some(0) {
            return Err(EngineError::Config("engine.max_steps must be at least 1".to_string()));
        }
        if self.max_concurrent_workflows == 0 {
            return Err(EngineError::Config(
                "engine.max_concurrent_workflows must be at least 1".to_string(),
            ));
        }
        if let Some((key, _)) = self.loops.iter().find(|(_, ceiling)| **ceiling == 0) {
            return Err(EngineError::Config(format!(
                "ceiling for loop '{}' must be at least 1",
                key
            )));
        }
        Ok(())
    }
}
