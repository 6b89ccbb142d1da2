//! Bounded, timed calls to external collaborators
//!
//! Every call a stage makes to a text generator, a search service or a scoring
//! service goes through [`call_collaborator`]:
//!
//! - each attempt is wrapped in `tokio::time::timeout`, so nothing hangs forever
//! - transient failures ([`CollaboratorError::is_transient`]) are retried at most
//!   [`CallPolicy::retries`] times, with capped exponential backoff
//! - permanent failures (missing configuration, rejected request) return at once
//!
//! Unbounded retrying is the router's job, through loop edges and their attempt
//! ceilings, never the stage's.
//!
//! ```rust,no_run
//! use stagegraph_core::collaborator::{call_collaborator, CallPolicy, CollaboratorError};
//! use std::time::Duration;
//!
//! # async fn search(q: &str) -> Result<Vec<String>, CollaboratorError> { Ok(vec![]) }
//! # async fn demo() -> Result<(), CollaboratorError> {
//! let policy = CallPolicy::new(Duration::from_secs(30)).with_retries(1);
//! let hits = call_collaborator("search", &policy, || search("rust async")).await?;
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Hard cap on local retries per call
pub const MAX_LOCAL_RETRIES: u32 = 3;

/// Failure of an external collaborator call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// No answer within the call timeout
    #[error("{collaborator} timed out after {timeout_ms}ms")]
    Timeout {
        /// Collaborator name
        collaborator: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Service unreachable or returned a server error
    #[error("{0} is unavailable")]
    Unavailable(String),

    /// Throttled by the provider
    #[error("{0} rate limit exceeded")]
    RateLimited(String),

    /// Answer could not be used (bad JSON, wrong shape)
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Collaborator not configured (no credentials, not wired)
    #[error("{0} is not configured")]
    NotConfigured(String),

    /// Request refused for a non-transient reason
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    /// Whether an immediate retry can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout { .. }
                | CollaboratorError::Unavailable(_)
                | CollaboratorError::RateLimited(_)
                | CollaboratorError::Malformed(_)
        )
    }
}

/// Timeout and local retry budget of a collaborator call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPolicy {
    /// Per-attempt timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Extra attempts after the first, clamped to [`MAX_LOCAL_RETRIES`]
    pub retries: u32,

    /// Delay before the first retry; doubles per retry
    #[serde(with = "duration_secs")]
    pub backoff: Duration,

    /// Upper bound for a single backoff delay
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,

    /// Randomize each delay by a factor in 0.5..=1.5
    pub jitter: bool,
}

impl CallPolicy {
    /// Policy with the given timeout, one retry and a short backoff
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Set the retry budget (clamped to [`MAX_LOCAL_RETRIES`])
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.min(MAX_LOCAL_RETRIES);
        self
    }

    /// Set the first backoff delay
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Effective retry budget
    pub fn max_retries(&self) -> u32 {
        self.retries.min(MAX_LOCAL_RETRIES)
    }

    /// Delay before retry number `retry` (0-based), never above `max_backoff`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.backoff.as_secs_f64() * 2f64.powi(retry.min(64) as i32);
        let max = self.max_backoff.as_secs_f64();
        let delay = if self.jitter {
            base.min(max) * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            base
        };
        Duration::try_from_secs_f64(delay.min(max)).unwrap_or(self.max_backoff)
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 1,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            jitter: true,
        }
    }
}

/// Run a collaborator call under `policy`
///
/// `call` is invoked once per attempt. A timeout counts as a transient failure.
pub async fn call_collaborator<T, Fut, Call>(
    collaborator: &str,
    policy: &CallPolicy,
    mut call: Call,
) -> Result<T, CollaboratorError>
where
    Call: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let max_retries = policy.max_retries();
    let mut retry = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollaboratorError::Timeout {
                collaborator: collaborator.to_string(),
                timeout_ms: policy.timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && retry < max_retries => {
                let delay = policy.delay_for(retry);
                tracing::warn!(
                    collaborator = %collaborator,
                    retry = retry + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient collaborator failure, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => {
                tracing::debug!(collaborator = %collaborator, error = %e, "Collaborator call failed");
                return Err(e);
            }
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds that fits in a Duration: {}",
                e
            ))
        })
    }
}
