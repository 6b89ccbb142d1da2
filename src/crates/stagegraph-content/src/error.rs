//! Content workflow errors

use stagegraph_core::EngineError;
use thiserror::Error;

/// Result type for content workflow operations
pub type Result<T> = std::result::Result<T, ContentError>;

/// Errors building or feeding the content workflow
#[derive(Error, Debug)]
pub enum ContentError {
    /// Workflow construction or execution failed in the engine
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// `[content]` or `[collaborators]` configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Order file could not be used
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// Order JSON could not be parsed
    #[error("Order parse error: {0}")]
    Parse(#[from] serde_json::Error),
}
