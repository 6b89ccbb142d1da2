//! # stagegraph-content - Order-Processing Content Workflow
//!
//! The nine-stage workflow that turns an order (description, page count,
//! attached material) into a finished, cited and checked text, built on
//! `stagegraph-core`.
//!
//! ## Stages
//!
//! | Stage | Does |
//! |-------|------|
//! | `analyze_requirements` | extracts topic, length and source requirements |
//! | `write` | drafts, expands, shortens and revises the text |
//! | `integrate_citations` | finds sources and inserts in-text citations |
//! | `check_word_count` | keeps the text between the target and the word limit |
//! | `check_quality` | reviews the draft against the writing rules |
//! | `check_ai` | scores the text for machine-generated content |
//! | `humanize` | rewrites flagged sentences or the whole body |
//! | `check_quality_post_humanization` | catches critical problems humanization introduced |
//! | `generate_references` | appends the references section |
//!
//! External services are reached only through the [`collaborators`] traits; a
//! missing optional collaborator makes its stage pass through with `skipped`.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use stagegraph_checkpoint::InMemoryCheckpointStore;
//! use stagegraph_content::{build_workflow, mock, ContentConfig, Order, OrderFields, StageContext};
//! use stagegraph_core::Engine;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ContentConfig::default();
//! let order: Order = serde_json::from_str(r#"{"order_id": "o-1", "description": "Tides and coastal towns"}"#)?;
//! let fields = OrderFields::from_order(&order, config.words_per_page);
//!
//! let ctx = StageContext::new(mock::offline_collaborators(), config);
//! let engine = Engine::new(build_workflow(ctx)?, Arc::new(InMemoryCheckpointStore::new()));
//! let done = engine.run(&order.order_id, fields).await?;
//! assert_eq!(done.status, "completed");
//! assert!(!done.fields.final_text.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod fields;
pub mod graph;
pub mod loops;
pub mod mock;
pub mod stages;
pub mod text;

pub use collaborators::{
    AuthenticityReport, AuthenticityScorer, CallPolicies, Collaborators, SourceSearch,
    TextGenerator,
};
pub use config::{CollaboratorSettings, CollaboratorsConfig, ContentConfig};
pub use error::{ContentError, Result};
pub use fields::{CitationAction, HumanizationMode, Order, OrderFields, OrderPatch, Requirements, Source, WriterMode};
pub use graph::{build_workflow, WORKFLOW_NAME};
pub use stages::StageContext;

use std::path::Path;

/// Parse an order from JSON
pub fn parse_order(json: &str) -> Result<Order> {
    let order: Order = serde_json::from_str(json)?;
    if order.order_id.trim().is_empty() {
        return Err(ContentError::InvalidOrder("order_id is empty".to_string()));
    }
    Ok(order)
}

/// Read and parse an order file
pub async fn load_order(path: impl AsRef<Path>) -> Result<Order> {
    let path = path.as_ref();
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ContentError::InvalidOrder(format!("{}: {}", path.display(), e)))?;
    parse_order(&json)
}
