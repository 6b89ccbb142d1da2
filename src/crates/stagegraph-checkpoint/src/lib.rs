//! # stagegraph-checkpoint - Durable Workflow Snapshots
//!
//! **Checkpoint store abstraction and implementations** for persisting the latest
//! snapshot of each running workflow, so that a workflow interrupted by a crash or
//! a restart can resume from its last completed stage.
//!
//! ## Core Concepts
//!
//! ### 1. CheckpointStore Trait
//!
//! [`CheckpointStore`] is a key-value contract keyed by workflow id:
//!
//! - **`save()`** - Replace the latest checkpoint of a workflow
//! - **`load()`** - Fetch it back (`None` when absent)
//! - **`clear()`** - Drop it
//! - **`list()`** - Enumerate workflow ids with a checkpoint
//!
//! ### 2. Checkpoint Record
//!
//! A [`Checkpoint`] wraps the serialized snapshot with a format version, a write
//! id, a timestamp, the step count and free-form [`CheckpointMetadata`]. The
//! snapshot is opaque JSON here; the engine owns its shape.
//!
//! ### 3. Backends
//!
//! - [`InMemoryCheckpointStore`] - Shared `HashMap`, for tests and one-shot runs
//! - [`FileCheckpointStore`] - One JSON file per workflow, written atomically
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stagegraph_checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = FileCheckpointStore::open(".stagegraph/checkpoints").await?;
//!
//!     let checkpoint = Checkpoint::new("order-42", 3, json!({"status": "text_written"}));
//!     store.save("order-42", checkpoint).await?;
//!
//!     if let Some(latest) = store.load("order-42").await? {
//!         println!("order-42 is at step {}", latest.step);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Guarantees
//!
//! - A successful `save` is durable before it returns (file backend: `sync_all`
//!   then rename).
//! - A later `load` never observes a partially written checkpoint.
//! - Writes for distinct workflow ids are independent.
//!
//! ## See Also
//!
//! - `stagegraph-core` - The engine that writes a checkpoint after every stage

pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSource};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use traits::CheckpointStore;
