//! Storage trait definitions

use crate::graph::{CommitBatch, GraphData};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt row in keyspace {keyspace}: {reason}")]
    Corrupt { keyspace: String, reason: String },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for graph storage backends
///
/// Implementations must be thread-safe (Send + Sync): commits of different
/// keyspaces, and the deduplication daemon, reach the store from different
/// threads.
pub trait GraphStore: Send + Sync {
    /// Load the committed graph of a keyspace (empty if it was never written)
    fn load_graph(&self, keyspace: &str) -> StorageResult<GraphData>;

    /// Durably apply one committed batch. Either all of it lands or none.
    fn apply_batch(&self, keyspace: &str, batch: &CommitBatch) -> StorageResult<()>;

    /// List keyspaces that have been written
    fn list_keyspaces(&self) -> StorageResult<Vec<String>>;

    /// Delete a keyspace and all of its vertices and edges
    fn delete_keyspace(&self, keyspace: &str) -> StorageResult<bool>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: GraphStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
