//! Concept Graph: a typed concept layer over a transactional property graph
//!
//! Schema concepts (entity, relation and attribute types, roles, rules) and
//! their instances are stored as vertices and edges of a property graph.
//! Transactions hand out identity-mapped [`Concept`] handles over those
//! elements and check the knowledge base's structure before every commit.
//!
//! # Core Concepts
//!
//! - **Keyspaces**: independent graphs, each with its own meta schema
//! - **Relations**: compact edges for attribute ownership, vertices once reified
//! - **Attributes**: unique per type and value, converged by deduplication
//!
//! # Example
//!
//! ```
//! use concept_graph::{Config, DataType, SessionFactory};
//!
//! let factory = SessionFactory::in_memory(Config::default());
//! let session = factory.session("social").unwrap();
//! let mut tx = session.write();
//! let person = tx.put_entity_type("person").unwrap();
//! let name = tx.put_attribute_type("name", DataType::String).unwrap();
//! tx.has(&person, &name).unwrap();
//! let alice = tx.add_entity(&person).unwrap();
//! let value = tx.put_attribute(&name, "alice").unwrap();
//! tx.has_attribute(&alice, &value).unwrap();
//! tx.commit().unwrap();
//! ```

pub mod concept;
pub mod config;
pub mod dedup;
pub mod error;
pub mod graph;
pub mod session;
pub mod storage;
pub mod validation;

pub use concept::{
    attribute_index, AttributeValue, Casting, Concept, ConceptId, ConceptKind, DataType, Label, LabelId,
    RelationStructure,
};
pub use config::Config;
pub use dedup::{DedupHandle, Deduplicator, DeduplicatorDaemon, KeyspaceIndexPair, MergeReport};
pub use error::{ConceptError, ConceptResult, TransactionError};
pub use session::{CommitLog, Session, SessionFactory, Transaction, TransactionId, TransactionType};
pub use storage::{GraphStore, OpenStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
