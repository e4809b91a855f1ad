//! Sessions and transactions over named keyspaces
//!
//! A [`SessionFactory`] owns the open keyspaces. A [`Session`] is bound to
//! one keyspace and carries the schema cache shared by the transactions it
//! opens. A [`Transaction`] reads the snapshot taken when it was opened plus
//! its own writes, and publishes them atomically at commit.

mod keyspace;
mod transaction;

pub use keyspace::Keyspace;
pub use transaction::{CommitLog, Transaction};

pub(crate) use keyspace::CommitRequest;

use crate::concept::{ConceptManager, SchemaCache};
use crate::config::Config;
use crate::dedup::DedupHandle;
use crate::error::{ConceptError, ConceptResult};
use crate::graph::GraphTx;
use crate::storage::{GraphStore, OpenStore, SqliteStore};
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique id of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    Read,
    Write,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Entry point: opens keyspaces and hands out sessions on them
pub struct SessionFactory {
    config: Config,
    store: Option<Arc<dyn GraphStore>>,
    keyspaces: DashMap<String, Arc<Keyspace>>,
    dedup: RwLock<Option<DedupHandle>>,
}

impl SessionFactory {
    /// Factory for the given configuration, opening the SQLite store when
    /// `storage.path` is set
    pub fn new(config: Config) -> ConceptResult<Self> {
        let store: Option<Arc<dyn GraphStore>> = match &config.storage.path {
            Some(path) => Some(Arc::new(SqliteStore::open(path)?)),
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// Factory whose keyspaces live in memory only
    pub fn in_memory(config: Config) -> Self {
        Self::build(config, None)
    }

    pub fn with_store(config: Config, store: Arc<dyn GraphStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: Config, store: Option<Arc<dyn GraphStore>>) -> Self {
        Self {
            config,
            store,
            keyspaces: DashMap::new(),
            dedup: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a session, creating the keyspace if it does not exist
    pub fn session(&self, keyspace: &str) -> ConceptResult<Session> {
        let keyspace = self.keyspace(keyspace)?;
        let dedup = self.dedup.read().unwrap().clone();
        Ok(Session::new(keyspace, dedup))
    }

    pub(crate) fn keyspace(&self, name: &str) -> ConceptResult<Arc<Keyspace>> {
        if name.is_empty() {
            return Err(ConceptError::Config("keyspace name must not be empty".into()));
        }
        if let Some(keyspace) = self.keyspaces.get(name) {
            return Ok(keyspace.clone());
        }
        let keyspace = self
            .keyspaces
            .entry(name.to_string())
            .or_try_insert_with(|| Keyspace::open(name, self.config.clone(), self.store.clone()).map(Arc::new))?;
        Ok(keyspace.clone())
    }

    /// Keyspaces open in this factory or present in the store
    pub fn list_keyspaces(&self) -> ConceptResult<Vec<String>> {
        let mut names: Vec<String> = self.keyspaces.iter().map(|k| k.key().clone()).collect();
        if let Some(store) = &self.store {
            names.extend(store.list_keyspaces()?);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Drop a keyspace and everything in it. Sessions already open on it
    /// keep their snapshot but their commits are no longer persisted.
    pub fn delete_keyspace(&self, name: &str) -> ConceptResult<bool> {
        let open = self.keyspaces.remove(name).is_some();
        let stored = match &self.store {
            Some(store) => store.delete_keyspace(name)?,
            None => false,
        };
        if open || stored {
            info!(keyspace = name, "keyspace.deleted");
        }
        Ok(open || stored)
    }

    /// Forward the attribute indices of every later commit to a deduplicator
    pub fn attach_deduplicator(&self, handle: DedupHandle) {
        *self.dedup.write().unwrap() = Some(handle);
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("keyspaces", &self.keyspaces.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

/// A client's view of one keyspace
pub struct Session {
    keyspace: Arc<Keyspace>,
    cache: Mutex<Arc<SchemaCache>>,
    dedup: Option<DedupHandle>,
}

impl Session {
    fn new(keyspace: Arc<Keyspace>, dedup: Option<DedupHandle>) -> Self {
        let version = keyspace.schema_version();
        Self {
            keyspace,
            cache: Mutex::new(Arc::new(SchemaCache::new(version))),
            dedup,
        }
    }

    pub fn keyspace(&self) -> &str {
        self.keyspace.name()
    }

    pub fn schema_version(&self) -> u64 {
        self.keyspace.schema_version()
    }

    /// Concepts with facts in the session cache
    pub fn cached_concepts(&self) -> usize {
        self.cache.lock().unwrap().cached_concepts()
    }

    pub fn transaction(&self, tx_type: TransactionType) -> Transaction {
        let (graph, version) = self.keyspace.snapshot();
        let session_cache = self.cache_for(version);
        let tx_id = TransactionId::new();
        let graph = GraphTx::new(graph, self.keyspace.id_generator());
        let manager = ConceptManager::new(self.keyspace.clone(), tx_id, tx_type, graph, session_cache, version);
        debug!(tx = %tx_id, keyspace = %self.keyspace.name(), %tx_type, version, "tx.opened");
        Transaction::new(manager, self.dedup.clone())
    }

    pub fn read(&self) -> Transaction {
        self.transaction(TransactionType::Read)
    }

    pub fn write(&self) -> Transaction {
        self.transaction(TransactionType::Write)
    }

    /// The session cache matching a snapshot's schema version, advanced
    /// past intervening schema commits when needed. A transaction on an
    /// older snapshot than the cache gets none.
    fn cache_for(&self, version: u64) -> Option<Arc<SchemaCache>> {
        if !self.keyspace.config().session_cache {
            return None;
        }
        let mut current = self.cache.lock().unwrap();
        if current.version() == version {
            return Some(current.clone());
        }
        if current.version() > version {
            return None;
        }
        let next = match self.keyspace.invalidations_between(current.version(), version) {
            Some(invalidations) => current.successor(version, &invalidations),
            None => SchemaCache::new(version),
        };
        debug!(keyspace = %self.keyspace.name(), from = current.version(), to = version, "session.cache.advanced");
        *current = Arc::new(next);
        Some(current.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("keyspace", &self.keyspace.name()).finish()
    }
}
