//! Transaction: commit and rollback around a concept manager

use super::{CommitRequest, TransactionType};
use crate::concept::{ConceptId, ConceptManager, Label, TxCache};
use crate::dedup::{DedupHandle, KeyspaceIndexPair};
use crate::error::{ConceptError, ConceptResult};
use crate::graph::VertexId;
use crate::validation;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use tracing::{debug, info, warn};

/// What one successful commit wrote
#[derive(Debug, Clone, Serialize)]
pub struct CommitLog {
    pub keyspace: String,
    pub committed_at: DateTime<Utc>,
    /// Schema version after the commit
    pub version: u64,
    /// Net new direct instances per type
    pub instance_counts: BTreeMap<Label, i64>,
    /// Attribute index -> attributes this transaction created under it
    pub new_attributes: BTreeMap<String, BTreeSet<ConceptId>>,
}

/// A unit of work against one keyspace. Concept operations are reached
/// through `Deref` to the [`ConceptManager`].
pub struct Transaction {
    manager: ConceptManager,
    dedup: Option<DedupHandle>,
    redirects: Vec<(VertexId, VertexId)>,
}

impl Transaction {
    pub(crate) fn new(manager: ConceptManager, dedup: Option<DedupHandle>) -> Self {
        Self {
            manager,
            dedup,
            redirects: Vec::new(),
        }
    }

    /// Validate and publish this transaction's writes. The transaction is
    /// closed afterwards whatever the outcome.
    pub fn commit(mut self) -> ConceptResult<CommitLog> {
        self.manager.check_open()?;
        let result = self.commit_inner();
        self.close();
        result
    }

    fn commit_inner(&mut self) -> ConceptResult<CommitLog> {
        let keyspace = self.manager.keyspace.clone();
        let tx_id = self.manager.tx_id;
        if self.manager.tx_type == TransactionType::Read || !self.manager.graph.is_modified() {
            debug!(tx = %tx_id, keyspace = %keyspace.name(), "tx.commit.nothing_to_write");
            return Ok(CommitLog {
                keyspace: keyspace.name().to_string(),
                committed_at: Utc::now(),
                version: self.manager.snapshot_version,
                instance_counts: BTreeMap::new(),
                new_attributes: BTreeMap::new(),
            });
        }

        let errors = validation::validate(&mut self.manager)?;
        if !errors.is_empty() {
            warn!(tx = %tx_id, keyspace = %keyspace.name(), errors = errors.len(), "tx.commit.invalid");
            return Err(ConceptError::InvalidKb { errors });
        }

        let instance_counts = self.instance_counts_by_label()?;
        let cache = &self.manager.cache;
        let request = CommitRequest {
            batch: self.manager.graph.batch(),
            new_labels: new_label_vertices(cache),
            grown_types: cache
                .instance_counts
                .iter()
                .filter(|(_, count)| **count > 0)
                .filter_map(|(id, _)| match id {
                    ConceptId::Vertex(v) => Some(*v),
                    ConceptId::Edge(_) => None,
                })
                .collect(),
            invalidation: cache.has_schema_changes().then(|| cache.invalidation()),
            redirects: std::mem::take(&mut self.redirects),
        };
        let new_attributes = cache.new_attributes.clone();

        let version = keyspace.commit(request)?;

        if let Some(dedup) = &self.dedup {
            for index in new_attributes.keys() {
                dedup.submit(KeyspaceIndexPair::new(keyspace.name(), index.clone()));
            }
        }
        info!(
            tx = %tx_id,
            keyspace = %keyspace.name(),
            version,
            new_attributes = new_attributes.len(),
            "tx.commit.completed"
        );
        Ok(CommitLog {
            keyspace: keyspace.name().to_string(),
            committed_at: Utc::now(),
            version,
            instance_counts,
            new_attributes,
        })
    }

    fn instance_counts_by_label(&mut self) -> ConceptResult<BTreeMap<Label, i64>> {
        let counts: Vec<(ConceptId, i64)> = self
            .manager
            .cache
            .instance_counts
            .iter()
            .filter(|(_, count)| **count != 0)
            .map(|(id, count)| (*id, *count))
            .collect();
        let mut by_label = BTreeMap::new();
        for (id, count) in counts {
            if let Some(concept) = self.manager.get_concept(id)? {
                let label = self.manager.label(&concept)?;
                by_label.insert(label, count);
            }
        }
        Ok(by_label)
    }

    /// Discard every write made in this transaction
    pub fn rollback(mut self) {
        if self.manager.open {
            debug!(tx = %self.manager.tx_id, keyspace = %self.manager.keyspace.name(), "tx.rolled_back");
        }
        self.close();
    }

    fn close(&mut self) {
        self.manager.open = false;
        self.manager.cache = TxCache::new();
        self.redirects.clear();
    }

    /// Record that `from` was merged into `to`, so edges concurrent
    /// transactions attach to `from` land on `to`
    pub(crate) fn record_merge(&mut self, from: VertexId, to: VertexId) {
        self.redirects.push((from, to));
    }
}

/// Vertices carrying the labels a transaction introduced
fn new_label_vertices(cache: &TxCache) -> Vec<(Label, VertexId)> {
    cache
        .new_labels
        .iter()
        .filter_map(|label| match cache.labels.get(label) {
            Some(Some(ConceptId::Vertex(v))) => Some((label.clone(), *v)),
            _ => None,
        })
        .collect()
}

impl Deref for Transaction {
    type Target = ConceptManager;

    fn deref(&self) -> &ConceptManager {
        &self.manager
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut ConceptManager {
        &mut self.manager
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.manager.open {
            debug!(tx = %self.manager.tx_id, keyspace = %self.manager.keyspace.name(), "tx.dropped_open");
            self.close();
        }
    }
}
