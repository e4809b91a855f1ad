//! Attribute deduplication
//!
//! Concurrent transactions may each create a vertex for the same attribute
//! type and value. Merging folds every such candidate into the one with the
//! lowest id, moving its edges onto the survivor first. A merge is its own
//! write transaction, so running it again, or alongside further inserts,
//! converges on a single vertex per index.

mod daemon;

pub use daemon::{DedupHandle, DeduplicatorDaemon};

use crate::concept::{edge_property, vertex_property, ConceptId, EdgeLabel};
use crate::error::ConceptResult;
use crate::graph::{Direction, EdgeRecord, PropertyValue, VertexId};
use crate::session::{SessionFactory, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// One uniqueness index to converge in one keyspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyspaceIndexPair {
    pub keyspace: String,
    pub index: String,
}

impl KeyspaceIndexPair {
    pub fn new(keyspace: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            index: index.into(),
        }
    }
}

impl fmt::Display for KeyspaceIndexPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.index)
    }
}

/// Outcome of one merge
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub keyspace: String,
    pub index: String,
    pub survivor: Option<ConceptId>,
    /// Duplicates folded into the survivor and deleted
    pub merged: usize,
    /// Edges moved onto the survivor
    pub redirected_edges: usize,
    /// Edges dropped because the survivor already had an equivalent one
    pub collapsed_edges: usize,
}

/// Merges duplicate attributes
pub struct Deduplicator;

impl Deduplicator {
    /// Fold every attribute vertex carrying the pair's index into the
    /// lowest-id one and commit. Candidates that vanish mid-merge are skipped.
    pub fn deduplicate(factory: &SessionFactory, pair: &KeyspaceIndexPair) -> ConceptResult<MergeReport> {
        let session = factory.session(&pair.keyspace)?;
        let mut tx = session.write();
        let report = Self::merge(&mut tx, pair)?;
        if report.merged == 0 {
            return Ok(report);
        }

        tx.commit()?;
        info!(
            %pair,
            survivor = ?report.survivor,
            merged = report.merged,
            redirected = report.redirected_edges,
            collapsed = report.collapsed_edges,
            "dedup.merge.completed"
        );
        Ok(report)
    }

    /// Stage the merge in `tx` without committing it. Links other
    /// transactions commit to a duplicate before `tx` commits are moved onto
    /// the survivor at commit.
    pub fn merge(tx: &mut Transaction, pair: &KeyspaceIndexPair) -> ConceptResult<MergeReport> {
        let mut report = MergeReport {
            keyspace: pair.keyspace.clone(),
            index: pair.index.clone(),
            ..Default::default()
        };

        let candidates = tx
            .graph
            .vertices_by_property(vertex_property::INDEX, &PropertyValue::String(pair.index.clone()));
        let Some((&survivor, duplicates)) = candidates.split_first() else {
            debug!(%pair, "dedup.merge.no_candidates");
            return Ok(report);
        };
        report.survivor = Some(ConceptId::Vertex(survivor));

        for &duplicate in duplicates {
            if !tx.graph.vertex_exists(duplicate) || !tx.graph.vertex_exists(survivor) {
                warn!(%pair, %duplicate, "dedup.merge.candidate_vanished");
                continue;
            }
            merge_into(tx, duplicate, survivor, &mut report)?;
            if let Some(concept) = tx.get_concept(ConceptId::Vertex(duplicate))? {
                tx.delete_thing(&concept)?;
            }
            tx.record_merge(duplicate, survivor);
            report.merged += 1;
        }
        Ok(report)
    }
}

/// Move every edge touching `duplicate` onto `survivor`, dropping those the
/// survivor already has an equivalent of
fn merge_into(tx: &mut Transaction, duplicate: VertexId, survivor: VertexId, report: &mut MergeReport) -> ConceptResult<()> {
    // owner -> attribute links, edge form
    for edge in tx.graph.edges_of(duplicate, Direction::In, Some(EdgeLabel::Attribute.as_str())) {
        let exists = tx
            .graph
            .edges_of(edge.source, Direction::Out, Some(EdgeLabel::Attribute.as_str()))
            .iter()
            .any(|e| e.target == survivor && same_property(e, &edge, edge_property::RELATION_TYPE_LABEL_ID));
        move_edge(tx, &edge, edge.source, survivor, exists, report)?;
    }
    // attributes owned by the duplicate itself
    for edge in tx.graph.edges_of(duplicate, Direction::Out, Some(EdgeLabel::Attribute.as_str())) {
        let exists = tx
            .graph
            .edges_of(survivor, Direction::Out, Some(EdgeLabel::Attribute.as_str()))
            .iter()
            .any(|e| e.target == edge.target && same_property(e, &edge, edge_property::RELATION_TYPE_LABEL_ID));
        move_edge(tx, &edge, survivor, edge.target, exists, report)?;
    }
    // castings, including the value side of reified has-relations
    for edge in tx.graph.edges_of(duplicate, Direction::In, Some(EdgeLabel::RolePlayer.as_str())) {
        let exists = tx
            .graph
            .edges_of(edge.source, Direction::Out, Some(EdgeLabel::RolePlayer.as_str()))
            .iter()
            .any(|e| e.target == survivor && same_property(e, &edge, edge_property::ROLE_LABEL_ID));
        move_edge(tx, &edge, edge.source, survivor, exists, report)?;
    }
    Ok(())
}

fn same_property(a: &EdgeRecord, b: &EdgeRecord, key: &str) -> bool {
    a.property(key) == b.property(key)
}

fn move_edge(
    tx: &mut Transaction,
    edge: &EdgeRecord,
    source: VertexId,
    target: VertexId,
    collapse: bool,
    report: &mut MergeReport,
) -> ConceptResult<()> {
    if !collapse {
        let moved = tx.graph.create_edge(source, target, &edge.label)?;
        for (key, value) in &edge.properties {
            tx.graph.set_edge_property(moved, key, Some(value.clone()))?;
        }
        report.redirected_edges += 1;
    } else {
        report.collapsed_edges += 1;
    }
    tx.graph.delete_edge(edge.id)?;
    debug!(edge = %edge.id, label = %edge.label, %source, %target, collapse, "dedup.edge.moved");
    Ok(())
}
