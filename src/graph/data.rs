//! Committed graph state and the write batches applied to it

use super::element::{Direction, EdgeId, EdgeRecord, PropertyValue, VertexId, VertexRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

type IndexKey = (String, String);

/// An immutable-by-convention snapshot of a keyspace's graph.
///
/// Every vertex property is indexed so that property lookups
/// (labels, label ids, attribute uniqueness indices) never scan.
#[derive(Debug, Clone, Default)]
pub struct GraphData {
    vertices: HashMap<VertexId, VertexRecord>,
    edges: HashMap<EdgeId, EdgeRecord>,
    out_edges: HashMap<VertexId, BTreeSet<EdgeId>>,
    in_edges: HashMap<VertexId, BTreeSet<EdgeId>>,
    index: HashMap<IndexKey, BTreeSet<VertexId>>,
}

/// The writes of one transaction, in a form both the in-memory graph and
/// the persistent store can apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitBatch {
    pub new_vertices: Vec<VertexRecord>,
    pub vertex_properties: Vec<(VertexId, String, Option<PropertyValue>)>,
    pub new_edges: Vec<EdgeRecord>,
    pub edge_properties: Vec<(EdgeId, String, Option<PropertyValue>)>,
    pub removed_edges: Vec<EdgeId>,
    pub removed_vertices: Vec<VertexId>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.new_vertices.is_empty()
            && self.vertex_properties.is_empty()
            && self.new_edges.is_empty()
            && self.edge_properties.is_empty()
            && self.removed_edges.is_empty()
            && self.removed_vertices.is_empty()
    }
}

/// Outcome of applying a batch to a graph
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// The batch as it actually landed (redirected endpoints, cascades, skips)
    pub applied: CommitBatch,
    /// New edges dropped because an endpoint no longer exists
    pub dropped_edges: Vec<EdgeId>,
    /// New edges whose endpoint was rewritten to a merge survivor
    pub redirected_edges: Vec<EdgeId>,
}

fn index_key(key: &str, value: &PropertyValue) -> IndexKey {
    (key.to_string(), value.index_key())
}

impl GraphData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex(&self, id: VertexId) -> Option<&VertexRecord> {
        self.vertices.get(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&EdgeRecord> {
        self.edges.get(&id)
    }

    pub fn contains_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains_key(&id)
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn vertices(&self) -> impl Iterator<Item = &VertexRecord> {
        self.vertices.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.values()
    }

    /// Ids of edges incident to `vertex` in the given direction, ascending
    pub fn edge_ids(&self, vertex: VertexId, direction: Direction) -> Vec<EdgeId> {
        let mut ids: BTreeSet<EdgeId> = BTreeSet::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(out) = self.out_edges.get(&vertex) {
                ids.extend(out.iter().copied());
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(inc) = self.in_edges.get(&vertex) {
                ids.extend(inc.iter().copied());
            }
        }
        ids.into_iter().collect()
    }

    /// Vertices holding `key = value`, ascending by id
    pub fn vertices_with_property(&self, key: &str, value: &PropertyValue) -> Vec<VertexId> {
        self.index
            .get(&index_key(key, value))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Largest vertex or edge id in use, used to seed id allocation
    pub fn max_element_id(&self) -> u64 {
        let v = self.vertices.keys().map(|id| id.as_u64()).max().unwrap_or(0);
        let e = self.edges.keys().map(|id| id.as_u64()).max().unwrap_or(0);
        v.max(e)
    }

    pub fn insert_vertex(&mut self, record: VertexRecord) {
        if let Some(old) = self.vertices.remove(&record.id) {
            self.unindex(&old);
        }
        for (key, value) in &record.properties {
            self.index.entry(index_key(key, value)).or_default().insert(record.id);
        }
        self.vertices.insert(record.id, record);
    }

    /// Remove a vertex and every edge incident to it.
    ///
    /// Returns the ids of the edges removed by the cascade.
    pub fn remove_vertex(&mut self, id: VertexId) -> Option<Vec<EdgeId>> {
        let record = self.vertices.remove(&id)?;
        self.unindex(&record);
        let incident = self.edge_ids(id, Direction::Both);
        for edge in &incident {
            self.remove_edge(*edge);
        }
        self.out_edges.remove(&id);
        self.in_edges.remove(&id);
        Some(incident)
    }

    /// Set or clear a vertex property. Returns false when the vertex is absent.
    pub fn set_vertex_property(&mut self, id: VertexId, key: &str, value: Option<PropertyValue>) -> bool {
        let Some(record) = self.vertices.get_mut(&id) else {
            return false;
        };
        if let Some(old) = record.properties.remove(key) {
            if let Some(set) = self.index.get_mut(&index_key(key, &old)) {
                set.remove(&id);
            }
        }
        if let Some(value) = value {
            self.index.entry(index_key(key, &value)).or_default().insert(id);
            record.properties.insert(key.to_string(), value);
        }
        true
    }

    /// Insert an edge. Returns false when either endpoint is absent.
    pub fn insert_edge(&mut self, record: EdgeRecord) -> bool {
        if !self.vertices.contains_key(&record.source) || !self.vertices.contains_key(&record.target) {
            return false;
        }
        self.out_edges.entry(record.source).or_default().insert(record.id);
        self.in_edges.entry(record.target).or_default().insert(record.id);
        self.edges.insert(record.id, record);
        true
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Option<EdgeRecord> {
        let record = self.edges.remove(&id)?;
        if let Some(out) = self.out_edges.get_mut(&record.source) {
            out.remove(&id);
        }
        if let Some(inc) = self.in_edges.get_mut(&record.target) {
            inc.remove(&id);
        }
        Some(record)
    }

    pub fn set_edge_property(&mut self, id: EdgeId, key: &str, value: Option<PropertyValue>) -> bool {
        let Some(record) = self.edges.get_mut(&id) else {
            return false;
        };
        match value {
            Some(value) => {
                record.properties.insert(key.to_string(), value);
            }
            None => {
                record.properties.remove(key);
            }
        }
        true
    }

    /// Apply a transaction's batch.
    ///
    /// Property writes merge per property, so concurrent writers to different
    /// properties of one vertex both survive. `redirect` maps a vertex that was
    /// merged away to its survivor; new edges pointing at such a vertex are
    /// rewritten, other edges with a missing endpoint are dropped.
    pub fn apply(&mut self, batch: &CommitBatch, redirect: impl Fn(VertexId) -> Option<VertexId>) -> ApplyReport {
        let mut report = ApplyReport::default();

        for id in &batch.removed_edges {
            if self.remove_edge(*id).is_some() {
                report.applied.removed_edges.push(*id);
            }
        }
        for id in &batch.removed_vertices {
            if let Some(cascade) = self.remove_vertex(*id) {
                report.applied.removed_edges.extend(cascade);
                report.applied.removed_vertices.push(*id);
            }
        }
        for record in &batch.new_vertices {
            self.insert_vertex(record.clone());
            report.applied.new_vertices.push(record.clone());
        }
        for (id, key, value) in &batch.vertex_properties {
            if self.set_vertex_property(*id, key, value.clone()) {
                report.applied.vertex_properties.push((*id, key.clone(), value.clone()));
            }
        }

        let resolve = |graph: &GraphData, v: VertexId| -> Option<VertexId> {
            if graph.contains_vertex(v) {
                return Some(v);
            }
            let mut current = v;
            // Merge chains are short; bound the walk anyway.
            for _ in 0..64 {
                current = redirect(current)?;
                if graph.contains_vertex(current) {
                    return Some(current);
                }
            }
            None
        };

        for record in &batch.new_edges {
            let source = resolve(self, record.source);
            let target = resolve(self, record.target);
            match (source, target) {
                (Some(source), Some(target)) => {
                    let mut landed = record.clone();
                    if source != record.source || target != record.target {
                        report.redirected_edges.push(record.id);
                    }
                    landed.source = source;
                    landed.target = target;
                    self.insert_edge(landed.clone());
                    report.applied.new_edges.push(landed);
                }
                _ => report.dropped_edges.push(record.id),
            }
        }
        for (id, key, value) in &batch.edge_properties {
            if self.set_edge_property(*id, key, value.clone()) {
                report.applied.edge_properties.push((*id, key.clone(), value.clone()));
            }
        }

        report
    }

    fn unindex(&mut self, record: &VertexRecord) {
        for (key, value) in &record.properties {
            if let Some(set) = self.index.get_mut(&index_key(key, value)) {
                set.remove(&record.id);
                if set.is_empty() {
                    self.index.remove(&index_key(key, value));
                }
            }
        }
    }
}
