//! Per-transaction view of the graph: a committed snapshot plus private writes
//!
//! This is the storage adapter the concept layer talks to. Reads see the
//! snapshot taken when the transaction opened overlaid with the
//! transaction's own writes; nothing becomes visible to anyone else until
//! the collected [`CommitBatch`] is applied by the keyspace.

use super::data::{CommitBatch, GraphData};
use super::element::{Direction, EdgeId, EdgeRecord, PropertyValue, VertexId, VertexRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the graph adapter
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Vertex not found: {0}")]
    VertexNotFound(VertexId),

    #[error("Edge not found: {0}")]
    EdgeNotFound(EdgeId),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Allocates vertex and edge ids for one keyspace.
///
/// Vertices and edges share one id space, so ids increase monotonically
/// in creation order regardless of element kind.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Start allocating after `last_used`
    pub fn starting_after(last_used: u64) -> Self {
        Self {
            next: AtomicU64::new(last_used + 1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

type PropertyDelta = BTreeMap<String, Option<PropertyValue>>;

/// Snapshot + overlay graph handle owned by one transaction
#[derive(Debug)]
pub struct GraphTx {
    snapshot: Arc<GraphData>,
    ids: Arc<IdGenerator>,
    new_vertices: HashMap<VertexId, VertexRecord>,
    new_edges: HashMap<EdgeId, EdgeRecord>,
    removed_vertices: HashSet<VertexId>,
    removed_edges: HashSet<EdgeId>,
    vertex_props: HashMap<VertexId, PropertyDelta>,
    edge_props: HashMap<EdgeId, PropertyDelta>,
    added_out: HashMap<VertexId, BTreeSet<EdgeId>>,
    added_in: HashMap<VertexId, BTreeSet<EdgeId>>,
    added_index: HashMap<(String, String), BTreeSet<VertexId>>,
}

impl GraphTx {
    pub fn new(snapshot: Arc<GraphData>, ids: Arc<IdGenerator>) -> Self {
        Self {
            snapshot,
            ids,
            new_vertices: HashMap::new(),
            new_edges: HashMap::new(),
            removed_vertices: HashSet::new(),
            removed_edges: HashSet::new(),
            vertex_props: HashMap::new(),
            edge_props: HashMap::new(),
            added_out: HashMap::new(),
            added_in: HashMap::new(),
            added_index: HashMap::new(),
        }
    }

    /// True once this transaction has written anything
    pub fn is_modified(&self) -> bool {
        !(self.new_vertices.is_empty()
            && self.new_edges.is_empty()
            && self.removed_vertices.is_empty()
            && self.removed_edges.is_empty()
            && self.vertex_props.is_empty()
            && self.edge_props.is_empty())
    }

    // === Reads ===

    pub fn vertex_exists(&self, id: VertexId) -> bool {
        if self.removed_vertices.contains(&id) {
            return false;
        }
        self.new_vertices.contains_key(&id) || self.snapshot.contains_vertex(id)
    }

    pub fn edge_exists(&self, id: EdgeId) -> bool {
        if self.removed_edges.contains(&id) {
            return false;
        }
        self.new_edges.contains_key(&id) || self.snapshot.edge(id).is_some()
    }

    /// The vertex as this transaction sees it
    pub fn vertex(&self, id: VertexId) -> Option<VertexRecord> {
        if self.removed_vertices.contains(&id) {
            return None;
        }
        if let Some(record) = self.new_vertices.get(&id) {
            return Some(record.clone());
        }
        let mut record = self.snapshot.vertex(id)?.clone();
        if let Some(delta) = self.vertex_props.get(&id) {
            apply_delta(&mut record.properties, delta);
        }
        Some(record)
    }

    pub fn vertex_label(&self, id: VertexId) -> Option<String> {
        if self.removed_vertices.contains(&id) {
            return None;
        }
        if let Some(record) = self.new_vertices.get(&id) {
            return Some(record.label.clone());
        }
        self.snapshot.vertex(id).map(|v| v.label.clone())
    }

    pub fn vertex_property(&self, id: VertexId, key: &str) -> Option<PropertyValue> {
        if self.removed_vertices.contains(&id) {
            return None;
        }
        if let Some(record) = self.new_vertices.get(&id) {
            return record.properties.get(key).cloned();
        }
        if let Some(change) = self.vertex_props.get(&id).and_then(|delta| delta.get(key)) {
            return change.clone();
        }
        self.snapshot.vertex(id)?.properties.get(key).cloned()
    }

    pub fn edge(&self, id: EdgeId) -> Option<EdgeRecord> {
        if self.removed_edges.contains(&id) {
            return None;
        }
        if let Some(record) = self.new_edges.get(&id) {
            return Some(record.clone());
        }
        let mut record = self.snapshot.edge(id)?.clone();
        if let Some(delta) = self.edge_props.get(&id) {
            apply_delta(&mut record.properties, delta);
        }
        Some(record)
    }

    pub fn edge_property(&self, id: EdgeId, key: &str) -> Option<PropertyValue> {
        self.edge(id).and_then(|e| e.properties.get(key).cloned())
    }

    /// Edges incident to `vertex`, optionally filtered by label, ascending by id
    pub fn edges_of(&self, vertex: VertexId, direction: Direction, label: Option<&str>) -> Vec<EdgeRecord> {
        if !self.vertex_exists(vertex) {
            return Vec::new();
        }
        let mut ids: BTreeSet<EdgeId> = self.snapshot.edge_ids(vertex, direction).into_iter().collect();
        if matches!(direction, Direction::Out | Direction::Both) {
            if let Some(out) = self.added_out.get(&vertex) {
                ids.extend(out.iter().copied());
            }
        }
        if matches!(direction, Direction::In | Direction::Both) {
            if let Some(inc) = self.added_in.get(&vertex) {
                ids.extend(inc.iter().copied());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.edge(id))
            .filter(|e| label.map_or(true, |l| e.label == l))
            .collect()
    }

    /// Vertices holding `key = value`, ascending by id
    pub fn vertices_by_property(&self, key: &str, value: &PropertyValue) -> Vec<VertexId> {
        let mut candidates: BTreeSet<VertexId> =
            self.snapshot.vertices_with_property(key, value).into_iter().collect();
        if let Some(added) = self.added_index.get(&(key.to_string(), value.index_key())) {
            candidates.extend(added.iter().copied());
        }
        candidates
            .into_iter()
            .filter(|id| self.vertex_property(*id, key).as_ref() == Some(value))
            .collect()
    }

    /// The lowest-id vertex holding `key = value`
    pub fn vertex_by_property(&self, key: &str, value: &PropertyValue) -> Option<VertexId> {
        self.vertices_by_property(key, value).into_iter().next()
    }

    // === Writes ===

    pub fn create_vertex(&mut self, label: &str) -> VertexId {
        let id = VertexId::new(self.ids.next_id());
        self.new_vertices.insert(id, VertexRecord::new(id, label));
        id
    }

    pub fn create_edge(&mut self, source: VertexId, target: VertexId, label: &str) -> GraphResult<EdgeId> {
        if !self.vertex_exists(source) {
            return Err(GraphError::VertexNotFound(source));
        }
        if !self.vertex_exists(target) {
            return Err(GraphError::VertexNotFound(target));
        }
        let id = EdgeId::new(self.ids.next_id());
        self.new_edges.insert(id, EdgeRecord::new(id, label, source, target));
        self.added_out.entry(source).or_default().insert(id);
        self.added_in.entry(target).or_default().insert(id);
        Ok(id)
    }

    pub fn set_vertex_property(&mut self, id: VertexId, key: &str, value: Option<PropertyValue>) -> GraphResult<()> {
        if !self.vertex_exists(id) {
            return Err(GraphError::VertexNotFound(id));
        }
        if let Some(value) = &value {
            self.added_index
                .entry((key.to_string(), value.index_key()))
                .or_default()
                .insert(id);
        }
        if let Some(record) = self.new_vertices.get_mut(&id) {
            match value {
                Some(value) => record.properties.insert(key.to_string(), value),
                None => record.properties.remove(key),
            };
        } else {
            self.vertex_props.entry(id).or_default().insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn set_edge_property(&mut self, id: EdgeId, key: &str, value: Option<PropertyValue>) -> GraphResult<()> {
        if !self.edge_exists(id) {
            return Err(GraphError::EdgeNotFound(id));
        }
        if let Some(record) = self.new_edges.get_mut(&id) {
            match value {
                Some(value) => record.properties.insert(key.to_string(), value),
                None => record.properties.remove(key),
            };
        } else {
            self.edge_props.entry(id).or_default().insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn delete_edge(&mut self, id: EdgeId) -> GraphResult<()> {
        if !self.edge_exists(id) {
            return Err(GraphError::EdgeNotFound(id));
        }
        if let Some(record) = self.new_edges.remove(&id) {
            if let Some(out) = self.added_out.get_mut(&record.source) {
                out.remove(&id);
            }
            if let Some(inc) = self.added_in.get_mut(&record.target) {
                inc.remove(&id);
            }
        } else {
            self.edge_props.remove(&id);
            self.removed_edges.insert(id);
        }
        Ok(())
    }

    /// Delete a vertex together with every edge incident to it
    pub fn delete_vertex(&mut self, id: VertexId) -> GraphResult<()> {
        if !self.vertex_exists(id) {
            return Err(GraphError::VertexNotFound(id));
        }
        for edge in self.edges_of(id, Direction::Both, None) {
            self.delete_edge(edge.id)?;
        }
        if self.new_vertices.remove(&id).is_none() {
            self.vertex_props.remove(&id);
            self.removed_vertices.insert(id);
        }
        Ok(())
    }

    /// Collect this transaction's writes into a batch
    pub fn batch(&self) -> CommitBatch {
        let mut new_vertices: Vec<VertexRecord> = self.new_vertices.values().cloned().collect();
        new_vertices.sort_by_key(|v| v.id);
        let mut new_edges: Vec<EdgeRecord> = self.new_edges.values().cloned().collect();
        new_edges.sort_by_key(|e| e.id);

        let mut vertex_properties = Vec::new();
        let mut touched: Vec<&VertexId> = self.vertex_props.keys().collect();
        touched.sort();
        for id in touched {
            for (key, value) in &self.vertex_props[id] {
                vertex_properties.push((*id, key.clone(), value.clone()));
            }
        }
        let mut edge_properties = Vec::new();
        let mut touched: Vec<&EdgeId> = self.edge_props.keys().collect();
        touched.sort();
        for id in touched {
            for (key, value) in &self.edge_props[id] {
                edge_properties.push((*id, key.clone(), value.clone()));
            }
        }

        let mut removed_edges: Vec<EdgeId> = self.removed_edges.iter().copied().collect();
        removed_edges.sort();
        let mut removed_vertices: Vec<VertexId> = self.removed_vertices.iter().copied().collect();
        removed_vertices.sort();

        CommitBatch {
            new_vertices,
            vertex_properties,
            new_edges,
            edge_properties,
            removed_edges,
            removed_vertices,
        }
    }

    /// Ids of vertices created by this transaction, ascending
    pub fn created_vertices(&self) -> Vec<VertexId> {
        let mut ids: Vec<VertexId> = self.new_vertices.keys().copied().collect();
        ids.sort();
        ids
    }
}

fn apply_delta(properties: &mut super::element::Properties, delta: &PropertyDelta) {
    for (key, value) in delta {
        match value {
            Some(value) => {
                properties.insert(key.clone(), value.clone());
            }
            None => {
                properties.remove(key);
            }
        }
    }
}
