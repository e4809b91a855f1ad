//! Keyspace: the latest committed graph and the commit pipeline

use crate::concept::{bootstrap_meta_schema, edge_property, vertex_property, BaseType, EdgeLabel, Invalidation, Label, LabelId, MetaSchema};
use crate::config::Config;
use crate::error::{ConceptResult, TransactionError};
use crate::graph::{CommitBatch, Direction, EdgeId, EdgeRecord, GraphData, GraphTx, IdGenerator, PropertyValue, VertexId, VertexRecord};
use crate::storage::GraphStore;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Schema invalidations kept for advancing session caches
const INVALIDATION_LOG_LEN: usize = 128;

#[derive(Clone)]
struct KeyspaceState {
    graph: Arc<GraphData>,
    version: u64,
}

/// Everything a transaction hands over at commit
pub(crate) struct CommitRequest {
    pub batch: CommitBatch,
    /// Labels this transaction introduced, with the vertex carrying each
    pub new_labels: Vec<(Label, VertexId)>,
    /// Types that gained instances; their current shard may need rotating
    pub grown_types: Vec<VertexId>,
    pub invalidation: Option<Invalidation>,
    /// Merged-away vertex -> survivor, recorded by deduplication
    pub redirects: Vec<(VertexId, VertexId)>,
}

/// One named graph with its allocators and committed state
pub struct Keyspace {
    name: String,
    config: Config,
    store: Option<Arc<dyn GraphStore>>,
    state: RwLock<KeyspaceState>,
    commit_lock: Mutex<()>,
    ids: Arc<IdGenerator>,
    label_ids: AtomicU32,
    redirects: DashMap<VertexId, VertexId>,
    invalidations: Mutex<VecDeque<(u64, Invalidation)>>,
}

impl Keyspace {
    /// Load the keyspace from the store (if any), bootstrapping the meta
    /// schema when it has never been written
    pub(crate) fn open(name: &str, config: Config, store: Option<Arc<dyn GraphStore>>) -> ConceptResult<Self> {
        let mut graph = match &store {
            Some(store) => store.load_graph(name)?,
            None => GraphData::new(),
        };
        let ids = Arc::new(IdGenerator::starting_after(graph.max_element_id()));

        let meta_label = PropertyValue::String(MetaSchema::Thing.label().to_string());
        if graph.vertices_with_property(vertex_property::SCHEMA_LABEL, &meta_label).is_empty() {
            let mut tx = GraphTx::new(Arc::new(graph.clone()), ids.clone());
            bootstrap_meta_schema(&mut tx)?;
            let batch = tx.batch();
            graph.apply(&batch, |_| None);
            if let Some(store) = &store {
                store.apply_batch(name, &batch)?;
            }
            info!(keyspace = name, "keyspace.created");
        }

        let max_label_id = graph
            .vertices()
            .filter_map(|v| v.property(vertex_property::LABEL_ID).and_then(PropertyValue::as_long))
            .max()
            .unwrap_or(0)
            .max(MetaSchema::max_label_id() as i64);
        debug!(
            keyspace = name,
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            "keyspace.opened"
        );

        Ok(Self {
            name: name.to_string(),
            config,
            store,
            state: RwLock::new(KeyspaceState {
                graph: Arc::new(graph),
                version: 0,
            }),
            commit_lock: Mutex::new(()),
            ids,
            label_ids: AtomicU32::new(max_label_id as u32 + 1),
            redirects: DashMap::new(),
            invalidations: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current schema version; bumped by every commit that changes the schema
    pub fn schema_version(&self) -> u64 {
        self.state.read().unwrap().version
    }

    /// The latest committed graph
    pub fn graph(&self) -> Arc<GraphData> {
        self.state.read().unwrap().graph.clone()
    }

    pub(crate) fn snapshot(&self) -> (Arc<GraphData>, u64) {
        let state = self.state.read().unwrap();
        (state.graph.clone(), state.version)
    }

    pub(crate) fn id_generator(&self) -> Arc<IdGenerator> {
        self.ids.clone()
    }

    pub(crate) fn next_label_id(&self) -> LabelId {
        LabelId::new(self.label_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// Survivor a merged-away vertex was folded into
    pub fn redirect(&self, v: VertexId) -> Option<VertexId> {
        self.redirects.get(&v).map(|r| *r)
    }

    /// Invalidations committed after `from` up to and including `to`, or
    /// `None` when the log no longer reaches back that far
    pub(crate) fn invalidations_between(&self, from: u64, to: u64) -> Option<Vec<Invalidation>> {
        let log = self.invalidations.lock().unwrap();
        let wanted: Vec<Invalidation> = log
            .iter()
            .filter(|(version, _)| *version > from && *version <= to)
            .map(|(_, invalidation)| invalidation.clone())
            .collect();
        (wanted.len() as u64 == to - from).then_some(wanted)
    }

    /// Apply a validated transaction to the latest committed graph
    pub(crate) fn commit(&self, request: CommitRequest) -> ConceptResult<u64> {
        let _guard = self.commit_lock.lock().unwrap();
        let (latest, version) = self.snapshot();

        let mut graph = (*latest).clone();
        let late = late_edges(&latest, &request);
        let report = graph.apply(&request.batch, |v| self.redirect(v));

        // A label introduced here must still name exactly one concept once
        // everything committed since the snapshot is taken into account
        for (label, mine) in &request.new_labels {
            let key = PropertyValue::String(label.to_string());
            let taken = graph
                .vertices_with_property(vertex_property::SCHEMA_LABEL, &key)
                .into_iter()
                .find(|v| v != mine);
            if let Some(other) = taken {
                let existing = graph
                    .vertex(other)
                    .and_then(|v| BaseType::from_marker(&v.label))
                    .and_then(|base| base.concept_kind())
                    .map_or("concept", |kind| kind.name());
                return Err(TransactionError::LabelTaken {
                    label: label.to_string(),
                    existing: existing.to_string(),
                }
                .into());
            }
        }

        for edge in &report.dropped_edges {
            warn!(keyspace = %self.name, %edge, "tx.commit.edge_dropped");
        }
        if !report.redirected_edges.is_empty() {
            debug!(keyspace = %self.name, count = report.redirected_edges.len(), "tx.commit.edges_redirected");
        }
        let mut applied = report.applied;
        if !late.is_empty() {
            self.fold_late_edges(&mut graph, &mut applied, late, &request.redirects);
        }
        for type_vertex in request.grown_types {
            if let Some(rotation) = self.rotate_shard(&mut graph, type_vertex) {
                applied.new_vertices.extend(rotation.new_vertices);
                applied.vertex_properties.extend(rotation.vertex_properties);
                applied.new_edges.extend(rotation.new_edges);
            }
        }

        if let Some(store) = &self.store {
            store.apply_batch(&self.name, &applied)?;
        }
        for (from, to) in request.redirects {
            self.redirects.insert(from, to);
        }

        let version = match request.invalidation {
            Some(invalidation) => {
                let next = version + 1;
                let mut log = self.invalidations.lock().unwrap();
                log.push_back((next, invalidation));
                while log.len() > INVALIDATION_LOG_LEN {
                    log.pop_front();
                }
                next
            }
            None => version,
        };
        *self.state.write().unwrap() = KeyspaceState {
            graph: Arc::new(graph),
            version,
        };
        Ok(version)
    }

    /// Re-home edges that reached a merged-away vertex after the merging
    /// transaction took its snapshot. Each lands on the survivor unless the
    /// survivor already has an equivalent edge.
    fn fold_late_edges(
        &self,
        graph: &mut GraphData,
        applied: &mut CommitBatch,
        late: Vec<EdgeRecord>,
        redirects: &[(VertexId, VertexId)],
    ) {
        let survivor_of = |v: VertexId| redirects.iter().find(|(from, _)| *from == v).map(|(_, to)| *to);
        for edge in late {
            let source = survivor_of(edge.source).unwrap_or(edge.source);
            let target = survivor_of(edge.target).unwrap_or(edge.target);
            if !graph.contains_vertex(source) || !graph.contains_vertex(target) {
                warn!(keyspace = %self.name, edge = %edge.id, "tx.commit.late_edge_dropped");
                continue;
            }
            let equivalent = graph.edge_ids(source, Direction::Out).into_iter().any(|id| {
                graph
                    .edge(id)
                    .is_some_and(|e| e.target == target && e.label == edge.label && same_identity(e, &edge))
            });
            if equivalent {
                debug!(keyspace = %self.name, edge = %edge.id, "tx.commit.late_edge_collapsed");
                continue;
            }
            let mut moved = EdgeRecord::new(EdgeId::new(self.ids.next_id()), edge.label.clone(), source, target);
            moved.properties = edge.properties.clone();
            debug!(keyspace = %self.name, from = %edge.id, to = %moved.id, "tx.commit.late_edge_moved");
            graph.insert_edge(moved.clone());
            applied.new_edges.push(moved);
        }
    }

    /// Start a new shard once the type's current one has reached the threshold
    fn rotate_shard(&self, graph: &mut GraphData, type_vertex: VertexId) -> Option<CommitBatch> {
        let current = graph
            .vertex(type_vertex)?
            .property(vertex_property::CURRENT_SHARD)?
            .as_long()
            .map(|raw| VertexId::new(raw as u64))?;
        let size = graph
            .edge_ids(current, Direction::In)
            .into_iter()
            .filter(|e| graph.edge(*e).is_some_and(|e| e.label == EdgeLabel::Isa.as_str()))
            .count() as u64;
        if size < self.config.sharding_threshold {
            return None;
        }

        let shard = VertexRecord::new(VertexId::new(self.ids.next_id()), BaseType::Shard.marker());
        let edge = EdgeRecord::new(
            EdgeId::new(self.ids.next_id()),
            EdgeLabel::Shard.as_str(),
            shard.id,
            type_vertex,
        );
        let batch = CommitBatch {
            vertex_properties: vec![(
                type_vertex,
                vertex_property::CURRENT_SHARD.to_string(),
                Some(PropertyValue::Long(shard.id.as_u64() as i64)),
            )],
            new_vertices: vec![shard],
            new_edges: vec![edge],
            ..Default::default()
        };
        graph.apply(&batch, |_| None);
        info!(keyspace = %self.name, %type_vertex, %current, size, "shard.rotated");
        Some(batch)
    }
}

/// Edges on the latest graph touching a vertex this commit merges away,
/// which the merging transaction never saw and so did not remove
fn late_edges(latest: &GraphData, request: &CommitRequest) -> Vec<EdgeRecord> {
    if request.redirects.is_empty() {
        return Vec::new();
    }
    let seen: HashSet<EdgeId> = request.batch.removed_edges.iter().copied().collect();
    let mut late = Vec::new();
    for (from, _) in &request.redirects {
        for id in latest.edge_ids(*from, Direction::Both) {
            if seen.contains(&id) {
                continue;
            }
            if let Some(edge) = latest.edge(id) {
                late.push(edge.clone());
            }
        }
    }
    late
}

/// Edges of one label are interchangeable when they carry the same role or
/// relation type
fn same_identity(a: &EdgeRecord, b: &EdgeRecord) -> bool {
    [edge_property::ROLE_LABEL_ID, edge_property::RELATION_TYPE_LABEL_ID]
        .iter()
        .all(|key| a.property(key) == b.property(key))
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyspace")
            .field("name", &self.name)
            .field("version", &self.schema_version())
            .finish_non_exhaustive()
    }
}
