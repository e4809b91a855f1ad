//! Element factory: validated vertex/edge handles bound to one transaction

use super::manager::ConceptManager;
use super::schema::{BaseType, EdgeLabel};
use crate::error::{ConceptError, ConceptResult, TransactionError};
use crate::graph::{Direction, EdgeId, EdgeRecord, PropertyValue, VertexId};
use crate::session::TransactionId;

/// A vertex known to exist in the transaction that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexElement {
    pub id: VertexId,
    pub(crate) tx: TransactionId,
}

/// An edge known to exist in the transaction that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeElement {
    pub id: EdgeId,
    pub source: VertexId,
    pub target: VertexId,
    pub(crate) tx: TransactionId,
}

impl ConceptManager {
    /// Wrap a vertex, or `None` if this transaction cannot see it
    pub(crate) fn vertex_element(&self, id: VertexId) -> Option<VertexElement> {
        self.graph.vertex_exists(id).then_some(VertexElement { id, tx: self.tx_id })
    }

    pub(crate) fn edge_element(&self, id: EdgeId) -> Option<EdgeElement> {
        let edge = self.graph.edge(id)?;
        Some(self.wrap_edge(&edge))
    }

    pub(crate) fn wrap_edge(&self, edge: &EdgeRecord) -> EdgeElement {
        EdgeElement {
            id: edge.id,
            source: edge.source,
            target: edge.target,
            tx: self.tx_id,
        }
    }

    pub(crate) fn add_vertex_element(&mut self, base: BaseType) -> VertexElement {
        let id = self.graph.create_vertex(base.marker());
        VertexElement { id, tx: self.tx_id }
    }

    pub(crate) fn add_edge_element(&mut self, from: VertexId, to: VertexId, label: EdgeLabel) -> ConceptResult<EdgeElement> {
        let id = self.graph.create_edge(from, to, label.as_str())?;
        Ok(EdgeElement {
            id,
            source: from,
            target: to,
            tx: self.tx_id,
        })
    }

    /// Create the edge unless one with the same label already links the two vertices
    pub(crate) fn put_edge(&mut self, from: VertexId, to: VertexId, label: EdgeLabel) -> ConceptResult<EdgeId> {
        if let Some(existing) = self.edge_between(from, to, label) {
            return Ok(existing);
        }
        Ok(self.add_edge_element(from, to, label)?.id)
    }

    pub(crate) fn edge_between(&self, from: VertexId, to: VertexId, label: EdgeLabel) -> Option<EdgeId> {
        self.graph
            .edges_of(from, Direction::Out, Some(label.as_str()))
            .into_iter()
            .find(|e| e.target == to)
            .map(|e| e.id)
    }

    pub(crate) fn edges(&self, vertex: VertexId, direction: Direction, label: EdgeLabel) -> Vec<EdgeRecord> {
        self.graph.edges_of(vertex, direction, Some(label.as_str()))
    }

    /// Vertices on the far side of `label` edges
    pub(crate) fn neighbours(&self, vertex: VertexId, direction: Direction, label: EdgeLabel) -> Vec<VertexId> {
        self.edges(vertex, direction, label)
            .into_iter()
            .filter_map(|e| e.other_end(vertex))
            .collect()
    }

    pub(crate) fn marker(&self, vertex: VertexId) -> Option<String> {
        self.graph.vertex_label(vertex)
    }

    pub(crate) fn vertex_prop(&self, vertex: VertexId, key: &str) -> Option<PropertyValue> {
        self.graph.vertex_property(vertex, key)
    }

    pub(crate) fn set_vertex_prop(&mut self, vertex: VertexId, key: &str, value: impl Into<PropertyValue>) -> ConceptResult<()> {
        self.graph.set_vertex_property(vertex, key, Some(value.into()))?;
        Ok(())
    }

    pub(crate) fn clear_vertex_prop(&mut self, vertex: VertexId, key: &str) -> ConceptResult<()> {
        self.graph.set_vertex_property(vertex, key, None)?;
        Ok(())
    }

    pub(crate) fn edge_prop(&self, edge: EdgeId, key: &str) -> Option<PropertyValue> {
        self.graph.edge_property(edge, key)
    }

    pub(crate) fn set_edge_prop(&mut self, edge: EdgeId, key: &str, value: impl Into<PropertyValue>) -> ConceptResult<()> {
        self.graph.set_edge_property(edge, key, Some(value.into()))?;
        Ok(())
    }

    /// Read a vertex property, computing and writing it through when missing.
    ///
    /// Read transactions compute without writing.
    pub(crate) fn persistent_prop(
        &mut self,
        vertex: VertexId,
        key: &str,
        compute: impl FnOnce(&Self) -> ConceptResult<PropertyValue>,
    ) -> ConceptResult<PropertyValue> {
        if let Some(value) = self.vertex_prop(vertex, key) {
            return Ok(value);
        }
        let value = compute(self)?;
        if self.is_writable() {
            self.set_vertex_prop(vertex, key, value.clone())?;
        }
        Ok(value)
    }

    pub(crate) fn check_element_owner(&self, tx: TransactionId, what: impl ToString) -> ConceptResult<()> {
        if tx != self.tx_id {
            return Err(ConceptError::Transaction(TransactionError::ForeignConcept(what.to_string())));
        }
        Ok(())
    }
}
