//! Events emitted by write operations
//!
//! The transaction cache is the default sink: it turns the stream into
//! sharding counts, the new-attribute map of the commit log and the set of
//! concepts the validator must look at. Callers can attach an additional
//! sink to observe the same stream.

use super::{ConceptId, Label};
use crate::graph::VertexId;

#[derive(Debug, Clone, PartialEq)]
pub enum ConceptEvent {
    /// A new schema concept took a label
    SchemaConceptCreated { concept: ConceptId, label: Label },
    /// A schema concept's own facts changed (sup, plays, relates, flags, label)
    SchemaConceptModified { concept: ConceptId },
    SchemaConceptDeleted { concept: ConceptId, label: Label },
    LabelChanged { concept: ConceptId, old: Label, new: Label },

    InstanceCreated { type_id: ConceptId, instance: ConceptId },
    InstanceDeleted { type_id: ConceptId, instance: ConceptId },
    AttributeCreated { index: String, attribute: ConceptId },
    AttributeDeleted { index: String, attribute: ConceptId },

    /// An edge-form has/key relation was written
    AttributeLinked { relation: ConceptId, owner: ConceptId, attribute: ConceptId },
    CastingAdded { relation: ConceptId, role: ConceptId, player: ConceptId },
    CastingRemoved { relation: ConceptId, role: ConceptId, player: ConceptId },
    RelationReified { relation: ConceptId, vertex: VertexId },
    ShardCreated { type_id: ConceptId, shard: VertexId },
}

/// Receiver of concept events
pub trait EventSink {
    fn on_event(&mut self, event: &ConceptEvent);
}

/// Sink that records every event, handy for tests and auditing
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<ConceptEvent>,
}

impl EventSink for RecordingSink {
    fn on_event(&mut self, event: &ConceptEvent) {
        self.events.push(event.clone());
    }
}

impl<S: EventSink> EventSink for std::rc::Rc<std::cell::RefCell<S>> {
    fn on_event(&mut self, event: &ConceptEvent) {
        self.borrow_mut().on_event(event);
    }
}
