//! Property-graph substrate the concept layer is mapped onto

mod data;
mod element;
mod tx;

pub use data::{ApplyReport, CommitBatch, GraphData};
pub use element::{Direction, EdgeId, EdgeRecord, Properties, PropertyValue, VertexId, VertexRecord};
pub use tx::{GraphError, GraphResult, GraphTx, IdGenerator};
