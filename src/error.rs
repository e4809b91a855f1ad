//! Error types shared across the concept layer

use crate::graph::GraphError;
use crate::storage::StorageError;
use thiserror::Error;

/// A mutation rejected synchronously at the call that violates a contract
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionError {
    #[error("Meta type '{0}' cannot be modified")]
    MetaTypeImmutable(String),

    #[error("Type '{0}' is abstract and cannot have instances")]
    AbstractInstantiation(String),

    #[error("Cannot {attempted} '{attribute}' on '{owner}': it is already attached with {existing}")]
    HasKeyOverlap {
        owner: String,
        attribute: String,
        attempted: &'static str,
        existing: &'static str,
    },

    #[error("Cannot change super of '{concept}' to '{sup}': role '{role}' is still played by its instances")]
    ChangingSuperDisconnectsRole { concept: String, sup: String, role: String },

    #[error("Regex '{regex}' on '{attribute_type}' does not match value '{value}'")]
    RegexViolation {
        attribute_type: String,
        regex: String,
        value: String,
    },

    #[error("Invalid regex '{regex}': {reason}")]
    InvalidRegex { regex: String, reason: String },

    #[error("Label '{0}' uses the reserved implicit prefix")]
    ReservedLabel(String),

    #[error("Label '{label}' is already used by a {existing}")]
    LabelTaken { label: String, existing: String },

    #[error("Attribute type '{label}' has data type {existing}, not {requested}")]
    DataTypeMismatch {
        label: String,
        existing: String,
        requested: String,
    },

    #[error("Setting '{sup}' as super of '{concept}' would create a loop")]
    SupLoop { concept: String, sup: String },

    #[error("Cannot delete '{label}': {reason}")]
    DeletionNotAllowed { label: String, reason: String },

    #[error("Cannot remove '{attribute}' from '{owner}': instances of '{owner}' still own it")]
    IllegalUnhas { owner: String, attribute: String },

    #[error("Type '{owner}' is not allowed to have attribute type '{attribute}'")]
    HasNotAllowed { owner: String, attribute: String },

    #[error("Value {value} is not valid for data type {data_type}")]
    InvalidValue { value: String, data_type: String },

    #[error("{concept} is a {actual}, expected a {expected}")]
    WrongKind {
        concept: String,
        actual: &'static str,
        expected: &'static str,
    },

    #[error("Relation {0} must be reified first")]
    ReificationRequired(String),

    #[error("Concept {0} does not belong to this transaction")]
    ForeignConcept(String),

    #[error("Concept {0} has been deleted")]
    ConceptDeleted(String),

    #[error("Transaction is closed")]
    Closed,

    #[error("Transaction is read only")]
    ReadOnly,
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum ConceptError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Invalid knowledge base:\n{}", errors.join("\n"))]
    InvalidKb { errors: Vec<String> },

    /// Overlapping or unreadable markers seen mid-read; retry the transaction
    #[error("Temporary write failure on {element}: {reason}")]
    TemporaryWrite { element: String, reason: String },

    #[error("Unknown concept: {0}")]
    UnknownConcept(String),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConceptError {
    /// Whether the caller should retry the whole transaction
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TemporaryWrite { .. })
    }

    pub(crate) fn temporary_write(element: impl ToString, reason: impl Into<String>) -> Self {
        Self::TemporaryWrite {
            element: element.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for concept operations
pub type ConceptResult<T> = Result<T, ConceptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_temporary_write_is_retryable() {
        assert!(ConceptError::temporary_write("V1", "overlap").is_retryable());
        assert!(!ConceptError::UnknownConcept("V1".into()).is_retryable());
        assert!(!ConceptError::from(TransactionError::Closed).is_retryable());
    }

    #[test]
    fn invalid_kb_lists_every_violation() {
        let err = ConceptError::InvalidKb {
            errors: vec!["first".into(), "second".into()],
        };
        let message = err.to_string();
        assert!(message.contains("first"));
        assert!(message.contains("second"));
    }
}
