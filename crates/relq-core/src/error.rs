//! Core error types.

use thiserror::Error;

/// Compilation and execution errors.
///
/// Translation failure is deliberately absent here: an untranslatable
/// fragment is not an error, it is a [`crate::compile::Translation`] value
/// that routes the clause to client evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// An entity type named by the query is not in the model.
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    /// A property named by the query does not exist on its entity type.
    #[error("unknown property '{property}' on entity '{entity}'")]
    UnknownProperty {
        /// Entity type name.
        entity: String,
        /// Property name.
        property: String,
    },

    /// A navigation named by an include does not exist on its entity type.
    #[error("unknown navigation '{navigation}' on entity '{entity}'")]
    UnknownNavigation {
        /// Entity type name.
        entity: String,
        /// Navigation name.
        navigation: String,
    },

    /// A query shape the compiler cannot process.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A client-side function the evaluator does not know.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// A client-side evaluation produced a value of the wrong kind.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A table named by a select is not present in the row store.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}
