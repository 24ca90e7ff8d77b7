//! Relq query model - provider-agnostic query representation.
//!
//! This crate defines the upstream query model consumed by the relational
//! compilation pipeline in `relq-core`:
//!
//! - [`value`] - Runtime value types for literals, rows, and results
//! - [`source`] - Query-source handles and the arena that issues them
//! - [`expr`] - The generic scalar expression tree
//! - [`query_model`] - Clause-level query structure (from, join, where, ...)
//! - [`include`] - Include specifications for navigation loading
//! - [`annotation`] - Per-source semantic markers attached during parsing
//!
//! The types here are produced by an upstream query parser and consumed
//! read-only by the compiler, with one exception: query annotations are
//! re-keyed when the compiler merges one query source into another.

pub mod annotation;
pub mod expr;
pub mod include;
pub mod query_model;
pub mod source;
pub mod value;

pub use annotation::{AnnotationKind, QueryAnnotation};
pub use expr::{BinaryOp, Expr, UnaryOp};
pub use include::IncludeSpec;
pub use query_model::{
    BodyClause, FromClause, GroupJoinClause, JoinClause, OrderByClause, OrderDirection,
    OrderSpec, QueryModel, ResultOperator, SelectClause, SourceExpr, WhereClause,
};
pub use source::{QuerySource, QuerySourceArena};
pub use value::Value;
