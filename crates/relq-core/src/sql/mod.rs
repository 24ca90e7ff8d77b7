//! The relational expression model built by the compilation pipeline.

pub mod expr;
pub mod select;

pub use expr::{SqlExpr, SqlOrdering};
pub use select::{JoinHandle, ProjectionEntry, SelectExpr, TableExpr};
