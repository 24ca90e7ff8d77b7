//! Relq core - compilation of generic query models into relational queries.
//!
//! The pipeline takes a provider-agnostic query model from `relq-model` and
//! produces a [`shaping::CompiledQuery`]: a relational select plus the
//! shaping and client-side evaluation needed for whatever could not be
//! pushed down.
//!
//! - [`metadata`] - The entity model the compiler resolves names against
//! - [`sql`] - The mutable relational expression model ([`sql::SelectExpr`])
//! - [`compile`] - The compilation pipeline ([`compile::QueryCompiler`])
//! - [`shaping`] - Compiled output: shapers, client ops, row selectors
//! - [`identity`] - The entity identity map and query context
//! - [`exec`] - An interpreting executor over an in-memory row store
//!
//! Push-down is best-effort by design: a clause the translator cannot
//! express relationally becomes a client-side operation on the shaped row
//! stream, never a compilation error.

pub mod compile;
pub mod error;
pub mod exec;
pub mod identity;
pub mod metadata;
pub mod shaping;
pub mod sql;

pub use compile::{CompilationOptions, QueryCompiler};
pub use error::Error;
pub use exec::store::MemoryStore;
pub use exec::QueryExecutor;
pub use identity::{Entity, EntityKey, QueryContext, StateManager};
pub use metadata::{EntityType, Model, NavigationDef, PropertyDef};
pub use shaping::{CompiledQuery, Shaped};
