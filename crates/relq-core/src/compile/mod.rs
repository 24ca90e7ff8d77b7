//! The relational compilation pipeline.
//!
//! [`visitor`] orchestrates the pass over the query model, driving the
//! [`translator`] (push-down attempts), the [`materialization`] pre-pass
//! (projection minimization), the [`include`] reader-offset computation, and
//! the [`predicate`] normalization post-pass. Compilation frames live in
//! [`frames`] for the lifetime of one compile call.

pub mod frames;
pub mod include;
pub mod materialization;
pub mod predicate;
pub mod translator;
pub mod visitor;

use std::collections::HashMap;

use relq_model::{BodyClause, Expr, QueryModel, QuerySource, SourceExpr};

use crate::error::Error;
use crate::metadata::Model;
use crate::sql::SqlExpr;

pub use visitor::QueryCompiler;

/// The outcome of translating one generic expression fragment.
///
/// An untranslatable fragment is not an error: it routes the enclosing
/// clause to client evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    /// The fragment is expressible relationally.
    Translated(SqlExpr),
    /// Some sub-fragment cannot be expressed relationally; the clause must
    /// run client-side.
    ClientEval,
}

/// Compilation knobs.
#[derive(Debug, Clone)]
pub struct CompilationOptions {
    /// Whether materialized entities are tracked when no annotation says
    /// otherwise.
    pub track_by_default: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            track_by_default: true,
        }
    }
}

/// Entity-type bindings for every query source declared anywhere in a query
/// model, including nested subqueries.
///
/// A source binds to an entity type when its row expression is an entity set
/// or a subquery whose selector traces to one. Group sequences and scalar
/// subqueries bind to nothing.
#[derive(Debug, Default, Clone)]
pub struct SourceBindings {
    map: HashMap<QuerySource, String>,
}

impl SourceBindings {
    /// Build bindings for a query model against the entity model.
    ///
    /// Fails when a from clause names an entity type the model does not
    /// know; that is a structurally invalid query, not a translation gap.
    pub fn build(model: &Model, query_model: &QueryModel) -> Result<Self, Error> {
        let mut bindings = Self::default();
        bindings.collect(model, query_model)?;
        Ok(bindings)
    }

    fn collect(&mut self, model: &Model, query_model: &QueryModel) -> Result<(), Error> {
        self.bind_source(model, query_model.main_from.source, &query_model.main_from.expression)?;
        for clause in &query_model.body {
            match clause {
                BodyClause::AdditionalFrom(from) => {
                    self.bind_source(model, from.source, &from.expression)?;
                }
                BodyClause::Join(join) => {
                    self.bind_source(model, join.source, &join.inner)?;
                }
                BodyClause::GroupJoin(group_join) => {
                    self.bind_source(model, group_join.join.source, &group_join.join.inner)?;
                }
                BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
            }
        }
        self.collect_from_expr(model, &query_model.select.selector)?;
        Ok(())
    }

    fn bind_source(
        &mut self,
        model: &Model,
        source: QuerySource,
        expression: &SourceExpr,
    ) -> Result<(), Error> {
        match expression {
            SourceExpr::Entity(name) => {
                model.require_entity(name)?;
                self.map.insert(source, name.clone());
            }
            SourceExpr::SubQuery(nested) => {
                self.collect(model, nested)?;
                if let Some(entity) = self.selector_entity(nested) {
                    self.map.insert(source, entity);
                }
            }
        }
        Ok(())
    }

    fn collect_from_expr(&mut self, model: &Model, expr: &Expr) -> Result<(), Error> {
        match expr {
            Expr::SubQuery(nested) => self.collect(model, nested),
            Expr::Binary { left, right, .. } => {
                self.collect_from_expr(model, left)?;
                self.collect_from_expr(model, right)
            }
            Expr::Unary { operand, .. } => self.collect_from_expr(model, operand),
            Expr::Call { args, .. } => {
                for arg in args {
                    self.collect_from_expr(model, arg)?;
                }
                Ok(())
            }
            Expr::SourceRef(_) | Expr::Property { .. } | Expr::Literal(_) => Ok(()),
        }
    }

    fn selector_entity(&self, query_model: &QueryModel) -> Option<String> {
        match &query_model.select.selector {
            Expr::SourceRef(source) => self.map.get(source).cloned(),
            _ => None,
        }
    }

    /// The entity type a source binds to, if any.
    pub fn entity_of(&self, source: QuerySource) -> Option<&str> {
        self.map.get(&source).map(String::as_str)
    }

    /// Re-key a binding when a source is merged into another.
    pub fn rebind(&mut self, from: QuerySource, to: QuerySource) {
        if let Some(entity) = self.map.remove(&from) {
            self.map.entry(to).or_insert(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityType, PropertyDef};
    use relq_model::{FromClause, QuerySourceArena};

    fn model() -> Model {
        Model::new().with_entity(
            EntityType::new("User", "users")
                .with_property(PropertyDef::new("id", "id"))
                .with_key(vec!["id"]),
        )
    }

    #[test]
    fn test_entity_binding() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"));

        let bindings = SourceBindings::build(&model(), &qm).unwrap();
        assert_eq!(bindings.entity_of(u), Some("User"));
    }

    #[test]
    fn test_subquery_selector_binding_traces_entity() {
        let mut arena = QuerySourceArena::new();
        let inner = arena.create("inner");
        let outer = arena.create("outer");

        let nested = QueryModel::new(FromClause::entity(inner, "User"));
        let qm = QueryModel::new(FromClause::subquery(outer, nested));

        let bindings = SourceBindings::build(&model(), &qm).unwrap();
        assert_eq!(bindings.entity_of(outer), Some("User"));
        assert_eq!(bindings.entity_of(inner), Some("User"));
    }

    #[test]
    fn test_unknown_entity_fails() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "Ghost"));
        assert!(SourceBindings::build(&model(), &qm).is_err());
    }
}
