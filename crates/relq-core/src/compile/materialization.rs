//! The requires-materialization pre-pass.
//!
//! Decides, per query source, whether results must be materialized as
//! entities or can stay raw value buffers. Each entity-typed reference to a
//! source votes up; each reference that is immediately consumed as a column
//! extraction votes back down; a subquery selector that does not trace to
//! the enclosing query's result votes down once more. A source materializes
//! only when the tally stays positive.

use std::collections::{HashMap, HashSet};

use relq_model::{BodyClause, Expr, QueryModel, QuerySource, SourceExpr};

use super::SourceBindings;
use crate::metadata::Model;

/// Compute the set of query sources whose results must be materialized.
pub fn find_sources_requiring_materialization(
    model: &Model,
    bindings: &SourceBindings,
    query_model: &QueryModel,
) -> HashSet<QuerySource> {
    let mut visitor = MaterializationVisitor {
        model,
        bindings,
        counters: HashMap::new(),
    };
    visitor.visit_level(query_model);
    visitor
        .counters
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(source, _)| source)
        .collect()
}

struct MaterializationVisitor<'a> {
    model: &'a Model,
    bindings: &'a SourceBindings,
    counters: HashMap<QuerySource, i64>,
}

impl MaterializationVisitor<'_> {
    fn visit_level(&mut self, query_model: &QueryModel) {
        let selector = &query_model.select.selector;
        self.visit_source_expr(
            query_model.main_from.source,
            &query_model.main_from.expression,
            selector,
        );
        for clause in &query_model.body {
            match clause {
                BodyClause::AdditionalFrom(from) => {
                    self.visit_source_expr(from.source, &from.expression, selector);
                }
                BodyClause::Join(join) => {
                    self.visit_source_expr(join.source, &join.inner, selector);
                    self.visit_expr(&join.outer_key);
                    self.visit_expr(&join.inner_key);
                }
                BodyClause::GroupJoin(group_join) => {
                    self.visit_source_expr(
                        group_join.join.source,
                        &group_join.join.inner,
                        selector,
                    );
                    self.visit_expr(&group_join.join.outer_key);
                    self.visit_expr(&group_join.join.inner_key);
                }
                BodyClause::Where(clause) => self.visit_expr(&clause.predicate),
                BodyClause::OrderBy(clause) => {
                    for spec in &clause.orderings {
                        self.visit_expr(&spec.expression);
                    }
                }
            }
        }
        self.visit_expr(selector);
    }

    fn visit_source_expr(
        &mut self,
        declared: QuerySource,
        expression: &SourceExpr,
        enclosing_selector: &Expr,
    ) {
        if let SourceExpr::SubQuery(nested) = expression {
            // The nested selector traces to the enclosing result only when
            // the enclosing query selects the declared source as a whole.
            let traced =
                matches!(enclosing_selector, Expr::SourceRef(s) if *s == declared);
            self.visit_subquery(nested, traced);
        }
    }

    fn visit_subquery(&mut self, nested: &QueryModel, traced: bool) {
        self.visit_level(nested);
        if !traced {
            if let Expr::SourceRef(inner) = &nested.select.selector {
                *self.counters.entry(*inner).or_insert(0) -= 1;
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::SourceRef(source) => {
                let entry = self.counters.entry(*source).or_insert(0);
                if self.bindings.entity_of(*source).is_some() {
                    *entry += 1;
                }
            }
            Expr::Property { source, name } => {
                let known = self
                    .bindings
                    .entity_of(*source)
                    .and_then(|entity| self.model.entity(entity))
                    .map(|entity| entity.property(name).is_some());
                let entry = self.counters.entry(*source).or_insert(0);
                match known {
                    // A mapped column extraction consumes the reference.
                    Some(true) | None => {}
                    // An unmapped member needs the entity client-side.
                    Some(false) => *entry += 1,
                }
            }
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            Expr::Unary { operand, .. } => self.visit_expr(operand),
            Expr::Call { args, .. } => {
                for arg in args {
                    self.visit_expr(arg);
                }
            }
            Expr::SubQuery(nested) => self.visit_subquery(nested, false),
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
                .with_property(PropertyDef::new("name", "name"))
                .with_key(vec!["id"]),
        )
    }

    fn analyze(qm: &QueryModel) -> HashSet<QuerySource> {
        let model = model();
        let bindings = SourceBindings::build(&model, qm).unwrap();
        find_sources_requiring_materialization(&model, &bindings, qm)
    }

    #[test]
    fn test_column_selector_needs_no_materialization() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"))
            .and_where(Expr::eq(Expr::property(u, "name"), Expr::literal("a")))
            .select(Expr::property(u, "name"));

        assert!(analyze(&qm).is_empty());
    }

    #[test]
    fn test_entity_selector_requires_materialization() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"));

        assert_eq!(analyze(&qm), HashSet::from([u]));
    }

    #[test]
    fn test_untraced_subquery_selector_votes_down() {
        let mut arena = QuerySourceArena::new();
        let inner = arena.create("inner");
        let outer = arena.create("outer");

        let nested = QueryModel::new(FromClause::entity(inner, "User"));
        let qm = QueryModel::new(FromClause::subquery(outer, nested))
            .select(Expr::property(outer, "name"));

        // Neither level needs entities: the outer consumes one column and
        // the nested selector does not reach the final result.
        assert!(analyze(&qm).is_empty());
    }

    #[test]
    fn test_traced_subquery_selector_keeps_materialization() {
        let mut arena = QuerySourceArena::new();
        let inner = arena.create("inner");
        let outer = arena.create("outer");

        let nested = QueryModel::new(FromClause::entity(inner, "User"));
        let qm = QueryModel::new(FromClause::subquery(outer, nested));

        let result = analyze(&qm);
        assert!(result.contains(&inner));
        assert!(result.contains(&outer));
    }

    #[test]
    fn test_unmapped_member_forces_materialization() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"))
            .select(Expr::property(u, "display_label"));

        assert_eq!(analyze(&qm), HashSet::from([u]));
    }
}
