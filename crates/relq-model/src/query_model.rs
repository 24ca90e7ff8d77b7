//! Clause-level structure of a parsed query.
//!
//! A [`QueryModel`] is the upstream parser's output: one main from clause,
//! body clauses in declaration order, a select clause, and trailing result
//! operators. Nested queries appear as [`SourceExpr::SubQuery`] on from and
//! join clauses and as [`crate::expr::Expr::SubQuery`] inside expressions.

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::source::QuerySource;

/// A parsed query: main from, body clauses, select, result operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryModel {
    /// The clause establishing the primary row source.
    pub main_from: FromClause,
    /// Body clauses in declaration order.
    pub body: Vec<BodyClause>,
    /// The final projection.
    pub select: SelectClause,
    /// Trailing result operators in application order.
    pub result_operators: Vec<ResultOperator>,
}

impl QueryModel {
    /// Create a query over a main from clause, selecting the source itself.
    pub fn new(main_from: FromClause) -> Self {
        let selector = Expr::SourceRef(main_from.source);
        Self {
            main_from,
            body: vec![],
            select: SelectClause { selector },
            result_operators: vec![],
        }
    }

    /// Append a body clause.
    pub fn with_clause(mut self, clause: BodyClause) -> Self {
        self.body.push(clause);
        self
    }

    /// Append a where clause.
    pub fn and_where(self, predicate: Expr) -> Self {
        self.with_clause(BodyClause::Where(WhereClause { predicate }))
    }

    /// Append an order-by clause.
    pub fn order_by(self, orderings: Vec<OrderSpec>) -> Self {
        self.with_clause(BodyClause::OrderBy(OrderByClause { orderings }))
    }

    /// Append a join clause.
    pub fn join(self, join: JoinClause) -> Self {
        self.with_clause(BodyClause::Join(join))
    }

    /// Append an additional from clause.
    pub fn additional_from(self, from: FromClause) -> Self {
        self.with_clause(BodyClause::AdditionalFrom(from))
    }

    /// Replace the select clause.
    pub fn select(mut self, selector: Expr) -> Self {
        self.select = SelectClause { selector };
        self
    }

    /// Append a result operator.
    pub fn with_operator(mut self, op: ResultOperator) -> Self {
        self.result_operators.push(op);
        self
    }

    /// All query sources declared by this query level, in declaration order.
    pub fn declared_sources(&self) -> Vec<QuerySource> {
        let mut sources = vec![self.main_from.source];
        for clause in &self.body {
            match clause {
                BodyClause::AdditionalFrom(from) => sources.push(from.source),
                BodyClause::Join(join) => sources.push(join.source),
                BodyClause::GroupJoin(group_join) => {
                    sources.push(group_join.join.source);
                    sources.push(group_join.group_source);
                }
                BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
            }
        }
        sources
    }

    /// Collect sources referenced by any expression in this query level,
    /// including nested subqueries.
    pub(crate) fn collect_expression_sources(&self, out: &mut Vec<QuerySource>) {
        let mut visit = |expr: &Expr| {
            for source in expr.referenced_sources() {
                if !out.contains(&source) {
                    out.push(source);
                }
            }
        };
        for clause in &self.body {
            match clause {
                BodyClause::Where(w) => visit(&w.predicate),
                BodyClause::OrderBy(o) => {
                    for spec in &o.orderings {
                        visit(&spec.expression);
                    }
                }
                BodyClause::Join(j) => {
                    visit(&j.outer_key);
                    visit(&j.inner_key);
                }
                BodyClause::GroupJoin(g) => {
                    visit(&g.join.outer_key);
                    visit(&g.join.inner_key);
                }
                BodyClause::AdditionalFrom(_) => {}
            }
        }
        visit(&self.select.selector);
    }
}

/// A row-source-establishing clause (main or additional from).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromClause {
    /// The source identity this clause declares.
    pub source: QuerySource,
    /// Where the rows come from.
    pub expression: SourceExpr,
}

impl FromClause {
    /// From an entity set.
    pub fn entity(source: QuerySource, entity: impl Into<String>) -> Self {
        Self {
            source,
            expression: SourceExpr::Entity(entity.into()),
        }
    }

    /// From a nested query.
    pub fn subquery(source: QuerySource, model: QueryModel) -> Self {
        Self {
            source,
            expression: SourceExpr::SubQuery(Box::new(model)),
        }
    }
}

/// The row-producing expression of a from or join clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceExpr {
    /// All rows of a named entity set.
    Entity(String),
    /// The results of a nested query.
    SubQuery(Box<QueryModel>),
}

/// One body clause of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BodyClause {
    /// `from ... from ...` - an additional row source (cross product).
    AdditionalFrom(FromClause),
    /// An equi-join against another row source.
    Join(JoinClause),
    /// A group join: the inner matches are exposed as a group sequence.
    GroupJoin(GroupJoinClause),
    /// A row filter.
    Where(WhereClause),
    /// An ordering clause.
    OrderBy(OrderByClause),
}

/// An equi-join clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    /// The source identity declared for the joined rows.
    pub source: QuerySource,
    /// The inner row source.
    pub inner: SourceExpr,
    /// Key selector over the preceding sources.
    pub outer_key: Expr,
    /// Key selector over the joined source.
    pub inner_key: Expr,
}

/// A group-join clause: joined rows grouped per outer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupJoinClause {
    /// The source identity of the group sequence.
    pub group_source: QuerySource,
    /// The underlying join.
    pub join: JoinClause,
}

/// A row filter clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    /// Boolean predicate over the sources in scope.
    pub predicate: Expr,
}

/// An ordering clause with one or more ordering terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByClause {
    /// Ordering terms in declared order.
    pub orderings: Vec<OrderSpec>,
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// The expression to sort by.
    pub expression: Expr,
    /// Sort direction.
    pub direction: OrderDirection,
}

impl OrderSpec {
    /// An ascending ordering term.
    pub fn asc(expression: Expr) -> Self {
        Self {
            expression,
            direction: OrderDirection::Asc,
        }
    }

    /// A descending ordering term.
    pub fn desc(expression: Expr) -> Self {
        Self {
            expression,
            direction: OrderDirection::Desc,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// The final projection of a query level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectClause {
    /// The selector expression producing each result.
    pub selector: Expr,
}

/// A trailing result operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultOperator {
    /// Keep at most the first `n` results.
    Take(u64),
    /// Skip the first `n` results.
    Skip(u64),
    /// Count the results.
    Count,
    /// Keep only the first result.
    First,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::QuerySourceArena;

    #[test]
    fn test_builder_roundtrip() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");

        let model = QueryModel::new(FromClause::entity(u, "User"))
            .and_where(Expr::eq(Expr::property(u, "active"), Expr::literal(true)))
            .order_by(vec![OrderSpec::asc(Expr::property(u, "name"))])
            .with_operator(ResultOperator::Take(10));

        assert_eq!(model.body.len(), 2);
        assert_eq!(model.result_operators, vec![ResultOperator::Take(10)]);
        assert_eq!(model.select.selector, Expr::SourceRef(u));
    }

    #[test]
    fn test_declared_sources_in_order() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let p = arena.create("p");

        let model = QueryModel::new(FromClause::entity(u, "User")).join(JoinClause {
            source: p,
            inner: SourceExpr::Entity("Post".into()),
            outer_key: Expr::property(u, "id"),
            inner_key: Expr::property(p, "author_id"),
        });

        assert_eq!(model.declared_sources(), vec![u, p]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let model = QueryModel::new(FromClause::entity(u, "User"))
            .select(Expr::property(u, "name"));

        let json = serde_json::to_string(&model).unwrap();
        let back: QueryModel = serde_json::from_str(&json).unwrap();
        assert_eq!(model, back);
    }
}
