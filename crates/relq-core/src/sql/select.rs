//! The mutable `SELECT` expression model.
//!
//! One [`SelectExpr`] exists per query source being compiled. The
//! orchestrating visitor mutates it clause by clause: projections grow (and
//! are speculatively rolled back), predicates are conjoined, orderings are
//! prepended, and whole selects are pushed down as subquery tables when they
//! must be merged into an outer select.
//!
//! Projection order is load-bearing: materialization captures positional
//! offsets, so projections are only ever appended or truncated from the end,
//! never reordered.

use serde::{Deserialize, Serialize};

use relq_model::QuerySource;

use super::expr::{SqlExpr, SqlOrdering};

/// One projection entry: an expression plus its output alias.
///
/// Entries are de-duplicated by (property, source) identity, not by column
/// name: the same column projected for two different sources occupies two
/// distinct slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionEntry {
    /// The source this entry was bound for.
    pub source: QuerySource,
    /// The property this entry was bound from.
    pub property: String,
    /// The projected expression.
    pub expression: SqlExpr,
    /// Output alias.
    pub alias: String,
}

impl ProjectionEntry {
    /// A column projection for a (property, source) pair.
    pub fn column(
        source: QuerySource,
        property: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        let property = property.into();
        let column = column.into();
        Self {
            source,
            property: property.clone(),
            expression: SqlExpr::column(source, property, column.clone()),
            alias: column,
        }
    }
}

/// A table in a select's `FROM` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableExpr {
    /// A base table.
    Base {
        /// Table name.
        table: String,
        /// Alias in this select.
        alias: String,
        /// The query source the table produces rows for.
        source: QuerySource,
    },
    /// A pushed-down subquery used as a table.
    Subquery {
        /// The wrapped select.
        select: Box<SelectExpr>,
        /// Alias in this select.
        alias: String,
        /// The query source the subquery produces rows for.
        source: QuerySource,
    },
    /// An inner join of another table.
    InnerJoin {
        /// The joined table.
        table: Box<TableExpr>,
        /// The join predicate, set after the join is appended.
        predicate: Option<SqlExpr>,
    },
    /// A cross join of another table.
    CrossJoin {
        /// The joined table.
        table: Box<TableExpr>,
    },
}

impl TableExpr {
    /// The query source this table produces rows for.
    pub fn source(&self) -> QuerySource {
        match self {
            TableExpr::Base { source, .. } | TableExpr::Subquery { source, .. } => *source,
            TableExpr::InnerJoin { table, .. } | TableExpr::CrossJoin { table } => table.source(),
        }
    }
}

/// Handle to a join table appended to a select, used to set its predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinHandle(usize);

/// The mutable intermediate representation of one `SELECT` statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectExpr {
    query_source: Option<QuerySource>,
    tables: Vec<TableExpr>,
    star_projection: bool,
    projection: Vec<ProjectionEntry>,
    predicate: Option<SqlExpr>,
    order_by: Vec<SqlOrdering>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SelectExpr {
    /// Create an empty select owned by a query source.
    pub fn new(query_source: Option<QuerySource>) -> Self {
        Self {
            query_source,
            ..Default::default()
        }
    }

    /// Create a select over a single base table.
    pub fn from_table(
        table: impl Into<String>,
        alias: impl Into<String>,
        source: QuerySource,
    ) -> Self {
        let mut select = Self::new(Some(source));
        select.tables.push(TableExpr::Base {
            table: table.into(),
            alias: alias.into(),
            source,
        });
        select
    }

    /// The query source this select was created for.
    pub fn query_source(&self) -> Option<QuerySource> {
        self.query_source
    }

    /// Reattach this select to a query source (used after pushdown).
    pub fn set_query_source(&mut self, source: QuerySource) {
        self.query_source = Some(source);
    }

    /// The tables in the `FROM` list.
    pub fn tables(&self) -> &[TableExpr] {
        &self.tables
    }

    /// True when the select reads from exactly one table.
    pub fn is_single_table(&self) -> bool {
        self.tables.len() == 1
    }

    /// Take the single table out of this select.
    ///
    /// Panics when the select does not have exactly one table; callers must
    /// check [`Self::is_single_table`] before merging.
    pub fn take_single_table(&mut self) -> TableExpr {
        assert!(
            self.tables.len() == 1,
            "select must have exactly one table to be merged"
        );
        self.tables.pop().expect("table checked above")
    }

    /// Whether this select projects all columns implicitly.
    pub fn has_star_projection(&self) -> bool {
        self.star_projection
    }

    /// The explicit projection list.
    pub fn projection(&self) -> &[ProjectionEntry] {
        &self.projection
    }

    /// Number of explicit projection entries.
    pub fn projection_count(&self) -> usize {
        self.projection.len()
    }

    /// Add a column projection for a (property, source) pair, returning its
    /// stable zero-based index.
    ///
    /// Adding the same pair twice returns the original index; the entry is
    /// not duplicated. Distinct sources projecting the same column name get
    /// distinct slots.
    pub fn add_to_projection(
        &mut self,
        column: impl Into<String>,
        property: impl Into<String>,
        source: QuerySource,
    ) -> usize {
        if self.star_projection {
            self.explode_star_projection();
        }
        let property = property.into();
        if let Some(index) = self.get_projection_index(&property, source) {
            return index;
        }
        self.projection
            .push(ProjectionEntry::column(source, property, column.into()));
        self.projection.len() - 1
    }

    /// Look up the projection index for a (property, source) pair.
    pub fn get_projection_index(&self, property: &str, source: QuerySource) -> Option<usize> {
        self.projection
            .iter()
            .position(|entry| entry.source == source && entry.property == property)
    }

    /// Truncate projections added since a checkpoint.
    ///
    /// Used to undo speculative projection growth when a join predicate
    /// fails to translate.
    pub fn remove_range_from_projection(&mut self, from: usize) {
        self.projection.truncate(from);
    }

    /// Append an inner-joined table plus its projection entries, returning a
    /// handle on which the join predicate can subsequently be set.
    pub fn add_inner_join(
        &mut self,
        table: TableExpr,
        projection: Vec<ProjectionEntry>,
    ) -> JoinHandle {
        self.tables.push(TableExpr::InnerJoin {
            table: Box::new(table),
            predicate: None,
        });
        self.projection.extend(projection);
        JoinHandle(self.tables.len() - 1)
    }

    /// Append a cross-joined table plus its projection entries.
    pub fn add_cross_join(&mut self, table: TableExpr, projection: Vec<ProjectionEntry>) {
        self.tables.push(TableExpr::CrossJoin {
            table: Box::new(table),
        });
        self.projection.extend(projection);
    }

    /// Set the predicate of a previously appended join.
    pub fn set_join_predicate(&mut self, handle: JoinHandle, predicate: SqlExpr) {
        match &mut self.tables[handle.0] {
            TableExpr::InnerJoin {
                predicate: slot, ..
            } => *slot = Some(predicate),
            _ => panic!("join handle does not address an inner join"),
        }
    }

    /// The select's predicate.
    pub fn predicate(&self) -> Option<&SqlExpr> {
        self.predicate.as_ref()
    }

    /// Replace the select's predicate.
    pub fn set_predicate(&mut self, predicate: Option<SqlExpr>) {
        self.predicate = predicate;
    }

    /// Conjoin a predicate onto the select.
    ///
    /// The first predicate is stored bare; subsequent ones are `AND`ed.
    pub fn and_predicate(&mut self, predicate: SqlExpr) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => SqlExpr::and_also(existing, predicate),
            None => predicate,
        });
    }

    /// The `ORDER BY` list.
    pub fn order_by(&self) -> &[SqlOrdering] {
        &self.order_by
    }

    /// Prepend ordering terms, making them the primary sort keys.
    ///
    /// Each order-by clause visited later in the query takes precedence over
    /// earlier ones, so clauses prepend rather than append.
    pub fn prepend_to_order_by(&mut self, orderings: Vec<SqlOrdering>) {
        let mut combined = orderings;
        combined.append(&mut self.order_by);
        self.order_by = combined;
    }

    /// The row limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Set the row limit.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    /// The row offset, if any.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Set the row offset.
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = Some(offset);
    }

    /// True when this select cannot be merged into an outer select without
    /// first being pushed down as a subquery.
    pub fn requires_push_down(&self) -> bool {
        !self.order_by.is_empty() || self.limit.is_some() || self.offset.is_some()
    }

    /// Wrap the entire current select as a single subquery table inside a
    /// brand-new outer select, in place.
    ///
    /// The ordering, limit, and predicate all stay on the inner select; the
    /// outer select starts with an implicit star projection so positional
    /// offsets into the inner projection are preserved.
    pub fn push_down_subquery(&mut self) {
        let source = self.query_source;
        let inner = std::mem::take(self);
        self.query_source = source;
        self.star_projection = true;
        self.tables.push(TableExpr::Subquery {
            select: Box::new(inner),
            alias: "t".to_string(),
            source: source.expect("pushed-down select must be bound to a query source"),
        });
    }

    /// Expand an implicit star projection into explicit column entries.
    ///
    /// Required before this select becomes the inner side of an operation
    /// that must address specific column offsets. Entries are copied in the
    /// wrapped select's projection order, so offsets are unchanged.
    pub fn explode_star_projection(&mut self) {
        if !self.star_projection {
            return;
        }
        self.star_projection = false;
        let mut exploded = Vec::new();
        for table in &mut self.tables {
            if let TableExpr::Subquery { select, .. } = table {
                if select.has_star_projection() {
                    select.explode_star_projection();
                }
                for entry in select.projection() {
                    exploded.push(ProjectionEntry {
                        source: entry.source,
                        property: entry.property.clone(),
                        expression: SqlExpr::column(
                            entry.source,
                            entry.property.clone(),
                            entry.alias.clone(),
                        ),
                        alias: entry.alias.clone(),
                    });
                }
            }
        }
        self.projection = exploded;
    }

    /// Re-key every reference to a query source, recursively.
    ///
    /// Used when a lifted subquery select is re-attached to the outer query
    /// source: tables, projection entries, predicates, and orderings all
    /// adopt the outer source, so later bindings against it dedup onto the
    /// existing slots and column references resolve uniformly.
    pub fn rebind_query_source(&mut self, from: QuerySource, to: QuerySource) {
        if self.query_source == Some(from) {
            self.query_source = Some(to);
        }
        for table in &mut self.tables {
            Self::rebind_table(table, from, to);
        }
        for entry in &mut self.projection {
            if entry.source == from {
                entry.source = to;
            }
            Self::rebind_expr(&mut entry.expression, from, to);
        }
        if let Some(predicate) = &mut self.predicate {
            Self::rebind_expr(predicate, from, to);
        }
        for ordering in &mut self.order_by {
            Self::rebind_expr(&mut ordering.expression, from, to);
        }
    }

    fn rebind_table(table: &mut TableExpr, from: QuerySource, to: QuerySource) {
        match table {
            TableExpr::Base { source, .. } => {
                if *source == from {
                    *source = to;
                }
            }
            TableExpr::Subquery { select, source, .. } => {
                if *source == from {
                    *source = to;
                }
                select.rebind_query_source(from, to);
            }
            TableExpr::InnerJoin { table, predicate } => {
                Self::rebind_table(table, from, to);
                if let Some(predicate) = predicate {
                    Self::rebind_expr(predicate, from, to);
                }
            }
            TableExpr::CrossJoin { table } => Self::rebind_table(table, from, to),
        }
    }

    fn rebind_expr(expr: &mut SqlExpr, from: QuerySource, to: QuerySource) {
        match expr {
            SqlExpr::Column { source, .. } => {
                if *source == from {
                    *source = to;
                }
            }
            SqlExpr::Literal(_) => {}
            SqlExpr::Binary { left, right, .. } => {
                Self::rebind_expr(left, from, to);
                Self::rebind_expr(right, from, to);
            }
            SqlExpr::Unary { operand, .. } => Self::rebind_expr(operand, from, to),
        }
    }

    /// Make a column readable at this level.
    ///
    /// A base table exposes all of its columns, but a pushed-down subquery
    /// exposes only what it projects; referencing a column of a source whose
    /// rows flow through a subquery requires projecting it on the inner
    /// select, at every nesting level.
    pub fn ensure_column_available(&mut self, source: QuerySource, property: &str, column: &str) {
        for table in &mut self.tables {
            Self::table_ensure_column(table, source, property, column);
        }
    }

    fn table_ensure_column(
        table: &mut TableExpr,
        source: QuerySource,
        property: &str,
        column: &str,
    ) {
        match table {
            TableExpr::Base { .. } => {}
            TableExpr::Subquery { select, .. } => {
                if select.handles_query_source(source) {
                    select.ensure_column_available(source, property, column);
                    select.add_to_projection(column, property, source);
                }
            }
            TableExpr::InnerJoin { table, .. } | TableExpr::CrossJoin { table } => {
                Self::table_ensure_column(table, source, property, column)
            }
        }
    }

    /// Apply a rewrite to this select's predicate, its join predicates, and
    /// every nested subquery select, bottom-up.
    pub fn rewrite_predicates(&mut self, rewrite: &mut impl FnMut(SqlExpr) -> SqlExpr) {
        for table in &mut self.tables {
            Self::rewrite_table(table, rewrite);
        }
        if let Some(predicate) = self.predicate.take() {
            self.predicate = Some(rewrite(predicate));
        }
    }

    fn rewrite_table(table: &mut TableExpr, rewrite: &mut impl FnMut(SqlExpr) -> SqlExpr) {
        match table {
            TableExpr::Base { .. } => {}
            TableExpr::Subquery { select, .. } => select.rewrite_predicates(rewrite),
            TableExpr::InnerJoin { table, predicate } => {
                Self::rewrite_table(table, rewrite);
                if let Some(p) = predicate.take() {
                    *predicate = Some(rewrite(p));
                }
            }
            TableExpr::CrossJoin { table } => Self::rewrite_table(table, rewrite),
        }
    }

    /// True when this select produces rows for the given query source,
    /// either directly or through one of its tables.
    pub fn handles_query_source(&self, source: QuerySource) -> bool {
        if self.query_source == Some(source) {
            return true;
        }
        self.tables.iter().any(|t| Self::table_handles(t, source))
    }

    fn table_handles(table: &TableExpr, source: QuerySource) -> bool {
        match table {
            TableExpr::Base { source: s, .. } => *s == source,
            TableExpr::Subquery {
                select, source: s, ..
            } => *s == source || select.handles_query_source(source),
            TableExpr::InnerJoin { table, .. } | TableExpr::CrossJoin { table } => {
                Self::table_handles(table, source)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relq_model::{BinaryOp, QuerySourceArena};

    fn sources(n: usize) -> (QuerySourceArena, Vec<QuerySource>) {
        let mut arena = QuerySourceArena::new();
        let list = (0..n).map(|i| arena.create(format!("s{i}"))).collect();
        (arena, list)
    }

    #[test]
    fn test_projection_index_stability() {
        let (_arena, s) = sources(2);
        let mut select = SelectExpr::from_table("users", "u", s[0]);

        let a = select.add_to_projection("id", "id", s[0]);
        let b = select.add_to_projection("name", "name", s[0]);
        // Same column name, different source: distinct slot.
        let c = select.add_to_projection("id", "id", s[1]);

        assert_eq!((a, b, c), (0, 1, 2));
        // Re-adding returns the existing index without duplicating.
        assert_eq!(select.add_to_projection("name", "name", s[0]), 1);
        assert_eq!(select.projection_count(), 3);
        assert_eq!(select.get_projection_index("id", s[1]), Some(2));
        assert_eq!(select.get_projection_index("missing", s[0]), None);
    }

    #[test]
    fn test_remove_range_rolls_back_speculative_growth() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        select.add_to_projection("id", "id", s[0]);

        let checkpoint = select.projection_count();
        select.add_to_projection("name", "name", s[0]);
        select.add_to_projection("email", "email", s[0]);
        select.remove_range_from_projection(checkpoint);

        assert_eq!(select.projection_count(), checkpoint);
        assert_eq!(select.get_projection_index("name", s[0]), None);
    }

    #[test]
    fn test_and_predicate_conjoins() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);

        let first = SqlExpr::binary(
            BinaryOp::Eq,
            SqlExpr::column(s[0], "active", "active"),
            SqlExpr::Literal(true.into()),
        );
        select.and_predicate(first.clone());
        assert_eq!(select.predicate(), Some(&first));

        let second = SqlExpr::binary(
            BinaryOp::Gt,
            SqlExpr::column(s[0], "age", "age"),
            SqlExpr::Literal(30i64.into()),
        );
        select.and_predicate(second.clone());
        assert_eq!(
            select.predicate(),
            Some(&SqlExpr::and_also(first, second))
        );
    }

    #[test]
    fn test_prepend_to_order_by() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);

        let a = SqlOrdering::new(
            SqlExpr::column(s[0], "a", "a"),
            relq_model::OrderDirection::Asc,
        );
        let b = SqlOrdering::new(
            SqlExpr::column(s[0], "b", "b"),
            relq_model::OrderDirection::Desc,
        );
        select.prepend_to_order_by(vec![a.clone()]);
        select.prepend_to_order_by(vec![b.clone()]);

        assert_eq!(select.order_by(), &[b, a]);
    }

    #[test]
    fn test_push_down_keeps_ordering_inside() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        select.add_to_projection("id", "id", s[0]);
        select.set_limit(5);
        select.prepend_to_order_by(vec![SqlOrdering::new(
            SqlExpr::column(s[0], "id", "id"),
            relq_model::OrderDirection::Asc,
        )]);

        assert!(select.requires_push_down());
        select.push_down_subquery();

        assert!(select.has_star_projection());
        assert!(select.limit().is_none());
        assert!(select.order_by().is_empty());
        assert!(select.is_single_table());
        match &select.tables()[0] {
            TableExpr::Subquery { select: inner, .. } => {
                assert_eq!(inner.limit(), Some(5));
                assert_eq!(inner.order_by().len(), 1);
            }
            other => panic!("expected subquery table, got {other:?}"),
        }
        assert!(select.handles_query_source(s[0]));
    }

    #[test]
    fn test_explode_star_projection_preserves_offsets() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        select.add_to_projection("id", "id", s[0]);
        select.add_to_projection("name", "name", s[0]);

        select.push_down_subquery();
        select.explode_star_projection();

        assert_eq!(select.get_projection_index("id", s[0]), Some(0));
        assert_eq!(select.get_projection_index("name", s[0]), Some(1));
    }

    #[test]
    fn test_double_push_down_nests_one_level_each_time() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        select.add_to_projection("id", "id", s[0]);

        select.push_down_subquery();
        select.push_down_subquery();
        select.explode_star_projection();

        // Two wraps deep, offsets unchanged.
        assert_eq!(select.get_projection_index("id", s[0]), Some(0));
        match &select.tables()[0] {
            TableExpr::Subquery { select: mid, .. } => match &mid.tables()[0] {
                TableExpr::Subquery { select: inner, .. } => {
                    assert!(matches!(inner.tables()[0], TableExpr::Base { .. }));
                }
                other => panic!("expected nested subquery, got {other:?}"),
            },
            other => panic!("expected subquery table, got {other:?}"),
        }
    }

    #[test]
    fn test_join_handle_sets_predicate() {
        let (_arena, s) = sources(2);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        let handle = select.add_inner_join(
            TableExpr::Base {
                table: "posts".into(),
                alias: "p".into(),
                source: s[1],
            },
            vec![ProjectionEntry::column(s[1], "id", "id")],
        );

        let predicate = SqlExpr::binary(
            BinaryOp::Eq,
            SqlExpr::column(s[0], "id", "id"),
            SqlExpr::column(s[1], "author_id", "author_id"),
        );
        select.set_join_predicate(handle, predicate.clone());

        match &select.tables()[1] {
            TableExpr::InnerJoin {
                predicate: Some(p), ..
            } => assert_eq!(p, &predicate),
            other => panic!("expected inner join with predicate, got {other:?}"),
        }
        assert!(select.handles_query_source(s[1]));
    }

    #[test]
    fn test_rebind_query_source_rewrites_recursively() {
        let (_arena, s) = sources(2);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        select.add_to_projection("id", "id", s[0]);
        select.and_predicate(SqlExpr::binary(
            BinaryOp::Gt,
            SqlExpr::column(s[0], "age", "age"),
            SqlExpr::Literal(10i64.into()),
        ));
        select.set_limit(1);
        select.push_down_subquery();

        select.rebind_query_source(s[0], s[1]);

        assert_eq!(select.query_source(), Some(s[1]));
        assert!(select.handles_query_source(s[1]));
        assert!(!select.handles_query_source(s[0]));
        match &select.tables()[0] {
            TableExpr::Subquery { select: inner, .. } => {
                assert_eq!(inner.get_projection_index("id", s[1]), Some(0));
                match inner.predicate() {
                    Some(SqlExpr::Binary { left, .. }) => match left.as_ref() {
                        SqlExpr::Column { source, .. } => assert_eq!(*source, s[1]),
                        other => panic!("expected column, got {other:?}"),
                    },
                    other => panic!("expected binary predicate, got {other:?}"),
                }
            }
            other => panic!("expected subquery table, got {other:?}"),
        }
    }

    #[test]
    fn test_ensure_column_available_projects_through_subquery() {
        let (_arena, s) = sources(1);
        let mut select = SelectExpr::from_table("users", "u", s[0]);
        select.set_limit(3);
        select.push_down_subquery();
        select.explode_star_projection();
        // The inner select projects nothing yet.
        assert_eq!(select.projection_count(), 0);

        select.ensure_column_available(s[0], "name", "name");

        match &select.tables()[0] {
            TableExpr::Subquery { select: inner, .. } => {
                assert_eq!(inner.get_projection_index("name", s[0]), Some(0));
            }
            other => panic!("expected subquery table, got {other:?}"),
        }
        // Idempotent: a second call does not duplicate the slot.
        select.ensure_column_available(s[0], "name", "name");
        match &select.tables()[0] {
            TableExpr::Subquery { select: inner, .. } => {
                assert_eq!(inner.projection_count(), 1);
            }
            other => panic!("expected subquery table, got {other:?}"),
        }
    }
}
