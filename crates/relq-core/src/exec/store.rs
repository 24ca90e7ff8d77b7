//! An in-memory row store that interprets select expressions.
//!
//! Rows are kept per table as column-name/value pairs. [`MemoryStore::rows`]
//! walks a select's table list (base tables, pushed-down subqueries, inner
//! and cross joins), applies the predicate, ordering, offset, and limit, and
//! emits one [`ValueBuffer`] per surviving row in projection order.

use std::collections::HashMap;

use relq_model::{QuerySource, Value};

use super::eval::{apply_binary, apply_unary, compare_values, truthy};
use crate::error::Error;
use crate::shaping::ValueBuffer;
use crate::sql::{ProjectionEntry, SelectExpr, SqlExpr, TableExpr};

/// One cell of a combined row during select interpretation.
///
/// Subquery outputs stay addressable both under the source that originally
/// projected them and under the subquery table's own source, because outer
/// selects may reference either after lifting.
#[derive(Debug, Clone)]
struct Cell {
    source: QuerySource,
    alias_source: Option<QuerySource>,
    column: String,
    value: Value,
}

impl Cell {
    fn matches(&self, source: QuerySource, column: &str) -> bool {
        (self.source == source || self.alias_source == Some(source)) && self.column == column
    }
}

type StoredRow = Vec<(String, Value)>;

/// In-memory tables keyed by name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: HashMap<String, Vec<StoredRow>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row to a table, creating the table on first insert.
    pub fn insert(&mut self, table: &str, row: Vec<(&str, Value)>) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(row.into_iter().map(|(c, v)| (c.to_string(), v)).collect());
    }

    /// All rows of a table.
    pub fn table(&self, name: &str) -> Result<&[StoredRow], Error> {
        self.tables
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Interpret a select, producing one value buffer per row.
    pub fn rows(&self, select: &SelectExpr) -> Result<Vec<ValueBuffer>, Error> {
        let mut combos: Vec<Vec<Cell>> = vec![Vec::new()];
        for table in select.tables() {
            combos = self.join_table(combos, table)?;
        }

        if let Some(predicate) = select.predicate() {
            let mut filtered = Vec::with_capacity(combos.len());
            for cells in combos {
                if truthy(&eval_sql(predicate, &cells)?) {
                    filtered.push(cells);
                }
            }
            combos = filtered;
        }

        if !select.order_by().is_empty() {
            let mut keyed = Vec::with_capacity(combos.len());
            for cells in combos {
                let mut keys = Vec::with_capacity(select.order_by().len());
                for ordering in select.order_by() {
                    keys.push(eval_sql(&ordering.expression, &cells)?);
                }
                keyed.push((keys, cells));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for (ordering, (ka, kb)) in select.order_by().iter().zip(a.iter().zip(b)) {
                    let cmp = compare_values(ka, kb).unwrap_or(std::cmp::Ordering::Equal);
                    let cmp = match ordering.direction {
                        relq_model::OrderDirection::Asc => cmp,
                        relq_model::OrderDirection::Desc => cmp.reverse(),
                    };
                    if cmp != std::cmp::Ordering::Equal {
                        return cmp;
                    }
                }
                std::cmp::Ordering::Equal
            });
            combos = keyed.into_iter().map(|(_, cells)| cells).collect();
        }

        if let Some(offset) = select.offset() {
            let offset = (offset as usize).min(combos.len());
            combos.drain(..offset);
        }
        if let Some(limit) = select.limit() {
            combos.truncate(limit as usize);
        }

        let mut buffers = Vec::with_capacity(combos.len());
        for cells in combos {
            let values = if select.has_star_projection() {
                cells.iter().map(|cell| cell.value.clone()).collect()
            } else {
                let mut values = Vec::with_capacity(select.projection_count());
                for entry in select.projection() {
                    values.push(eval_sql(&entry.expression, &cells)?);
                }
                values
            };
            buffers.push(ValueBuffer::new(values));
        }
        Ok(buffers)
    }

    fn join_table(
        &self,
        combos: Vec<Vec<Cell>>,
        table: &TableExpr,
    ) -> Result<Vec<Vec<Cell>>, Error> {
        match table {
            TableExpr::Base { .. } | TableExpr::Subquery { .. } => {
                let rows = self.table_rows(table)?;
                Ok(cross_product(combos, &rows))
            }
            TableExpr::CrossJoin { table } => {
                let rows = self.table_rows(table)?;
                Ok(cross_product(combos, &rows))
            }
            TableExpr::InnerJoin { table, predicate } => {
                let rows = self.table_rows(table)?;
                let mut joined = Vec::new();
                for combo in combos {
                    for row in &rows {
                        let mut merged = combo.clone();
                        merged.extend(row.iter().cloned());
                        let keep = match predicate {
                            Some(predicate) => truthy(&eval_sql(predicate, &merged)?),
                            None => true,
                        };
                        if keep {
                            joined.push(merged);
                        }
                    }
                }
                Ok(joined)
            }
        }
    }

    fn table_rows(&self, table: &TableExpr) -> Result<Vec<Vec<Cell>>, Error> {
        match table {
            TableExpr::Base { table, source, .. } => Ok(self
                .table(table)?
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|(column, value)| Cell {
                            source: *source,
                            alias_source: None,
                            column: column.clone(),
                            value: value.clone(),
                        })
                        .collect()
                })
                .collect()),
            TableExpr::Subquery { select, source, .. } => {
                let columns = output_columns(select);
                let buffers = self.rows(select)?;
                Ok(buffers
                    .into_iter()
                    .map(|buffer| {
                        columns
                            .iter()
                            .enumerate()
                            .map(|(index, (entry_source, column))| Cell {
                                source: *entry_source,
                                alias_source: (entry_source != source).then_some(*source),
                                column: column.clone(),
                                value: buffer.get(index).clone(),
                            })
                            .collect()
                    })
                    .collect())
            }
            TableExpr::InnerJoin { table, .. } | TableExpr::CrossJoin { table } => {
                self.table_rows(table)
            }
        }
    }
}

fn cross_product(combos: Vec<Vec<Cell>>, rows: &[Vec<Cell>]) -> Vec<Vec<Cell>> {
    let mut out = Vec::with_capacity(combos.len() * rows.len());
    for combo in combos {
        for row in rows {
            let mut merged = combo.clone();
            merged.extend(row.iter().cloned());
            out.push(merged);
        }
    }
    out
}

/// The (source, column) pairs a select outputs, in buffer order.
fn output_columns(select: &SelectExpr) -> Vec<(QuerySource, String)> {
    if select.has_star_projection() {
        let mut columns = Vec::new();
        for table in select.tables() {
            collect_table_columns(table, &mut columns);
        }
        return columns;
    }
    select
        .projection()
        .iter()
        .map(|entry: &ProjectionEntry| (entry.source, entry.alias.clone()))
        .collect()
}

fn collect_table_columns(table: &TableExpr, out: &mut Vec<(QuerySource, String)>) {
    match table {
        TableExpr::Subquery { select, .. } => out.extend(output_columns(select)),
        // Base tables under a star projection do not occur: stars are only
        // introduced by pushdown, which wraps a single subquery table.
        TableExpr::Base { .. } => {}
        TableExpr::InnerJoin { table, .. } | TableExpr::CrossJoin { table } => {
            collect_table_columns(table, out)
        }
    }
}

fn eval_sql(expr: &SqlExpr, cells: &[Cell]) -> Result<Value, Error> {
    match expr {
        SqlExpr::Column { source, column, .. } => cells
            .iter()
            .find(|cell| cell.matches(*source, column))
            .map(|cell| Ok(cell.value.clone()))
            .unwrap_or_else(|| {
                // A dangling column reference is a compilation bug, not a
                // data condition.
                panic!("column '{column}' not produced for source {source:?}")
            }),
        SqlExpr::Literal(value) => Ok(value.clone()),
        SqlExpr::Binary { op, left, right } => {
            let left = eval_sql(left, cells)?;
            let right = eval_sql(right, cells)?;
            apply_binary(*op, &left, &right)
        }
        SqlExpr::Unary { op, operand } => {
            let operand = eval_sql(operand, cells)?;
            apply_unary(*op, &operand)
        }
    }
}
