//! Execution of compiled queries.
//!
//! [`QueryExecutor`] interprets a [`CompiledQuery`] against a
//! [`store::MemoryStore`]: raw rows come from the row store (or a nested
//! compiled query), each row is shaped into a per-source scope, the
//! client-side operation list runs in clause order, and the row selector
//! extracts the final shaped result. Entity materialization funnels through
//! the query context's identity map.

pub mod eval;
pub mod store;

use std::sync::Arc;

use tracing::debug;

use relq_model::{OrderDirection, Value};

use crate::error::Error;
use crate::identity::{Entity, EntityKey, QueryContext};
use crate::metadata::{EntityType, Model};
use crate::shaping::{
    BufferView, ClientOp, CompiledQuery, EntityShaper, IncludeShaper, RowSelector, RowSource,
    Scope, SecondarySource, Shaped, Shaper, Terminal, ValueBuffer,
};
use eval::{compare_values, eval_bool, eval_expr, values_equal};
use store::MemoryStore;

/// One in-flight result row: the raw buffer (when rows came from a select)
/// plus the shaped scope.
struct Row {
    buffer: Option<ValueBuffer>,
    scope: Scope,
}

/// Interprets compiled queries against an in-memory row store.
pub struct QueryExecutor<'a> {
    model: &'a Model,
    store: &'a MemoryStore,
    ctx: QueryContext,
}

impl<'a> QueryExecutor<'a> {
    /// Create an executor over a model, store, and query context.
    pub fn new(model: &'a Model, store: &'a MemoryStore, ctx: QueryContext) -> Self {
        Self { model, store, ctx }
    }

    /// Execute a compiled query, producing one shaped result per row.
    pub fn execute(&self, query: &CompiledQuery) -> Result<Vec<Shaped>, Error> {
        let mut rows = self.produce_rows(&query.source)?;
        for op in &query.ops {
            rows = self.apply_op(rows, op)?;
        }

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(self.select_row(&query.selector, row)?);
        }

        match query.terminal {
            Some(Terminal::Count) => Ok(vec![Shaped::Value(Value::Int64(results.len() as i64))]),
            Some(Terminal::First) => {
                results.truncate(1);
                Ok(results)
            }
            None => Ok(results),
        }
    }

    fn produce_rows(&self, source: &RowSource) -> Result<Vec<Row>, Error> {
        match source {
            RowSource::Select { select, shaper } => {
                let buffers = self.store.rows(select)?;
                debug!(rows = buffers.len(), "row store produced rows");
                let mut rows = Vec::with_capacity(buffers.len());
                for buffer in buffers {
                    let mut scope = Scope::new();
                    self.shape(shaper, &buffer, &mut scope)?;
                    rows.push(Row {
                        buffer: Some(buffer),
                        scope,
                    });
                }
                Ok(rows)
            }
            RowSource::Nested { source, query } => {
                let shaped = self.execute(query)?;
                Ok(shaped
                    .into_iter()
                    .map(|item| {
                        let mut scope = Scope::new();
                        scope.insert(*source, item);
                        Row {
                            buffer: None,
                            scope,
                        }
                    })
                    .collect())
            }
        }
    }

    fn shape(&self, shaper: &Shaper, buffer: &ValueBuffer, scope: &mut Scope) -> Result<(), Error> {
        match shaper {
            Shaper::Buffer(b) => {
                scope.insert(
                    b.source,
                    Shaped::Buffer(BufferView {
                        buffer: buffer.with_offset(b.offset),
                        columns: Arc::new(b.columns.clone()),
                    }),
                );
                Ok(())
            }
            Shaper::Entity(e) => {
                let entity = self.materialize_entity(e, buffer)?;
                scope.insert(e.source, Shaped::Entity(entity));
                Ok(())
            }
            Shaper::Pair { outer, inner } => {
                self.shape(outer, buffer, scope)?;
                self.shape(inner, buffer, scope)
            }
        }
    }

    fn materialize_entity(
        &self,
        shaper: &EntityShaper,
        buffer: &ValueBuffer,
    ) -> Result<Arc<Entity>, Error> {
        let view = buffer.with_offset(shaper.offset);
        let key_values: Vec<Value> = shaper
            .key_indices
            .iter()
            .map(|index| view.get(*index).clone())
            .collect();
        let key = EntityKey::new(shaper.entity.clone(), key_values);
        let entity = self.ctx.get_entity(
            key,
            || {
                let fields = shaper
                    .properties
                    .iter()
                    .map(|(name, index)| (name.clone(), view.get(*index).clone()))
                    .collect();
                Entity::new(
                    shaper.entity.clone(),
                    EntityKey::new(
                        shaper.entity.clone(),
                        shaper
                            .key_indices
                            .iter()
                            .map(|index| view.get(*index).clone())
                            .collect(),
                    ),
                    fields,
                )
            },
            shaper.tracking,
        );
        for include in &shaper.includes {
            self.attach_navigations(&entity, &include.steps, include)?;
        }
        Ok(entity)
    }

    fn attach_navigations(
        &self,
        owner: &Arc<Entity>,
        steps: &[crate::shaping::NavigationStep],
        include: &IncludeShaper,
    ) -> Result<(), Error> {
        let Some((step, rest)) = steps.split_first() else {
            return Ok(());
        };
        let target = self.model.require_entity(&step.target)?;
        if step.collection {
            let fk_column = column_of(target, &step.foreign_key)?;
            // A single foreign-key column can only point back at a
            // single-column owner key.
            let owner_key = match owner.key.values.as_slice() {
                [value] => value.clone(),
                _ => {
                    return Err(Error::InvalidQuery(format!(
                        "entity '{}' needs a single-column key to load collection \
                         navigation '{}'",
                        owner.entity_type, step.navigation
                    )))
                }
            };
            for row in self.store.table(&target.table)? {
                let matches = row
                    .iter()
                    .any(|(column, value)| column == &fk_column && values_equal(value, &owner_key));
                if matches {
                    let related = self.materialize_row(target, row, include.tracking)?;
                    owner.attach_collection_item(&step.navigation, Arc::clone(&related));
                    self.attach_navigations(&related, rest, include)?;
                }
            }
        } else {
            let fk_value = match owner.get(&step.foreign_key) {
                Some(value) if !value.is_null() => value.clone(),
                _ => return Ok(()),
            };
            let key_column = target
                .key
                .first()
                .and_then(|name| target.property(name))
                .map(|p| p.column.clone())
                .ok_or_else(|| Error::InvalidQuery(format!(
                    "entity '{}' has no single-column key to navigate to",
                    target.name
                )))?;
            let found = self.store.table(&target.table)?.iter().find(|row| {
                row.iter()
                    .any(|(column, value)| column == &key_column && values_equal(value, &fk_value))
            });
            if let Some(row) = found {
                let related = self.materialize_row(target, row, include.tracking)?;
                owner.attach_reference(&step.navigation, Arc::clone(&related));
                self.attach_navigations(&related, rest, include)?;
            }
        }
        Ok(())
    }

    fn materialize_row(
        &self,
        entity_type: &EntityType,
        row: &[(String, Value)],
        track: bool,
    ) -> Result<Arc<Entity>, Error> {
        let mut fields = Vec::with_capacity(entity_type.properties.len());
        for property in &entity_type.properties {
            let value = row
                .iter()
                .find(|(column, _)| column == &property.column)
                .map(|(_, value)| value.clone())
                .unwrap_or(Value::Null);
            fields.push((property.name.clone(), value));
        }
        let key_values: Vec<Value> = entity_type
            .key_positions()
            .into_iter()
            .map(|position| fields[position].1.clone())
            .collect();
        let key = EntityKey::new(entity_type.name.clone(), key_values);
        Ok(self.ctx.get_entity(
            key.clone(),
            || Entity::new(entity_type.name.clone(), key, fields),
            track,
        ))
    }

    fn apply_op(&self, rows: Vec<Row>, op: &ClientOp) -> Result<Vec<Row>, Error> {
        match op {
            ClientOp::Filter(predicate) => {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if eval_bool(predicate, &row.scope)? {
                        kept.push(row);
                    }
                }
                Ok(kept)
            }
            ClientOp::OrderBy(specs) => {
                let mut keyed = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut keys = Vec::with_capacity(specs.len());
                    for spec in specs {
                        keys.push(eval_expr(&spec.expression, &row.scope)?);
                    }
                    keyed.push((keys, row));
                }
                keyed.sort_by(|(a, _), (b, _)| {
                    for (spec, (ka, kb)) in specs.iter().zip(a.iter().zip(b)) {
                        let cmp = compare_values(ka, kb).unwrap_or(std::cmp::Ordering::Equal);
                        let cmp = match spec.direction {
                            OrderDirection::Asc => cmp,
                            OrderDirection::Desc => cmp.reverse(),
                        };
                        if cmp != std::cmp::Ordering::Equal {
                            return cmp;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                Ok(keyed.into_iter().map(|(_, row)| row).collect())
            }
            ClientOp::CrossJoin(secondary) => {
                let inner = self.execute_secondary(secondary)?;
                let mut joined = Vec::with_capacity(rows.len() * inner.len());
                for row in rows {
                    for item in &inner {
                        let mut scope = row.scope.clone();
                        scope.insert(secondary.source, item.clone());
                        joined.push(Row {
                            buffer: row.buffer.clone(),
                            scope,
                        });
                    }
                }
                Ok(joined)
            }
            ClientOp::NestedLoopJoin {
                secondary,
                outer_key,
                inner_key,
            } => {
                let inner = self.execute_secondary(secondary)?;
                let inner_keys = self.secondary_keys(secondary, &inner, inner_key)?;
                let mut joined = Vec::new();
                for row in rows {
                    let outer_value = eval_expr(outer_key, &row.scope)?;
                    for (item, inner_value) in inner.iter().zip(&inner_keys) {
                        if values_equal(&outer_value, inner_value) {
                            let mut scope = row.scope.clone();
                            scope.insert(secondary.source, item.clone());
                            joined.push(Row {
                                buffer: row.buffer.clone(),
                                scope,
                            });
                        }
                    }
                }
                Ok(joined)
            }
            ClientOp::GroupJoin {
                group_source,
                secondary,
                outer_key,
                inner_key,
            } => {
                let inner = self.execute_secondary(secondary)?;
                let inner_keys = self.secondary_keys(secondary, &inner, inner_key)?;
                let mut grouped = Vec::with_capacity(rows.len());
                for mut row in rows {
                    let outer_value = eval_expr(outer_key, &row.scope)?;
                    let group: Vec<Shaped> = inner
                        .iter()
                        .zip(&inner_keys)
                        .filter(|(_, inner_value)| values_equal(&outer_value, inner_value))
                        .map(|(item, _)| item.clone())
                        .collect();
                    row.scope.insert(*group_source, Shaped::Sequence(group));
                    grouped.push(row);
                }
                Ok(grouped)
            }
            ClientOp::Skip(n) => {
                let skip = (*n as usize).min(rows.len());
                Ok(rows.into_iter().skip(skip).collect())
            }
            ClientOp::Take(n) => Ok(rows.into_iter().take(*n as usize).collect()),
        }
    }

    fn execute_secondary(&self, secondary: &SecondarySource) -> Result<Vec<Shaped>, Error> {
        self.execute(&secondary.query)
    }

    /// Key values for each secondary result, evaluated with the result
    /// exposed under the secondary's source.
    fn secondary_keys(
        &self,
        secondary: &SecondarySource,
        items: &[Shaped],
        inner_key: &relq_model::Expr,
    ) -> Result<Vec<Value>, Error> {
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            let mut scope = Scope::new();
            scope.insert(secondary.source, item.clone());
            keys.push(eval_expr(inner_key, &scope)?);
        }
        Ok(keys)
    }

    fn select_row(&self, selector: &RowSelector, row: &Row) -> Result<Shaped, Error> {
        match selector {
            RowSelector::Source(source) => {
                row.scope
                    .get(*source)
                    .cloned()
                    .ok_or_else(|| Error::InvalidQuery(format!(
                        "selected source {source:?} is not in scope"
                    )))
            }
            RowSelector::Column(index) => match &row.buffer {
                Some(buffer) => Ok(Shaped::Value(buffer.get(*index).clone())),
                None => Err(Error::InvalidQuery(
                    "column selection requires a relational row".to_string(),
                )),
            },
            RowSelector::Client(expr) => Ok(Shaped::Value(eval_expr(expr, &row.scope)?)),
        }
    }
}

fn column_of(entity: &EntityType, property: &str) -> Result<String, Error> {
    entity
        .property(property)
        .map(|p| p.column.clone())
        .ok_or_else(|| Error::UnknownProperty {
            entity: entity.name.clone(),
            property: property.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaping::{BufferShaper, NavigationStep};
    use crate::sql::SelectExpr;
    use relq_model::{Expr, QuerySource, QuerySourceArena};

    fn users_model() -> Model {
        Model::new()
            .with_entity(
                crate::metadata::EntityType::new("User", "users")
                    .with_property(crate::metadata::PropertyDef::new("id", "id"))
                    .with_property(crate::metadata::PropertyDef::new("name", "name"))
                    .with_key(vec!["id"])
                    .with_navigation(crate::metadata::NavigationDef::collection(
                        "orders",
                        "Order",
                        "user_id",
                    )),
            )
            .with_entity(
                crate::metadata::EntityType::new("Order", "orders")
                    .with_property(crate::metadata::PropertyDef::new("id", "id"))
                    .with_property(crate::metadata::PropertyDef::new("user_id", "user_id"))
                    .with_property(crate::metadata::PropertyDef::new("total", "total"))
                    .with_key(vec!["id"]),
            )
    }

    fn users_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.insert("users", vec![("id", Value::Int64(1)), ("name", "ada".into())]);
        store.insert("users", vec![("id", Value::Int64(2)), ("name", "bob".into())]);
        store.insert(
            "orders",
            vec![
                ("id", Value::Int64(10)),
                ("user_id", Value::Int64(1)),
                ("total", Value::Int64(250)),
            ],
        );
        store.insert(
            "orders",
            vec![
                ("id", Value::Int64(11)),
                ("user_id", Value::Int64(1)),
                ("total", Value::Int64(80)),
            ],
        );
        store
    }

    fn entity_query(source: QuerySource, tracking: bool) -> CompiledQuery {
        let mut select = SelectExpr::from_table("users", "u", source);
        select.add_to_projection("id", "id", source);
        select.add_to_projection("name", "name", source);
        CompiledQuery {
            source: RowSource::Select {
                select,
                shaper: Shaper::Entity(EntityShaper {
                    source,
                    entity: "User".into(),
                    offset: 0,
                    key_indices: vec![0],
                    properties: vec![("id".into(), 0), ("name".into(), 1)],
                    tracking,
                    includes: vec![],
                }),
            },
            ops: vec![],
            selector: RowSelector::Source(source),
            terminal: None,
        }
    }

    #[test]
    fn test_tracked_entities_share_identity_across_queries() {
        let model = users_model();
        let store = users_store();
        let ctx = QueryContext::standalone();
        let executor = QueryExecutor::new(&model, &store, ctx);
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");

        let query = entity_query(u, true);
        let first = executor.execute(&query).unwrap();
        let second = executor.execute(&query).unwrap();

        match (&first[0], &second[0]) {
            (Shaped::Entity(a), Shaped::Entity(b)) => assert!(Arc::ptr_eq(a, b)),
            other => panic!("expected entities, got {other:?}"),
        }
    }

    #[test]
    fn test_client_filter_over_buffer_rows() {
        let model = users_model();
        let store = users_store();
        let executor = QueryExecutor::new(&model, &store, QueryContext::standalone());
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");

        let mut select = SelectExpr::from_table("users", "u", u);
        select.add_to_projection("name", "name", u);
        let query = CompiledQuery {
            source: RowSource::Select {
                select,
                shaper: Shaper::Buffer(BufferShaper {
                    source: u,
                    offset: 0,
                    columns: vec![("name".into(), 0)],
                }),
            },
            ops: vec![ClientOp::Filter(Expr::eq(
                Expr::call("length", vec![Expr::property(u, "name")]),
                Expr::literal(3i64),
            ))],
            selector: RowSelector::Client(Expr::call(
                "upper",
                vec![Expr::property(u, "name")],
            )),
            terminal: None,
        };

        let results = executor.execute(&query).unwrap();
        let names: Vec<&Value> = results
            .iter()
            .map(|shaped| match shaped {
                Shaped::Value(value) => value,
                other => panic!("expected value, got {other:?}"),
            })
            .collect();
        assert_eq!(names, vec![&Value::from("ADA"), &Value::from("BOB")]);
    }

    #[test]
    fn test_include_attaches_collection() {
        let model = users_model();
        let store = users_store();
        let executor = QueryExecutor::new(&model, &store, QueryContext::standalone());
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");

        let mut query = entity_query(u, true);
        if let RowSource::Select { shaper, .. } = &mut query.source {
            let entity = shaper.entity_shaper_mut(u).unwrap();
            entity.includes.push(IncludeShaper {
                steps: vec![NavigationStep {
                    navigation: "orders".into(),
                    target: "Order".into(),
                    foreign_key: "user_id".into(),
                    collection: true,
                }],
                reader_indices: vec![],
                tracking: true,
            });
        }

        let results = executor.execute(&query).unwrap();
        let ada = match &results[0] {
            Shaped::Entity(entity) => entity,
            other => panic!("expected entity, got {other:?}"),
        };
        match ada.navigation("orders") {
            Some(crate::identity::NavigationValue::Collection(orders)) => {
                assert_eq!(orders.len(), 2);
                assert_eq!(orders[0].get("total"), Some(&Value::Int64(250)));
            }
            other => panic!("expected loaded collection, got {other:?}"),
        }
        // The second user has no orders; nothing was attached.
        let bob = match &results[1] {
            Shaped::Entity(entity) => entity,
            other => panic!("expected entity, got {other:?}"),
        };
        assert!(bob.navigation("orders").is_none());
    }

    #[test]
    fn test_nested_loop_join_matches_on_keys() {
        let model = users_model();
        let store = users_store();
        let executor = QueryExecutor::new(&model, &store, QueryContext::standalone());
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let o = arena.create("o");

        let mut inner_select = SelectExpr::from_table("orders", "o", o);
        inner_select.add_to_projection("user_id", "user_id", o);
        inner_select.add_to_projection("total", "total", o);
        let secondary = SecondarySource {
            source: o,
            query: Box::new(CompiledQuery {
                source: RowSource::Select {
                    select: inner_select,
                    shaper: Shaper::Buffer(BufferShaper {
                        source: o,
                        offset: 0,
                        columns: vec![("user_id".into(), 0), ("total".into(), 1)],
                    }),
                },
                ops: vec![],
                selector: RowSelector::Source(o),
                terminal: None,
            }),
        };

        let mut query = entity_query(u, false);
        query.ops.push(ClientOp::NestedLoopJoin {
            secondary,
            outer_key: Expr::property(u, "id"),
            inner_key: Expr::property(o, "user_id"),
        });
        query.selector = RowSelector::Client(Expr::property(o, "total"));

        let results = executor.execute(&query).unwrap();
        let totals: Vec<&Value> = results
            .iter()
            .map(|shaped| match shaped {
                Shaped::Value(value) => value,
                other => panic!("expected value, got {other:?}"),
            })
            .collect();
        // Only user 1 has orders; two matched pairs.
        assert_eq!(totals, vec![&Value::Int64(250), &Value::Int64(80)]);
    }

    #[test]
    fn test_collection_include_rejects_composite_owner_key() {
        let model = Model::new()
            .with_entity(
                crate::metadata::EntityType::new("Enrollment", "enrollments")
                    .with_property(crate::metadata::PropertyDef::new("user_id", "user_id"))
                    .with_property(crate::metadata::PropertyDef::new("course_id", "course_id"))
                    .with_key(vec!["user_id", "course_id"])
                    .with_navigation(crate::metadata::NavigationDef::collection(
                        "notes",
                        "Note",
                        "enrollment_id",
                    )),
            )
            .with_entity(
                crate::metadata::EntityType::new("Note", "notes")
                    .with_property(crate::metadata::PropertyDef::new("id", "id"))
                    .with_property(crate::metadata::PropertyDef::new(
                        "enrollment_id",
                        "enrollment_id",
                    ))
                    .with_key(vec!["id"]),
            );
        let mut store = MemoryStore::new();
        store.insert(
            "enrollments",
            vec![("user_id", Value::Int64(1)), ("course_id", Value::Int64(9))],
        );
        let executor = QueryExecutor::new(&model, &store, QueryContext::standalone());
        let mut arena = QuerySourceArena::new();
        let e = arena.create("e");

        let mut select = SelectExpr::from_table("enrollments", "e", e);
        select.add_to_projection("user_id", "user_id", e);
        select.add_to_projection("course_id", "course_id", e);
        let query = CompiledQuery {
            source: RowSource::Select {
                select,
                shaper: Shaper::Entity(EntityShaper {
                    source: e,
                    entity: "Enrollment".into(),
                    offset: 0,
                    key_indices: vec![0, 1],
                    properties: vec![("user_id".into(), 0), ("course_id".into(), 1)],
                    tracking: false,
                    includes: vec![IncludeShaper {
                        steps: vec![NavigationStep {
                            navigation: "notes".into(),
                            target: "Note".into(),
                            foreign_key: "enrollment_id".into(),
                            collection: true,
                        }],
                        reader_indices: vec![],
                        tracking: false,
                    }],
                }),
            },
            ops: vec![],
            selector: RowSelector::Source(e),
            terminal: None,
        };

        assert!(matches!(
            executor.execute(&query),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_count_terminal() {
        let model = users_model();
        let store = users_store();
        let executor = QueryExecutor::new(&model, &store, QueryContext::standalone());
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");

        let mut query = entity_query(u, false);
        query.terminal = Some(Terminal::Count);

        let results = executor.execute(&query).unwrap();
        assert_eq!(results.len(), 1);
        match &results[0] {
            Shaped::Value(value) => assert_eq!(value, &Value::Int64(2)),
            other => panic!("expected value, got {other:?}"),
        }
    }
}
