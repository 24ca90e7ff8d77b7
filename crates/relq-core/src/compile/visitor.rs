//! The orchestrating query-model visitor.
//!
//! Compiles one [`QueryModel`] level per frame: the main from clause
//! establishes a select, each body clause either merges into it (push-down)
//! or appends a client-side operation, and the select clause plus result
//! operators finish the level. Subqueries recurse into child frames and are
//! lifted into the parent select when their shape allows it.
//!
//! Push-down is best-effort throughout: a fragment the store cannot evaluate
//! silently becomes client work, never an error.

use std::collections::HashSet;

use tracing::debug;

use relq_model::{
    AnnotationKind, BodyClause, Expr, FromClause, GroupJoinClause, IncludeSpec, JoinClause,
    OrderSpec, QueryAnnotation, QueryModel, QuerySource, ResultOperator, SourceExpr,
};

use super::frames::{FrameArena, FrameId};
use super::include::compile_includes;
use super::materialization::find_sources_requiring_materialization;
use super::predicate::normalize_predicate;
use super::translator::{BoundColumn, SqlTranslator};
use super::{CompilationOptions, SourceBindings, Translation};
use crate::error::Error;
use crate::metadata::Model;
use crate::shaping::{
    BufferShaper, ClientOp, CompiledQuery, EntityShaper, IncludeShaper, RowSelector, RowSource,
    SecondarySource, Shaper, Terminal,
};
use crate::sql::{SelectExpr, SqlExpr, SqlOrdering};

/// Compiles query models against an entity model.
pub struct QueryCompiler<'m> {
    model: &'m Model,
    options: CompilationOptions,
}

impl<'m> QueryCompiler<'m> {
    /// Create a compiler with default options.
    pub fn new(model: &'m Model) -> Self {
        Self {
            model,
            options: CompilationOptions::default(),
        }
    }

    /// Override the compilation options.
    pub fn with_options(mut self, options: CompilationOptions) -> Self {
        self.options = options;
        self
    }

    /// Compile a query model with no annotations or includes.
    pub fn compile(&self, query_model: &QueryModel) -> Result<CompiledQuery, Error> {
        self.compile_with(query_model, &[], &[])
    }

    /// Compile a query model with its annotations and includes.
    pub fn compile_with(
        &self,
        query_model: &QueryModel,
        annotations: &[QueryAnnotation],
        includes: &[IncludeSpec],
    ) -> Result<CompiledQuery, Error> {
        let bindings = SourceBindings::build(self.model, query_model)?;
        let mut requires_materialization =
            find_sources_requiring_materialization(self.model, &bindings, query_model);
        // Navigation fixup needs the owning entities.
        for include in includes {
            requires_materialization.insert(include.source);
        }
        let compiled_includes = compile_includes(self.model, &bindings, includes)?;

        let mut ctx = CompileCtx {
            model: self.model,
            options: self.options.clone(),
            bindings,
            requires_materialization,
            frames: FrameArena::new(),
            annotations: annotations.to_vec(),
        };
        let root = ctx.frames.push(None);
        let level = ctx.visit_query_model(root, query_model)?;

        let mut compiled = CompiledQuery {
            source: level.source,
            ops: level.ops,
            selector: level.selector,
            terminal: level.terminal,
        };

        match &mut compiled.source {
            RowSource::Select { shaper, .. } => {
                for (plan, spec) in compiled_includes.plans.into_iter().zip(includes) {
                    match shaper.entity_shaper_mut(spec.source) {
                        Some(entity) => entity.includes.push(IncludeShaper {
                            steps: plan.steps,
                            reader_indices: plan.reader_indices,
                            tracking: plan.tracking,
                        }),
                        None => debug!(
                            source = ?spec.source,
                            "include owner is not materialized at the top level; skipping"
                        ),
                    }
                }
            }
            RowSource::Nested { .. } if !includes.is_empty() => {
                return Err(Error::InvalidQuery(
                    "includes cannot be attached to a query whose rows come from a \
                     client-evaluated subquery"
                        .to_string(),
                ));
            }
            RowSource::Nested { .. } => {}
        }

        let relational_nulls = annotations
            .iter()
            .any(|a| a.kind == AnnotationKind::RelationalNullSemantics);
        normalize_compiled(&mut compiled, relational_nulls);
        validate_client_expressions(&compiled)?;

        debug!(client_ops = compiled.ops.len(), "query compiled");
        Ok(compiled)
    }
}

/// One visited level, before assembly into a [`CompiledQuery`].
struct LevelResult {
    source: RowSource,
    ops: Vec<ClientOp>,
    selector: RowSelector,
    terminal: Option<Terminal>,
}

/// Mutable per-level state threaded through the clause visits.
struct LevelState {
    frame: FrameId,
    main_source: QuerySource,
    shaper: Option<Shaper>,
    nested: Option<Box<CompiledQuery>>,
    ops: Vec<ClientOp>,
}

impl LevelState {
    /// Push-down stays available until the first client-side operation;
    /// after that, later clauses must observe the client stream.
    fn can_push_down(&self) -> bool {
        self.nested.is_none() && self.ops.is_empty()
    }
}

/// How a from/join source compiled.
enum SourceCompilation {
    /// A select was registered in the frame; the shaper reads its rows.
    Relational(Shaper),
    /// The source must execute as its own query client-side.
    Client(CompiledQuery),
}

struct CompileCtx<'m> {
    model: &'m Model,
    options: CompilationOptions,
    bindings: SourceBindings,
    requires_materialization: HashSet<QuerySource>,
    frames: FrameArena,
    annotations: Vec<QueryAnnotation>,
}

impl CompileCtx<'_> {
    fn visit_query_model(
        &mut self,
        frame: FrameId,
        query_model: &QueryModel,
    ) -> Result<LevelResult, Error> {
        let main = query_model.main_from.source;
        let mut state = LevelState {
            frame,
            main_source: main,
            shaper: None,
            nested: None,
            ops: Vec::new(),
        };

        match self.compile_source(frame, main, &query_model.main_from.expression)? {
            SourceCompilation::Relational(shaper) => state.shaper = Some(shaper),
            SourceCompilation::Client(query) => state.nested = Some(Box::new(query)),
        }

        for clause in &query_model.body {
            match clause {
                BodyClause::AdditionalFrom(from) => self.visit_additional_from(&mut state, from)?,
                BodyClause::Join(join) => self.visit_join(&mut state, join)?,
                BodyClause::GroupJoin(group_join) => {
                    self.visit_group_join(&mut state, group_join)?
                }
                BodyClause::Where(clause) => self.visit_where(&mut state, &clause.predicate)?,
                BodyClause::OrderBy(clause) => {
                    self.visit_order_by(&mut state, &clause.orderings)?
                }
            }
        }

        let selector = self.visit_select(&mut state, &query_model.select.selector)?;
        let mut terminal = None;
        for op in &query_model.result_operators {
            self.apply_result_operator(&mut state, op, &mut terminal);
        }

        let source = match state.nested.take() {
            Some(query) => RowSource::Nested {
                source: main,
                query,
            },
            None => {
                let select = self
                    .frames
                    .frame_mut(frame)
                    .remove_query(main)
                    .expect("main select registered for a relational level");
                RowSource::Select {
                    select,
                    shaper: state.shaper.take().expect("relational level has a shaper"),
                }
            }
        };

        Ok(LevelResult {
            source,
            ops: state.ops,
            selector,
            terminal,
        })
    }

    // ---- row sources ----

    fn compile_source(
        &mut self,
        frame: FrameId,
        source: QuerySource,
        expression: &SourceExpr,
    ) -> Result<SourceCompilation, Error> {
        match expression {
            SourceExpr::Entity(name) => self.compile_entity_source(frame, source, name),
            SourceExpr::SubQuery(nested) => self.compile_subquery_source(frame, source, nested),
        }
    }

    fn compile_entity_source(
        &mut self,
        frame: FrameId,
        source: QuerySource,
        name: &str,
    ) -> Result<SourceCompilation, Error> {
        let entity = self.model.require_entity(name)?;
        let alias = format!("t{}", source.index());
        let mut select = SelectExpr::from_table(entity.table.clone(), alias, source);
        let shaper = if self.requires_materialization.contains(&source) {
            let mut properties = Vec::with_capacity(entity.properties.len());
            for property in &entity.properties {
                let index =
                    select.add_to_projection(property.column.clone(), property.name.clone(), source);
                properties.push((property.name.clone(), index));
            }
            Shaper::Entity(EntityShaper {
                source,
                entity: entity.name.clone(),
                offset: 0,
                key_indices: entity.key_positions(),
                properties,
                tracking: self.tracking_for(source),
                includes: Vec::new(),
            })
        } else {
            Shaper::Buffer(BufferShaper {
                source,
                offset: 0,
                columns: Vec::new(),
            })
        };
        self.frames.frame_mut(frame).add_query(source, select);
        Ok(SourceCompilation::Relational(shaper))
    }

    fn compile_subquery_source(
        &mut self,
        frame: FrameId,
        source: QuerySource,
        nested: &QueryModel,
    ) -> Result<SourceCompilation, Error> {
        let child_frame = self.frames.push(Some(frame));
        let child = self.visit_query_model(child_frame, nested)?;
        let plain_shape = child.ops.is_empty() && child.terminal.is_none();
        match child.source {
            RowSource::Select { select, shaper } if plain_shape => {
                // Park the child select; it moves into the primary map only
                // when the lift goes through.
                self.frames.frame_mut(frame).add_subquery(source, select);
                let unlimited_ordering = {
                    let select = self
                        .frames
                        .frame(frame)
                        .subquery(source)
                        .expect("parked above");
                    !select.order_by().is_empty() && select.limit().is_none()
                };
                if unlimited_ordering {
                    // An unlimited ordering is only observable in result
                    // order, which merging would discard.
                    debug!(?source, "subquery has unlimited ordering; executing it nested");
                    let select = self
                        .frames
                        .frame_mut(frame)
                        .take_subquery(source)
                        .expect("parked above");
                    return Ok(SourceCompilation::Client(CompiledQuery {
                        source: RowSource::Select { select, shaper },
                        ops: Vec::new(),
                        selector: child.selector,
                        terminal: None,
                    }));
                }
                match child.selector {
                    RowSelector::Source(selected) => {
                        let mut select = self
                            .frames
                            .frame_mut(frame)
                            .take_subquery(source)
                            .expect("parked above");
                        if select.requires_push_down() {
                            select.push_down_subquery();
                        }
                        if select.has_star_projection() {
                            select.explode_star_projection();
                        }
                        select.set_query_source(source);
                        for annotation in &mut self.annotations {
                            if annotation.source == selected {
                                annotation.source = source;
                            }
                        }
                        self.bindings.rebind(selected, source);
                        let lifted = self.lift_shaper(source, &select, shaper, selected);
                        select.rebind_query_source(selected, source);
                        self.frames.frame_mut(frame).add_query(source, select);
                        debug!(?source, "subquery lifted");
                        Ok(SourceCompilation::Relational(lifted))
                    }
                    RowSelector::Column(index) => {
                        let mut select = self
                            .frames
                            .frame_mut(frame)
                            .take_subquery(source)
                            .expect("parked above");
                        if select.requires_push_down() {
                            select.push_down_subquery();
                        }
                        if select.has_star_projection() {
                            select.explode_star_projection();
                        }
                        select.set_query_source(source);
                        let entry = &select.projection()[index];
                        let columns = vec![(entry.property.clone(), index)];
                        let inner_source = entry.source;
                        select.rebind_query_source(inner_source, source);
                        self.frames.frame_mut(frame).add_query(source, select);
                        debug!(?source, "scalar subquery lifted");
                        Ok(SourceCompilation::Relational(Shaper::Buffer(BufferShaper {
                            source,
                            offset: 0,
                            columns,
                        })))
                    }
                    selector @ RowSelector::Client(_) => {
                        let select = self
                            .frames
                            .frame_mut(frame)
                            .take_subquery(source)
                            .expect("parked above");
                        Ok(SourceCompilation::Client(CompiledQuery {
                            source: RowSource::Select { select, shaper },
                            ops: Vec::new(),
                            selector,
                            terminal: None,
                        }))
                    }
                }
            }
            child_source => Ok(SourceCompilation::Client(CompiledQuery {
                source: child_source,
                ops: child.ops,
                selector: child.selector,
                terminal: child.terminal,
            })),
        }
    }

    /// Build the outer-facing shaper for a lifted subquery select.
    fn lift_shaper(
        &self,
        source: QuerySource,
        select: &SelectExpr,
        child_shaper: Shaper,
        selected: QuerySource,
    ) -> Shaper {
        if self.requires_materialization.contains(&source) {
            let mut child_shaper = child_shaper;
            if let Some(entity) = child_shaper.entity_shaper_mut(selected) {
                let mut entity = entity.clone();
                entity.source = source;
                entity.tracking = self.tracking_for(source);
                return Shaper::Entity(entity);
            }
        }
        let columns = select
            .projection()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.source == selected)
            .map(|(index, entry)| (entry.property.clone(), index))
            .collect();
        Shaper::Buffer(BufferShaper {
            source,
            offset: 0,
            columns,
        })
    }

    /// Compile a source into a standalone query for client-side combination.
    fn compile_secondary(
        &mut self,
        frame: FrameId,
        source: QuerySource,
        expression: &SourceExpr,
    ) -> Result<SecondarySource, Error> {
        match self.compile_source(frame, source, expression)? {
            SourceCompilation::Relational(mut shaper) => {
                let mut select = self
                    .frames
                    .frame_mut(frame)
                    .remove_query(source)
                    .expect("registered by compile_source");
                self.ensure_full_columns(&mut select, &mut shaper);
                Ok(SecondarySource {
                    source,
                    query: Box::new(CompiledQuery {
                        source: RowSource::Select { select, shaper },
                        ops: Vec::new(),
                        selector: RowSelector::Source(source),
                        terminal: None,
                    }),
                })
            }
            SourceCompilation::Client(query) => Ok(SecondarySource {
                source,
                query: Box::new(query),
            }),
        }
    }

    // ---- body clauses ----

    fn visit_additional_from(
        &mut self,
        state: &mut LevelState,
        from: &FromClause,
    ) -> Result<(), Error> {
        if !state.can_push_down() {
            let secondary = self.compile_secondary(state.frame, from.source, &from.expression)?;
            state.ops.push(ClientOp::CrossJoin(secondary));
            return Ok(());
        }
        match self.compile_source(state.frame, from.source, &from.expression)? {
            SourceCompilation::Client(query) => {
                debug!(source = ?from.source, "additional from is client-side; cross-joining in memory");
                state.ops.push(ClientOp::CrossJoin(SecondarySource {
                    source: from.source,
                    query: Box::new(query),
                }));
                Ok(())
            }
            SourceCompilation::Relational(shaper) => {
                let frame = self.frames.frame_mut(state.frame);
                let mut added = frame
                    .remove_query(from.source)
                    .expect("registered by compile_source");
                if added.is_single_table() {
                    if let Some(select) = frame.query_mut(state.main_source) {
                        if select.has_star_projection() {
                            select.explode_star_projection();
                        }
                        let offset = select.projection_count();
                        let table = added.take_single_table();
                        let projection = added.projection().to_vec();
                        select.add_cross_join(table, projection);
                        let outer = state.shaper.take().expect("relational level has a shaper");
                        state.shaper = Some(Shaper::flattened(outer, shaper, offset));
                        debug!(source = ?from.source, "additional from flattened into a cross join");
                        return Ok(());
                    }
                }
                debug!(source = ?from.source, "additional from cannot be flattened; cross-joining in memory");
                let mut shaper = shaper;
                self.ensure_full_columns(&mut added, &mut shaper);
                state.ops.push(ClientOp::CrossJoin(SecondarySource {
                    source: from.source,
                    query: Box::new(CompiledQuery {
                        source: RowSource::Select {
                            select: added,
                            shaper,
                        },
                        ops: Vec::new(),
                        selector: RowSelector::Source(from.source),
                        terminal: None,
                    }),
                }));
                Ok(())
            }
        }
    }

    fn visit_join(&mut self, state: &mut LevelState, join: &JoinClause) -> Result<(), Error> {
        if !state.can_push_down() {
            let secondary = self.compile_secondary(state.frame, join.source, &join.inner)?;
            state.ops.push(ClientOp::NestedLoopJoin {
                secondary,
                outer_key: join.outer_key.clone(),
                inner_key: join.inner_key.clone(),
            });
            return Ok(());
        }
        match self.compile_source(state.frame, join.source, &join.inner)? {
            SourceCompilation::Client(query) => {
                debug!(source = ?join.source, "join inner source is client-side; using nested-loop join");
                self.ensure_client_columns(state, &join.outer_key);
                state.ops.push(ClientOp::NestedLoopJoin {
                    secondary: SecondarySource {
                        source: join.source,
                        query: Box::new(query),
                    },
                    outer_key: join.outer_key.clone(),
                    inner_key: join.inner_key.clone(),
                });
                Ok(())
            }
            SourceCompilation::Relational(shaper) => self.merge_join(state, join, shaper),
        }
    }

    fn merge_join(
        &mut self,
        state: &mut LevelState,
        join: &JoinClause,
        inner_shaper: Shaper,
    ) -> Result<(), Error> {
        let main = state.main_source;
        let checkpoint = self
            .frames
            .frame(state.frame)
            .query(main)
            .expect("relational level")
            .projection_count();

        let key_predicate = Expr::eq(join.outer_key.clone(), join.inner_key.clone());
        let (translation, bound, outer_refs) = {
            let mut translator =
                SqlTranslator::new(self.model, &self.bindings, &self.frames, state.frame);
            let translation = translator.translate(&key_predicate);
            (
                translation,
                translator.bound_columns().to_vec(),
                translator.outer_references().to_vec(),
            )
        };
        self.apply_outer_references(state.frame, &outer_refs);

        // Speculatively bind the key columns into the outer select; rolled
        // back below whichever way the attempt goes.
        {
            let frame = self.frames.frame_mut(state.frame);
            if let Some(select) = frame.query_mut(main) {
                for column in &bound {
                    if select.handles_query_source(column.source) {
                        select.add_to_projection(
                            column.column.clone(),
                            column.property.clone(),
                            column.source,
                        );
                    }
                }
            }
        }

        let single_table = self
            .frames
            .frame(state.frame)
            .query(join.source)
            .map(SelectExpr::is_single_table)
            .unwrap_or(false);

        match translation {
            Translation::Translated(predicate) if single_table => {
                let mut inner_select = self
                    .frames
                    .frame_mut(state.frame)
                    .remove_query(join.source)
                    .expect("registered by compile_source");
                let frame = self.frames.frame_mut(state.frame);
                let select = frame.query_mut(main).expect("relational level");
                select.remove_range_from_projection(checkpoint);
                if select.has_star_projection() {
                    select.explode_star_projection();
                }
                let offset = select.projection_count();
                let table = inner_select.take_single_table();
                let projection = if self.requires_materialization.contains(&join.source) {
                    inner_select.projection().to_vec()
                } else {
                    Vec::new()
                };
                ensure_sql_columns(select, &predicate);
                let handle = select.add_inner_join(table, projection);
                select.set_join_predicate(handle, predicate);
                let outer = state.shaper.take().expect("relational level has a shaper");
                state.shaper = Some(Shaper::flattened(outer, inner_shaper, offset));
                debug!(source = ?join.source, "join pushed down");
                Ok(())
            }
            _ => {
                {
                    let frame = self.frames.frame_mut(state.frame);
                    if let Some(select) = frame.query_mut(main) {
                        select.remove_range_from_projection(checkpoint);
                    }
                }
                debug!(source = ?join.source, "join keys did not translate; using client nested-loop join");
                let mut inner_select = self
                    .frames
                    .frame_mut(state.frame)
                    .remove_query(join.source)
                    .expect("registered by compile_source");
                let mut inner_shaper = inner_shaper;
                self.ensure_full_columns(&mut inner_select, &mut inner_shaper);
                self.ensure_client_columns(state, &join.outer_key);
                state.ops.push(ClientOp::NestedLoopJoin {
                    secondary: SecondarySource {
                        source: join.source,
                        query: Box::new(CompiledQuery {
                            source: RowSource::Select {
                                select: inner_select,
                                shaper: inner_shaper,
                            },
                            ops: Vec::new(),
                            selector: RowSelector::Source(join.source),
                            terminal: None,
                        }),
                    },
                    outer_key: join.outer_key.clone(),
                    inner_key: join.inner_key.clone(),
                });
                Ok(())
            }
        }
    }

    fn visit_group_join(
        &mut self,
        state: &mut LevelState,
        group_join: &GroupJoinClause,
    ) -> Result<(), Error> {
        // Group shapes have no relational rendering here; the matches are
        // grouped in memory.
        let join = &group_join.join;
        let secondary = self.compile_secondary(state.frame, join.source, &join.inner)?;
        self.ensure_client_columns(state, &join.outer_key);
        state.ops.push(ClientOp::GroupJoin {
            group_source: group_join.group_source,
            secondary,
            outer_key: join.outer_key.clone(),
            inner_key: join.inner_key.clone(),
        });
        Ok(())
    }

    fn visit_where(&mut self, state: &mut LevelState, predicate: &Expr) -> Result<(), Error> {
        if !state.can_push_down() {
            self.ensure_client_columns(state, predicate);
            state.ops.push(ClientOp::Filter(predicate.clone()));
            return Ok(());
        }
        let (split, outer_refs) = {
            let mut translator =
                SqlTranslator::new(self.model, &self.bindings, &self.frames, state.frame);
            let split = translator.translate_predicate(predicate);
            (split, translator.outer_references().to_vec())
        };
        self.apply_outer_references(state.frame, &outer_refs);

        if let Some(sql) = split.sql {
            let frame = self.frames.frame_mut(state.frame);
            let select = frame.query_mut(state.main_source).expect("relational level");
            ensure_sql_columns(select, &sql);
            select.and_predicate(sql);
        }
        if let Some(residue) = split.residue {
            debug!("predicate partially untranslatable; filtering residue client-side");
            self.ensure_client_columns(state, &residue);
            state.ops.push(ClientOp::Filter(residue));
        }
        Ok(())
    }

    fn visit_order_by(
        &mut self,
        state: &mut LevelState,
        orderings: &[OrderSpec],
    ) -> Result<(), Error> {
        if !state.can_push_down() {
            for spec in orderings {
                self.ensure_client_columns(state, &spec.expression);
            }
            state.ops.push(ClientOp::OrderBy(orderings.to_vec()));
            return Ok(());
        }
        // All-or-nothing: a partially pushed ordering would interleave
        // server and client sort keys incorrectly.
        let (translated, outer_refs) = {
            let mut translator =
                SqlTranslator::new(self.model, &self.bindings, &self.frames, state.frame);
            let mut acc = Some(Vec::with_capacity(orderings.len()));
            for spec in orderings {
                match translator.translate(&spec.expression) {
                    Translation::Translated(expr) => {
                        if let Some(list) = acc.as_mut() {
                            list.push(SqlOrdering::new(expr, spec.direction));
                        }
                    }
                    Translation::ClientEval => acc = None,
                }
            }
            (acc, translator.outer_references().to_vec())
        };
        self.apply_outer_references(state.frame, &outer_refs);

        match translated {
            Some(list) => {
                let frame = self.frames.frame_mut(state.frame);
                let select = frame.query_mut(state.main_source).expect("relational level");
                for ordering in &list {
                    ensure_sql_columns(select, &ordering.expression);
                }
                select.prepend_to_order_by(list);
            }
            None => {
                debug!("ordering did not translate; sorting client-side");
                for spec in orderings {
                    self.ensure_client_columns(state, &spec.expression);
                }
                state.ops.push(ClientOp::OrderBy(orderings.to_vec()));
            }
        }
        Ok(())
    }

    // ---- select and result operators ----

    fn visit_select(
        &mut self,
        state: &mut LevelState,
        selector: &Expr,
    ) -> Result<RowSelector, Error> {
        if let Expr::SourceRef(source) = selector {
            return Ok(RowSelector::Source(*source));
        }
        if state.can_push_down() {
            if let Expr::Property { source, name } = selector {
                let translation = {
                    let mut translator =
                        SqlTranslator::new(self.model, &self.bindings, &self.frames, state.frame);
                    translator.translate(selector)
                };
                if let Translation::Translated(SqlExpr::Column { column, .. }) = translation {
                    let frame = self.frames.frame_mut(state.frame);
                    if let Some(select) = frame.query_mut(*source) {
                        select.ensure_column_available(*source, name, &column);
                        let index = select.add_to_projection(column, name.clone(), *source);
                        return Ok(RowSelector::Column(index));
                    }
                }
            }
        }
        self.ensure_client_columns(state, selector);
        Ok(RowSelector::Client(selector.clone()))
    }

    fn apply_result_operator(
        &mut self,
        state: &mut LevelState,
        op: &ResultOperator,
        terminal: &mut Option<Terminal>,
    ) {
        match op {
            ResultOperator::Take(n) => {
                if state.can_push_down() {
                    let frame = self.frames.frame_mut(state.frame);
                    let select = frame.query_mut(state.main_source).expect("relational level");
                    if select.limit().is_some() {
                        // A second limit applies to the already-limited rows.
                        select.push_down_subquery();
                    }
                    select.set_limit(*n);
                } else {
                    state.ops.push(ClientOp::Take(*n));
                }
            }
            ResultOperator::Skip(n) => {
                if state.can_push_down() {
                    let frame = self.frames.frame_mut(state.frame);
                    let select = frame.query_mut(state.main_source).expect("relational level");
                    if select.limit().is_some() || select.offset().is_some() {
                        select.push_down_subquery();
                    }
                    select.set_offset(*n);
                } else {
                    state.ops.push(ClientOp::Skip(*n));
                }
            }
            ResultOperator::Count => *terminal = Some(Terminal::Count),
            ResultOperator::First => {
                if state.can_push_down() {
                    let frame = self.frames.frame_mut(state.frame);
                    if let Some(select) = frame.query_mut(state.main_source) {
                        if select.limit().is_some() {
                            select.push_down_subquery();
                        }
                        select.set_limit(1);
                    }
                }
                *terminal = Some(Terminal::First);
            }
        }
    }

    // ---- binding helpers ----

    /// Project the properties a client-evaluated expression reads, and make
    /// them addressable through the affected buffer shapers.
    fn ensure_client_columns(&mut self, state: &mut LevelState, expr: &Expr) {
        let mut refs = Vec::new();
        collect_property_refs(expr, &mut refs);
        for (source, property) in refs {
            let Some(entity_name) = self.bindings.entity_of(source) else {
                continue;
            };
            let Some(entity) = self.model.entity(entity_name) else {
                continue;
            };
            let Some(def) = entity.property(&property) else {
                continue;
            };
            let column = def.column.clone();
            let frame = self.frames.frame_mut(state.frame);
            let Some(select) = frame.query_mut(source) else {
                continue;
            };
            select.ensure_column_available(source, &property, &column);
            let index = select.add_to_projection(column, property.clone(), source);
            if let Some(shaper) = state.shaper.as_mut() {
                if let Some(buffer) = shaper.buffer_shaper_mut(source) {
                    if !buffer.columns.iter().any(|(name, _)| name == &property) {
                        buffer
                            .columns
                            .push((property, index.saturating_sub(buffer.offset)));
                    }
                }
            }
        }
    }

    /// Project all mapped properties of every buffer-shaped source so the
    /// rows are fully readable client-side.
    fn ensure_full_columns(&self, select: &mut SelectExpr, shaper: &mut Shaper) {
        for source in shaper.sources() {
            let Some(entity_name) = self.bindings.entity_of(source) else {
                continue;
            };
            let Some(entity) = self.model.entity(entity_name) else {
                continue;
            };
            if let Some(buffer) = shaper.buffer_shaper_mut(source) {
                for property in &entity.properties {
                    select.ensure_column_available(source, &property.name, &property.column);
                    let index =
                        select.add_to_projection(property.column.clone(), property.name.clone(), source);
                    if !buffer.columns.iter().any(|(name, _)| name == &property.name) {
                        buffer
                            .columns
                            .push((property.name.clone(), index.saturating_sub(buffer.offset)));
                    }
                }
            }
        }
    }

    /// Grow ancestor projections for cross-level property references so the
    /// values are available where the client expression runs.
    fn apply_outer_references(&mut self, frame: FrameId, references: &[BoundColumn]) {
        for reference in references {
            if let Some(ancestor) = self.frames.ancestor_handling(frame, reference.source) {
                if let Some(select) = self.frames.frame_mut(ancestor).query_mut(reference.source) {
                    select.ensure_column_available(
                        reference.source,
                        &reference.property,
                        &reference.column,
                    );
                    select.add_to_projection(
                        reference.column.clone(),
                        reference.property.clone(),
                        reference.source,
                    );
                }
            }
        }
    }

    fn tracking_for(&self, source: QuerySource) -> bool {
        for annotation in &self.annotations {
            if annotation.source == source {
                match annotation.kind {
                    AnnotationKind::TrackingRequired => return true,
                    AnnotationKind::NoTracking => return false,
                    AnnotationKind::RelationalNullSemantics => {}
                }
            }
        }
        self.options.track_by_default
    }
}

/// Project every column a pushed-down fragment references through any
/// subquery tables it must be read from.
fn ensure_sql_columns(select: &mut SelectExpr, expr: &SqlExpr) {
    match expr {
        SqlExpr::Column {
            source,
            property,
            column,
        } => select.ensure_column_available(*source, property, column),
        SqlExpr::Literal(_) => {}
        SqlExpr::Binary { left, right, .. } => {
            ensure_sql_columns(select, left);
            ensure_sql_columns(select, right);
        }
        SqlExpr::Unary { operand, .. } => ensure_sql_columns(select, operand),
    }
}

fn collect_property_refs(expr: &Expr, out: &mut Vec<(QuerySource, String)>) {
    match expr {
        Expr::Property { source, name } => {
            let pair = (*source, name.clone());
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
        Expr::Binary { left, right, .. } => {
            collect_property_refs(left, out);
            collect_property_refs(right, out);
        }
        Expr::Unary { operand, .. } => collect_property_refs(operand, out),
        Expr::Call { args, .. } => {
            for arg in args {
                collect_property_refs(arg, out);
            }
        }
        Expr::SourceRef(_) | Expr::Literal(_) | Expr::SubQuery(_) => {}
    }
}

/// Rewrite every select predicate in a compiled query for the requested
/// null semantics.
fn normalize_compiled(query: &mut CompiledQuery, use_relational_nulls: bool) {
    match &mut query.source {
        RowSource::Select { select, .. } => {
            select.rewrite_predicates(&mut |expr| normalize_predicate(expr, use_relational_nulls));
        }
        RowSource::Nested { query, .. } => normalize_compiled(query, use_relational_nulls),
    }
    for op in &mut query.ops {
        match op {
            ClientOp::CrossJoin(secondary)
            | ClientOp::NestedLoopJoin { secondary, .. }
            | ClientOp::GroupJoin { secondary, .. } => {
                normalize_compiled(&mut secondary.query, use_relational_nulls);
            }
            ClientOp::Filter(_)
            | ClientOp::OrderBy(_)
            | ClientOp::Skip(_)
            | ClientOp::Take(_) => {}
        }
    }
}

/// Check that every client expression in a compiled query can actually run:
/// all referenced sources are in scope where the expression executes, and no
/// nested query was left behind in client residue. Violations are compile
/// errors, not deferred execution failures.
fn validate_client_expressions(query: &CompiledQuery) -> Result<(), Error> {
    let mut in_scope: HashSet<QuerySource> = match &query.source {
        RowSource::Select { shaper, .. } => shaper.sources().into_iter().collect(),
        RowSource::Nested { source, query } => {
            validate_client_expressions(query)?;
            HashSet::from([*source])
        }
    };
    for op in &query.ops {
        match op {
            ClientOp::Filter(predicate) => check_expr_scope(predicate, &in_scope)?,
            ClientOp::OrderBy(specs) => {
                for spec in specs {
                    check_expr_scope(&spec.expression, &in_scope)?;
                }
            }
            ClientOp::CrossJoin(secondary) => {
                validate_client_expressions(&secondary.query)?;
                in_scope.insert(secondary.source);
            }
            ClientOp::NestedLoopJoin {
                secondary,
                outer_key,
                inner_key,
            } => {
                validate_client_expressions(&secondary.query)?;
                check_expr_scope(outer_key, &in_scope)?;
                check_expr_scope(inner_key, &HashSet::from([secondary.source]))?;
                in_scope.insert(secondary.source);
            }
            ClientOp::GroupJoin {
                group_source,
                secondary,
                outer_key,
                inner_key,
            } => {
                validate_client_expressions(&secondary.query)?;
                check_expr_scope(outer_key, &in_scope)?;
                check_expr_scope(inner_key, &HashSet::from([secondary.source]))?;
                in_scope.insert(*group_source);
            }
            ClientOp::Skip(_) | ClientOp::Take(_) => {}
        }
    }
    match &query.selector {
        RowSelector::Client(expr) => check_expr_scope(expr, &in_scope),
        RowSelector::Source(source) if !in_scope.contains(source) => {
            Err(Error::InvalidQuery(format!(
                "selected source {source:?} is not in scope at execution"
            )))
        }
        RowSelector::Source(_) | RowSelector::Column(_) => Ok(()),
    }
}

fn check_expr_scope(expr: &Expr, in_scope: &HashSet<QuerySource>) -> Result<(), Error> {
    match expr {
        Expr::Property { source, .. } | Expr::SourceRef(source) => {
            if in_scope.contains(source) {
                Ok(())
            } else {
                Err(Error::InvalidQuery(format!(
                    "client expression references source {source:?}, which is not in scope \
                     where the expression runs"
                )))
            }
        }
        Expr::Literal(_) => Ok(()),
        Expr::Binary { left, right, .. } => {
            check_expr_scope(left, in_scope)?;
            check_expr_scope(right, in_scope)
        }
        Expr::Unary { operand, .. } => check_expr_scope(operand, in_scope),
        Expr::Call { args, .. } => {
            for arg in args {
                check_expr_scope(arg, in_scope)?;
            }
            Ok(())
        }
        Expr::SubQuery(_) => Err(Error::InvalidQuery(
            "a nested query in a client-evaluated expression cannot be executed".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityType, PropertyDef};
    use relq_model::{OrderDirection, QuerySourceArena};

    fn model() -> Model {
        Model::new()
            .with_entity(
                EntityType::new("User", "users")
                    .with_property(PropertyDef::new("id", "id"))
                    .with_property(PropertyDef::new("name", "name"))
                    .with_property(PropertyDef::new("age", "age"))
                    .with_key(vec!["id"]),
            )
            .with_entity(
                EntityType::new("Post", "posts")
                    .with_property(PropertyDef::new("id", "id"))
                    .with_property(PropertyDef::new("author_id", "author_id"))
                    .with_property(PropertyDef::new("title", "title"))
                    .with_key(vec!["id"]),
            )
    }

    fn select_of(query: &CompiledQuery) -> &SelectExpr {
        match &query.source {
            RowSource::Select { select, .. } => select,
            other => panic!("expected relational row source, got {other:?}"),
        }
    }

    #[test]
    fn test_where_pushes_down_whole_predicate() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"))
            .and_where(Expr::gt(Expr::property(u, "age"), Expr::literal(30i64)));

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        assert!(compiled.ops.is_empty());
        assert!(select_of(&compiled).predicate().is_some());
    }

    #[test]
    fn test_untranslatable_conjunct_becomes_client_filter() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let client_part = Expr::eq(
            Expr::call("length", vec![Expr::property(u, "name")]),
            Expr::literal(5i64),
        );
        let qm = QueryModel::new(FromClause::entity(u, "User")).and_where(Expr::and(
            Expr::gt(Expr::property(u, "age"), Expr::literal(30i64)),
            client_part.clone(),
        ));

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        assert!(select_of(&compiled).predicate().is_some());
        assert_eq!(compiled.ops.len(), 1);
        match &compiled.ops[0] {
            ClientOp::Filter(residue) => assert_eq!(residue, &client_part),
            other => panic!("expected client filter, got {other:?}"),
        }
    }

    #[test]
    fn test_later_order_by_clause_becomes_primary_key() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"))
            .order_by(vec![OrderSpec::asc(Expr::property(u, "age"))])
            .order_by(vec![OrderSpec::desc(Expr::property(u, "name"))]);

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        let order_by = select_of(&compiled).order_by();
        assert_eq!(order_by.len(), 2);
        assert_eq!(order_by[0].direction, OrderDirection::Desc);
        match &order_by[0].expression {
            SqlExpr::Column { column, .. } => assert_eq!(column, "name"),
            other => panic!("expected column ordering, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_join_rolls_back_projection() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let p = arena.create("p");
        let qm = QueryModel::new(FromClause::entity(u, "User")).join(JoinClause {
            source: p,
            inner: SourceExpr::Entity("Post".into()),
            outer_key: Expr::property(u, "id"),
            // A call never translates, so the join falls back client-side.
            inner_key: Expr::call("normalize", vec![Expr::property(p, "author_id")]),
        });

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        let select = select_of(&compiled);
        // The entity projection survives; the speculative key binding does
        // not add anything beyond it.
        assert_eq!(select.projection_count(), 3);
        assert!(select.is_single_table());
        assert!(matches!(compiled.ops[0], ClientOp::NestedLoopJoin { .. }));
    }

    #[test]
    fn test_join_pushes_down_and_flattens() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let p = arena.create("p");
        let qm = QueryModel::new(FromClause::entity(u, "User")).join(JoinClause {
            source: p,
            inner: SourceExpr::Entity("Post".into()),
            outer_key: Expr::property(u, "id"),
            inner_key: Expr::property(p, "author_id"),
        });

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        assert!(compiled.ops.is_empty());
        let select = select_of(&compiled);
        assert_eq!(select.tables().len(), 2);
        // Only the materialized outer entity is projected; the join side is
        // not needed by the selector.
        assert_eq!(select.projection_count(), 3);
    }

    #[test]
    fn test_subquery_with_limit_lifts_as_pushed_down_table() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let inner = arena.create("inner");
        let outer = arena.create("outer");
        let nested = QueryModel::new(FromClause::entity(inner, "User"))
            .order_by(vec![OrderSpec::asc(Expr::property(inner, "age"))])
            .with_operator(ResultOperator::Take(5));
        let qm = QueryModel::new(FromClause::subquery(outer, nested));

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        assert!(compiled.ops.is_empty());
        let select = select_of(&compiled);
        assert!(select.is_single_table());
        assert!(matches!(
            select.tables()[0],
            crate::sql::TableExpr::Subquery { .. }
        ));
        // The lifted entity shaper still reads offsets 0..3.
        match &compiled.source {
            RowSource::Select { shaper, .. } => match shaper {
                Shaper::Entity(entity) => {
                    assert_eq!(entity.source, outer);
                    assert_eq!(entity.offset, 0);
                }
                other => panic!("expected entity shaper, got {other:?}"),
            },
            other => panic!("expected relational row source, got {other:?}"),
        }
    }

    #[test]
    fn test_subquery_with_unlimited_ordering_stays_nested() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let inner = arena.create("inner");
        let outer = arena.create("outer");
        let nested = QueryModel::new(FromClause::entity(inner, "User"))
            .order_by(vec![OrderSpec::asc(Expr::property(inner, "age"))]);
        let qm = QueryModel::new(FromClause::subquery(outer, nested));

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        assert!(matches!(compiled.source, RowSource::Nested { .. }));
    }

    #[test]
    fn test_take_then_skip_wraps_before_setting_offset() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User"))
            .with_operator(ResultOperator::Take(10))
            .with_operator(ResultOperator::Skip(5));

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        let select = select_of(&compiled);
        assert_eq!(select.offset(), Some(5));
        assert!(select.limit().is_none());
        match &select.tables()[0] {
            crate::sql::TableExpr::Subquery { select: inner, .. } => {
                assert_eq!(inner.limit(), Some(10));
            }
            other => panic!("expected wrapped subquery, got {other:?}"),
        }
    }

    #[test]
    fn test_subquery_in_predicate_is_rejected_at_compile_time() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let p = arena.create("p");
        let inner = QueryModel::new(FromClause::entity(p, "Post")).select(Expr::property(p, "id"));
        let qm = QueryModel::new(FromClause::entity(u, "User")).and_where(Expr::gt(
            Expr::property(u, "age"),
            Expr::SubQuery(Box::new(inner)),
        ));

        assert!(matches!(
            QueryCompiler::new(&model).compile(&qm),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_correlated_subquery_reference_is_rejected_at_compile_time() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let p0 = arena.create("p0");
        let p = arena.create("p");
        // The nested predicate reaches out to the enclosing source; no row
        // scope will carry it when the nested query runs.
        let inner = QueryModel::new(FromClause::entity(p0, "Post")).and_where(Expr::eq(
            Expr::property(p0, "author_id"),
            Expr::property(u, "id"),
        ));
        let qm = QueryModel::new(FromClause::entity(u, "User"))
            .additional_from(FromClause::subquery(p, inner));

        assert!(matches!(
            QueryCompiler::new(&model).compile(&qm),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_column_selector_binds_projection_index() {
        let model = model();
        let mut arena = QuerySourceArena::new();
        let u = arena.create("u");
        let qm = QueryModel::new(FromClause::entity(u, "User")).select(Expr::property(u, "name"));

        let compiled = QueryCompiler::new(&model).compile(&qm).unwrap();
        match compiled.selector {
            RowSelector::Column(index) => {
                let select = select_of(&compiled);
                assert_eq!(select.projection()[index].property, "name");
            }
            other => panic!("expected column selector, got {other:?}"),
        }
    }
}
