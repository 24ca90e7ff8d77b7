//! Best-effort translation of generic expressions into relational ones.
//!
//! Translation never fails the query: a fragment the store cannot evaluate
//! comes back as [`Translation::ClientEval`] and the orchestrator routes the
//! clause (or its untranslatable residue) to client-side evaluation.

use relq_model::{BinaryOp, Expr, QuerySource};

use super::frames::{FrameArena, FrameId};
use super::{SourceBindings, Translation};
use crate::metadata::Model;
use crate::sql::SqlExpr;

/// A column the translator bound while walking an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundColumn {
    /// The source the property was bound on.
    pub source: QuerySource,
    /// The bound property.
    pub property: String,
    /// Its store column.
    pub column: String,
}

/// The split result of translating a predicate.
///
/// Under a top-level conjunction the translatable conjuncts go server-side
/// and the rest becomes the client residue; any other shape translates
/// all-or-nothing.
#[derive(Debug)]
pub struct PredicateTranslation {
    /// The server-side part, if any.
    pub sql: Option<SqlExpr>,
    /// The client-side remainder, if any.
    pub residue: Option<Expr>,
}

/// Expression translator scoped to one compilation frame.
pub struct SqlTranslator<'a> {
    model: &'a Model,
    bindings: &'a SourceBindings,
    frames: &'a FrameArena,
    frame: FrameId,
    bound_columns: Vec<BoundColumn>,
    outer_references: Vec<BoundColumn>,
}

impl<'a> SqlTranslator<'a> {
    /// Create a translator over the given frame.
    pub fn new(
        model: &'a Model,
        bindings: &'a SourceBindings,
        frames: &'a FrameArena,
        frame: FrameId,
    ) -> Self {
        Self {
            model,
            bindings,
            frames,
            frame,
            bound_columns: Vec::new(),
            outer_references: Vec::new(),
        }
    }

    /// Columns bound on sources handled in the current frame.
    ///
    /// The orchestrator projects these speculatively when translating join
    /// keys, and rolls the projection back if the attempt fails.
    pub fn bound_columns(&self) -> &[BoundColumn] {
        &self.bound_columns
    }

    /// Columns bound on sources handled by an ancestor frame.
    ///
    /// These make the whole fragment client-evaluated; the orchestrator adds
    /// them to the owning ancestor's projection so the values reach the
    /// client evaluator.
    pub fn outer_references(&self) -> &[BoundColumn] {
        &self.outer_references
    }

    /// Translate one expression, all-or-nothing.
    pub fn translate(&mut self, expr: &Expr) -> Translation {
        match expr {
            Expr::Literal(value) => Translation::Translated(SqlExpr::Literal(value.clone())),
            Expr::Property { source, name } => self.translate_property(*source, name),
            Expr::Binary { op, left, right } => {
                let left = self.translate(left);
                let right = self.translate(right);
                match (left, right) {
                    (Translation::Translated(l), Translation::Translated(r)) => {
                        Translation::Translated(SqlExpr::binary(*op, l, r))
                    }
                    _ => Translation::ClientEval,
                }
            }
            Expr::Unary { op, operand } => match self.translate(operand) {
                Translation::Translated(inner) => {
                    Translation::Translated(SqlExpr::unary(*op, inner))
                }
                Translation::ClientEval => Translation::ClientEval,
            },
            // Entity references, function calls, and correlated subqueries
            // have no relational rendering here.
            Expr::SourceRef(_) | Expr::Call { .. } | Expr::SubQuery(_) => Translation::ClientEval,
        }
    }

    /// Translate a predicate, splitting at top-level conjunctions so that
    /// translatable conjuncts are pushed down even when siblings are not.
    pub fn translate_predicate(&mut self, expr: &Expr) -> PredicateTranslation {
        if let Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } = expr
        {
            let l = self.translate_predicate(left);
            let r = self.translate_predicate(right);
            let sql = match (l.sql, r.sql) {
                (Some(a), Some(b)) => Some(SqlExpr::and_also(a, b)),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            };
            let residue = match (l.residue, r.residue) {
                (Some(a), Some(b)) => Some(Expr::and(a, b)),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            };
            return PredicateTranslation { sql, residue };
        }
        match self.translate(expr) {
            Translation::Translated(sql) => PredicateTranslation {
                sql: Some(sql),
                residue: None,
            },
            Translation::ClientEval => PredicateTranslation {
                sql: None,
                residue: Some(expr.clone()),
            },
        }
    }

    fn translate_property(&mut self, source: QuerySource, name: &str) -> Translation {
        let Some(entity_name) = self.bindings.entity_of(source) else {
            return Translation::ClientEval;
        };
        let Ok(entity) = self.model.require_entity(entity_name) else {
            return Translation::ClientEval;
        };
        let Some(property) = entity.property(name) else {
            // A member the model does not map stays a client concern.
            return Translation::ClientEval;
        };
        let bound = BoundColumn {
            source,
            property: property.name.clone(),
            column: property.column.clone(),
        };
        if self.frames.frame(self.frame).handles(source) {
            self.bound_columns.push(bound.clone());
            return Translation::Translated(SqlExpr::column(source, bound.property, bound.column));
        }
        if self.frames.ancestor_handling(self.frame, source).is_some() {
            self.outer_references.push(bound);
        }
        Translation::ClientEval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityType, PropertyDef};
    use crate::sql::SelectExpr;
    use relq_model::QuerySourceArena;

    fn model() -> Model {
        Model::new().with_entity(
            EntityType::new("User", "users")
                .with_property(PropertyDef::new("id", "id"))
                .with_property(PropertyDef::new("age", "age"))
                .with_key(vec!["id"]),
        )
    }

    fn setup() -> (Model, QuerySourceArena, QuerySource, FrameArena, FrameId) {
        let model = model();
        let mut sources = QuerySourceArena::new();
        let u = sources.create("u");
        let mut frames = FrameArena::new();
        let frame = frames.push(None);
        frames
            .frame_mut(frame)
            .add_query(u, SelectExpr::from_table("users", "u", u));
        (model, sources, u, frames, frame)
    }

    fn bindings(model: &Model, u: QuerySource) -> SourceBindings {
        use relq_model::{FromClause, QueryModel};
        SourceBindings::build(model, &QueryModel::new(FromClause::entity(u, "User"))).unwrap()
    }

    #[test]
    fn test_comparison_translates_to_column_and_literal() {
        let (model, _sources, u, frames, frame) = setup();
        let bindings = bindings(&model, u);
        let mut translator = SqlTranslator::new(&model, &bindings, &frames, frame);

        let expr = Expr::gt(Expr::property(u, "age"), Expr::literal(30i64));
        match translator.translate(&expr) {
            Translation::Translated(SqlExpr::Binary { op, .. }) => assert_eq!(op, BinaryOp::Gt),
            other => panic!("expected translated comparison, got {other:?}"),
        }
        assert_eq!(translator.bound_columns().len(), 1);
        assert_eq!(translator.bound_columns()[0].column, "age");
    }

    #[test]
    fn test_call_forces_client_eval() {
        let (model, _sources, u, frames, frame) = setup();
        let bindings = bindings(&model, u);
        let mut translator = SqlTranslator::new(&model, &bindings, &frames, frame);

        let expr = Expr::call("length", vec![Expr::property(u, "age")]);
        assert_eq!(translator.translate(&expr), Translation::ClientEval);
    }

    #[test]
    fn test_conjunction_splits_into_sql_and_residue() {
        let (model, _sources, u, frames, frame) = setup();
        let bindings = bindings(&model, u);
        let mut translator = SqlTranslator::new(&model, &bindings, &frames, frame);

        let server = Expr::gt(Expr::property(u, "age"), Expr::literal(30i64));
        let client = Expr::eq(
            Expr::call("length", vec![Expr::property(u, "id")]),
            Expr::literal(2i64),
        );
        let split = translator.translate_predicate(&Expr::and(server, client.clone()));

        assert!(split.sql.is_some());
        assert_eq!(split.residue, Some(client));
    }

    #[test]
    fn test_disjunction_is_all_or_nothing() {
        let (model, _sources, u, frames, frame) = setup();
        let bindings = bindings(&model, u);
        let mut translator = SqlTranslator::new(&model, &bindings, &frames, frame);

        let server = Expr::gt(Expr::property(u, "age"), Expr::literal(30i64));
        let client = Expr::call("length", vec![Expr::property(u, "id")]);
        let split = translator.translate_predicate(&Expr::or(server, client));

        assert!(split.sql.is_none());
        assert!(split.residue.is_some());
    }

    #[test]
    fn test_outer_source_records_outer_reference() {
        let (model, mut sources, u, mut frames, root) = setup();
        let bindings = bindings(&model, u);
        let _inner_source = sources.create("inner");
        let child = frames.push(Some(root));

        let mut translator = SqlTranslator::new(&model, &bindings, &frames, child);
        let expr = Expr::eq(Expr::property(u, "age"), Expr::literal(30i64));

        assert_eq!(translator.translate(&expr), Translation::ClientEval);
        assert_eq!(translator.outer_references().len(), 1);
        assert_eq!(translator.outer_references()[0].source, u);
    }

    #[test]
    fn test_unknown_property_is_client_eval() {
        let (model, _sources, u, frames, frame) = setup();
        let bindings = bindings(&model, u);
        let mut translator = SqlTranslator::new(&model, &bindings, &frames, frame);

        let expr = Expr::property(u, "nickname");
        assert_eq!(translator.translate(&expr), Translation::ClientEval);
        assert!(translator.bound_columns().is_empty());
    }
}
