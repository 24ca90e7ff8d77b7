//! Null-semantics normalization of select predicates.
//!
//! In-process comparison semantics treat two nulls as equal; database
//! three-valued logic does not. Unless a query opts into relational null
//! semantics, equality between two nullable columns is expanded so the store
//! returns the rows the client evaluator would.

use relq_model::{BinaryOp, Value};

use crate::sql::SqlExpr;

/// Rewrite a predicate for the requested null semantics.
///
/// With `use_relational_nulls` the predicate is left alone. Otherwise
/// column-to-column equality and inequality are expanded to match two-sided
/// null equality.
pub fn normalize_predicate(expr: SqlExpr, use_relational_nulls: bool) -> SqlExpr {
    if use_relational_nulls {
        return expr;
    }
    rewrite(expr)
}

fn rewrite(expr: SqlExpr) -> SqlExpr {
    match expr {
        SqlExpr::Binary { op, left, right } => {
            let left = rewrite(*left);
            let right = rewrite(*right);
            match op {
                BinaryOp::Eq => expand_equality(left, right),
                BinaryOp::Ne => expand_inequality(left, right),
                _ => SqlExpr::binary(op, left, right),
            }
        }
        SqlExpr::Unary { op, operand } => SqlExpr::unary(op, rewrite(*operand)),
        other => other,
    }
}

fn expand_equality(left: SqlExpr, right: SqlExpr) -> SqlExpr {
    match (&left, &right) {
        // Comparison against a null literal is a plain null test.
        (_, SqlExpr::Literal(Value::Null)) => SqlExpr::is_null(left),
        (SqlExpr::Literal(Value::Null), _) => SqlExpr::is_null(right),
        // Two columns: equal values, or both null.
        (SqlExpr::Column { .. }, SqlExpr::Column { .. }) => SqlExpr::binary(
            BinaryOp::Or,
            SqlExpr::binary(BinaryOp::Eq, left.clone(), right.clone()),
            SqlExpr::and_also(SqlExpr::is_null(left), SqlExpr::is_null(right)),
        ),
        _ => SqlExpr::binary(BinaryOp::Eq, left, right),
    }
}

fn expand_inequality(left: SqlExpr, right: SqlExpr) -> SqlExpr {
    match (&left, &right) {
        (_, SqlExpr::Literal(Value::Null)) => SqlExpr::is_not_null(left),
        (SqlExpr::Literal(Value::Null), _) => SqlExpr::is_not_null(right),
        // Two columns: different non-null values, or exactly one null.
        (SqlExpr::Column { .. }, SqlExpr::Column { .. }) => SqlExpr::binary(
            BinaryOp::Or,
            SqlExpr::binary(
                BinaryOp::Or,
                SqlExpr::and_also(
                    SqlExpr::binary(BinaryOp::Ne, left.clone(), right.clone()),
                    SqlExpr::and_also(
                        SqlExpr::is_not_null(left.clone()),
                        SqlExpr::is_not_null(right.clone()),
                    ),
                ),
                SqlExpr::and_also(SqlExpr::is_null(left.clone()), SqlExpr::is_not_null(right.clone())),
            ),
            SqlExpr::and_also(SqlExpr::is_not_null(left), SqlExpr::is_null(right)),
        ),
        _ => SqlExpr::binary(BinaryOp::Ne, left, right),
    }
}
