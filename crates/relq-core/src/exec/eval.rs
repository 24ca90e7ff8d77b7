//! Client-side expression evaluation.
//!
//! Evaluates generic expressions over a per-row [`Scope`]: entities answer
//! property reads directly, buffer views answer them through their column
//! maps. The value operators here are shared with the row store, with one
//! exception: client equality uses in-process null semantics (two nulls are
//! equal), while the store keeps three-valued comparisons and relies on
//! predicate normalization to select the same rows.

use relq_model::{BinaryOp, Expr, UnaryOp, Value};

use crate::error::Error;
use crate::shaping::{Scope, Shaped};

/// Evaluate an expression against a row scope.
pub fn eval_expr(expr: &Expr, scope: &Scope) -> Result<Value, Error> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::SourceRef(source) => match scope.get(*source) {
            Some(Shaped::Value(value)) => Ok(value.clone()),
            Some(_) => Err(Error::TypeMismatch(format!(
                "source {source:?} is not a scalar"
            ))),
            None => Err(Error::InvalidQuery(format!(
                "source {source:?} is not in scope"
            ))),
        },
        Expr::Property { source, name } => read_property(scope, *source, name),
        Expr::Binary { op, left, right } => {
            let left = eval_expr(left, scope)?;
            let right = eval_expr(right, scope)?;
            match op {
                BinaryOp::Eq => Ok(Value::Bool(in_process_equal(&left, &right))),
                BinaryOp::Ne => Ok(Value::Bool(!in_process_equal(&left, &right))),
                _ => apply_binary(*op, &left, &right),
            }
        }
        Expr::Unary { op, operand } => {
            let operand = eval_expr(operand, scope)?;
            apply_unary(*op, &operand)
        }
        Expr::Call { function, args } => eval_call(function, args, scope),
        Expr::SubQuery(_) => Err(Error::InvalidQuery(
            "nested queries cannot be evaluated as scalar expressions".to_string(),
        )),
    }
}

/// Evaluate a predicate against a row scope; null means no match.
pub fn eval_bool(expr: &Expr, scope: &Scope) -> Result<bool, Error> {
    Ok(truthy(&eval_expr(expr, scope)?))
}

fn read_property(scope: &Scope, source: relq_model::QuerySource, name: &str) -> Result<Value, Error> {
    match scope.get(source) {
        Some(Shaped::Entity(entity)) => {
            entity
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownProperty {
                    entity: entity.entity_type.clone(),
                    property: name.to_string(),
                })
        }
        Some(Shaped::Buffer(view)) => view.get(name).cloned().ok_or_else(|| {
            Error::InvalidQuery(format!(
                "property '{name}' was not projected for client evaluation"
            ))
        }),
        Some(_) => Err(Error::TypeMismatch(format!(
            "source {source:?} has no readable properties"
        ))),
        None => Err(Error::InvalidQuery(format!(
            "source {source:?} is not in scope"
        ))),
    }
}

/// In-process equality for client expressions: two nulls are equal to each
/// other, one null never equals a value.
fn in_process_equal(left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return left.is_null() && right.is_null();
    }
    values_equal(left, right)
}

fn eval_call(function: &str, args: &[Expr], scope: &Scope) -> Result<Value, Error> {
    // Sequence cardinality reads the scope directly rather than coercing the
    // group to a scalar first.
    if function == "count" {
        if let [Expr::SourceRef(source)] = args {
            return match scope.get(*source) {
                Some(Shaped::Sequence(items)) => Ok(Value::Int64(items.len() as i64)),
                Some(_) => Err(Error::TypeMismatch(format!(
                    "source {source:?} is not a sequence"
                ))),
                None => Err(Error::InvalidQuery(format!(
                    "source {source:?} is not in scope"
                ))),
            };
        }
    }
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval_expr(arg, scope)?);
    }
    match (function, values.as_slice()) {
        ("length" | "lower" | "upper" | "abs", [Value::Null]) => Ok(Value::Null),
        ("length", [Value::String(s)]) => Ok(Value::Int64(s.chars().count() as i64)),
        ("lower", [Value::String(s)]) => Ok(Value::String(s.to_lowercase())),
        ("upper", [Value::String(s)]) => Ok(Value::String(s.to_uppercase())),
        ("abs", [Value::Int32(v)]) => Ok(Value::Int32(v.abs())),
        ("abs", [Value::Int64(v)]) => Ok(Value::Int64(v.abs())),
        ("abs", [Value::Float64(v)]) => Ok(Value::Float64(v.abs())),
        ("length" | "lower" | "upper" | "abs", _) => Err(Error::TypeMismatch(format!(
            "invalid argument for '{function}'"
        ))),
        _ => Err(Error::UnknownFunction(function.to_string())),
    }
}

/// Apply a binary operator to two values.
///
/// Comparisons against null yield null; logical operators treat null as
/// false. Numerics coerce across integer widths and into floats.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, Error> {
    match op {
        BinaryOp::And => Ok(Value::Bool(truthy(left) && truthy(right))),
        BinaryOp::Or => Ok(Value::Bool(truthy(left) || truthy(right))),
        BinaryOp::Eq | BinaryOp::Ne => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let equal = values_equal(left, right);
            Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let ordering = compare_values(left, right).ok_or_else(|| {
                Error::TypeMismatch(format!("cannot compare {left:?} with {right:?}"))
            })?;
            let matched = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(matched))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            arithmetic(op, left, right)
        }
    }
}

/// Apply a unary operator to a value.
pub fn apply_unary(op: UnaryOp, operand: &Value) -> Result<Value, Error> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(operand))),
        UnaryOp::Neg => match operand {
            Value::Null => Ok(Value::Null),
            Value::Int32(v) => Ok(Value::Int32(-v)),
            Value::Int64(v) => Ok(Value::Int64(-v)),
            Value::Float64(v) => Ok(Value::Float64(-v)),
            other => Err(Error::TypeMismatch(format!("cannot negate {other:?}"))),
        },
        UnaryOp::IsNull => Ok(Value::Bool(operand.is_null())),
        UnaryOp::IsNotNull => Ok(Value::Bool(!operand.is_null())),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, Error> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        if !matches!(left, Value::Float64(_)) && !matches!(right, Value::Float64(_)) {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => a.checked_div(b),
                _ => unreachable!(),
            };
            return result.map(Value::Int64).ok_or_else(|| {
                Error::TypeMismatch(format!("integer arithmetic failed: {a} {op:?} {b}"))
            });
        }
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ => unreachable!(),
        };
        return Ok(Value::Float64(result));
    }
    Err(Error::TypeMismatch(format!(
        "cannot apply {op:?} to {left:?} and {right:?}"
    )))
}

/// Value equality with numeric coercion; nulls never equal anything,
/// including each other.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return a == b;
    }
    left == right
}

/// Ordering between two values; null sorts before everything.
pub fn compare_values(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (left.is_null(), right.is_null()) {
        (true, true) => return Some(Ordering::Equal),
        (true, false) => return Some(Ordering::Less),
        (false, true) => return Some(Ordering::Greater),
        (false, false) => {}
    }
    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Null and non-boolean values are not matches.
pub fn truthy(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}
