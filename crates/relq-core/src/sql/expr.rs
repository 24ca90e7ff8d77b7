//! The relational expression vocabulary.
//!
//! These are the expressions a downstream SQL generator consumes: column
//! references, literals, binary/unary operators. Operator kinds are shared
//! with the generic tree; what distinguishes this vocabulary is that every
//! node is known to be expressible relationally.

use serde::{Deserialize, Serialize};

use relq_model::{BinaryOp, OrderDirection, QuerySource, UnaryOp, Value};

/// A relational-model expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlExpr {
    /// A column of a query source.
    Column {
        /// The source the column belongs to.
        source: QuerySource,
        /// Property name the column was bound from.
        property: String,
        /// Column name in the source's table.
        column: String,
    },
    /// A literal value.
    Literal(Value),
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<SqlExpr>,
        /// Right operand.
        right: Box<SqlExpr>,
    },
    /// A unary operation.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// The operand.
        operand: Box<SqlExpr>,
    },
}

impl SqlExpr {
    /// A column reference.
    pub fn column(
        source: QuerySource,
        property: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        SqlExpr::Column {
            source,
            property: property.into(),
            column: column.into(),
        }
    }

    /// A binary operation.
    pub fn binary(op: BinaryOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// A unary operation.
    pub fn unary(op: UnaryOp, operand: SqlExpr) -> Self {
        SqlExpr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    /// Conjoin two expressions with `AND`.
    pub fn and_also(left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::binary(BinaryOp::And, left, right)
    }

    /// A null test.
    pub fn is_null(operand: SqlExpr) -> Self {
        SqlExpr::unary(UnaryOp::IsNull, operand)
    }

    /// A non-null test.
    pub fn is_not_null(operand: SqlExpr) -> Self {
        SqlExpr::unary(UnaryOp::IsNotNull, operand)
    }
}

/// One `ORDER BY` term of a select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlOrdering {
    /// The expression to sort by.
    pub expression: SqlExpr,
    /// Sort direction.
    pub direction: OrderDirection,
}

impl SqlOrdering {
    /// Create an ordering term.
    pub fn new(expression: SqlExpr, direction: OrderDirection) -> Self {
        Self {
            expression,
            direction,
        }
    }
}
