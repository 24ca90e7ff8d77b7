//! The generic scalar expression tree.
//!
//! This is the provider-agnostic expression vocabulary produced by the
//! upstream parser: references to query sources, property accesses,
//! literals, operators, opaque function calls, and nested subqueries.
//! The relational compiler translates fragments of this tree into its own
//! relational vocabulary where it can, and evaluates the rest client-side.

use serde::{Deserialize, Serialize};

use crate::query_model::QueryModel;
use crate::source::QuerySource;
use crate::value::Value;

/// Binary operators in the generic expression tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Logical conjunction.
    And,
    /// Logical disjunction.
    Or,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
}

impl BinaryOp {
    /// Check if this operator produces a boolean result.
    pub fn is_predicate(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

/// Unary operators in the generic expression tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Neg,
    /// Null test.
    IsNull,
    /// Non-null test.
    IsNotNull,
}

/// A fragment of the generic query expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a query source as a whole (an entity-typed reference).
    SourceRef(QuerySource),
    /// Property access on a query source, e.g. `u.name`.
    Property {
        /// The source the property is read from.
        source: QuerySource,
        /// Property name on the source's entity type.
        name: String,
    },
    /// A literal value.
    Literal(Value),
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// A unary operation.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// The operand.
        operand: Box<Expr>,
    },
    /// A call to a function the relational layer does not understand.
    ///
    /// Calls never translate; they force client evaluation of the smallest
    /// enclosing clause fragment.
    Call {
        /// Function name, resolved by the client-side evaluator.
        function: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// A nested query producing a sequence of results.
    SubQuery(Box<QueryModel>),
}

impl Expr {
    /// Property access on a source.
    pub fn property(source: QuerySource, name: impl Into<String>) -> Self {
        Expr::Property {
            source,
            name: name.into(),
        }
    }

    /// A literal value.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Equality comparison.
    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    /// Inequality comparison.
    pub fn ne(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Ne, left, right)
    }

    /// Greater-than comparison.
    pub fn gt(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Gt, left, right)
    }

    /// Less-than comparison.
    pub fn lt(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, left, right)
    }

    /// Logical conjunction.
    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::And, left, right)
    }

    /// Logical disjunction.
    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Or, left, right)
    }

    /// Arbitrary binary operation.
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Unary operation.
    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    /// Logical negation.
    pub fn not(operand: Expr) -> Self {
        Expr::unary(UnaryOp::Not, operand)
    }

    /// Null test.
    pub fn is_null(operand: Expr) -> Self {
        Expr::unary(UnaryOp::IsNull, operand)
    }

    /// A call to a named function.
    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            function: function.into(),
            args,
        }
    }

    /// Collect every query source referenced anywhere in this fragment.
    ///
    /// Subquery bodies are included: a correlated reference inside a nested
    /// query still counts as a use of the outer source.
    pub fn referenced_sources(&self) -> Vec<QuerySource> {
        let mut sources = Vec::new();
        self.collect_sources(&mut sources);
        sources
    }

    fn collect_sources(&self, out: &mut Vec<QuerySource>) {
        match self {
            Expr::SourceRef(source) | Expr::Property { source, .. } => {
                if !out.contains(source) {
                    out.push(*source);
                }
            }
            Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.collect_sources(out);
                right.collect_sources(out);
            }
            Expr::Unary { operand, .. } => operand.collect_sources(out),
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_sources(out);
                }
            }
            Expr::SubQuery(model) => model.collect_expression_sources(out),
        }
    }
}
