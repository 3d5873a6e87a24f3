//! Bound expressions
//!
//! Expressions reference input columns by index and are typed against the
//! operator's input schema before any code is generated. Inference failures
//! are compile-time configuration errors carrying the offending context.

use crate::error::{ForgeError, ForgeResult};
use crate::plan::types::{Schema, SqlType};
use crate::runtime::Value;

/// Binary operators over SQL values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

/// Scalar builtins (row-at-a-time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunction {
    // String functions
    Upper,
    Lower,
    Length,
    Substring,
    Concat,
    Trim,
    Repeat,
    Reverse,
    Left,
    Right,

    // Math functions
    Abs,
    Sqrt,
    Ceil,
    Floor,
    Round,
    Exp,
    Ln,
    Log2,
    Log10,
    Sin,
    Cos,
    Tan,
    Pow,
}

impl ScalarFunction {
    /// Fixed argument count; calls with any other arity are rejected at
    /// compile time.
    pub fn arity(self) -> usize {
        match self {
            ScalarFunction::Substring => 3,
            ScalarFunction::Concat
            | ScalarFunction::Repeat
            | ScalarFunction::Left
            | ScalarFunction::Right
            | ScalarFunction::Pow => 2,
            _ => 1,
        }
    }
}

/// A bound expression over an input row.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Input column reference by index
    Column(usize),
    /// Literal value
    Literal(Value),
    /// Binary operation
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// Logical negation (three-valued)
    Not(Box<Expr>),
    /// IS NULL
    IsNull(Box<Expr>),
    /// IS NOT NULL
    IsNotNull(Box<Expr>),
    /// Scalar builtin call
    ScalarFunc {
        func: ScalarFunction,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn col(idx: usize) -> Expr {
        Expr::Column(idx)
    }

    pub fn lit(value: Value) -> Expr {
        Expr::Literal(value)
    }

    pub fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Infer the expression's type against `input`, validating column
    /// references, operator operand types, and builtin arities.
    pub fn infer_type(&self, input: &Schema, context: &str) -> ForgeResult<SqlType> {
        match self {
            Expr::Column(idx) => input
                .column(*idx)
                .map(|c| c.ty)
                .ok_or(ForgeError::UnknownColumn {
                    index: *idx,
                    context: context.to_string(),
                }),
            Expr::Literal(value) => Ok(value.sql_type().unwrap_or(SqlType::Int)),
            Expr::BinaryOp { left, op, right } => {
                let lt = left.infer_type(input, context)?;
                let rt = right.infer_type(input, context)?;
                infer_binary(lt, *op, rt, context)
            }
            Expr::Not(inner) => {
                let ty = inner.infer_type(input, context)?;
                expect_type(SqlType::Bool, ty, context)?;
                Ok(SqlType::Bool)
            }
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
                inner.infer_type(input, context)?;
                Ok(SqlType::Bool)
            }
            Expr::ScalarFunc { func, args } => {
                if args.len() != func.arity() {
                    return Err(ForgeError::InvalidPlan(format!(
                        "{func:?} takes {} argument(s), got {} at {context}",
                        func.arity(),
                        args.len()
                    )));
                }
                let arg_types = args
                    .iter()
                    .map(|a| a.infer_type(input, context))
                    .collect::<ForgeResult<Vec<_>>>()?;
                infer_scalar_func(*func, &arg_types, context)
            }
        }
    }
}

fn expect_type(expected: SqlType, actual: SqlType, context: &str) -> ForgeResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ForgeError::TypeMismatch {
            expected: expected.name().to_string(),
            actual: actual.name().to_string(),
            context: context.to_string(),
        })
    }
}

fn expect_numeric(actual: SqlType, context: &str) -> ForgeResult<()> {
    if matches!(actual, SqlType::Int | SqlType::Real) {
        Ok(())
    } else {
        Err(ForgeError::TypeMismatch {
            expected: "Int or Real".to_string(),
            actual: actual.name().to_string(),
            context: context.to_string(),
        })
    }
}

fn infer_binary(
    lt: SqlType,
    op: BinaryOperator,
    rt: SqlType,
    context: &str,
) -> ForgeResult<SqlType> {
    if op.is_logical() {
        expect_type(SqlType::Bool, lt, context)?;
        expect_type(SqlType::Bool, rt, context)?;
        return Ok(SqlType::Bool);
    }
    if op.is_comparison() {
        let comparable = lt == rt
            || (matches!(lt, SqlType::Int | SqlType::Real)
                && matches!(rt, SqlType::Int | SqlType::Real));
        if !comparable {
            return Err(ForgeError::TypeMismatch {
                expected: lt.name().to_string(),
                actual: rt.name().to_string(),
                context: context.to_string(),
            });
        }
        return Ok(SqlType::Bool);
    }
    // Arithmetic: numeric operands, Real wins promotion
    expect_numeric(lt, context)?;
    expect_numeric(rt, context)?;
    if lt == SqlType::Real || rt == SqlType::Real {
        Ok(SqlType::Real)
    } else {
        Ok(SqlType::Int)
    }
}

fn infer_scalar_func(
    func: ScalarFunction,
    args: &[SqlType],
    context: &str,
) -> ForgeResult<SqlType> {
    use ScalarFunction::*;
    match func {
        Upper | Lower | Trim | Reverse => {
            expect_type(SqlType::Str, args[0], context)?;
            Ok(SqlType::Str)
        }
        Length => {
            expect_type(SqlType::Str, args[0], context)?;
            Ok(SqlType::Int)
        }
        Substring => {
            expect_type(SqlType::Str, args[0], context)?;
            expect_type(SqlType::Int, args[1], context)?;
            expect_type(SqlType::Int, args[2], context)?;
            Ok(SqlType::Str)
        }
        Concat => {
            expect_type(SqlType::Str, args[0], context)?;
            expect_type(SqlType::Str, args[1], context)?;
            Ok(SqlType::Str)
        }
        Repeat | Left | Right => {
            expect_type(SqlType::Str, args[0], context)?;
            expect_type(SqlType::Int, args[1], context)?;
            Ok(SqlType::Str)
        }
        Abs => {
            expect_numeric(args[0], context)?;
            Ok(args[0])
        }
        Pow => {
            expect_numeric(args[0], context)?;
            expect_numeric(args[1], context)?;
            Ok(SqlType::Real)
        }
        Sqrt | Ceil | Floor | Round | Exp | Ln | Log2 | Log10 | Sin | Cos | Tan => {
            expect_numeric(args[0], context)?;
            Ok(SqlType::Real)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::Column;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("a", SqlType::Int),
            Column::new("b", SqlType::Real),
            Column::new("s", SqlType::Str),
        ])
    }

    #[test]
    fn column_reference_types() {
        assert_eq!(
            Expr::col(1).infer_type(&schema(), "t").unwrap(),
            SqlType::Real
        );
        assert!(matches!(
            Expr::col(9).infer_type(&schema(), "t"),
            Err(ForgeError::UnknownColumn { index: 9, .. })
        ));
    }

    #[test]
    fn arithmetic_promotes_to_real() {
        let e = Expr::binary(Expr::col(0), BinaryOperator::Plus, Expr::col(1));
        assert_eq!(e.infer_type(&schema(), "t").unwrap(), SqlType::Real);

        let e = Expr::binary(Expr::col(0), BinaryOperator::Multiply, Expr::col(0));
        assert_eq!(e.infer_type(&schema(), "t").unwrap(), SqlType::Int);
    }

    #[test]
    fn comparison_requires_compatible_operands() {
        let ok = Expr::binary(Expr::col(0), BinaryOperator::Lt, Expr::col(1));
        assert_eq!(ok.infer_type(&schema(), "t").unwrap(), SqlType::Bool);

        let bad = Expr::binary(Expr::col(0), BinaryOperator::Eq, Expr::col(2));
        assert!(matches!(
            bad.infer_type(&schema(), "t"),
            Err(ForgeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn logical_operands_must_be_bool() {
        let bad = Expr::binary(Expr::col(0), BinaryOperator::And, Expr::col(0));
        assert!(bad.infer_type(&schema(), "t").is_err());
    }

    #[test]
    fn scalar_func_arity_is_checked() {
        let bad = Expr::ScalarFunc {
            func: ScalarFunction::Substring,
            args: vec![Expr::col(2)],
        };
        assert!(matches!(
            bad.infer_type(&schema(), "t"),
            Err(ForgeError::InvalidPlan(_))
        ));
    }

    #[test]
    fn string_builtins() {
        let e = Expr::ScalarFunc {
            func: ScalarFunction::Length,
            args: vec![Expr::col(2)],
        };
        assert_eq!(e.infer_type(&schema(), "t").unwrap(), SqlType::Int);
    }
}
