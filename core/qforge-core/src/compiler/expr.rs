//! Expression code generation
//!
//! Compiles bound expressions into SQL-value instructions over the current
//! row's registers. Column references resolve to the row registers
//! directly (no copies); every other node allocates a fresh register for
//! its result. Predicates compile to a guarded continuation: evaluate,
//! collapse Null to false, jump past the downstream consume when false.

use crate::compiler::codegen::CodeGen;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{BinaryOperator, Expr, ScalarFunction};
use crate::runtime::Value;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::{FunctionBuilder, Label};
use crate::vm::program::{Constant, LocalId, Operand, RegType};

/// Compile an expression, returning the register holding its value.
pub fn compile_expr(
    cg: &CodeGen,
    fb: &mut FunctionBuilder,
    expr: &Expr,
    row: &[LocalId],
) -> ForgeResult<LocalId> {
    match expr {
        Expr::Column(idx) => row.get(*idx).copied().ok_or(ForgeError::UnknownColumn {
            index: *idx,
            context: "expression codegen".to_string(),
        }),
        Expr::Literal(value) => compile_literal(cg, fb, value),
        Expr::BinaryOp { left, op, right } => {
            let lhs = compile_expr(cg, fb, left, row)?;
            let rhs = compile_expr(cg, fb, right, row)?;
            let dst = fb.new_local(RegType::Val);
            fb.emit(
                binary_bytecode(*op),
                [Operand::Local(dst), Operand::Local(lhs), Operand::Local(rhs)],
            );
            Ok(dst)
        }
        Expr::Not(inner) => {
            let src = compile_expr(cg, fb, inner, row)?;
            let dst = fb.new_local(RegType::Val);
            fb.emit(Bytecode::SqlNot, [Operand::Local(dst), Operand::Local(src)]);
            Ok(dst)
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            let src = compile_expr(cg, fb, inner, row)?;
            let dst = fb.new_local(RegType::Val);
            let op = if matches!(expr, Expr::IsNull(_)) {
                Bytecode::ValIsNull
            } else {
                Bytecode::ValIsNotNull
            };
            fb.emit(op, [Operand::Local(dst), Operand::Local(src)]);
            Ok(dst)
        }
        Expr::ScalarFunc { func, args } => {
            let mut compiled = Vec::with_capacity(args.len());
            for arg in args {
                compiled.push(compile_expr(cg, fb, arg, row)?);
            }
            let dst = fb.new_local(RegType::Val);
            let mut operands = vec![Operand::Local(dst)];
            operands.extend(compiled.into_iter().map(Operand::Local));
            fb.emit(scalar_bytecode(*func), operands);
            Ok(dst)
        }
    }
}

/// Compile a predicate into a guard: evaluates the expression, forces
/// Null to false, and jumps to the returned label when the row does not
/// pass. The caller emits the downstream consume and then binds the
/// label.
pub fn compile_guard(
    cg: &CodeGen,
    fb: &mut FunctionBuilder,
    predicate: &Expr,
    row: &[LocalId],
) -> ForgeResult<Label> {
    let cond = compile_expr(cg, fb, predicate, row)?;
    let truth = fb.new_local(RegType::Bool);
    fb.emit(
        Bytecode::ForceBoolTruth,
        [Operand::Local(truth), Operand::Local(cond)],
    );
    let skip = fb.create_label();
    fb.emit_jump_if_false(truth, skip);
    Ok(skip)
}

fn compile_literal(cg: &CodeGen, fb: &mut FunctionBuilder, value: &Value) -> ForgeResult<LocalId> {
    let dst = fb.new_local(RegType::Val);
    match value {
        Value::Null => fb.emit(Bytecode::AssignNull, [Operand::Local(dst)]),
        Value::Bool(b) => fb.emit(
            Bytecode::AssignImmBool,
            [Operand::Local(dst), Operand::Imm(*b as i64)],
        ),
        Value::Int(i) => fb.emit(
            Bytecode::AssignImmInt,
            [Operand::Local(dst), Operand::Imm(*i)],
        ),
        Value::Real(r) => fb.emit(
            Bytecode::AssignImmReal,
            [Operand::Local(dst), Operand::FImm(*r)],
        ),
        Value::Str(s) => {
            let id = cg.add_constant(Constant::Str(s.clone()));
            fb.emit(
                Bytecode::LoadConstStr,
                [Operand::Local(dst), Operand::ConstRef(id)],
            );
        }
    }
    Ok(dst)
}

fn binary_bytecode(op: BinaryOperator) -> Bytecode {
    match op {
        BinaryOperator::Plus => Bytecode::SqlAdd,
        BinaryOperator::Minus => Bytecode::SqlSub,
        BinaryOperator::Multiply => Bytecode::SqlMul,
        BinaryOperator::Divide => Bytecode::SqlDiv,
        BinaryOperator::Modulo => Bytecode::SqlRem,
        BinaryOperator::Eq => Bytecode::SqlEq,
        BinaryOperator::NotEq => Bytecode::SqlNe,
        BinaryOperator::Lt => Bytecode::SqlLt,
        BinaryOperator::LtEq => Bytecode::SqlLe,
        BinaryOperator::Gt => Bytecode::SqlGt,
        BinaryOperator::GtEq => Bytecode::SqlGe,
        BinaryOperator::And => Bytecode::SqlAnd,
        BinaryOperator::Or => Bytecode::SqlOr,
    }
}

fn scalar_bytecode(func: ScalarFunction) -> Bytecode {
    match func {
        ScalarFunction::Upper => Bytecode::Upper,
        ScalarFunction::Lower => Bytecode::Lower,
        ScalarFunction::Length => Bytecode::StrLength,
        ScalarFunction::Substring => Bytecode::Substring,
        ScalarFunction::Concat => Bytecode::Concat,
        ScalarFunction::Trim => Bytecode::Trim,
        ScalarFunction::Repeat => Bytecode::Repeat,
        ScalarFunction::Reverse => Bytecode::Reverse,
        ScalarFunction::Left => Bytecode::StrLeft,
        ScalarFunction::Right => Bytecode::StrRight,
        ScalarFunction::Abs => Bytecode::Abs,
        ScalarFunction::Sqrt => Bytecode::Sqrt,
        ScalarFunction::Ceil => Bytecode::Ceil,
        ScalarFunction::Floor => Bytecode::Floor,
        ScalarFunction::Round => Bytecode::Round,
        ScalarFunction::Exp => Bytecode::Exp,
        ScalarFunction::Ln => Bytecode::Ln,
        ScalarFunction::Log2 => Bytecode::Log2,
        ScalarFunction::Log10 => Bytecode::Log10,
        ScalarFunction::Sin => Bytecode::Sin,
        ScalarFunction::Cos => Bytecode::Cos,
        ScalarFunction::Tan => Bytecode::Tan,
        ScalarFunction::Pow => Bytecode::Pow,
    }
}

/// Split a conjunctive predicate into its AND-ed parts.
pub fn split_conjuncts(expr: &Expr) -> Vec<&Expr> {
    let mut parts = Vec::new();
    collect_conjuncts(expr, &mut parts);
    parts
}

fn collect_conjuncts<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other),
    }
}

/// A conjunct a scan can evaluate as a vectorized batch filter:
/// `column <cmp> literal` (either operand order).
pub fn as_vector_filter(expr: &Expr) -> Option<(usize, BinaryOperator, Value)> {
    let Expr::BinaryOp { left, op, right } = expr else {
        return None;
    };
    if !op.is_comparison() {
        return None;
    }
    match (left.as_ref(), right.as_ref()) {
        (Expr::Column(col), Expr::Literal(v)) => Some((*col, *op, v.clone())),
        (Expr::Literal(v), Expr::Column(col)) => Some((*col, flip(*op), v.clone())),
        _ => None,
    }
}

fn flip(op: BinaryOperator) -> BinaryOperator {
    match op {
        BinaryOperator::Lt => BinaryOperator::Gt,
        BinaryOperator::LtEq => BinaryOperator::GtEq,
        BinaryOperator::Gt => BinaryOperator::Lt,
        BinaryOperator::GtEq => BinaryOperator::LtEq,
        other => other,
    }
}

/// Batch-filter opcode for a comparison operator.
pub fn filter_bytecode(op: BinaryOperator) -> Option<Bytecode> {
    Some(match op {
        BinaryOperator::Eq => Bytecode::BatchFilterEq,
        BinaryOperator::NotEq => Bytecode::BatchFilterNe,
        BinaryOperator::Lt => Bytecode::BatchFilterLt,
        BinaryOperator::LtEq => Bytecode::BatchFilterLe,
        BinaryOperator::Gt => Bytecode::BatchFilterGt,
        BinaryOperator::GtEq => Bytecode::BatchFilterGe,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjunct_splitting_flattens_and_chains() {
        let e = Expr::binary(
            Expr::binary(Expr::col(0), BinaryOperator::Lt, Expr::lit(Value::Int(5))),
            BinaryOperator::And,
            Expr::binary(
                Expr::IsNotNull(Box::new(Expr::col(1))),
                BinaryOperator::And,
                Expr::binary(Expr::col(1), BinaryOperator::Gt, Expr::lit(Value::Int(0))),
            ),
        );
        assert_eq!(split_conjuncts(&e).len(), 3);
    }

    #[test]
    fn vector_filter_recognizes_column_literal_shapes() {
        let e = Expr::binary(Expr::col(2), BinaryOperator::Lt, Expr::lit(Value::Int(4)));
        assert_eq!(
            as_vector_filter(&e),
            Some((2, BinaryOperator::Lt, Value::Int(4)))
        );

        // literal < column flips to column > literal
        let e = Expr::binary(Expr::lit(Value::Int(4)), BinaryOperator::Lt, Expr::col(2));
        assert_eq!(
            as_vector_filter(&e),
            Some((2, BinaryOperator::Gt, Value::Int(4)))
        );

        let e = Expr::binary(Expr::col(0), BinaryOperator::Plus, Expr::lit(Value::Int(1)));
        assert_eq!(as_vector_filter(&e), None);
    }
}
