//! Index scan translator
//!
//! Point and range lookups through the index collaborator. Key bounds are
//! constant expressions evaluated once before the cursor is positioned;
//! the loop then pulls full table rows in index order.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::expr::compile_expr;
use crate::compiler::translators::copy_into_block;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{Expr, IndexScanSpec, PlanNode, Schema};
use crate::storage::IndexId;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{LocalId, Operand, RegType};

pub struct IndexScanTranslator {
    node: NodeId,
    index: IndexId,
    arity: usize,
    spec: IndexScanSpec,
}

impl IndexScanTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::IndexScan { index, schema, spec, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected IndexScan".to_string()));
        };
        // Key bounds must be constant: typing them against an empty schema
        // rejects any column reference.
        let empty = Schema::default();
        let context = format!("index-scan bounds of node #{node}");
        for expr in spec_exprs(spec) {
            expr.infer_type(&empty, &context)?;
        }
        Ok(Self {
            node,
            index: *index,
            arity: schema.arity(),
            spec: spec.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn produce(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        let iter = fb.new_local(RegType::Iter);
        fb.emit(
            Bytecode::IndexIterInit,
            [Operand::Local(iter), Operand::Count(self.index)],
        );

        match &self.spec {
            IndexScanSpec::Key(key) => {
                let block = compile_bound(cg, fb, key)?;
                fb.emit(
                    Bytecode::IndexIterScanKey,
                    [
                        Operand::Local(iter),
                        Operand::Local(block),
                        Operand::Count(key.len() as u32),
                    ],
                );
            }
            IndexScanSpec::Ascending { low, high, limit }
            | IndexScanSpec::Descending { low, high, limit } => {
                let low_block = compile_bound(cg, fb, low)?;
                let high_block = compile_bound(cg, fb, high)?;
                let op = if matches!(self.spec, IndexScanSpec::Ascending { .. }) {
                    Bytecode::IndexIterScanAscending
                } else {
                    Bytecode::IndexIterScanDescending
                };
                fb.emit(
                    op,
                    [
                        Operand::Local(iter),
                        Operand::Local(low_block),
                        Operand::Count(low.len() as u32),
                        Operand::Local(high_block),
                        Operand::Count(high.len() as u32),
                        Operand::Count(limit.unwrap_or(0) as u32),
                    ],
                );
            }
        }

        let row: Vec<LocalId> = (0..self.arity).map(|_| fb.new_local(RegType::Val)).collect();
        let has = fb.new_local(RegType::Bool);
        let head = fb.create_label();
        let exit = fb.create_label();
        fb.bind_label(head);
        fb.emit(
            Bytecode::IndexIterAdvance,
            [Operand::Local(has), Operand::Local(iter)],
        );
        fb.emit_jump_if_false(has, exit);
        for (col, reg) in row.iter().enumerate() {
            fb.emit(
                Bytecode::IndexIterGet,
                [
                    Operand::Local(*reg),
                    Operand::Local(iter),
                    Operand::Count(col as u32),
                ],
            );
        }
        cg.consume_parent(fb, self.node, &row)?;
        fb.emit_jump(head);
        fb.bind_label(exit);
        fb.emit(Bytecode::IndexIterFree, [Operand::Local(iter)]);
        Ok(())
    }
}

fn spec_exprs(spec: &IndexScanSpec) -> Vec<&Expr> {
    match spec {
        IndexScanSpec::Key(key) => key.iter().collect(),
        IndexScanSpec::Ascending { low, high, .. } | IndexScanSpec::Descending { low, high, .. } => {
            low.iter().chain(high.iter()).collect()
        }
    }
}

fn compile_bound(cg: &CodeGen, fb: &mut FunctionBuilder, exprs: &[Expr]) -> ForgeResult<LocalId> {
    let mut regs = Vec::with_capacity(exprs.len());
    for expr in exprs {
        regs.push(compile_expr(cg, fb, expr, &[])?);
    }
    Ok(copy_into_block(fb, &regs))
}
