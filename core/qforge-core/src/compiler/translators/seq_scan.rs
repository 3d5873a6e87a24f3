//! Sequential scan translator
//!
//! The canonical pipeline source: a two-level loop over batches and the
//! rows their selection vectors admit. Predicate conjuncts of the shape
//! `column <cmp> literal` run as vectorized batch filters right after the
//! batch is fetched; everything else evaluates per row as a guarded
//! continuation before the consume chain fires.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::expr::{
    as_vector_filter, compile_expr, compile_guard, filter_bytecode, split_conjuncts,
};
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{BinaryOperator, Expr, PlanNode, SqlType};
use crate::runtime::Value;
use crate::storage::TableId;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{LocalId, Operand, RegType};

pub struct SeqScanTranslator {
    node: NodeId,
    table: TableId,
    arity: usize,
    /// `column <cmp> literal` conjuncts, applied batch-at-a-time
    vector_filters: Vec<(usize, BinaryOperator, Value)>,
    /// Remaining conjuncts, applied row-at-a-time
    residuals: Vec<Expr>,
    pub parallel: bool,
}

impl SeqScanTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::SeqScan {
            table,
            schema,
            predicate,
            parallel,
        } = arena.node(node)
        else {
            return Err(ForgeError::InvalidPlan("expected SeqScan".to_string()));
        };

        let mut vector_filters = Vec::new();
        let mut residuals = Vec::new();
        if let Some(predicate) = predicate {
            let ty = predicate.infer_type(schema, &format!("scan predicate of node #{node}"))?;
            if ty != SqlType::Bool {
                return Err(ForgeError::TypeMismatch {
                    expected: "Bool".to_string(),
                    actual: ty.name().to_string(),
                    context: format!("scan predicate of node #{node}"),
                });
            }
            for conjunct in split_conjuncts(predicate) {
                match as_vector_filter(conjunct) {
                    Some(filter) => vector_filters.push(filter),
                    None => residuals.push(conjunct.clone()),
                }
            }
        }

        Ok(Self {
            node,
            table: *table,
            arity: schema.arity(),
            vector_filters,
            residuals,
            parallel: *parallel,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    /// Serial form: open the iterator, run the loop, close it.
    pub fn produce(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        let iter = fb.new_local(RegType::Iter);
        fb.emit(
            Bytecode::TableIterInit,
            [Operand::Local(iter), Operand::Count(self.table)],
        );
        self.emit_loop(cg, fb, iter)?;
        fb.emit(Bytecode::TableIterClose, [Operand::Local(iter)]);
        Ok(())
    }

    /// Loop body over an already-open iterator. The parallel worker
    /// function calls this directly with its partition cursor parameter.
    pub fn emit_loop(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        iter: LocalId,
    ) -> ForgeResult<()> {
        // Literal registers for the vectorized filters, once per scan.
        let mut filter_regs = Vec::with_capacity(self.vector_filters.len());
        for (_, _, literal) in &self.vector_filters {
            filter_regs.push(compile_expr(cg, fb, &Expr::Literal(literal.clone()), &[])?);
        }

        let row: Vec<LocalId> = (0..self.arity).map(|_| fb.new_local(RegType::Val)).collect();
        let row_id = fb.new_local(RegType::Val);
        let has_batch = fb.new_local(RegType::Bool);
        let has_row = fb.new_local(RegType::Bool);

        let batch_head = fb.create_label();
        let batch_exit = fb.create_label();
        fb.bind_label(batch_head);
        fb.emit(
            Bytecode::TableIterNextBatch,
            [Operand::Local(has_batch), Operand::Local(iter)],
        );
        fb.emit_jump_if_false(has_batch, batch_exit);

        for ((col, op, _), reg) in self.vector_filters.iter().zip(&filter_regs) {
            let bytecode = filter_bytecode(*op).ok_or_else(|| {
                ForgeError::InvalidPlan(format!("non-comparison vector filter at node #{}", self.node))
            })?;
            fb.emit(
                bytecode,
                [
                    Operand::Local(iter),
                    Operand::Count(*col as u32),
                    Operand::Local(*reg),
                ],
            );
        }

        let row_head = fb.create_label();
        let row_exit = fb.create_label();
        fb.bind_label(row_head);
        fb.emit(
            Bytecode::BatchHasNext,
            [Operand::Local(has_row), Operand::Local(iter)],
        );
        fb.emit_jump_if_false(has_row, row_exit);

        for (col, reg) in row.iter().enumerate() {
            fb.emit(
                Bytecode::BatchGet,
                [
                    Operand::Local(*reg),
                    Operand::Local(iter),
                    Operand::Count(col as u32),
                ],
            );
        }
        fb.emit(
            Bytecode::BatchGetRowId,
            [Operand::Local(row_id), Operand::Local(iter)],
        );
        cg.set_scan_row_id(self.node, row_id);

        let mut guards = Vec::with_capacity(self.residuals.len());
        for residual in &self.residuals {
            guards.push(compile_guard(cg, fb, residual, &row)?);
        }
        cg.consume_parent(fb, self.node, &row)?;
        for guard in guards.into_iter().rev() {
            fb.bind_label(guard);
        }

        fb.emit(Bytecode::BatchAdvance, [Operand::Local(iter)]);
        fb.emit_jump(row_head);
        fb.bind_label(row_exit);
        fb.emit_jump(batch_head);
        fb.bind_label(batch_exit);
        Ok(())
    }
}
