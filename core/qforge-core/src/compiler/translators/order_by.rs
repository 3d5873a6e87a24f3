//! Order-by translator
//!
//! The sort pipeline breaker. The build pipeline inserts every row into
//! the sorter; the sort barrier at the end of that pipeline orders (and
//! top-K-truncates) the buffer; the read pipeline then streams rows out
//! in order.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::pipeline::PipelineId;
use crate::compiler::translators::{block_regs, copy_into_block};
use crate::error::{ForgeError, ForgeResult};
use crate::plan::PlanNode;
use crate::runtime::SortSpec;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{ConstId, Constant, LocalId, Operand, RegType, StateField, StateKind, StateLayout};

pub struct OrderByTranslator {
    node: NodeId,
    spec: SortSpec,
    arity: usize,
    build_pipeline: PipelineId,
    state_slot: u16,
    spec_const: ConstId,
}

impl OrderByTranslator {
    pub fn new(arena: &PlanArena, node: NodeId, build_pipeline: PipelineId) -> ForgeResult<Self> {
        let PlanNode::OrderBy { keys, limit, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected OrderBy".to_string()));
        };
        // Key indices were bounds-checked during schema derivation.
        let arity = arena.schema(node).arity();
        Ok(Self {
            node,
            spec: SortSpec {
                keys: keys.clone(),
                limit: *limit,
            },
            arity,
            build_pipeline,
            state_slot: 0,
            spec_const: ConstId(0),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn declare_state(&mut self, layout: &mut StateLayout, constants: &mut Vec<Constant>) {
        self.state_slot = layout.fields.len() as u16;
        layout.fields.push(StateField {
            name: format!("sorter_{}", self.node),
            kind: StateKind::Sorter,
        });
        self.spec_const = ConstId(constants.len() as u32);
        constants.push(Constant::SortSpec(self.spec.clone()));
    }

    pub fn init_state(&self, _cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        fb.emit(
            Bytecode::SorterInit,
            [
                Operand::StateSlot(self.state_slot),
                Operand::ConstRef(self.spec_const),
            ],
        );
        Ok(())
    }

    pub fn teardown_state(&self, _cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        fb.emit(Bytecode::SorterFree, [Operand::StateSlot(self.state_slot)]);
        Ok(())
    }

    /// Build side: append the row to the sort buffer.
    pub fn consume(&self, _cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let block = copy_into_block(fb, row);
        fb.emit(
            Bytecode::SorterInsert,
            [
                Operand::StateSlot(self.state_slot),
                Operand::Local(block),
                Operand::Count(row.len() as u32),
            ],
        );
        Ok(())
    }

    /// End of the build pipeline: the sort barrier.
    pub fn finish_pipeline(
        &self,
        _cg: &CodeGen,
        fb: &mut FunctionBuilder,
        pipeline: PipelineId,
    ) -> ForgeResult<()> {
        if pipeline == self.build_pipeline {
            fb.emit(Bytecode::SorterSort, [Operand::StateSlot(self.state_slot)]);
        }
        Ok(())
    }

    /// Read side: stream rows out in sort order.
    pub fn produce(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        let iter = fb.new_local(RegType::Iter);
        fb.emit(
            Bytecode::SorterIterInit,
            [Operand::Local(iter), Operand::StateSlot(self.state_slot)],
        );
        let has = fb.new_local(RegType::Bool);
        let block = fb.alloc_block(RegType::Val, self.arity);
        let head = fb.create_label();
        let exit = fb.create_label();
        fb.bind_label(head);
        fb.emit(
            Bytecode::SorterIterNext,
            [Operand::Local(has), Operand::Local(iter)],
        );
        fb.emit_jump_if_false(has, exit);
        fb.emit(
            Bytecode::SorterIterRow,
            [
                Operand::Local(block),
                Operand::Count(self.arity as u32),
                Operand::Local(iter),
            ],
        );
        cg.consume_parent(fb, self.node, &block_regs(block, self.arity))?;
        fb.emit_jump(head);
        fb.bind_label(exit);
        Ok(())
    }
}
