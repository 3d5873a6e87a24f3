//! Limit translator
//!
//! Counts delivered rows in a pipeline-local register and forwards only
//! those inside the (offset, offset + count] window. The counter is
//! allocated and zeroed before the pipeline's source loop starts.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::pipeline::PipelineId;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::PlanNode;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{LocalId, Operand, RegType};

pub struct LimitTranslator {
    node: NodeId,
    count: usize,
    offset: usize,
}

impl LimitTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::Limit { count, offset, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected Limit".to_string()));
        };
        Ok(Self {
            node,
            count: *count,
            offset: *offset,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn prepare_pipeline(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        _pipeline: PipelineId,
    ) -> ForgeResult<()> {
        let counter = fb.new_local(RegType::Int);
        fb.emit(
            Bytecode::AssignImmInt,
            [Operand::Local(counter), Operand::Imm(0)],
        );
        cg.set_limit_counter(self.node, counter);
        Ok(())
    }

    pub fn consume(&self, cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let counter = cg.limit_counter(self.node)?;
        let one = fb.new_local(RegType::Int);
        fb.emit(Bytecode::AssignImmInt, [Operand::Local(one), Operand::Imm(1)]);
        fb.emit(
            Bytecode::IntAdd,
            [
                Operand::Local(counter),
                Operand::Local(counter),
                Operand::Local(one),
            ],
        );

        let skip = fb.create_label();
        // counter is the 1-based position of this row.
        let off = fb.new_local(RegType::Int);
        fb.emit(
            Bytecode::AssignImmInt,
            [Operand::Local(off), Operand::Imm(self.offset as i64)],
        );
        let past_offset = fb.new_local(RegType::Bool);
        fb.emit(
            Bytecode::IntGt,
            [
                Operand::Local(past_offset),
                Operand::Local(counter),
                Operand::Local(off),
            ],
        );
        fb.emit_jump_if_false(past_offset, skip);

        let bound = fb.new_local(RegType::Int);
        fb.emit(
            Bytecode::AssignImmInt,
            [
                Operand::Local(bound),
                Operand::Imm((self.offset + self.count) as i64),
            ],
        );
        let in_window = fb.new_local(RegType::Bool);
        fb.emit(
            Bytecode::IntLe,
            [
                Operand::Local(in_window),
                Operand::Local(counter),
                Operand::Local(bound),
            ],
        );
        fb.emit_jump_if_false(in_window, skip);

        cg.consume_parent(fb, self.node, row)?;
        fb.bind_label(skip);
        Ok(())
    }
}
