//! Hash join translator
//!
//! The build side (child 0) runs in its own pipeline and inserts rows into
//! the join hash table; the build barrier at the end of that pipeline
//! freezes it. The probe side (child 1) stays in the current pipeline:
//! each probe row looks up its key and emits one combined row per match,
//! build columns first.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::pipeline::PipelineId;
use crate::compiler::translators::{block_regs, copy_into_block};
use crate::error::{ForgeError, ForgeResult};
use crate::plan::PlanNode;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{LocalId, Operand, RegType, StateField, StateKind, StateLayout};

pub struct HashJoinTranslator {
    node: NodeId,
    /// (build column, probe column) equality pairs
    keys: Vec<(usize, usize)>,
    build_arity: usize,
    build_pipeline: PipelineId,
    state_slot: u16,
}

impl HashJoinTranslator {
    pub fn new(arena: &PlanArena, node: NodeId, build_pipeline: PipelineId) -> ForgeResult<Self> {
        let PlanNode::HashJoin { keys, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected HashJoin".to_string()));
        };
        if keys.is_empty() {
            return Err(ForgeError::InvalidPlan(format!(
                "hash join at node #{node} has no key pairs"
            )));
        }
        let build_child = arena.children(node)[0];
        Ok(Self {
            node,
            keys: keys.clone(),
            build_arity: arena.schema(build_child).arity(),
            build_pipeline,
            state_slot: 0,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn declare_state(&mut self, layout: &mut StateLayout, _constants: &mut Vec<crate::vm::program::Constant>) {
        self.state_slot = layout.fields.len() as u16;
        layout.fields.push(StateField {
            name: format!("join_table_{}", self.node),
            kind: StateKind::JoinTable,
        });
    }

    pub fn init_state(&self, _cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        fb.emit(Bytecode::JoinTableInit, [Operand::StateSlot(self.state_slot)]);
        Ok(())
    }

    pub fn teardown_state(&self, _cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        fb.emit(Bytecode::JoinTableFree, [Operand::StateSlot(self.state_slot)]);
        Ok(())
    }

    pub fn consume(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        ordinal: usize,
        row: &[LocalId],
    ) -> ForgeResult<()> {
        match ordinal {
            0 => self.consume_build(fb, row),
            1 => self.consume_probe(cg, fb, row),
            _ => Err(ForgeError::InvalidPlan(format!(
                "hash join at node #{} has no child #{ordinal}",
                self.node
            ))),
        }
    }

    /// Build side: insert the row under its key columns.
    fn consume_build(&self, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let key_regs = self.key_regs(row, |k| k.0)?;
        let keys = copy_into_block(fb, &key_regs);
        let values = copy_into_block(fb, row);
        fb.emit(
            Bytecode::JoinTableInsert,
            [
                Operand::StateSlot(self.state_slot),
                Operand::Local(keys),
                Operand::Count(self.keys.len() as u32),
                Operand::Local(values),
                Operand::Count(row.len() as u32),
            ],
        );
        Ok(())
    }

    /// Probe side: one combined row per key match.
    fn consume_probe(&self, cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let key_regs = self.key_regs(row, |k| k.1)?;
        let keys = copy_into_block(fb, &key_regs);
        let iter = fb.new_local(RegType::Iter);
        fb.emit(
            Bytecode::JoinProbeInit,
            [
                Operand::Local(iter),
                Operand::StateSlot(self.state_slot),
                Operand::Local(keys),
                Operand::Count(self.keys.len() as u32),
            ],
        );

        let has = fb.new_local(RegType::Bool);
        let build_block = fb.alloc_block(RegType::Val, self.build_arity);
        let head = fb.create_label();
        let exit = fb.create_label();
        fb.bind_label(head);
        fb.emit(
            Bytecode::JoinProbeNext,
            [Operand::Local(has), Operand::Local(iter)],
        );
        fb.emit_jump_if_false(has, exit);
        fb.emit(
            Bytecode::JoinProbeRow,
            [
                Operand::Local(build_block),
                Operand::Count(self.build_arity as u32),
                Operand::Local(iter),
            ],
        );
        let mut combined = block_regs(build_block, self.build_arity);
        combined.extend_from_slice(row);
        cg.consume_parent(fb, self.node, &combined)?;
        fb.emit_jump(head);
        fb.bind_label(exit);
        Ok(())
    }

    /// End of the build pipeline: the build barrier.
    pub fn finish_pipeline(
        &self,
        _cg: &CodeGen,
        fb: &mut FunctionBuilder,
        pipeline: PipelineId,
    ) -> ForgeResult<()> {
        if pipeline == self.build_pipeline {
            fb.emit(Bytecode::JoinTableBuild, [Operand::StateSlot(self.state_slot)]);
        }
        Ok(())
    }

    fn key_regs(
        &self,
        row: &[LocalId],
        side: impl Fn(&(usize, usize)) -> usize,
    ) -> ForgeResult<Vec<LocalId>> {
        self.keys
            .iter()
            .map(|pair| {
                row.get(side(pair)).copied().ok_or(ForgeError::UnknownColumn {
                    index: side(pair),
                    context: format!("join key of node #{}", self.node),
                })
            })
            .collect()
    }
}
