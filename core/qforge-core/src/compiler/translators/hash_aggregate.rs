//! Hash aggregation translator
//!
//! A pipeline breaker registered in two pipelines. In the build pipeline
//! it consumes child rows into the aggregation hash table; the explicit
//! merge phase at the end of that pipeline freezes the table. In the read
//! pipeline it is the source: it iterates the frozen groups and pushes
//! (keys, results) rows upward.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::pipeline::PipelineId;
use crate::compiler::translators::block_regs;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{AggregateExpr, PlanNode};
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{ConstId, Constant, LocalId, Operand, RegType, StateField, StateKind, StateLayout};

pub struct HashAggregateTranslator {
    node: NodeId,
    group_by: Vec<usize>,
    aggregates: Vec<AggregateExpr>,
    out_arity: usize,
    build_pipeline: PipelineId,
    state_slot: u16,
    spec_const: ConstId,
}

impl HashAggregateTranslator {
    pub fn new(arena: &PlanArena, node: NodeId, build_pipeline: PipelineId) -> ForgeResult<Self> {
        let PlanNode::HashAggregate {
            group_by,
            aggregates,
            ..
        } = arena.node(node)
        else {
            return Err(ForgeError::InvalidPlan("expected HashAggregate".to_string()));
        };
        // Schema derivation validated group columns and aggregate types.
        let out_arity = arena.schema(node).arity();
        Ok(Self {
            node,
            group_by: group_by.clone(),
            aggregates: aggregates.clone(),
            out_arity,
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
            name: format!("agg_table_{}", self.node),
            kind: StateKind::AggTable,
        });
        self.spec_const = ConstId(constants.len() as u32);
        constants.push(Constant::AggSpec(
            self.aggregates.iter().map(|a| a.function).collect(),
        ));
    }

    pub fn init_state(&self, _cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        fb.emit(
            Bytecode::AggTableInit,
            [
                Operand::StateSlot(self.state_slot),
                Operand::ConstRef(self.spec_const),
            ],
        );
        Ok(())
    }

    pub fn teardown_state(&self, _cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        fb.emit(Bytecode::AggTableFree, [Operand::StateSlot(self.state_slot)]);
        Ok(())
    }

    /// Build side: fold one child row into its group. Nothing flows
    /// downstream here; the top half reads the materialization later.
    pub fn consume(&self, _cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let keys = fb.alloc_block(RegType::Val, self.group_by.len());
        for (i, &col) in self.group_by.iter().enumerate() {
            let src = row.get(col).ok_or(ForgeError::UnknownColumn {
                index: col,
                context: format!("group-by of node #{}", self.node),
            })?;
            fb.emit(
                Bytecode::Assign,
                [Operand::Local(LocalId(keys.0 + i as u16)), Operand::Local(*src)],
            );
        }

        let args = fb.alloc_block(RegType::Val, self.aggregates.len());
        for (i, agg) in self.aggregates.iter().enumerate() {
            let dst = Operand::Local(LocalId(args.0 + i as u16));
            match agg.input {
                Some(col) => {
                    let src = row.get(col).ok_or(ForgeError::UnknownColumn {
                        index: col,
                        context: format!("aggregate argument of node #{}", self.node),
                    })?;
                    fb.emit(Bytecode::Assign, [dst, Operand::Local(*src)]);
                }
                // COUNT(*) reads no column; keep the argument row rectangular.
                None => fb.emit(Bytecode::AssignNull, [dst]),
            }
        }

        fb.emit(
            Bytecode::AggTableUpsert,
            [
                Operand::StateSlot(self.state_slot),
                Operand::Local(keys),
                Operand::Count(self.group_by.len() as u32),
                Operand::Local(args),
                Operand::Count(self.aggregates.len() as u32),
            ],
        );
        Ok(())
    }

    /// End of the build pipeline: the merge barrier.
    pub fn finish_pipeline(
        &self,
        _cg: &CodeGen,
        fb: &mut FunctionBuilder,
        pipeline: PipelineId,
    ) -> ForgeResult<()> {
        if pipeline == self.build_pipeline {
            fb.emit(
                Bytecode::AggTableMergePartitions,
                [Operand::StateSlot(self.state_slot)],
            );
        }
        Ok(())
    }

    /// Read side: source of the successor pipeline.
    pub fn produce(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        let iter = fb.new_local(RegType::Iter);
        fb.emit(
            Bytecode::AggIterInit,
            [Operand::Local(iter), Operand::StateSlot(self.state_slot)],
        );
        let has = fb.new_local(RegType::Bool);
        let block = fb.alloc_block(RegType::Val, self.out_arity);
        let head = fb.create_label();
        let exit = fb.create_label();
        fb.bind_label(head);
        fb.emit(
            Bytecode::AggIterNext,
            [Operand::Local(has), Operand::Local(iter)],
        );
        fb.emit_jump_if_false(has, exit);
        fb.emit(
            Bytecode::AggIterRow,
            [
                Operand::Local(block),
                Operand::Count(self.out_arity as u32),
                Operand::Local(iter),
            ],
        );
        cg.consume_parent(fb, self.node, &block_regs(block, self.out_arity))?;
        fb.emit_jump(head);
        fb.bind_label(exit);
        Ok(())
    }
}
