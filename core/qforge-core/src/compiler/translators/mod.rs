//! Operator translators
//!
//! One translator per plan operator, as a closed tagged variant: the
//! dispatch below is exhaustive over operator kinds, so adding an operator
//! without wiring its translator fails at compile time. Each translator
//! contributes code to the pipeline(s) it is registered in through the
//! produce/consume protocol:
//!
//! - `declare_state` appends fields to the global state record (called
//!   exactly once per translator, before any code is emitted);
//! - `init_state` / `teardown_state` emit into the init and teardown
//!   functions;
//! - `produce` drives iteration for pipeline sources (pass-through
//!   operators delegate to their input);
//! - `consume` handles one delivered row: guard it, transform it,
//!   materialize it, or push it onward;
//! - `finish_pipeline` emits post-loop synchronization (merge, build,
//!   sort) at the end of the pipeline that materializes a breaker's
//!   input.

mod filter;
mod hash_aggregate;
mod hash_join;
mod index_scan;
mod limit;
mod mutation;
mod nested_loop_join;
mod order_by;
mod output;
mod projection;
mod seq_scan;

pub use filter::FilterTranslator;
pub use hash_aggregate::HashAggregateTranslator;
pub use hash_join::HashJoinTranslator;
pub use index_scan::IndexScanTranslator;
pub use limit::LimitTranslator;
pub use mutation::{DeleteTranslator, InsertTranslator, UpdateTranslator};
pub use nested_loop_join::NestedLoopJoinTranslator;
pub use order_by::OrderByTranslator;
pub use output::OutputTranslator;
pub use projection::ProjectionTranslator;
pub use seq_scan::SeqScanTranslator;

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::pipeline::PipelineId;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::PlanNode;
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{Constant, LocalId, Operand, RegType, StateLayout};

/// The closed set of operator translators.
pub enum OperatorTranslator {
    SeqScan(SeqScanTranslator),
    IndexScan(IndexScanTranslator),
    Filter(FilterTranslator),
    Projection(ProjectionTranslator),
    HashAggregate(HashAggregateTranslator),
    OrderBy(OrderByTranslator),
    HashJoin(HashJoinTranslator),
    NestedLoopJoin(NestedLoopJoinTranslator),
    Limit(LimitTranslator),
    Insert(InsertTranslator),
    Update(UpdateTranslator),
    Delete(DeleteTranslator),
}

/// Variant constructor dispatch: plan-node kind to translator. Breakers
/// receive the id of the pipeline that materializes their input.
pub fn create_translator(
    arena: &PlanArena,
    node: NodeId,
    build_pipeline: Option<PipelineId>,
) -> ForgeResult<OperatorTranslator> {
    let build = || {
        build_pipeline.ok_or_else(|| {
            ForgeError::InvalidPlan(format!("breaker at node #{node} has no build pipeline"))
        })
    };
    Ok(match arena.node(node) {
        PlanNode::SeqScan { .. } => OperatorTranslator::SeqScan(SeqScanTranslator::new(arena, node)?),
        PlanNode::IndexScan { .. } => {
            OperatorTranslator::IndexScan(IndexScanTranslator::new(arena, node)?)
        }
        PlanNode::Filter { .. } => OperatorTranslator::Filter(FilterTranslator::new(arena, node)?),
        PlanNode::Projection { .. } => {
            OperatorTranslator::Projection(ProjectionTranslator::new(arena, node)?)
        }
        PlanNode::HashAggregate { .. } => OperatorTranslator::HashAggregate(
            HashAggregateTranslator::new(arena, node, build()?)?,
        ),
        PlanNode::OrderBy { .. } => {
            OperatorTranslator::OrderBy(OrderByTranslator::new(arena, node, build()?)?)
        }
        PlanNode::HashJoin { .. } => {
            OperatorTranslator::HashJoin(HashJoinTranslator::new(arena, node, build()?)?)
        }
        PlanNode::NestedLoopJoin { .. } => {
            OperatorTranslator::NestedLoopJoin(NestedLoopJoinTranslator::new(arena, node)?)
        }
        PlanNode::Limit { .. } => OperatorTranslator::Limit(LimitTranslator::new(arena, node)?),
        PlanNode::Insert { .. } => OperatorTranslator::Insert(InsertTranslator::new(arena, node)?),
        PlanNode::Update { .. } => OperatorTranslator::Update(UpdateTranslator::new(arena, node)?),
        PlanNode::Delete { .. } => OperatorTranslator::Delete(DeleteTranslator::new(arena, node)?),
    })
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            OperatorTranslator::SeqScan($t) => $body,
            OperatorTranslator::IndexScan($t) => $body,
            OperatorTranslator::Filter($t) => $body,
            OperatorTranslator::Projection($t) => $body,
            OperatorTranslator::HashAggregate($t) => $body,
            OperatorTranslator::OrderBy($t) => $body,
            OperatorTranslator::HashJoin($t) => $body,
            OperatorTranslator::NestedLoopJoin($t) => $body,
            OperatorTranslator::Limit($t) => $body,
            OperatorTranslator::Insert($t) => $body,
            OperatorTranslator::Update($t) => $body,
            OperatorTranslator::Delete($t) => $body,
        }
    };
}

impl OperatorTranslator {
    pub fn node(&self) -> NodeId {
        dispatch!(self, t => t.node())
    }

    /// Append this operator's fields to the global state record. Called
    /// exactly once per translator.
    pub fn declare_state(&mut self, layout: &mut StateLayout, constants: &mut Vec<Constant>) {
        match self {
            OperatorTranslator::HashAggregate(t) => t.declare_state(layout, constants),
            OperatorTranslator::OrderBy(t) => t.declare_state(layout, constants),
            OperatorTranslator::HashJoin(t) => t.declare_state(layout, constants),
            _ => {}
        }
    }

    /// Emit initialization statements into the init function.
    pub fn init_state(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        match self {
            OperatorTranslator::HashAggregate(t) => t.init_state(cg, fb),
            OperatorTranslator::OrderBy(t) => t.init_state(cg, fb),
            OperatorTranslator::HashJoin(t) => t.init_state(cg, fb),
            _ => Ok(()),
        }
    }

    /// Emit release statements into the teardown function.
    pub fn teardown_state(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        match self {
            OperatorTranslator::HashAggregate(t) => t.teardown_state(cg, fb),
            OperatorTranslator::OrderBy(t) => t.teardown_state(cg, fb),
            OperatorTranslator::HashJoin(t) => t.teardown_state(cg, fb),
            _ => Ok(()),
        }
    }

    /// Emit per-pipeline setup before the source loop (counters and the
    /// like). Called for every member of the pipeline, source first.
    pub fn prepare_pipeline(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        pipeline: PipelineId,
    ) -> ForgeResult<()> {
        match self {
            OperatorTranslator::Limit(t) => t.prepare_pipeline(cg, fb, pipeline),
            _ => Ok(()),
        }
    }

    /// Drive iteration. Sources emit their loop; pass-through operators
    /// delegate to their input so `produce` can be requested on any
    /// member of a pipeline.
    pub fn produce(&self, cg: &CodeGen, fb: &mut FunctionBuilder) -> ForgeResult<()> {
        match self {
            OperatorTranslator::SeqScan(t) => t.produce(cg, fb),
            OperatorTranslator::IndexScan(t) => t.produce(cg, fb),
            OperatorTranslator::Insert(t) => t.produce(cg, fb),
            OperatorTranslator::HashAggregate(t) => t.produce(cg, fb),
            OperatorTranslator::OrderBy(t) => t.produce(cg, fb),
            // Pass-through: iteration starts below.
            other => {
                let node = other.node();
                match cg.arena.children(node).first() {
                    Some(&child) => cg.produce(fb, child),
                    None => Err(ForgeError::InvalidPlan(format!(
                        "operator at node #{node} cannot drive iteration"
                    ))),
                }
            }
        }
    }

    /// Handle one row delivered from the child at `ordinal`.
    pub fn consume(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        ordinal: usize,
        row: &[LocalId],
    ) -> ForgeResult<()> {
        match self {
            OperatorTranslator::Filter(t) => t.consume(cg, fb, row),
            OperatorTranslator::Projection(t) => t.consume(cg, fb, row),
            OperatorTranslator::HashAggregate(t) => t.consume(cg, fb, row),
            OperatorTranslator::OrderBy(t) => t.consume(cg, fb, row),
            OperatorTranslator::HashJoin(t) => t.consume(cg, fb, ordinal, row),
            OperatorTranslator::NestedLoopJoin(t) => t.consume(cg, fb, ordinal, row),
            OperatorTranslator::Limit(t) => t.consume(cg, fb, row),
            OperatorTranslator::Update(t) => t.consume(cg, fb, row),
            OperatorTranslator::Delete(t) => t.consume(cg, fb, row),
            OperatorTranslator::SeqScan(_)
            | OperatorTranslator::IndexScan(_)
            | OperatorTranslator::Insert(_) => Err(ForgeError::InvalidPlan(format!(
                "source operator at node #{} cannot consume rows",
                self.node()
            ))),
        }
    }

    /// Emit the explicit synchronization phase at the end of the pipeline
    /// that materializes this operator's input.
    pub fn finish_pipeline(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        pipeline: PipelineId,
    ) -> ForgeResult<()> {
        match self {
            OperatorTranslator::HashAggregate(t) => t.finish_pipeline(cg, fb, pipeline),
            OperatorTranslator::OrderBy(t) => t.finish_pipeline(cg, fb, pipeline),
            OperatorTranslator::HashJoin(t) => t.finish_pipeline(cg, fb, pipeline),
            _ => Ok(()),
        }
    }

    /// Whether this operator may run inside a partition-parallel pipeline.
    pub fn parallel_safe(&self) -> bool {
        match self {
            // Materializing consumers write into concurrent structures.
            OperatorTranslator::HashAggregate(_)
            | OperatorTranslator::OrderBy(_)
            | OperatorTranslator::HashJoin(_)
            | OperatorTranslator::Filter(_)
            | OperatorTranslator::Projection(_)
            | OperatorTranslator::NestedLoopJoin(_)
            | OperatorTranslator::SeqScan(_) => true,
            // Row-count and mutation semantics need a single worker.
            OperatorTranslator::Limit(_)
            | OperatorTranslator::IndexScan(_)
            | OperatorTranslator::Insert(_)
            | OperatorTranslator::Update(_)
            | OperatorTranslator::Delete(_) => false,
        }
    }
}

/// Copy a row of registers into a fresh contiguous block and return the
/// block's first register. Range operands require contiguity.
pub(crate) fn copy_into_block(fb: &mut FunctionBuilder, regs: &[LocalId]) -> LocalId {
    let block = fb.alloc_block(RegType::Val, regs.len());
    for (i, reg) in regs.iter().enumerate() {
        fb.emit(
            Bytecode::Assign,
            [
                Operand::Local(LocalId(block.0 + i as u16)),
                Operand::Local(*reg),
            ],
        );
    }
    block
}

/// The registers of a contiguous block, as a row slice.
pub(crate) fn block_regs(first: LocalId, len: usize) -> Vec<LocalId> {
    (0..len as u16).map(|i| LocalId(first.0 + i)).collect()
}
