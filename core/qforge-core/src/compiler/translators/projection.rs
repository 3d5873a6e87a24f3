//! Projection translator
//!
//! Computes the projected expressions into fresh registers and pushes the
//! new row onward. Column-only projections reuse the input registers.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::expr::compile_expr;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{Expr, PlanNode};
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::LocalId;

pub struct ProjectionTranslator {
    node: NodeId,
    exprs: Vec<Expr>,
}

impl ProjectionTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::Projection { exprs, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected Projection".to_string()));
        };
        // Arena construction already typed every projected expression.
        Ok(Self {
            node,
            exprs: exprs.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn consume(&self, cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let mut projected = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            projected.push(compile_expr(cg, fb, expr, row)?);
        }
        cg.consume_parent(fb, self.node, &projected)
    }
}
