//! Nested-loop join translator
//!
//! No materialization barrier: both children live in one pipeline, the
//! left child drives the outer loop. Each outer row re-produces the right
//! subtree as its inner loop; inner rows join against the stashed outer
//! row registers.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::expr::compile_guard;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{Expr, PlanNode, SqlType};
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::LocalId;

pub struct NestedLoopJoinTranslator {
    node: NodeId,
    right_child: NodeId,
    predicate: Option<Expr>,
}

impl NestedLoopJoinTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::NestedLoopJoin { predicate, .. } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected NestedLoopJoin".to_string()));
        };
        if let Some(predicate) = predicate {
            let context = format!("join predicate of node #{node}");
            let ty = predicate.infer_type(arena.schema(node), &context)?;
            if ty != SqlType::Bool {
                return Err(ForgeError::TypeMismatch {
                    expected: "Bool".to_string(),
                    actual: ty.name().to_string(),
                    context,
                });
            }
        }
        Ok(Self {
            node,
            right_child: arena.children(node)[1],
            predicate: predicate.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn consume(
        &self,
        cg: &CodeGen,
        fb: &mut FunctionBuilder,
        ordinal: usize,
        row: &[LocalId],
    ) -> ForgeResult<()> {
        match ordinal {
            // Outer row: remember its registers, then run the inner loop.
            0 => {
                cg.stash_row(self.node, row.to_vec());
                cg.produce(fb, self.right_child)
            }
            // Inner row: combine with the stashed outer row.
            1 => {
                let mut combined = cg.stashed_row(self.node)?;
                combined.extend_from_slice(row);
                match &self.predicate {
                    Some(predicate) => {
                        let skip = compile_guard(cg, fb, predicate, &combined)?;
                        cg.consume_parent(fb, self.node, &combined)?;
                        fb.bind_label(skip);
                        Ok(())
                    }
                    None => cg.consume_parent(fb, self.node, &combined),
                }
            }
            _ => Err(ForgeError::InvalidPlan(format!(
                "nested-loop join at node #{} has no child #{ordinal}",
                self.node
            ))),
        }
    }
}
