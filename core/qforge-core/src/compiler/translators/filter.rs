//! Filter translator
//!
//! A guarded continuation: rows failing the predicate (or evaluating it
//! to Null) skip the downstream consume.

use crate::compiler::arena::{NodeId, PlanArena};
use crate::compiler::codegen::CodeGen;
use crate::compiler::expr::compile_guard;
use crate::error::{ForgeError, ForgeResult};
use crate::plan::{Expr, PlanNode, SqlType};
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::LocalId;

pub struct FilterTranslator {
    node: NodeId,
    predicate: Expr,
}

impl FilterTranslator {
    pub fn new(arena: &PlanArena, node: NodeId) -> ForgeResult<Self> {
        let PlanNode::Filter { input, predicate } = arena.node(node) else {
            return Err(ForgeError::InvalidPlan("expected Filter".to_string()));
        };
        let context = format!("filter predicate of node #{node}");
        let ty = predicate.infer_type(&input.output_schema()?, &context)?;
        if ty != SqlType::Bool {
            return Err(ForgeError::TypeMismatch {
                expected: "Bool".to_string(),
                actual: ty.name().to_string(),
                context,
            });
        }
        Ok(Self {
            node,
            predicate: predicate.clone(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn consume(&self, cg: &CodeGen, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        let skip = compile_guard(cg, fb, &self.predicate, row)?;
        cg.consume_parent(fb, self.node, row)?;
        fb.bind_label(skip);
        Ok(())
    }
}
