//! Output translator
//!
//! The synthesized final consumer of the terminal pipeline. Created by
//! the compilation context iff an output schema was supplied; plans
//! without one (mutations) simply have no downstream consumer at the
//! root.

use crate::compiler::translators::copy_into_block;
use crate::error::{ForgeError, ForgeResult};
use crate::vm::bytecodes::Bytecode;
use crate::vm::emitter::FunctionBuilder;
use crate::vm::program::{LocalId, Operand};

pub struct OutputTranslator {
    arity: usize,
}

impl OutputTranslator {
    pub fn new(arity: usize) -> Self {
        Self { arity }
    }

    /// Deliver one finished row to the execution context's sink.
    pub fn consume(&self, fb: &mut FunctionBuilder, row: &[LocalId]) -> ForgeResult<()> {
        if row.len() != self.arity {
            return Err(ForgeError::InvalidPlan(format!(
                "root emits {} column(s), output schema declares {}",
                row.len(),
                self.arity
            )));
        }
        let block = copy_into_block(fb, row);
        fb.emit(
            Bytecode::OutputRow,
            [Operand::Local(block), Operand::Count(self.arity as u32)],
        );
        Ok(())
    }

    /// Flush the sink; emitted once at the end of the terminal pipeline.
    pub fn finish(&self, fb: &mut FunctionBuilder) {
        fb.emit(Bytecode::OutputFinalize, []);
    }
}
