//! Function builder
//!
//! Incremental emission of one bytecode function: typed local allocation,
//! label creation and binding with back-patching of forward jumps, and a
//! final consistency pass. Register indices are handed out once and never
//! reused; translators own their registers for the lifetime of the
//! function.

use smallvec::SmallVec;

use crate::error::{ForgeError, ForgeResult};
use crate::vm::bytecodes::Bytecode;
use crate::vm::program::{Function, Instr, LocalId, Operand, RegType};

/// A forward-referencable jump target.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

enum LabelState {
    /// (pc, operand index) sites waiting for the target
    Unbound(Vec<(usize, usize)>),
    Bound(u32),
}

/// Builds one function's register file and instruction body.
pub struct FunctionBuilder {
    name: String,
    params: usize,
    locals: Vec<RegType>,
    code: Vec<Instr>,
    labels: Vec<LabelState>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: 0,
            locals: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Declare a parameter. Parameters are the leading locals and must be
    /// declared before any plain local.
    pub fn new_param(&mut self, ty: RegType) -> LocalId {
        debug_assert_eq!(
            self.locals.len(),
            self.params,
            "parameters must precede locals"
        );
        self.params += 1;
        self.push_local(ty)
    }

    /// Allocate one fresh register.
    pub fn new_local(&mut self, ty: RegType) -> LocalId {
        self.push_local(ty)
    }

    /// Allocate `n` consecutive registers, returning the first. Used for
    /// row blocks consumed by range operands.
    pub fn alloc_block(&mut self, ty: RegType, n: usize) -> LocalId {
        let first = LocalId(self.locals.len() as u16);
        for _ in 0..n {
            self.push_local(ty);
        }
        first
    }

    fn push_local(&mut self, ty: RegType) -> LocalId {
        let id = LocalId(self.locals.len() as u16);
        self.locals.push(ty);
        id
    }

    pub fn local_type(&self, local: LocalId) -> Option<RegType> {
        self.locals.get(local.0 as usize).copied()
    }

    pub fn next_pc(&self) -> u32 {
        self.code.len() as u32
    }

    /// Append one instruction. Operand shape is checked against the opcode
    /// metadata in debug builds; the verifier re-checks the whole program
    /// in every build.
    pub fn emit(&mut self, op: Bytecode, operands: impl IntoIterator<Item = Operand>) {
        let operands: SmallVec<[Operand; 4]> = operands.into_iter().collect();
        debug_assert_eq!(operands.len(), op.operand_count(), "{} operand count", op.name());
        debug_assert!(
            operands
                .iter()
                .zip(op.operand_kinds())
                .all(|(operand, &kind)| operand.matches(kind)),
            "{} operand kinds",
            op.name()
        );
        self.code.push(Instr { op, operands });
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(LabelState::Unbound(Vec::new()));
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next emitted instruction, patching every jump
    /// already referencing it.
    pub fn bind_label(&mut self, label: Label) {
        let pc = self.next_pc();
        match std::mem::replace(&mut self.labels[label.0], LabelState::Bound(pc)) {
            LabelState::Unbound(patches) => {
                for (site, operand_idx) in patches {
                    self.code[site].operands[operand_idx] = Operand::JumpTarget(pc);
                }
            }
            LabelState::Bound(_) => {
                debug_assert!(false, "label bound twice in '{}'", self.name);
            }
        }
    }

    fn jump_operand(&mut self, label: Label, operand_idx: usize) -> Operand {
        match &mut self.labels[label.0] {
            LabelState::Bound(pc) => Operand::JumpTarget(*pc),
            LabelState::Unbound(patches) => {
                patches.push((self.code.len(), operand_idx));
                Operand::JumpTarget(u32::MAX)
            }
        }
    }

    pub fn emit_jump(&mut self, label: Label) {
        let target = self.jump_operand(label, 0);
        self.emit(Bytecode::Jump, [target]);
    }

    pub fn emit_jump_if_true(&mut self, cond: LocalId, label: Label) {
        let target = self.jump_operand(label, 1);
        self.emit(Bytecode::JumpIfTrue, [Operand::Local(cond), target]);
    }

    pub fn emit_jump_if_false(&mut self, cond: LocalId, label: Label) {
        let target = self.jump_operand(label, 1);
        self.emit(Bytecode::JumpIfFalse, [Operand::Local(cond), target]);
    }

    /// Seal the function. Every label must be bound by now.
    pub fn finish(self) -> ForgeResult<Function> {
        for state in &self.labels {
            if let LabelState::Unbound(sites) = state
                && !sites.is_empty()
            {
                return Err(ForgeError::Verify {
                    function: self.name.clone(),
                    pc: sites[0].0,
                    message: "jump to a label that was never bound".to_string(),
                });
            }
        }
        Ok(Function {
            name: self.name,
            params: self.params,
            locals: self.locals,
            code: self.code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_jumps_are_back_patched() {
        let mut fb = FunctionBuilder::new("t");
        let cond = fb.new_local(RegType::Bool);
        fb.emit(Bytecode::AssignImmBool, [Operand::Local(cond), Operand::Imm(1)]);
        let exit = fb.create_label();
        fb.emit_jump_if_false(cond, exit);
        fb.emit(Bytecode::AssignImmBool, [Operand::Local(cond), Operand::Imm(0)]);
        fb.bind_label(exit);
        fb.emit(Bytecode::Return, []);
        let func = fb.finish().unwrap();
        assert_eq!(func.code[1].operands[1], Operand::JumpTarget(3));
    }

    #[test]
    fn backward_jumps_resolve_immediately() {
        let mut fb = FunctionBuilder::new("t");
        let head = fb.create_label();
        fb.bind_label(head);
        fb.emit_jump(head);
        let func = fb.finish().unwrap();
        assert_eq!(func.code[0].operands[0], Operand::JumpTarget(0));
    }

    #[test]
    fn unbound_label_fails_finish() {
        let mut fb = FunctionBuilder::new("t");
        let never = fb.create_label();
        fb.emit_jump(never);
        assert!(matches!(fb.finish(), Err(ForgeError::Verify { .. })));
    }

    #[test]
    fn block_allocation_is_consecutive() {
        let mut fb = FunctionBuilder::new("t");
        let _ = fb.new_local(RegType::Val);
        let first = fb.alloc_block(RegType::Val, 3);
        assert_eq!(first, LocalId(1));
        assert_eq!(fb.local_type(LocalId(3)), Some(RegType::Val));
    }
}
