//! Compiled program representation
//!
//! A `Program` is the immutable output of compilation: a function table
//! (init, one per pipeline, teardown, main), a constant pool, and the
//! global-state layout. Instructions reference typed virtual registers by
//! index; registers are statically assigned and never resized after a
//! function is emitted.

use smallvec::SmallVec;
use std::fmt::Write as _;

use crate::plan::AggregateFunction;
use crate::runtime::SortSpec;
use crate::vm::bytecodes::{Bytecode, OperandKind};

/// Index of a register ("local") within a function frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u16);

/// Index into the program's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// Index into the program's constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstId(pub u32);

/// Static type of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegType {
    Bool,
    Int,
    Real,
    Str,
    /// Dynamically typed SQL value (nullable)
    Val,
    /// Iterator handle
    Iter,
}

/// One instruction operand. The shape must match the opcode's metadata;
/// the verifier enforces this before execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Local(LocalId),
    Imm(i64),
    FImm(f64),
    /// Absolute instruction index within the containing function
    JumpTarget(u32),
    FuncRef(FunctionId),
    StateSlot(u16),
    Count(u32),
    ConstRef(ConstId),
}

impl Operand {
    pub fn matches(&self, kind: OperandKind) -> bool {
        matches!(
            (self, kind),
            (
                Operand::Local(_),
                OperandKind::LocalDst
                    | OperandKind::LocalSrc
                    | OperandKind::LocalRangeDst
                    | OperandKind::LocalRangeSrc
            ) | (Operand::Imm(_), OperandKind::Imm)
                | (Operand::FImm(_), OperandKind::FImm)
                | (Operand::JumpTarget(_), OperandKind::JumpTarget)
                | (Operand::FuncRef(_), OperandKind::FuncRef)
                | (Operand::StateSlot(_), OperandKind::StateSlot)
                | (Operand::Count(_), OperandKind::Count)
                | (Operand::ConstRef(_), OperandKind::ConstRef)
        )
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Bytecode,
    pub operands: SmallVec<[Operand; 4]>,
}

/// Entries of the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Str(String),
    /// Aggregate functions of one aggregation table, in output order
    AggSpec(Vec<AggregateFunction>),
    /// Sort keys and optional top-K bound of one sorter
    SortSpec(SortSpec),
}

/// Kind of a global-state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    AggTable,
    JoinTable,
    Sorter,
    /// Synthesized when no translator declares state; the record type is
    /// never empty.
    Placeholder,
}

/// One declared field of the global state record.
#[derive(Debug, Clone, PartialEq)]
pub struct StateField {
    pub name: String,
    pub kind: StateKind,
}

/// The global state record type, one field per declared runtime structure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateLayout {
    pub fields: Vec<StateField>,
}

impl StateLayout {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One generated function: typed locals (params are the leading locals,
/// defined at entry) and a linear instruction body.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Number of leading locals that are parameters
    pub params: usize,
    pub locals: Vec<RegType>,
    pub code: Vec<Instr>,
}

/// The compiled artifact handed to a backend. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<Function>,
    pub constants: Vec<Constant>,
    pub state: StateLayout,
    pub init: FunctionId,
    /// Pipeline functions in execution order
    pub pipelines: Vec<FunctionId>,
    pub teardown: FunctionId,
    pub main: FunctionId,
    /// Per-compilation identifier scoping generated names
    pub query_id: u64,
}

impl Program {
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn constant(&self, id: ConstId) -> Option<&Constant> {
        self.constants.get(id.0 as usize)
    }

    /// Render the whole program in disassembly form, driven entirely by
    /// the opcode metadata table.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; query {} — {} function(s)", self.query_id, self.functions.len());
        let _ = writeln!(out, "; state: {} slot(s)", self.state.len());
        for (id, func) in self.functions.iter().enumerate() {
            let _ = writeln!(
                out,
                "fn {} (#{id}, {} param(s), {} local(s)):",
                func.name,
                func.params,
                func.locals.len()
            );
            for (pc, instr) in func.code.iter().enumerate() {
                let _ = write!(out, "  {pc:>4}: {}", instr.op.name());
                for (i, operand) in instr.operands.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    let _ = match operand {
                        Operand::Local(l) => write!(out, "{sep}r{}", l.0),
                        Operand::Imm(v) => write!(out, "{sep}#{v}"),
                        Operand::FImm(v) => write!(out, "{sep}#{v}"),
                        Operand::JumpTarget(t) => write!(out, "{sep}@{t}"),
                        Operand::FuncRef(f) => {
                            let name = self
                                .function(*f)
                                .map(|f| f.name.as_str())
                                .unwrap_or("<invalid>");
                            write!(out, "{sep}fn:{name}")
                        }
                        Operand::StateSlot(s) => write!(out, "{sep}state[{s}]"),
                        Operand::Count(c) => write!(out, "{sep}{c}"),
                        Operand::ConstRef(c) => write!(out, "{sep}const[{}]", c.0),
                    };
                }
                let _ = writeln!(out);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn tiny_program() -> Program {
        Program {
            functions: vec![Function {
                name: "q1_main".to_string(),
                params: 0,
                locals: vec![RegType::Int],
                code: vec![
                    Instr {
                        op: Bytecode::AssignImmInt,
                        operands: smallvec![Operand::Local(LocalId(0)), Operand::Imm(0)],
                    },
                    Instr {
                        op: Bytecode::Return,
                        operands: smallvec![],
                    },
                ],
            }],
            constants: vec![Constant::Str("hello".to_string())],
            state: StateLayout {
                fields: vec![StateField {
                    name: "placeholder".to_string(),
                    kind: StateKind::Placeholder,
                }],
            },
            init: FunctionId(0),
            pipelines: vec![],
            teardown: FunctionId(0),
            main: FunctionId(0),
            query_id: 1,
        }
    }

    #[test]
    fn operand_kind_matching() {
        assert!(Operand::Local(LocalId(3)).matches(OperandKind::LocalDst));
        assert!(Operand::Local(LocalId(3)).matches(OperandKind::LocalRangeSrc));
        assert!(!Operand::Imm(1).matches(OperandKind::LocalSrc));
        assert!(Operand::Count(2).matches(OperandKind::Count));
    }

    #[test]
    fn disassembly_names_registers_and_targets() {
        let text = tiny_program().disassemble();
        assert!(text.contains("fn q1_main"));
        assert!(text.contains("AssignImmInt r0, #0"));
        assert!(text.contains("Return"));
    }
}
