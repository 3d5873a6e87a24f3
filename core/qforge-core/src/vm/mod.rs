//! Bytecode instruction set and virtual machine
//!
//! The ISA is a closed, data-driven opcode catalog; programs are linear
//! instruction streams over typed virtual registers. The interpreter is
//! the reference backend; `Backend` is the seam for an alternate
//! ahead-of-time implementation.

pub mod bytecodes;
pub mod emitter;
pub mod interp;
pub mod parallel;
pub mod program;
pub mod verifier;

pub use bytecodes::{Bytecode, OperandKind};
pub use emitter::{FunctionBuilder, Label};
pub use interp::{Backend, VmBackend, run};
pub use parallel::{ParallelizationPolicy, WorkerPool};
pub use program::{
    ConstId, Constant, Function, FunctionId, Instr, LocalId, Operand, Program, RegType, StateField,
    StateKind, StateLayout,
};
pub use verifier::verify;
