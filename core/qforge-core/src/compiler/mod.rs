//! Query compilation
//!
//! Turns a bound physical plan tree into a bytecode program: pipeline
//! decomposition, the produce/consume translator protocol, expression
//! codegen, and whole-program assembly.

pub mod arena;
pub mod codegen;
pub mod context;
pub mod expr;
pub mod pipeline;
pub mod translators;

pub use arena::{NodeId, PlanArena};
pub use codegen::CodeGen;
pub use context::{CompilationContext, compile};
pub use pipeline::{Pipeline, PipelineId, execution_order};
