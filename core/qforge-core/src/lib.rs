//! # qforge — pipeline query compilation core
//!
//! qforge turns bound physical query plans into register bytecode and
//! executes it on a typed virtual machine. Plans decompose into
//! *pipelines* around materialization points (aggregation, sort, hash
//! join build); within a pipeline, operators fuse into one loop through
//! the produce/consume protocol, so rows flow through registers instead
//! of intermediate buffers.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use qforge_core::plan::{Column, Expr, BinaryOperator, PlanNode, Schema, SqlType};
//! use qforge_core::runtime::{CollectingSink, ExecutionContext, Value};
//! use qforge_core::storage::{MemStorage, MemTransactionManager, TransactionManager};
//!
//! # fn main() -> qforge_core::ForgeResult<()> {
//! let storage = Arc::new(MemStorage::new());
//! let schema = Schema::new(vec![Column::new("v", SqlType::Int)]);
//! storage.create_table(1, schema.clone());
//! storage.load(1, (1..=5).map(|v| vec![Value::Int(v)]).collect())?;
//!
//! // SELECT v FROM t WHERE v < 4
//! let plan = PlanNode::SeqScan {
//!     table: 1,
//!     schema: schema.clone(),
//!     predicate: Some(Expr::binary(Expr::col(0), BinaryOperator::Lt, Expr::lit(Value::Int(4)))),
//!     parallel: false,
//! };
//!
//! let program = qforge_core::compile(&plan, Some(&schema))?;
//! let txn = MemTransactionManager::new().begin()?;
//! let (sink, rows) = CollectingSink::new();
//! let ctx = ExecutionContext::new(storage, txn, Box::new(sink));
//! qforge_core::run(&program, &ctx)?;
//! assert_eq!(rows.lock().len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`plan`] — bound physical plan trees (consumed read-only)
//! - [`compiler`] — pipelines, operator translators, program assembly
//! - [`vm`] — the instruction set, verifier, and interpreter backend
//! - [`runtime`] — values, hash tables, sorters, query state, contexts
//! - [`storage`] — the storage/transaction collaborator interface

pub mod compiler;
pub mod error;
pub mod logging;
pub mod plan;
pub mod runtime;
pub mod storage;
pub mod vm;

// Re-export the crate surface: compile + run and the shared error type.
pub use compiler::compile;
pub use error::{ForgeError, ForgeResult, RuntimeFault};
pub use vm::{Backend, VmBackend, run};
