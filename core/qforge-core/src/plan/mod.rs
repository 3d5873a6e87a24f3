//! Physical plan data model
//!
//! Bound, typed physical plan trees as produced by an external planner.
//! Plans are immutable during compilation; the compiler consumes them
//! read-only and never rewrites them.

mod expr;
mod types;

pub use expr::{BinaryOperator, Expr, ScalarFunction};
pub use types::{
    AggregateExpr, AggregateFunction, Column, IndexScanSpec, PlanNode, Schema, SortKey, SqlType,
};
