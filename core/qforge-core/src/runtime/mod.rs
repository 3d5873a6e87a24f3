//! Runtime structures referenced by compiled programs
//!
//! Values, aggregate accumulators, the materialization structures behind
//! pipeline breakers, per-execution query state, and the execution
//! context supplied by the invoking layer.

pub mod agg_table;
pub mod aggregate;
pub mod context;
pub mod join_table;
pub mod sorter;
pub mod state;
pub mod value;

pub use agg_table::AggregationHashTable;
pub use aggregate::Aggregator;
pub use context::{CollectingSink, ExecutionContext, RowSink};
pub use join_table::JoinHashTable;
pub use sorter::{SortSpec, Sorter};
pub use state::{QueryState, StateSlot};
pub use value::Value;
