//! Execution context
//!
//! Everything the invoking layer supplies to run a compiled program: the
//! active transaction, the storage collaborator, the output row sink, and
//! the worker pool. The sink sits behind a mutex so a parallel terminal
//! pipeline can emit safely.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::ForgeResult;
use crate::runtime::value::Value;
use crate::storage::{StorageEngine, TxnHandle};
use crate::vm::parallel::{ParallelizationPolicy, WorkerPool};

/// Receives result rows from the terminal pipeline.
pub trait RowSink: Send {
    fn push(&mut self, row: &[Value]) -> ForgeResult<()>;

    /// Called once after the terminal pipeline drains.
    fn finalize(&mut self) -> ForgeResult<()> {
        Ok(())
    }
}

/// Execution-time environment for one program run.
pub struct ExecutionContext {
    txn: TxnHandle,
    storage: Arc<dyn StorageEngine>,
    sink: Mutex<Box<dyn RowSink>>,
    pool: WorkerPool,
}

impl ExecutionContext {
    pub fn new(storage: Arc<dyn StorageEngine>, txn: TxnHandle, sink: Box<dyn RowSink>) -> Self {
        Self {
            txn,
            storage,
            sink: Mutex::new(sink),
            pool: WorkerPool::default(),
        }
    }

    pub fn with_policy(
        storage: Arc<dyn StorageEngine>,
        txn: TxnHandle,
        sink: Box<dyn RowSink>,
        policy: ParallelizationPolicy,
    ) -> ForgeResult<Self> {
        Ok(Self {
            txn,
            storage,
            sink: Mutex::new(sink),
            pool: WorkerPool::new(policy)?,
        })
    }

    pub fn txn(&self) -> TxnHandle {
        self.txn
    }

    pub fn storage(&self) -> &dyn StorageEngine {
        self.storage.as_ref()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn emit_row(&self, row: &[Value]) -> ForgeResult<()> {
        self.sink.lock().push(row)
    }

    pub fn finalize_output(&self) -> ForgeResult<()> {
        self.sink.lock().finalize()
    }
}

/// Sink that collects rows into a shared vector (tests, examples).
pub struct CollectingSink {
    rows: Arc<Mutex<Vec<Vec<Value>>>>,
}

impl CollectingSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<Vec<Value>>>>) {
        let rows = Arc::new(Mutex::new(Vec::new()));
        (Self { rows: Arc::clone(&rows) }, rows)
    }
}

impl RowSink for CollectingSink {
    fn push(&mut self, row: &[Value]) -> ForgeResult<()> {
        self.rows.lock().push(row.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[test]
    fn collecting_sink_gathers_rows() {
        let (sink, rows) = CollectingSink::new();
        let ctx = ExecutionContext::new(Arc::new(MemStorage::new()), TxnHandle(1), Box::new(sink));
        ctx.emit_row(&[Value::Int(1)]).unwrap();
        ctx.emit_row(&[Value::Int(2)]).unwrap();
        ctx.finalize_output().unwrap();
        assert_eq!(rows.lock().len(), 2);
    }
}
