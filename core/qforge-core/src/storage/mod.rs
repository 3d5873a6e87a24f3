//! Storage and transaction collaborator interface
//!
//! The compilation core does not implement tuple storage, MVCC, or
//! indexes; it consumes them through this narrow surface. `MemStorage`
//! provides a vector-backed implementation for tests and examples.

pub mod mem;

pub use mem::{MemStorage, MemTransactionManager};

use crate::error::ForgeResult;
use crate::runtime::value::Value;

pub type TableId = u32;
pub type IndexId = u32;
pub type RowId = u64;

/// Opaque transaction handle issued by the transaction collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnHandle(pub u64);

/// One batch of rows from a scan, column-major. `row_ids` runs parallel to
/// the rows and feeds mutation operators.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub columns: Vec<Vec<Value>>,
    pub row_ids: Vec<RowId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.row_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_ids.is_empty()
    }
}

/// Forward cursor over a table (or one partition of it).
pub trait TableCursor: Send {
    /// Next batch of rows, or `None` at end of scan.
    fn advance(&mut self, txn: TxnHandle) -> ForgeResult<Option<Batch>>;
}

/// Cursor over a secondary index. A scan method positions the cursor;
/// `advance` then yields full rows of the indexed table in index order.
pub trait IndexCursor: Send {
    /// Exact-match lookup on the full key.
    fn scan_key(&mut self, key: &[Value]) -> ForgeResult<()>;

    /// Range scan low..=high in ascending key order, with an optional
    /// result bound.
    fn scan_ascending(
        &mut self,
        low: &[Value],
        high: &[Value],
        limit: Option<usize>,
    ) -> ForgeResult<()>;

    /// Range scan high..=low in descending key order.
    fn scan_descending(
        &mut self,
        low: &[Value],
        high: &[Value],
        limit: Option<usize>,
    ) -> ForgeResult<()>;

    /// Next matching row, or `None` when the positioned scan is drained.
    fn advance(&mut self) -> ForgeResult<Option<Vec<Value>>>;
}

/// The storage engine surface consumed by compiled programs.
pub trait StorageEngine: Send + Sync {
    /// Open a full-table scan. `columns` selects the column set; empty
    /// means all columns.
    fn open_scan(
        &self,
        table: TableId,
        columns: &[usize],
        txn: TxnHandle,
    ) -> ForgeResult<Box<dyn TableCursor>>;

    /// Open a scan over one of `parts` disjoint partitions of the table.
    fn open_scan_partition(
        &self,
        table: TableId,
        columns: &[usize],
        part: usize,
        parts: usize,
        txn: TxnHandle,
    ) -> ForgeResult<Box<dyn TableCursor>>;

    /// Open an index cursor.
    fn open_index(&self, index: IndexId, txn: TxnHandle) -> ForgeResult<Box<dyn IndexCursor>>;

    /// Insert a row, returning its id.
    fn insert(&self, txn: TxnHandle, table: TableId, row: &[Value]) -> ForgeResult<RowId>;

    /// Replace the row with the given id; false if it no longer exists.
    fn update(
        &self,
        txn: TxnHandle,
        table: TableId,
        row_id: RowId,
        row: &[Value],
    ) -> ForgeResult<bool>;

    /// Delete the row with the given id; false if it no longer exists.
    fn delete(&self, txn: TxnHandle, table: TableId, row_id: RowId) -> ForgeResult<bool>;
}

/// The transaction manager surface.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> ForgeResult<TxnHandle>;
    fn commit(&self, txn: TxnHandle, callback: Box<dyn FnOnce() + Send>) -> ForgeResult<()>;
    fn abort(&self, txn: TxnHandle) -> ForgeResult<()>;
}
