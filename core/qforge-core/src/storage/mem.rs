//! In-memory storage engine
//!
//! Vector-backed tables and ordered secondary indexes, used by tests and
//! examples. Scans snapshot the table at open time; transaction handles
//! are accepted but not interpreted (isolation is the real engine's job).

use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ForgeError, ForgeResult};
use crate::plan::Schema;
use crate::runtime::value::Value;
use crate::storage::{
    Batch, IndexCursor, IndexId, RowId, StorageEngine, TableCursor, TableId, TransactionManager,
    TxnHandle,
};

const DEFAULT_BATCH_SIZE: usize = 1024;

struct MemTable {
    schema: Schema,
    /// Slot per ever-inserted row; `None` marks a deleted row. RowId is the
    /// slot index.
    rows: Vec<Option<Vec<Value>>>,
}

struct MemIndex {
    table: TableId,
    key_columns: Vec<usize>,
}

/// Vector-backed storage engine.
pub struct MemStorage {
    tables: RwLock<AHashMap<TableId, MemTable>>,
    indexes: RwLock<AHashMap<IndexId, MemIndex>>,
    batch_size: usize,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(AHashMap::new()),
            indexes: RwLock::new(AHashMap::new()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Smaller batches exercise the multi-batch scan path in tests.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..Self::new()
        }
    }

    pub fn create_table(&self, table: TableId, schema: Schema) {
        self.tables.write().insert(
            table,
            MemTable {
                schema,
                rows: Vec::new(),
            },
        );
    }

    /// Bulk-append rows (test setup convenience).
    pub fn load(&self, table: TableId, rows: Vec<Vec<Value>>) -> ForgeResult<()> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&table)
            .ok_or(ForgeError::TableNotFound(table))?;
        t.rows.extend(rows.into_iter().map(Some));
        Ok(())
    }

    pub fn create_index(&self, index: IndexId, table: TableId, key_columns: Vec<usize>) {
        self.indexes
            .write()
            .insert(index, MemIndex { table, key_columns });
    }

    pub fn table_schema(&self, table: TableId) -> Option<Schema> {
        self.tables.read().get(&table).map(|t| t.schema.clone())
    }

    /// Live rows in row-id order (test assertions).
    pub fn snapshot(&self, table: TableId) -> ForgeResult<Vec<Vec<Value>>> {
        let tables = self.tables.read();
        let t = tables.get(&table).ok_or(ForgeError::TableNotFound(table))?;
        Ok(t.rows.iter().flatten().cloned().collect())
    }

    fn snapshot_with_ids(
        &self,
        table: TableId,
    ) -> ForgeResult<(Vec<(RowId, Vec<Value>)>, usize)> {
        let tables = self.tables.read();
        let t = tables.get(&table).ok_or(ForgeError::TableNotFound(table))?;
        let rows = t
            .rows
            .iter()
            .enumerate()
            .filter_map(|(id, row)| row.as_ref().map(|r| (id as RowId, r.clone())))
            .collect();
        Ok((rows, t.schema.arity()))
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

struct MemCursor {
    batches: Vec<Batch>,
    pos: usize,
}

impl TableCursor for MemCursor {
    fn advance(&mut self, _txn: TxnHandle) -> ForgeResult<Option<Batch>> {
        if self.pos >= self.batches.len() {
            return Ok(None);
        }
        let batch = std::mem::take(&mut self.batches[self.pos]);
        self.pos += 1;
        Ok(Some(batch))
    }
}

fn make_batches(
    rows: Vec<(RowId, Vec<Value>)>,
    columns: &[usize],
    arity: usize,
    batch_size: usize,
) -> Vec<Batch> {
    let projected: Vec<usize> = if columns.is_empty() {
        (0..arity).collect()
    } else {
        columns.to_vec()
    };
    rows.chunks(batch_size)
        .map(|chunk| {
            let mut batch = Batch {
                columns: vec![Vec::with_capacity(chunk.len()); projected.len()],
                row_ids: Vec::with_capacity(chunk.len()),
            };
            for (id, row) in chunk {
                batch.row_ids.push(*id);
                for (out, &col) in batch.columns.iter_mut().zip(&projected) {
                    out.push(row.get(col).cloned().unwrap_or(Value::Null));
                }
            }
            batch
        })
        .collect()
}

struct MemIndexCursor {
    /// (key, row) pairs snapshotted at open, in table order.
    entries: Vec<(Vec<Value>, Vec<Value>)>,
    /// Result rows of the positioned scan, drained front to back.
    results: std::collections::VecDeque<Vec<Value>>,
}

impl MemIndexCursor {
    fn position(&mut self, rows: Vec<Vec<Value>>) {
        self.results = rows.into();
    }

    fn in_range(key: &[Value], low: &[Value], high: &[Value]) -> bool {
        let ge_low = low.is_empty()
            || key.iter().zip(low).fold(std::cmp::Ordering::Equal, |acc, (k, l)| {
                acc.then(k.cmp_sql(l))
            }) != std::cmp::Ordering::Less;
        let le_high = high.is_empty()
            || key.iter().zip(high).fold(std::cmp::Ordering::Equal, |acc, (k, h)| {
                acc.then(k.cmp_sql(h))
            }) != std::cmp::Ordering::Greater;
        ge_low && le_high
    }

    fn ranged(&self, low: &[Value], high: &[Value], ascending: bool) -> Vec<Vec<Value>> {
        let mut hits: Vec<&(Vec<Value>, Vec<Value>)> = self
            .entries
            .iter()
            .filter(|(key, _)| Self::in_range(key, low, high))
            .collect();
        hits.sort_by(|(ka, _), (kb, _)| {
            ka.iter()
                .zip(kb.iter())
                .fold(std::cmp::Ordering::Equal, |acc, (a, b)| acc.then(a.cmp_sql(b)))
        });
        if !ascending {
            hits.reverse();
        }
        hits.into_iter().map(|(_, row)| row.clone()).collect()
    }
}

impl IndexCursor for MemIndexCursor {
    fn scan_key(&mut self, key: &[Value]) -> ForgeResult<()> {
        let rows = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_slice() == key)
            .map(|(_, row)| row.clone())
            .collect();
        self.position(rows);
        Ok(())
    }

    fn scan_ascending(
        &mut self,
        low: &[Value],
        high: &[Value],
        limit: Option<usize>,
    ) -> ForgeResult<()> {
        let mut rows = self.ranged(low, high, true);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        self.position(rows);
        Ok(())
    }

    fn scan_descending(
        &mut self,
        low: &[Value],
        high: &[Value],
        limit: Option<usize>,
    ) -> ForgeResult<()> {
        let mut rows = self.ranged(low, high, false);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        self.position(rows);
        Ok(())
    }

    fn advance(&mut self) -> ForgeResult<Option<Vec<Value>>> {
        Ok(self.results.pop_front())
    }
}

impl StorageEngine for MemStorage {
    fn open_scan(
        &self,
        table: TableId,
        columns: &[usize],
        txn: TxnHandle,
    ) -> ForgeResult<Box<dyn TableCursor>> {
        self.open_scan_partition(table, columns, 0, 1, txn)
    }

    fn open_scan_partition(
        &self,
        table: TableId,
        columns: &[usize],
        part: usize,
        parts: usize,
        _txn: TxnHandle,
    ) -> ForgeResult<Box<dyn TableCursor>> {
        let (rows, arity) = self.snapshot_with_ids(table)?;
        let parts = parts.max(1);
        let chunk = rows.len().div_ceil(parts).max(1);
        let slice: Vec<_> = rows
            .into_iter()
            .skip(part * chunk)
            .take(chunk)
            .collect();
        Ok(Box::new(MemCursor {
            batches: make_batches(slice, columns, arity, self.batch_size),
            pos: 0,
        }))
    }

    fn open_index(&self, index: IndexId, _txn: TxnHandle) -> ForgeResult<Box<dyn IndexCursor>> {
        let indexes = self.indexes.read();
        let idx = indexes.get(&index).ok_or(ForgeError::IndexNotFound(index))?;
        let (rows, _) = self.snapshot_with_ids(idx.table)?;
        let entries = rows
            .into_iter()
            .map(|(_, row)| {
                let key = idx.key_columns.iter().map(|&c| row[c].clone()).collect();
                (key, row)
            })
            .collect();
        Ok(Box::new(MemIndexCursor {
            entries,
            results: std::collections::VecDeque::new(),
        }))
    }

    fn insert(&self, _txn: TxnHandle, table: TableId, row: &[Value]) -> ForgeResult<RowId> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&table)
            .ok_or(ForgeError::TableNotFound(table))?;
        if row.len() != t.schema.arity() {
            return Err(ForgeError::InvalidPlan(format!(
                "insert arity {} does not match table arity {}",
                row.len(),
                t.schema.arity()
            )));
        }
        t.rows.push(Some(row.to_vec()));
        Ok((t.rows.len() - 1) as RowId)
    }

    fn update(
        &self,
        _txn: TxnHandle,
        table: TableId,
        row_id: RowId,
        row: &[Value],
    ) -> ForgeResult<bool> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&table)
            .ok_or(ForgeError::TableNotFound(table))?;
        match t.rows.get_mut(row_id as usize) {
            Some(slot @ Some(_)) => {
                *slot = Some(row.to_vec());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, _txn: TxnHandle, table: TableId, row_id: RowId) -> ForgeResult<bool> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&table)
            .ok_or(ForgeError::TableNotFound(table))?;
        match t.rows.get_mut(row_id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Counter-based transaction manager; commit runs its callback eagerly.
pub struct MemTransactionManager {
    next: AtomicU64,
}

impl MemTransactionManager {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl Default for MemTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for MemTransactionManager {
    fn begin(&self) -> ForgeResult<TxnHandle> {
        Ok(TxnHandle(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn commit(&self, _txn: TxnHandle, callback: Box<dyn FnOnce() + Send>) -> ForgeResult<()> {
        callback();
        Ok(())
    }

    fn abort(&self, _txn: TxnHandle) -> ForgeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Column, SqlType};

    fn int_table(storage: &MemStorage, id: TableId, values: &[i64]) {
        storage.create_table(id, Schema::new(vec![Column::new("v", SqlType::Int)]));
        storage
            .load(id, values.iter().map(|&v| vec![Value::Int(v)]).collect())
            .unwrap();
    }

    #[test]
    fn scan_yields_all_rows_in_batches() {
        let storage = MemStorage::with_batch_size(2);
        int_table(&storage, 1, &[1, 2, 3, 4, 5]);
        let mut cursor = storage.open_scan(1, &[], TxnHandle(0)).unwrap();
        let mut seen = Vec::new();
        while let Some(batch) = cursor.advance(TxnHandle(0)).unwrap() {
            assert!(batch.len() <= 2);
            seen.extend(batch.columns[0].iter().cloned());
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn partitions_are_disjoint_and_complete() {
        let storage = MemStorage::new();
        int_table(&storage, 1, &[1, 2, 3, 4, 5, 6, 7]);
        let mut all = Vec::new();
        for part in 0..3 {
            let mut cursor = storage
                .open_scan_partition(1, &[], part, 3, TxnHandle(0))
                .unwrap();
            while let Some(batch) = cursor.advance(TxnHandle(0)).unwrap() {
                all.extend(batch.columns[0].iter().cloned());
            }
        }
        all.sort_by(|a, b| a.cmp_sql(b));
        assert_eq!(all.len(), 7);
        assert_eq!(all[0], Value::Int(1));
        assert_eq!(all[6], Value::Int(7));
    }

    #[test]
    fn update_and_delete_by_row_id() {
        let storage = MemStorage::new();
        int_table(&storage, 1, &[10]);
        assert!(storage.update(TxnHandle(0), 1, 0, &[Value::Int(11)]).unwrap());
        assert_eq!(storage.snapshot(1).unwrap(), vec![vec![Value::Int(11)]]);
        assert!(storage.delete(TxnHandle(0), 1, 0).unwrap());
        assert!(!storage.delete(TxnHandle(0), 1, 0).unwrap());
        assert!(storage.snapshot(1).unwrap().is_empty());
    }

    #[test]
    fn index_point_and_range_scans() {
        let storage = MemStorage::new();
        int_table(&storage, 1, &[30, 10, 20]);
        storage.create_index(7, 1, vec![0]);
        let mut cursor = storage.open_index(7, TxnHandle(0)).unwrap();

        cursor.scan_key(&[Value::Int(20)]).unwrap();
        assert_eq!(cursor.advance().unwrap(), Some(vec![Value::Int(20)]));
        assert_eq!(cursor.advance().unwrap(), None);

        cursor
            .scan_ascending(&[Value::Int(10)], &[Value::Int(30)], Some(2))
            .unwrap();
        assert_eq!(cursor.advance().unwrap(), Some(vec![Value::Int(10)]));
        assert_eq!(cursor.advance().unwrap(), Some(vec![Value::Int(20)]));
        assert_eq!(cursor.advance().unwrap(), None);

        cursor.scan_descending(&[], &[], None).unwrap();
        assert_eq!(cursor.advance().unwrap(), Some(vec![Value::Int(30)]));
    }

    #[test]
    fn commit_runs_callback() {
        let mgr = MemTransactionManager::new();
        let txn = mgr.begin().unwrap();
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = flag.clone();
        mgr.commit(txn, Box::new(move || f.store(true, Ordering::SeqCst)))
            .unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
