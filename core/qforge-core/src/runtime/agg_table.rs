//! Aggregation hash table
//!
//! Build side of the aggregation pipeline breaker. Inserts are safe under
//! concurrent pipeline workers; `merge_partitions` is the explicit
//! synchronization phase that freezes the table into an iterable snapshot.
//! Iteration before the merge phase is a program error.

use dashmap::DashMap;
use std::sync::OnceLock;

use crate::error::{ForgeResult, RuntimeFault};
use crate::plan::AggregateFunction;
use crate::runtime::aggregate::Aggregator;
use crate::runtime::value::Value;

struct GroupEntry {
    keys: Vec<Value>,
    aggs: Vec<Aggregator>,
}

/// Hash table keyed by encoded group values, one accumulator vector per
/// group.
pub struct AggregationHashTable {
    spec: Vec<AggregateFunction>,
    groups: DashMap<Vec<u8>, GroupEntry, ahash::RandomState>,
    frozen: OnceLock<Vec<Vec<Value>>>,
}

impl AggregationHashTable {
    pub fn new(spec: Vec<AggregateFunction>) -> Self {
        Self {
            spec,
            groups: DashMap::with_hasher(ahash::RandomState::new()),
            frozen: OnceLock::new(),
        }
    }

    pub fn aggregate_count(&self) -> usize {
        self.spec.len()
    }

    /// Insert one row: locate (or create) the group for `keys` and advance
    /// every accumulator with its argument. `args` carries one value per
    /// aggregate in spec order (ignored by COUNT(*)).
    pub fn upsert(&self, keys: &[Value], args: &[Value]) -> ForgeResult<()> {
        if self.frozen.get().is_some() {
            return Err(RuntimeFault::MalformedProgram(
                "aggregation table inserted into after merge".to_string(),
            )
            .into());
        }
        let mut encoded = Vec::with_capacity(keys.len() * 9);
        for key in keys {
            key.encode_key(&mut encoded);
        }
        let mut entry = self.groups.entry(encoded).or_insert_with(|| GroupEntry {
            keys: keys.to_vec(),
            aggs: self.spec.iter().map(|f| Aggregator::new(*f)).collect(),
        });
        for (agg, arg) in entry.aggs.iter_mut().zip(args) {
            agg.advance(arg);
        }
        Ok(())
    }

    /// Explicit post-build synchronization phase: freeze the table into a
    /// row snapshot (group keys followed by aggregate results). Runs after
    /// every worker of the build pipeline has completed; calling it twice
    /// is a no-op.
    pub fn merge_partitions(&self) {
        self.frozen.get_or_init(|| {
            self.groups
                .iter()
                .map(|entry| {
                    let mut row = entry.keys.clone();
                    row.extend(entry.aggs.iter().map(|a| a.result()));
                    row
                })
                .collect()
        });
    }

    /// Snapshot rows; only valid after `merge_partitions`.
    pub fn rows(&self) -> ForgeResult<&[Vec<Value>]> {
        self.frozen
            .get()
            .map(|rows| rows.as_slice())
            .ok_or_else(|| {
                RuntimeFault::MalformedProgram(
                    "aggregation table iterated before merge".to_string(),
                )
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_accumulate_and_freeze() {
        let table = AggregationHashTable::new(vec![AggregateFunction::Sum]);
        let a = Value::Str("a".to_string());
        let b = Value::Str("b".to_string());
        table.upsert(&[a.clone()], &[Value::Int(1)]).unwrap();
        table.upsert(&[a.clone()], &[Value::Int(2)]).unwrap();
        table.upsert(&[b.clone()], &[Value::Int(5)]).unwrap();
        table.merge_partitions();

        let mut rows = table.rows().unwrap().to_vec();
        rows.sort_by(|x, y| x[0].cmp_sql(&y[0]));
        assert_eq!(rows, vec![vec![a, Value::Int(3)], vec![b, Value::Int(5)]]);
    }

    #[test]
    fn iteration_before_merge_is_rejected() {
        let table = AggregationHashTable::new(vec![AggregateFunction::CountStar]);
        table.upsert(&[Value::Int(1)], &[Value::Null]).unwrap();
        assert!(table.rows().is_err());
    }

    #[test]
    fn concurrent_upserts_land_in_one_group() {
        use std::sync::Arc;
        let table = Arc::new(AggregationHashTable::new(vec![AggregateFunction::Sum]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        t.upsert(&[Value::Int(7)], &[Value::Int(1)]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        table.merge_partitions();
        let rows = table.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], vec![Value::Int(7), Value::Int(400)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let table = AggregationHashTable::new(vec![AggregateFunction::CountStar]);
        table.upsert(&[Value::Int(1)], &[Value::Null]).unwrap();
        table.merge_partitions();
        table.merge_partitions();
        assert_eq!(table.rows().unwrap().len(), 1);
    }
}
