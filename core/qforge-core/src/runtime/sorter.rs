//! External-style sorter
//!
//! Build side of the order-by pipeline breaker. Rows are appended under a
//! mutex (cheap enough for the insert path, safe under parallel pipeline
//! workers), then `sort()` freezes an ordered snapshot. With a top-K bound
//! the buffer is pruned during the build so memory stays proportional to K.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::OnceLock;

use crate::error::{ForgeResult, RuntimeFault};
use crate::plan::SortKey;
use crate::runtime::value::Value;

/// Ordering specification: keys in priority order plus an optional top-K
/// retention bound.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub keys: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl SortSpec {
    /// Multi-key comparison with per-key direction and null placement;
    /// later keys break ties.
    pub fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        for key in &self.keys {
            let (av, bv) = (&a[key.column], &b[key.column]);
            let ord = match (av.is_null(), bv.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    if key.nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (false, true) => {
                    if key.nulls_first {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                (false, false) => {
                    let ord = av.cmp_sql(bv);
                    if key.asc { ord } else { ord.reverse() }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

pub struct Sorter {
    spec: SortSpec,
    buf: Mutex<Vec<Vec<Value>>>,
    sorted: OnceLock<Vec<Vec<Value>>>,
}

impl Sorter {
    pub fn new(spec: SortSpec) -> Self {
        Self {
            spec,
            buf: Mutex::new(Vec::new()),
            sorted: OnceLock::new(),
        }
    }

    /// Append one row. With a top-K bound, prune once the buffer reaches
    /// twice the bound.
    pub fn insert(&self, row: Vec<Value>) -> ForgeResult<()> {
        if self.sorted.get().is_some() {
            return Err(RuntimeFault::MalformedProgram(
                "sorter inserted into after sort".to_string(),
            )
            .into());
        }
        let mut buf = self.buf.lock();
        buf.push(row);
        if let Some(limit) = self.spec.limit
            && buf.len() >= limit.saturating_mul(2).max(64)
        {
            let spec = &self.spec;
            buf.sort_by(|a, b| spec.compare(a, b));
            buf.truncate(limit);
        }
        Ok(())
    }

    /// Sort barrier: order the buffer (stably) and freeze the snapshot.
    /// Runs after every build worker completes; calling it twice is a
    /// no-op.
    pub fn sort(&self) {
        self.sorted.get_or_init(|| {
            let mut rows = std::mem::take(&mut *self.buf.lock());
            let spec = &self.spec;
            rows.sort_by(|a, b| spec.compare(a, b));
            if let Some(limit) = spec.limit {
                rows.truncate(limit);
            }
            rows
        });
    }

    /// Ordered rows; only valid after `sort()`.
    pub fn rows(&self) -> ForgeResult<&[Vec<Value>]> {
        self.sorted
            .get()
            .map(|rows| rows.as_slice())
            .ok_or_else(|| {
                RuntimeFault::MalformedProgram("sorter iterated before sort".to_string()).into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(keys: Vec<SortKey>, limit: Option<usize>) -> SortSpec {
        SortSpec { keys, limit }
    }

    #[test]
    fn two_key_ordering_breaks_ties_deterministically() {
        let sorter = Sorter::new(spec(vec![SortKey::asc(0), SortKey::desc(1)], None));
        sorter.insert(vec![Value::Int(1), Value::Int(10)]).unwrap();
        sorter.insert(vec![Value::Int(1), Value::Int(20)]).unwrap();
        sorter.insert(vec![Value::Int(0), Value::Int(5)]).unwrap();
        sorter.sort();
        let rows = sorter.rows().unwrap();
        assert_eq!(rows[0], vec![Value::Int(0), Value::Int(5)]);
        assert_eq!(rows[1], vec![Value::Int(1), Value::Int(20)]);
        assert_eq!(rows[2], vec![Value::Int(1), Value::Int(10)]);
    }

    #[test]
    fn nulls_first_on_ascending_keys() {
        let sorter = Sorter::new(spec(vec![SortKey::asc(0)], None));
        sorter.insert(vec![Value::Int(1)]).unwrap();
        sorter.insert(vec![Value::Null]).unwrap();
        sorter.sort();
        assert!(sorter.rows().unwrap()[0][0].is_null());
    }

    #[test]
    fn top_k_keeps_the_smallest_k() {
        let sorter = Sorter::new(spec(vec![SortKey::asc(0)], Some(3)));
        for i in (0..200).rev() {
            sorter.insert(vec![Value::Int(i)]).unwrap();
        }
        sorter.sort();
        let rows = sorter.rows().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![Value::Int(0)]);
        assert_eq!(rows[2], vec![Value::Int(2)]);
    }

    #[test]
    fn rows_before_sort_is_rejected() {
        let sorter = Sorter::new(spec(vec![SortKey::asc(0)], None));
        sorter.insert(vec![Value::Int(1)]).unwrap();
        assert!(sorter.rows().is_err());
    }
}
