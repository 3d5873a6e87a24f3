//! Per-execution query state
//!
//! One slot vector per program execution, shaped by the compiled state
//! layout. Every runtime structure (hash tables, sorters) lives in exactly
//! one slot: constructed by the init function, read by pipeline functions,
//! released exactly once by teardown. Freeing an already-empty slot is a
//! no-op, which is what makes teardown idempotent.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ForgeResult, RuntimeFault};
use crate::runtime::agg_table::AggregationHashTable;
use crate::runtime::join_table::JoinHashTable;
use crate::runtime::sorter::Sorter;

/// Contents of one global-state slot.
pub enum StateSlot {
    Empty,
    AggTable(AggregationHashTable),
    JoinTable(JoinHashTable),
    Sorter(Sorter),
}

/// The runtime instance of the compiled global state record.
pub struct QueryState {
    slots: Vec<RwLock<StateSlot>>,
    torn_down: AtomicBool,
}

impl QueryState {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| RwLock::new(StateSlot::Empty)).collect(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Install a structure into a slot (init path).
    pub fn put(&self, idx: usize, slot: StateSlot) -> ForgeResult<()> {
        let lock = self
            .slots
            .get(idx)
            .ok_or(RuntimeFault::DeadStateSlot(idx))?;
        *lock.write() = slot;
        Ok(())
    }

    /// Release a slot (teardown path). Idempotent.
    pub fn free(&self, idx: usize) -> ForgeResult<()> {
        let lock = self
            .slots
            .get(idx)
            .ok_or(RuntimeFault::DeadStateSlot(idx))?;
        *lock.write() = StateSlot::Empty;
        Ok(())
    }

    pub fn with_agg_table<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&AggregationHashTable) -> ForgeResult<R>,
    ) -> ForgeResult<R> {
        let lock = self
            .slots
            .get(idx)
            .ok_or(RuntimeFault::DeadStateSlot(idx))?;
        match &*lock.read() {
            StateSlot::AggTable(table) => f(table),
            _ => Err(RuntimeFault::DeadStateSlot(idx).into()),
        }
    }

    pub fn with_join_table<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&JoinHashTable) -> ForgeResult<R>,
    ) -> ForgeResult<R> {
        let lock = self
            .slots
            .get(idx)
            .ok_or(RuntimeFault::DeadStateSlot(idx))?;
        match &*lock.read() {
            StateSlot::JoinTable(table) => f(table),
            _ => Err(RuntimeFault::DeadStateSlot(idx).into()),
        }
    }

    pub fn with_sorter<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&Sorter) -> ForgeResult<R>,
    ) -> ForgeResult<R> {
        let lock = self
            .slots
            .get(idx)
            .ok_or(RuntimeFault::DeadStateSlot(idx))?;
        match &*lock.read() {
            StateSlot::Sorter(sorter) => f(sorter),
            _ => Err(RuntimeFault::DeadStateSlot(idx).into()),
        }
    }

    /// Record that the teardown function ran. Returns false if it already
    /// had, so the host never runs it twice.
    pub fn mark_torn_down(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::AggregateFunction;
    use crate::runtime::value::Value;

    #[test]
    fn put_access_free_cycle() {
        let state = QueryState::new(2);
        state
            .put(
                0,
                StateSlot::AggTable(AggregationHashTable::new(vec![AggregateFunction::CountStar])),
            )
            .unwrap();
        state
            .with_agg_table(0, |t| t.upsert(&[Value::Int(1)], &[Value::Null]))
            .unwrap();
        state.free(0).unwrap();
        assert!(state.with_agg_table(0, |_| Ok(())).is_err());
    }

    #[test]
    fn free_is_idempotent() {
        let state = QueryState::new(1);
        state.put(0, StateSlot::JoinTable(JoinHashTable::new())).unwrap();
        state.free(0).unwrap();
        state.free(0).unwrap();
    }

    #[test]
    fn wrong_slot_kind_is_a_fault() {
        let state = QueryState::new(1);
        state.put(0, StateSlot::JoinTable(JoinHashTable::new())).unwrap();
        assert!(state.with_sorter(0, |_| Ok(())).is_err());
    }

    #[test]
    fn teardown_marker_flips_once() {
        let state = QueryState::new(0);
        assert!(state.mark_torn_down());
        assert!(!state.mark_torn_down());
    }
}
