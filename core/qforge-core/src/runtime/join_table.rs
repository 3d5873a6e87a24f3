//! Join hash table
//!
//! Build side of a hash join. Concurrent insertion during the build
//! pipeline, an explicit `build()` barrier, then read-only probes from the
//! probe pipeline. Probing before `build()` is a program error.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ForgeResult, RuntimeFault};
use crate::runtime::value::Value;

/// Hash table from encoded join keys to the build-side rows carrying them.
pub struct JoinHashTable {
    buckets: DashMap<Vec<u8>, Vec<Vec<Value>>, ahash::RandomState>,
    built: AtomicBool,
}

impl JoinHashTable {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::with_hasher(ahash::RandomState::new()),
            built: AtomicBool::new(false),
        }
    }

    /// Insert one build-side row under its key values.
    pub fn insert(&self, keys: &[Value], row: &[Value]) -> ForgeResult<()> {
        if self.built.load(Ordering::Acquire) {
            return Err(RuntimeFault::MalformedProgram(
                "join table inserted into after build".to_string(),
            )
            .into());
        }
        let mut encoded = Vec::with_capacity(keys.len() * 9);
        for key in keys {
            key.encode_key(&mut encoded);
        }
        self.buckets.entry(encoded).or_default().push(row.to_vec());
        Ok(())
    }

    /// Build barrier: after this, the table is read-only. Runs after every
    /// worker of the build pipeline has completed.
    pub fn build(&self) {
        self.built.store(true, Ordering::Release);
    }

    /// All build rows matching `keys`. SQL equality: a Null key matches
    /// nothing.
    pub fn probe(&self, keys: &[Value]) -> ForgeResult<Vec<Vec<Value>>> {
        if !self.built.load(Ordering::Acquire) {
            return Err(RuntimeFault::MalformedProgram(
                "join table probed before build".to_string(),
            )
            .into());
        }
        if keys.iter().any(Value::is_null) {
            return Ok(Vec::new());
        }
        let mut encoded = Vec::with_capacity(keys.len() * 9);
        for key in keys {
            key.encode_key(&mut encoded);
        }
        Ok(self
            .buckets
            .get(&encoded)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}

impl Default for JoinHashTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_returns_matching_rows() {
        let table = JoinHashTable::new();
        table
            .insert(&[Value::Int(2)], &[Value::Int(2), Value::Str("x".into())])
            .unwrap();
        table
            .insert(&[Value::Int(2)], &[Value::Int(2), Value::Str("y".into())])
            .unwrap();
        table.insert(&[Value::Int(3)], &[Value::Int(3)]).unwrap();
        table.build();

        assert_eq!(table.probe(&[Value::Int(2)]).unwrap().len(), 2);
        assert_eq!(table.probe(&[Value::Int(3)]).unwrap().len(), 1);
        assert!(table.probe(&[Value::Int(4)]).unwrap().is_empty());
    }

    #[test]
    fn null_keys_never_match() {
        let table = JoinHashTable::new();
        table.insert(&[Value::Null], &[Value::Int(1)]).unwrap();
        table.build();
        assert!(table.probe(&[Value::Null]).unwrap().is_empty());
    }

    #[test]
    fn probe_before_build_is_rejected() {
        let table = JoinHashTable::new();
        table.insert(&[Value::Int(1)], &[Value::Int(1)]).unwrap();
        assert!(table.probe(&[Value::Int(1)]).is_err());
    }

    #[test]
    fn insert_after_build_is_rejected() {
        let table = JoinHashTable::new();
        table.build();
        assert!(table.insert(&[Value::Int(1)], &[Value::Int(1)]).is_err());
    }
}
