//! The maplet facade: composes hashing, the slot table, and a merge
//! operator behind insert/query/contains/delete/find-slot/stats.

use crate::error::{MapletError, MapletResult};
use crate::hash::fingerprint_of;
use crate::operator::{Operator, Value};
use crate::stats::MapletStats;
use crate::table::SlotTable;

/// Resize trigger: once load factor exceeds this, the table doubles before
/// the next insert is attempted (§3 "load factor... default 0.75").
const RESIZE_HIGH_WATER: f64 = 0.75;
/// Target load factor used to size the initial table from `capacity`.
const INITIAL_LOAD_TARGET: f64 = 0.75;
/// Extra remainder bits above the false-positive-rate-implied minimum, to
/// absorb load-factor effects on collision probability within a run.
const REMAINDER_OVERHEAD_BITS: u32 = 2;

pub struct Maplet {
    table: SlotTable,
    operator: Operator,
    operator_errors: u64,
    resize_count: u64,
}

impl Maplet {
    /// `capacity` drives the initial table size; `false_positive_rate` (in
    /// `(0, 1)`) drives the remainder width. Both compete for the same
    /// 64-bit hash budget (`q + r = 64`); capacity wins ties, clamping `r`
    /// down to whatever the capacity side leaves (see DESIGN.md).
    pub fn new(capacity: usize, false_positive_rate: f64, operator: Operator) -> MapletResult<Self> {
        if capacity == 0 || !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(MapletError::InvalidQuotientSize);
        }
        let target_m = ((capacity as f64 / INITIAL_LOAD_TARGET).ceil() as u64).max(2);
        let q_for_capacity = target_m.next_power_of_two().trailing_zeros().max(1);
        let r_for_fp_rate = (-false_positive_rate.log2()).ceil().max(1.0) as u32 + REMAINDER_OVERHEAD_BITS;
        let q = q_for_capacity.min(64 - r_for_fp_rate.min(63)).max(1);

        let table = SlotTable::new(q)?;
        Ok(Self { table, operator, operator_errors: 0, resize_count: 0 })
    }

    /// Inserts `value` for `key`, aggregating via the operator if the key's
    /// slot already holds a value. Proactively resizes before the insert
    /// when the table is past its high-water mark.
    pub fn insert(&mut self, key: &[u8], value: Value) -> MapletResult<()> {
        if self.table.load_factor() >= RESIZE_HIGH_WATER {
            self.resize()?;
        }
        let hash = fingerprint_of(key);
        let (q, rem) = self.table.split_hash(hash);
        match self.table.insert(q, rem, value, &self.operator) {
            Ok(_) => Ok(()),
            Err(MapletError::OperatorError(msg)) => {
                self.operator_errors += 1;
                Err(MapletError::OperatorError(msg))
            }
            Err(e) => Err(e),
        }
    }

    pub fn query(&self, key: &[u8]) -> Option<Value> {
        let hash = fingerprint_of(key);
        let (q, rem) = self.table.split_hash(hash);
        self.table.find_slot(q, rem).and_then(|i| self.table.value_at(i).cloned())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let hash = fingerprint_of(key);
        let (q, rem) = self.table.split_hash(hash);
        self.table.find_slot(q, rem).is_some()
    }

    pub fn delete(&mut self, key: &[u8]) -> Option<Value> {
        let hash = fingerprint_of(key);
        let (q, rem) = self.table.split_hash(hash);
        self.table.delete(q, rem)
    }

    /// Absolute slot index a key currently occupies (or would be found at
    /// by `query`), for external locality inspection.
    pub fn find_slot_for_key(&self, key: &[u8]) -> Option<usize> {
        let hash = fingerprint_of(key);
        let (q, rem) = self.table.split_hash(hash);
        self.table.find_slot(q, rem)
    }

    pub fn stats(&self) -> MapletStats {
        MapletStats {
            capacity: self.table.len(),
            size: self.table.count(),
            load_factor: self.table.load_factor(),
            operator_errors: self.operator_errors,
            resize_count: self.resize_count,
            remainder_bits: self.table.remainder_width(),
            memory_bytes: self.estimate_memory(),
        }
    }

    fn resize(&mut self) -> MapletResult<()> {
        self.table.resize(&self.operator)?;
        self.resize_count += 1;
        Ok(())
    }

    fn estimate_memory(&self) -> usize {
        let per_slot = std::mem::size_of::<u64>() + 1 + std::mem::size_of::<Value>();
        self.table.len() * (per_slot + 1) // +1 byte per slot for the occupied bitmap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_counter_aggregates() {
        let mut m = Maplet::new(16, 0.01, Operator::Counter).unwrap();
        m.insert(b"key1", Value::Scalar(10)).unwrap();
        m.insert(b"key1", Value::Scalar(20)).unwrap();
        m.insert(b"key1", Value::Scalar(30)).unwrap();
        assert_eq!(m.query(b"key1"), Some(Value::Scalar(60)));
    }

    #[test]
    fn s2_max_and_min() {
        let mut max_m = Maplet::new(16, 0.01, Operator::Max).unwrap();
        max_m.insert(b"key1", Value::Scalar(10)).unwrap();
        max_m.insert(b"key1", Value::Scalar(20)).unwrap();
        max_m.insert(b"key1", Value::Scalar(30)).unwrap();
        assert_eq!(max_m.query(b"key1"), Some(Value::Scalar(30)));

        let mut min_m = Maplet::new(16, 0.01, Operator::Min).unwrap();
        min_m.insert(b"key1", Value::Scalar(10)).unwrap();
        min_m.insert(b"key1", Value::Scalar(20)).unwrap();
        min_m.insert(b"key1", Value::Scalar(30)).unwrap();
        assert_eq!(min_m.query(b"key1"), Some(Value::Scalar(10)));
    }

    #[test]
    fn s3_vector_elementwise_then_length_mismatch() {
        let mut m = Maplet::new(16, 0.01, Operator::Vector).unwrap();
        m.insert(b"a", Value::Vector(vec![1.0, 2.0, 3.0])).unwrap();
        m.insert(b"a", Value::Vector(vec![4.0, 5.0, 6.0])).unwrap();
        assert_eq!(m.query(b"a"), Some(Value::Vector(vec![5.0, 7.0, 9.0])));

        let err = m.insert(b"a", Value::Vector(vec![1.0, 2.0])).unwrap_err();
        assert!(matches!(err, MapletError::OperatorError(_)));
        // Prior value survives a failed merge (§7).
        assert_eq!(m.query(b"a"), Some(Value::Vector(vec![5.0, 7.0, 9.0])));
    }

    #[test]
    fn delete_insert_inverse() {
        let mut m = Maplet::new(16, 0.01, Operator::Counter).unwrap();
        m.insert(b"k", Value::Scalar(1)).unwrap();
        let size_before = m.stats().size;
        assert!(m.delete(b"k").is_some());
        assert_eq!(m.stats().size, size_before - 1);
        assert_eq!(m.query(b"k"), None);
    }

    #[test]
    fn resize_preserves_values_across_growth() {
        let mut m = Maplet::new(4, 0.05, Operator::Counter).unwrap();
        for i in 0..200u64 {
            m.insert(format!("k{i}").as_bytes(), Value::Scalar(i)).unwrap();
        }
        for i in 0..200u64 {
            assert_eq!(m.query(format!("k{i}").as_bytes()), Some(Value::Scalar(i)));
        }
        assert!(m.stats().resize_count > 0);
    }

    #[test]
    fn invalid_constructor_args_are_rejected() {
        assert!(Maplet::new(0, 0.01, Operator::Counter).is_err());
        assert!(Maplet::new(10, 0.0, Operator::Counter).is_err());
        assert!(Maplet::new(10, 1.0, Operator::Counter).is_err());
    }
}
