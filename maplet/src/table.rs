//! The bit-packed slot table: quotient-filter probe, insertion, query,
//! delete and resize. Grounded on `quotient-filter`'s
//! `generic::filter::QuotientFilter<T>` (cluster/run scanning helpers,
//! shift-on-insert), with a separate `occupied` bitmap (see `slot.rs`) and a
//! proper shift-left delete instead of the teacher's tombstone approach,
//! since spec's invariants call for both.

use std::cmp::Ordering;

use crate::error::MapletError;
use crate::hash::{combine, split};
use crate::operator::{Operator, Value};
use crate::slot::{MetadataType, Slot};

pub(crate) struct SlotTable {
    r: u32,
    slots: Vec<Slot>,
    occupied: Vec<bool>,
    count: usize,
}

impl SlotTable {
    /// `q` is the quotient width in bits; table length is `2^q`.
    pub(crate) fn new(q: u32) -> Result<Self, MapletError> {
        if q == 0 || q >= 64 {
            return Err(MapletError::InvalidQuotientSize);
        }
        let size = 1usize << q;
        Ok(Self {
            r: 64 - q,
            slots: (0..size).map(|_| Slot::empty()).collect(),
            occupied: vec![false; size],
            count: 0,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn remainder_width(&self) -> u32 {
        self.r
    }

    pub(crate) fn load_factor(&self) -> f64 {
        self.count as f64 / self.slots.len() as f64
    }

    pub(crate) fn split_hash(&self, hash: u64) -> (usize, u64) {
        split(hash, self.r)
    }

    #[inline(always)]
    fn index_up(&self, idx: usize) -> usize {
        (idx + 1) % self.slots.len()
    }

    #[inline(always)]
    fn index_down(&self, idx: usize) -> usize {
        if idx == 0 { self.slots.len() - 1 } else { idx - 1 }
    }

    fn start_of_cluster(&self, start: usize) -> usize {
        let mut idx = start;
        while self.slots[idx].is_shifted() {
            idx = self.index_down(idx);
        }
        idx
    }

    fn lowest_of_run(&self, start: usize) -> usize {
        let mut idx = start;
        while self.slots[idx].is_continuation() {
            idx = self.index_up(idx);
        }
        idx
    }

    fn skip_unoccupied(&self, start: usize) -> usize {
        let mut idx = start;
        while !self.occupied[idx] {
            idx = self.index_up(idx);
        }
        idx
    }

    /// Locates the current start of `quotient`'s run. Requires
    /// `occupied[quotient]` to already be set; otherwise the result is
    /// meaningless.
    fn locate_run_start(&self, quotient: usize) -> usize {
        let mut b = self.start_of_cluster(quotient);
        let mut s = b;
        while b != quotient {
            s = self.index_up(s);
            s = self.lowest_of_run(s);
            b = self.index_up(b);
            b = self.skip_unoccupied(b);
        }
        s
    }

    /// Returns the absolute slot index holding `(quotient, remainder)`, if any.
    pub(crate) fn find_slot(&self, quotient: usize, remainder: u64) -> Option<usize> {
        if !self.occupied[quotient] {
            return None;
        }
        let mut pos = self.locate_run_start(quotient);
        let mut i = 0usize;
        loop {
            if self.slots[pos].is_empty() {
                return None;
            }
            if i > 0 && !self.slots[pos].is_continuation() {
                return None;
            }
            match self.slots[pos].remainder().cmp(&remainder) {
                Ordering::Equal => return Some(pos),
                Ordering::Greater => return None,
                Ordering::Less => {
                    pos = self.index_up(pos);
                    i += 1;
                }
            }
        }
    }

    pub(crate) fn value_at(&self, slot_index: usize) -> Option<&Value> {
        self.slots[slot_index].value()
    }

    /// Inserts or aggregates `value` at `(quotient, remainder)`. Returns the
    /// absolute slot index. Operator errors leave the existing slot's value
    /// untouched (§7).
    pub(crate) fn insert(
        &mut self,
        quotient: usize,
        remainder: u64,
        value: Value,
        operator: &Operator,
    ) -> Result<usize, MapletError> {
        if self.count >= self.slots.len() {
            return Err(MapletError::CapacityExceeded);
        }

        let was_occupied = self.occupied[quotient];
        self.occupied[quotient] = true;

        if self.slots[quotient].is_empty() {
            self.slots[quotient] = Slot::new(remainder, value);
            self.count += 1;
            return Ok(quotient);
        }

        // `locate_run_start` relies on `occupied[quotient]` already being set
        // (above) to terminate its cluster walk at `quotient`. That walk
        // always lands on the start of the first run whose canonical
        // quotient is >= ours: if our own run already exists, that's it; if
        // it doesn't, this is the start of the *next* occupied quotient's
        // run (or the first empty slot past the cluster tail), which is
        // exactly where a brand-new run belongs so that runs stay ordered
        // by canonical quotient within the cluster.
        let run_start = self.locate_run_start(quotient);

        let (insert_index, new_continuation, force_continuation_on_first_displaced) = if was_occupied {
            let run_had_existing = !self.slots[run_start].is_empty();

            let mut pos = run_start;
            let mut i = 0usize;
            loop {
                if self.slots[pos].is_empty() {
                    break;
                }
                if i > 0 && !self.slots[pos].is_continuation() {
                    break;
                }
                match self.slots[pos].remainder().cmp(&remainder) {
                    Ordering::Equal => {
                        let existing = self.slots[pos].value().unwrap().clone();
                        let merged = operator.merge(&existing, &value)?;
                        self.slots[pos].set_value(merged);
                        return Ok(pos);
                    }
                    Ordering::Greater => break,
                    Ordering::Less => {
                        pos = self.index_up(pos);
                        i += 1;
                    }
                }
            }

            let insert_index = pos;
            let inserted_at_run_start = insert_index == run_start;
            let new_continuation = run_had_existing && !inserted_at_run_start;
            let force_continuation_on_first_displaced = run_had_existing && inserted_at_run_start;
            (insert_index, new_continuation, force_continuation_on_first_displaced)
        } else {
            // Brand-new run: nothing to scan or merge against, since no key
            // with this quotient has ever been inserted. `run_start` is the
            // next run in the cluster (or the cluster's empty tail); insert
            // directly there, displacing that run and everything after it
            // rightward. The displaced element keeps its own continuation
            // bit — it's still the head of its own run, just physically
            // shifted one slot further from home.
            (run_start, false, false)
        };

        let mut new_slot = Slot::new(remainder, value);
        if new_continuation {
            new_slot.set_metadata(MetadataType::Continuation);
        }
        if insert_index != quotient {
            new_slot.set_metadata(MetadataType::Shifted);
        }

        let mut carry = new_slot;
        let mut pos = insert_index;
        let mut first = true;
        loop {
            if self.slots[pos].is_empty() {
                self.slots[pos] = carry;
                break;
            }
            let mut displaced = std::mem::replace(&mut self.slots[pos], Slot::empty());
            displaced.set_metadata(MetadataType::Shifted);
            if first && force_continuation_on_first_displaced {
                displaced.set_metadata(MetadataType::Continuation);
            }
            self.slots[pos] = carry;
            carry = displaced;
            pos = self.index_up(pos);
            first = false;
        }

        self.count += 1;
        Ok(insert_index)
    }

    /// Removes `(quotient, remainder)`, shifting the cluster tail left by
    /// one. Returns the removed value, if any.
    pub(crate) fn delete(&mut self, quotient: usize, remainder: u64) -> Option<Value> {
        if !self.occupied[quotient] {
            return None;
        }
        let run_start = self.locate_run_start(quotient);
        let mut pos = run_start;
        let mut i = 0usize;
        let target = loop {
            if self.slots[pos].is_empty() {
                return None;
            }
            if i > 0 && !self.slots[pos].is_continuation() {
                return None;
            }
            match self.slots[pos].remainder().cmp(&remainder) {
                Ordering::Equal => break pos,
                Ordering::Greater => return None,
                Ordering::Less => {
                    pos = self.index_up(pos);
                    i += 1;
                }
            }
        };

        let removed_was_run_start = i == 0;
        let has_other_member = i > 0 || self.slots[self.index_up(target)].is_continuation();
        let value = self.slots[target].take_value();

        let mut cur = target;
        let mut fixup_next_run_start = removed_was_run_start;
        loop {
            let next = self.index_up(cur);
            if self.slots[next].is_empty() || !self.slots[next].is_shifted() {
                self.slots[cur].clear();
                break;
            }
            let mut moved = std::mem::replace(&mut self.slots[next], Slot::empty());
            if fixup_next_run_start {
                moved.clear_metadata(MetadataType::Continuation);
            }
            fixup_next_run_start = false;
            self.slots[cur] = moved;
            cur = next;
        }

        self.count -= 1;
        if !has_other_member {
            self.occupied[quotient] = false;
        }
        value
    }

    fn collect_entries(&self) -> Vec<(u64, Value)> {
        let mut entries = Vec::with_capacity(self.count);
        for q in 0..self.slots.len() {
            if !self.occupied[q] {
                continue;
            }
            let mut pos = self.locate_run_start(q);
            let mut i = 0usize;
            loop {
                if self.slots[pos].is_empty() {
                    break;
                }
                if i > 0 && !self.slots[pos].is_continuation() {
                    break;
                }
                let hash = combine(q, self.slots[pos].remainder(), self.r);
                entries.push((hash, self.slots[pos].value().unwrap().clone()));
                pos = self.index_up(pos);
                i += 1;
            }
        }
        entries
    }

    /// Doubles the table, halving the remainder width, and reinserts every
    /// entry reconstructed from its original 64-bit hash. Builds the new
    /// table independently so a mid-resize failure never leaves `self`
    /// partially migrated (§4.2.1: resize is logically atomic).
    pub(crate) fn resize(&mut self, operator: &Operator) -> Result<(), MapletError> {
        let new_r = self
            .r
            .checked_sub(1)
            .filter(|r| *r > 0)
            .ok_or(MapletError::InvalidQuotientSize)?;
        let new_size = self.slots.len() * 2;

        let entries = self.collect_entries();
        let mut new_table = SlotTable {
            r: new_r,
            slots: (0..new_size).map(|_| Slot::empty()).collect(),
            occupied: vec![false; new_size],
            count: 0,
        };
        for (hash, value) in entries {
            let (q, rem) = split(hash, new_r);
            new_table.insert(q, rem, value, operator)?;
        }
        *self = new_table;
        Ok(())
    }
}
