//! The per-thread table: an open-addressed, linearly probed map from handle
//! identities to values.
//!
//! Keys are held weakly (see [`WeakKey`]); an entry whose handle has been
//! dropped is *stale* and is reclaimed opportunistically while the table is
//! probed for unrelated reasons. No tombstones are used: a stale slot is
//! either overwritten in place or expunged together with a rehash of the
//! remainder of its run, which keeps the probe-sequence invariant intact.
//!
//! Each table is owned by exactly one thread and is never shared, so none of
//! the operations here synchronize.

use std::any::Any;
use std::mem;

use crate::handle::InheritError;
use crate::weak_key::{CoreRef, WeakKey};

const INITIAL_CAPACITY: usize = 16;

/// One occupied slot: a weakly-held key plus the strongly-held value bound
/// under it. Values are type-erased; the handle layer restores the type.
pub(crate) struct Entry {
    key: WeakKey,
    value: Box<dyn Any>,
}

impl Entry {
    fn new(key: &CoreRef, value: Box<dyn Any>) -> Self {
        Self {
            key: WeakKey::new(key),
            value,
        }
    }
}

pub(crate) struct ThreadMap {
    // Length is always a power of two, so the home slot is `id & (len - 1)`.
    table: Vec<Option<Entry>>,
    // Occupied slots, stale entries included until they are expunged.
    size: usize,
    // Rehash once `size` reaches this; always `len * 2 / 3`.
    threshold: usize,
}

/// Bindings captured from a parent thread's map, ready to seed a child map.
/// Holds strong references to the seeded handles so none can go stale while
/// the snapshot is in flight between threads.
pub(crate) struct InheritedSeed {
    pub(crate) len: usize,
    pub(crate) entries: Vec<(CoreRef, Box<dyn Any + Send>)>,
}

fn next_index(i: usize, len: usize) -> usize {
    if i + 1 < len {
        i + 1
    } else {
        0
    }
}

fn prev_index(i: usize, len: usize) -> usize {
    if i > 0 {
        i - 1
    } else {
        len - 1
    }
}

fn home_index(id: u32, len: usize) -> usize {
    id as usize & (len - 1)
}

fn threshold_for(len: usize) -> usize {
    len * 2 / 3
}

fn empty_table(len: usize) -> Vec<Option<Entry>> {
    let mut table = Vec::with_capacity(len);
    table.resize_with(len, || None);
    table
}

impl ThreadMap {
    /// Build a map holding its first binding. Maps are only ever created on
    /// the first write in a thread, so there is no empty constructor.
    pub(crate) fn new(key: &CoreRef, value: Box<dyn Any>) -> Self {
        let mut table = empty_table(INITIAL_CAPACITY);
        let home = home_index(key.id(), INITIAL_CAPACITY);
        table[home] = Some(Entry::new(key, value));
        Self {
            table,
            size: 1,
            threshold: threshold_for(INITIAL_CAPACITY),
        }
    }

    /// Look up the value bound under `key`.
    ///
    /// Takes `&mut self` because a miss may expunge stale entries encountered
    /// along the probe path.
    pub(crate) fn get(&mut self, key: &CoreRef) -> Option<&dyn Any> {
        let home = home_index(key.id(), self.table.len());
        let found = if self.slot_refers_to(home, key) {
            Some(home)
        } else {
            self.probe_after_miss(key, home)
        };
        found.map(|i| {
            self.table[i]
                .as_ref()
                .expect("probed slot must hold the matched entry")
                .value
                .as_ref()
        })
    }

    /// Continue a lookup past the home slot.
    fn probe_after_miss(&mut self, key: &CoreRef, mut i: usize) -> Option<usize> {
        let len = self.table.len();
        loop {
            if self.table[i].is_none() {
                return None;
            }
            if self.slot_refers_to(i, key) {
                return Some(i);
            }
            if self.slot_stale(i) {
                // Expunging rehashes the rest of the run and may move a
                // displaced entry into this very slot; re-read it instead of
                // advancing.
                self.expunge_stale(i);
            } else {
                i = next_index(i, len);
            }
        }
    }

    /// Insert or update the binding for `key`.
    ///
    /// There is deliberately no fast path mirroring `get`: a caller is about
    /// as likely to create a fresh binding as to update an existing one.
    pub(crate) fn set(&mut self, key: &CoreRef, value: Box<dyn Any>) {
        let len = self.table.len();
        let mut i = home_index(key.id(), len);
        while self.table[i].is_some() {
            if self.slot_refers_to(i, key) {
                self.table[i]
                    .as_mut()
                    .expect("probed slot is occupied")
                    .value = value;
                return;
            }
            if self.slot_stale(i) {
                self.replace_stale(key, value, i);
                return;
            }
            i = next_index(i, len);
        }
        self.table[i] = Some(Entry::new(key, value));
        self.size += 1;
        let occupied = self.size;
        if !self.clean_some_slots(i, occupied) && occupied >= self.threshold {
            self.rehash();
        }
    }

    /// Delete the binding for `key`, if any.
    ///
    /// The weak key is cleared before expunging so later lookups short-circuit
    /// even while strong references to the handle still exist elsewhere.
    pub(crate) fn remove(&mut self, key: &CoreRef) {
        let len = self.table.len();
        let mut i = home_index(key.id(), len);
        while self.table[i].is_some() {
            if self.slot_refers_to(i, key) {
                self.table[i]
                    .as_mut()
                    .expect("probed slot is occupied")
                    .key
                    .clear();
                self.expunge_stale(i);
                return;
            }
            i = next_index(i, len);
        }
    }

    /// Install `(key, value)` given the first stale slot seen while probing
    /// for `key`, and expunge every stale entry in the containing run.
    fn replace_stale(&mut self, key: &CoreRef, value: Box<dyn Any>, stale_slot: usize) {
        let len = self.table.len();

        // Back up to the earliest stale slot in this run, so one expunge pass
        // can remove all of them.
        let mut slot_to_expunge = stale_slot;
        let mut i = prev_index(stale_slot, len);
        while self.table[i].is_some() {
            if self.slot_stale(i) {
                slot_to_expunge = i;
            }
            i = prev_index(i, len);
        }

        let mut i = next_index(stale_slot, len);
        while self.table[i].is_some() {
            if self.slot_refers_to(i, key) {
                // The binding already exists further down the run: update it,
                // then swap it into the stale slot so it sits at the earliest
                // position in its probe sequence.
                self.table[i]
                    .as_mut()
                    .expect("probed slot is occupied")
                    .value = value;
                self.table.swap(i, stale_slot);
                if slot_to_expunge == stale_slot {
                    slot_to_expunge = i;
                }
                let next_empty = self.expunge_stale(slot_to_expunge);
                self.clean_some_slots(next_empty, len);
                return;
            }
            if self.slot_stale(i) && slot_to_expunge == stale_slot {
                slot_to_expunge = i;
            }
            i = next_index(i, len);
        }

        // No existing binding: the stale slot itself becomes the new home.
        // Dropping the old entry frees its value immediately.
        self.table[stale_slot] = Some(Entry::new(key, value));
        if slot_to_expunge != stale_slot {
            let next_empty = self.expunge_stale(slot_to_expunge);
            self.clean_some_slots(next_empty, len);
        }
    }

    /// Remove the entry at `stale_slot` and rehash the remainder of its run,
    /// dropping any further stale entries found. Returns the index of the
    /// empty slot terminating the run.
    ///
    /// Rehashing in place is required for correctness, not compaction: a live
    /// entry displaced past the removed slot would otherwise become
    /// unreachable from its home slot.
    fn expunge_stale(&mut self, stale_slot: usize) -> usize {
        let len = self.table.len();
        self.table[stale_slot] = None;
        self.size -= 1;

        let mut i = next_index(stale_slot, len);
        while let Some(entry) = self.table[i].take() {
            if entry.key.is_stale() {
                self.size -= 1;
            } else {
                let home = home_index(entry.key.id(), len);
                if home == i {
                    self.table[i] = Some(entry);
                } else {
                    let mut j = home;
                    while self.table[j].is_some() {
                        j = next_index(j, len);
                    }
                    self.table[j] = Some(entry);
                }
            }
            i = next_index(i, len);
        }
        i
    }

    /// Scan roughly `log2(n)` slots after `start` for stale entries, restarting
    /// the budget at the full table length whenever one is found. Returns
    /// whether anything was removed.
    ///
    /// This keeps the amortized cost of `set` logarithmic while still chasing
    /// down clustered garbage once any of it surfaces.
    fn clean_some_slots(&mut self, start: usize, n: usize) -> bool {
        let len = self.table.len();
        let mut removed = false;
        let mut i = start;
        let mut n = n;
        loop {
            i = next_index(i, len);
            if self.slot_stale(i) {
                n = len;
                removed = true;
                i = self.expunge_stale(i);
            }
            n >>= 1;
            if n == 0 {
                break;
            }
        }
        removed
    }

    /// Expunge every stale entry, then grow if the table is still near its
    /// threshold. The lowered trigger avoids resize oscillation right after a
    /// cleanup pass.
    fn rehash(&mut self) {
        self.expunge_all();
        if self.size >= self.threshold - self.threshold / 4 {
            self.resize();
        }
    }

    fn expunge_all(&mut self) {
        for i in 0..self.table.len() {
            if self.slot_stale(i) {
                self.expunge_stale(i);
            }
        }
    }

    /// Double the table, reinserting live entries from their new home slots.
    /// Stale entries are dropped here, which frees their values.
    fn resize(&mut self) {
        let new_len = self.table.len() * 2;
        let old = mem::replace(&mut self.table, empty_table(new_len));
        let mut count = 0;
        for entry in old.into_iter().flatten() {
            if entry.key.is_stale() {
                continue;
            }
            let mut j = home_index(entry.key.id(), new_len);
            while self.table[j].is_some() {
                j = next_index(j, new_len);
            }
            self.table[j] = Some(entry);
            count += 1;
        }
        self.size = count;
        self.threshold = threshold_for(new_len);
    }

    /// Capture the bindings a child thread should inherit: every live entry
    /// whose handle defines a child value. Runs the child hooks immediately,
    /// on the calling (parent) thread.
    pub(crate) fn snapshot_children(&self) -> Option<InheritedSeed> {
        let mut entries = Vec::new();
        for entry in self.table.iter().flatten() {
            let Some(core) = entry.key.resolve() else {
                continue;
            };
            match core.child_value(entry.value.as_ref()) {
                Ok(child) => entries.push((core, child)),
                Err(InheritError::NotSupported) => {}
            }
        }
        if entries.is_empty() {
            None
        } else {
            Some(InheritedSeed {
                len: self.table.len(),
                entries,
            })
        }
    }

    /// Build a child map from a parent snapshot. The child uses the parent's
    /// table length (and therefore its threshold), with each seeded binding
    /// installed by forward probing from its home slot.
    pub(crate) fn from_seed(seed: InheritedSeed) -> Self {
        let len = seed.len;
        let mut map = Self {
            table: empty_table(len),
            size: 0,
            threshold: threshold_for(len),
        };
        for (core, value) in seed.entries {
            let mut j = home_index(core.id(), len);
            while map.table[j].is_some() {
                j = next_index(j, len);
            }
            map.table[j] = Some(Entry::new(&core, value));
            map.size += 1;
        }
        map
    }

    fn slot_refers_to(&self, i: usize, key: &CoreRef) -> bool {
        matches!(&self.table[i], Some(e) if e.key.refers_to(key))
    }

    fn slot_stale(&self, i: usize) -> bool {
        matches!(&self.table[i], Some(e) if e.key.is_stale())
    }
}

#[cfg(test)]
impl ThreadMap {
    pub(crate) fn capacity(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.size
    }

    /// Structural invariants that must hold after every operation.
    pub(crate) fn check_invariants(&self) {
        let len = self.table.len();
        assert!(len.is_power_of_two(), "table length must be a power of two");
        assert!(len >= INITIAL_CAPACITY);
        assert_eq!(self.threshold, threshold_for(len));

        let occupied = self.table.iter().filter(|s| s.is_some()).count();
        assert_eq!(self.size, occupied, "size must count occupied slots");

        let mut live_ids = std::collections::HashSet::new();
        for i in 0..len {
            let Some(entry) = &self.table[i] else { continue };
            if entry.key.is_stale() {
                continue;
            }
            assert!(
                live_ids.insert(entry.key.id()),
                "live identifiers must be unique"
            );
            // Probing from the home slot must reach the entry without
            // crossing an empty slot.
            let mut j = home_index(entry.key.id(), len);
            while j != i {
                assert!(
                    self.table[j].is_some(),
                    "probe path from home slot must not cross an empty slot"
                );
                j = next_index(j, len);
            }
        }
    }
}
