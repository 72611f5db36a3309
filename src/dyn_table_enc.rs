// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Encoder-side dynamic table (RFC 9204 §3.2.2).
//!
//! Grounded in `hpack::header_index::HeaderIndex`: a FIFO
//! of entries with running size accounting and `consolidate_table`-style
//! eviction. Generalized with two name-keyed indices for fast search and
//! per-entry `abs_id`/`ref_count` bookkeeping that HPACK's symmetric
//! table never needed. `hpack::header_index` itself backs its static
//! lookup with `std::collections::HashMap` rather than a hand-rolled
//! bucket scheme (see the "Hash stability" design note for why); this
//! table keeps that same substitution -- there is no seeding requirement
//! here since entries are private per-connection state, not
//! attacker-supplied keys shared across connections.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::error::TableError;

#[derive(Debug, Clone)]
struct EncoderEntry {
    name: Vec<u8>,
    value: Vec<u8>,
    abs_id: u64,
    ref_count: u32,
    size: usize,
}

fn entry_size(name: &[u8], value: &[u8]) -> usize {
    32 + name.len() + value.len()
}

/// Result of a dynamic-table search (`FULL_MATCH`/`NAME_MATCH`/`NONE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynMatch {
    FullMatch(u64),
    NameMatch(u64),
    None,
}

pub struct EncoderDynTable {
    /// Oldest entry at the front, newest at the back.
    entries: VecDeque<EncoderEntry>,
    by_name: HashMap<Vec<u8>, Vec<u64>>,
    by_nameval: HashMap<(Vec<u8>, Vec<u8>), Vec<u64>>,
    max_capacity: usize,
    cur_size: usize,
    ins_count: u64,
    /// Set by `can_evict_to_fit`: entries with `abs_id <= search_cutoff`
    /// are about to be evicted to make room and must not be referenced.
    search_cutoff: u64,
}

impl EncoderDynTable {
    pub fn new(max_capacity: usize) -> Self {
        EncoderDynTable {
            entries: VecDeque::new(),
            by_name: HashMap::new(),
            by_nameval: HashMap::new(),
            max_capacity,
            cur_size: 0,
            ins_count: 0,
            search_cutoff: 0,
        }
    }

    pub fn ins_count(&self) -> u64 {
        self.ins_count
    }

    pub fn cur_size(&self) -> usize {
        self.cur_size
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn search_cutoff(&self) -> u64 {
        self.search_cutoff
    }

    fn front_abs_id(&self) -> u64 {
        self.entries.front().map(|e| e.abs_id).unwrap_or(self.ins_count + 1)
    }

    /// Raises or lowers the capacity, evicting if the new capacity is
    /// smaller than the current size.
    pub fn set_max_capacity(&mut self, new_capacity: usize, connection_max: usize) -> Result<(), TableError> {
        if new_capacity > connection_max {
            return Err(TableError::CapacityExceeded {
                requested: new_capacity,
                max: connection_max,
            });
        }
        debug!("dynamic table capacity change {} -> {}", self.max_capacity, new_capacity);
        self.max_capacity = new_capacity;
        self.remove_overflow();
        Ok(())
    }

    /// Dry-run check for `can_evict_to_fit`: can eviction of
    /// entries with `ref_count == 0`, oldest first, free enough room for
    /// `needed` additional bytes? On success, `search_cutoff` is updated
    /// to the abs_id of the last entry that would need evicting.
    ///
    /// Eviction is strictly FIFO, so the walk stops at the first entry
    /// still referenced by an in-flight block -- that entry (and
    /// everything newer) cannot be evicted without breaking the order
    /// guarantee, even though `remove_overflow` itself evicts
    /// unconditionally once capacity is actually exceeded.
    pub fn can_evict_to_fit(&mut self, needed: usize) -> bool {
        let available = self.max_capacity.saturating_sub(self.cur_size);
        if available >= needed {
            self.search_cutoff = self.search_cutoff.max(0);
            return true;
        }
        let mut reclaimable = 0usize;
        let mut cutoff = 0u64;
        for e in self.entries.iter() {
            if e.ref_count != 0 {
                break;
            }
            reclaimable += e.size;
            cutoff = e.abs_id;
            if available + reclaimable >= needed {
                self.search_cutoff = cutoff;
                return true;
            }
        }
        false
    }

    /// Inserts a new entry, returning its absolute ID. Evicts overflow
    /// unconditionally afterward regardless of `ref_count` (RFC 9204 §3.2.2:
    /// "the encoder evicts unconditionally").
    pub fn insert(&mut self, name: &[u8], value: &[u8]) -> u64 {
        self.ins_count += 1;
        let abs_id = self.ins_count;
        let size = entry_size(name, value);
        self.cur_size += size;
        self.by_name.entry(name.to_vec()).or_default().push(abs_id);
        self.by_nameval
            .entry((name.to_vec(), value.to_vec()))
            .or_default()
            .push(abs_id);
        self.entries.push_back(EncoderEntry {
            name: name.to_vec(),
            value: value.to_vec(),
            abs_id,
            ref_count: 0,
            size,
        });
        self.remove_overflow();
        abs_id
    }

    fn remove_overflow(&mut self) {
        while self.cur_size > self.max_capacity {
            match self.entries.pop_front() {
                Some(e) => {
                    self.cur_size -= e.size;
                    if self.search_cutoff < e.abs_id {
                        self.search_cutoff = e.abs_id;
                    }
                    debug!("evicted dynamic entry {} ({} bytes, {} now used of {})", e.abs_id, e.size, self.cur_size, self.max_capacity);
                }
                None => break,
            }
        }
    }

    /// Searches for `(name, value)`. Entries with `abs_id <= search_cutoff`
    /// (about to be evicted) are skipped. When `may_risk` is false, entries
    /// with `abs_id > max_acked_id` are skipped too.
    pub fn find(&self, name: &[u8], value: &[u8], may_risk: bool, max_acked_id: u64) -> DynMatch {
        let front = self.front_abs_id();
        let is_live = |id: u64| id >= front && id > self.search_cutoff && (may_risk || id <= max_acked_id);

        if let Some(ids) = self.by_nameval.get(&(name.to_vec(), value.to_vec())) {
            if let Some(&id) = ids.iter().rev().find(|&&id| is_live(id)) {
                return DynMatch::FullMatch(id);
            }
        }
        if let Some(ids) = self.by_name.get(name) {
            if let Some(&id) = ids.iter().rev().find(|&&id| is_live(id)) {
                return DynMatch::NameMatch(id);
            }
        }
        DynMatch::None
    }

    fn index_of(&self, abs_id: u64) -> Option<usize> {
        let front = self.front_abs_id();
        if abs_id < front || abs_id > self.ins_count {
            return None;
        }
        Some((abs_id - front) as usize)
    }

    pub fn get(&self, abs_id: u64) -> Option<(&[u8], &[u8])> {
        self.index_of(abs_id)
            .and_then(|i| self.entries.get(i))
            .map(|e| (e.name.as_slice(), e.value.as_slice()))
    }

    /// Marks `abs_id` as referenced by an in-flight header block.
    pub fn inc_ref(&mut self, abs_id: u64) {
        if let Some(i) = self.index_of(abs_id) {
            if let Some(e) = self.entries.get_mut(i) {
                e.ref_count += 1;
            }
        }
    }

    /// Unmarks `abs_id` as referenced, called on ack or cancel.
    pub fn dec_ref(&mut self, abs_id: u64) {
        if let Some(i) = self.index_of(abs_id) {
            if let Some(e) = self.entries.get_mut(i) {
                e.ref_count = e.ref_count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_full_and_name_match() {
        let mut t = EncoderDynTable::new(4096);
        let id = t.insert(b"x-custom", b"v1");
        assert_eq!(id, 1);
        assert_eq!(t.find(b"x-custom", b"v1", true, 0), DynMatch::FullMatch(1));
        assert_eq!(t.find(b"x-custom", b"v2", true, 0), DynMatch::NameMatch(1));
        assert_eq!(t.find(b"x-other", b"v1", true, 0), DynMatch::None);
    }

    #[test]
    fn eviction_under_pressure_matches_scenario_3() {
        let mut t = EncoderDynTable::new(64);
        t.insert(&vec![b'a'; 18], b""); // 32 + 18 = 50
        assert_eq!(t.cur_size(), 50);
        t.insert(&vec![b'b'; 18], b""); // forces eviction of the first
        assert_eq!(t.cur_size(), 50);
        assert_eq!(t.ins_count(), 2);
        assert_eq!(t.find(&vec![b'a'; 18], b"", true, 0), DynMatch::None);
    }

    #[test]
    fn may_risk_false_ignores_unacked_entries() {
        let mut t = EncoderDynTable::new(4096);
        t.insert(b"name", b"value");
        assert_eq!(t.find(b"name", b"value", false, 0), DynMatch::None);
        assert_eq!(t.find(b"name", b"value", false, 1), DynMatch::FullMatch(1));
    }

    #[test]
    fn can_evict_to_fit_respects_referenced_entries() {
        let mut t = EncoderDynTable::new(64);
        let id = t.insert(&vec![b'a'; 18], b"");
        t.inc_ref(id);
        assert!(!t.can_evict_to_fit(50));
        t.dec_ref(id);
        assert!(t.can_evict_to_fit(50));
        assert_eq!(t.search_cutoff(), id);
    }
}
