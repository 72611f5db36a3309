// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Decoder-side dynamic table (RFC 9204 §3.2.2), addressed by absolute
//! ID rather than by name search -- the decoder only ever needs "give
//! me entry N", never "find me an entry matching this header".
//!
//! Grounded in the same FIFO-with-size-cap shape as `hpack::header_index::HeaderIndex`,
//! but kept as a `VecDeque<Rc<DecoderEntry>>`: this crate's data model
//! calls for entries that can be "evicted" (removed from the indexable
//! sequence) while still alive in memory because a slow stream holds a
//! reference, with destruction deferred to ref-count zero ("Reference
//! counting vs. eviction" design note). `Rc` gives exactly that for
//! free -- the strong count *is* the `ref_count` the data model
//! asks for, so there is no separate counter to keep in sync.

use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;

use crate::error::TableError;

#[derive(Debug)]
pub struct DecoderEntry {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    size: usize,
}

fn entry_size(name: &[u8], value: &[u8]) -> usize {
    32 + name.len() + value.len()
}

pub struct DecoderDynTable {
    /// Oldest (lowest abs_id still addressable) at the front.
    entries: VecDeque<Rc<DecoderEntry>>,
    max_capacity: usize,
    cur_size: usize,
    ins_count: u64,
}

impl DecoderDynTable {
    pub fn new(max_capacity: usize) -> Self {
        DecoderDynTable {
            entries: VecDeque::new(),
            max_capacity,
            cur_size: 0,
            ins_count: 0,
        }
    }

    pub fn ins_count(&self) -> u64 {
        self.ins_count
    }

    /// `del_count` (RFC 9204 §4.4.2): the number of entries ever evicted.
    pub fn del_count(&self) -> u64 {
        self.ins_count - self.entries.len() as u64
    }

    pub fn cur_size(&self) -> usize {
        self.cur_size
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn set_max_capacity(&mut self, new_capacity: usize, connection_max: usize) -> Result<(), TableError> {
        if new_capacity > connection_max {
            return Err(TableError::CapacityExceeded {
                requested: new_capacity,
                max: connection_max,
            });
        }
        self.max_capacity = new_capacity;
        self.evict_overflow();
        Ok(())
    }

    /// Inserts a new entry (from `insert-with-name-ref`, `insert-literal`
    /// or `duplicate`), returning its absolute ID.
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) -> u64 {
        let size = entry_size(&name, &value);
        self.ins_count += 1;
        self.cur_size += size;
        self.entries.push_back(Rc::new(DecoderEntry { name, value, size }));
        self.evict_overflow();
        self.ins_count
    }

    fn evict_overflow(&mut self) {
        while self.cur_size > self.max_capacity {
            match self.entries.pop_front() {
                Some(e) => {
                    self.cur_size -= e.size;
                    debug!("evicted dynamic entry, {} bytes now used of {}", self.cur_size, self.max_capacity);
                }
                None => break,
            }
        }
    }

    /// Looks up entry `abs_id`, returning a cheap `Rc` clone. Entries a
    /// `HeaderSet` holds onto stay alive even after this call evicts
    /// their slot from the addressable sequence.
    pub fn get(&self, abs_id: u64) -> Option<Rc<DecoderEntry>> {
        let del_count = self.del_count();
        if abs_id <= del_count || abs_id > self.ins_count {
            return None;
        }
        self.entries.get((abs_id - del_count - 1) as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let mut t = DecoderDynTable::new(4096);
        let id = t.insert(b"x-custom".to_vec(), b"v".to_vec());
        assert_eq!(id, 1);
        let e = t.get(1).unwrap();
        assert_eq!(&e.name, b"x-custom");
        assert_eq!(&e.value, b"v");
    }

    #[test]
    fn eviction_matches_scenario_3() {
        let mut t = DecoderDynTable::new(64);
        t.insert(vec![b'a'; 18], vec![]);
        t.insert(vec![b'b'; 18], vec![]);
        assert_eq!(t.cur_size(), 50);
        assert!(t.get(1).is_none());
        assert!(t.get(2).is_some());
        assert_eq!(t.del_count(), 1);
    }

    #[test]
    fn entry_survives_eviction_while_a_handle_is_held() {
        let mut t = DecoderDynTable::new(64);
        t.insert(vec![b'a'; 18], vec![]);
        let handle = t.get(1).unwrap();
        t.insert(vec![b'b'; 18], vec![]);
        assert!(t.get(1).is_none());
        assert_eq!(&handle.name, &vec![b'a'; 18]);
    }

    #[test]
    fn capacity_increase_beyond_connection_max_is_rejected() {
        let mut t = DecoderDynTable::new(100);
        let err = t.set_max_capacity(200, 150).unwrap_err();
        assert_eq!(
            err,
            TableError::CapacityExceeded {
                requested: 200,
                max: 150
            }
        );
    }
}
