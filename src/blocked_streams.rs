// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Min-heap of header blocks blocked on a dynamic-table insert count
//! New module: HPACK has no analogous concept, since its
//! table is not shared across an encoder stream decoupled in time from
//! the blocks that reference it. Built with `std::collections::BinaryHeap`
//! (via `Reverse`) rather than a hand-rolled heap, the same as
//! `hpack::header_index` leans on `VecDeque`/`HashMap` instead of rolling
//! its own.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Blocked {
    largest_ref: u64,
    stream_id: u64,
    seqno: u64,
}

pub struct BlockedStreams {
    heap: BinaryHeap<Reverse<Blocked>>,
    max_blocked_streams: usize,
}

impl Ord for Blocked {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.largest_ref
            .cmp(&other.largest_ref)
            .then(self.stream_id.cmp(&other.stream_id))
            .then(self.seqno.cmp(&other.seqno))
    }
}

impl PartialOrd for Blocked {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl BlockedStreams {
    pub fn new(max_blocked_streams: usize) -> Self {
        BlockedStreams {
            heap: BinaryHeap::new(),
            max_blocked_streams,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Registers a block waiting for `ins_count` to reach `largest_ref`.
    /// Fails (returning `false`, nothing inserted) if the connection is
    /// already at its blocked-stream budget.
    pub fn insert(&mut self, stream_id: u64, seqno: u64, largest_ref: u64) -> bool {
        if self.heap.len() >= self.max_blocked_streams {
            warn!(
                "blocked-stream budget exhausted: {}/{} already blocked, refusing stream {}",
                self.heap.len(),
                self.max_blocked_streams,
                stream_id
            );
            return false;
        }
        self.heap.push(Reverse(Blocked {
            largest_ref,
            stream_id,
            seqno,
        }));
        true
    }

    /// Removes and returns every block whose `largest_ref <= ins_count`,
    /// in the order they unblock (lowest `largest_ref` first).
    pub fn pop_up_to(&mut self, ins_count: u64) -> Vec<(u64, u64)> {
        let mut woken = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.largest_ref > ins_count {
                break;
            }
            let Reverse(b) = self.heap.pop().unwrap();
            woken.push((b.stream_id, b.seqno));
        }
        woken
    }

    /// Drops every blocked entry belonging to `stream_id` (decoder-stream
    /// cancellation can target blocks that are currently blocked, not
    /// just ones already unblocked and awaiting ack).
    pub fn cancel_stream(&mut self, stream_id: u64) {
        let remaining: BinaryHeap<Reverse<Blocked>> = self
            .heap
            .drain()
            .filter(|Reverse(b)| b.stream_id != stream_id)
            .collect();
        self.heap = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_in_ascending_largest_ref_order() {
        let mut b = BlockedStreams::new(10);
        assert!(b.insert(1, 0, 5));
        assert!(b.insert(2, 0, 3));
        assert!(b.insert(3, 0, 8));
        assert_eq!(b.pop_up_to(2), vec![]);
        assert_eq!(b.pop_up_to(5), vec![(2, 0), (1, 0)]);
        assert_eq!(b.len(), 1);
        assert_eq!(b.pop_up_to(8), vec![(3, 0)]);
        assert!(b.is_empty());
    }

    #[test]
    fn insert_fails_past_capacity() {
        let mut b = BlockedStreams::new(1);
        assert!(b.insert(1, 0, 1));
        assert!(!b.insert(2, 0, 1));
    }

    #[test]
    fn cancel_stream_removes_only_that_streams_blocks() {
        let mut b = BlockedStreams::new(10);
        b.insert(1, 0, 5);
        b.insert(2, 0, 3);
        b.cancel_stream(1);
        assert_eq!(b.pop_up_to(10), vec![(2, 0)]);
    }
}
