// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Connection-level limits and defaults, grouped the way HTTP/2 settings
//! constants are grouped in `http2/mod.rs`.

/// Default dynamic-table capacity for a freshly constructed `Encoder`
/// or `Decoder`, mirroring `DEFAULT_SETTINGS_HEADER_TABLE_SIZE`.
pub const DEFAULT_MAX_DYN_TABLE_SIZE: usize = 4_096;

/// Default bound on streams simultaneously permitted to risk an
/// unacknowledged reference.
pub const DEFAULT_MAX_RISKED_STREAMS: usize = 16;

/// Default bound on streams simultaneously allowed to sit blocked
/// waiting for dynamic-table insertions.
pub const DEFAULT_MAX_BLOCKED_STREAMS: usize = 16;

/// Upper bound accepted for `max_table_size` (mirrors `LSQPACK_MAX_DYN_TABLE_SIZE`).
pub const QPACK_MAX_DYN_TABLE_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound accepted for `max_risked_streams` (`LSQPACK_MAX_MAX_RISKED_STREAMS`).
pub const QPACK_MAX_MAX_RISKED_STREAMS: usize = 65_536;

/// Absolute IDs never reach or exceed this value (`LSQPACK_MAX_ABS_ID`).
pub const QPACK_MAX_ABS_ID: u64 = (1u64 << 62) - 1;

/// Connection-scoped limits shared by both `Encoder` and `Decoder`.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub max_table_capacity: usize,
    pub max_risked_streams: usize,
    pub max_blocked_streams: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_table_capacity: DEFAULT_MAX_DYN_TABLE_SIZE,
            max_risked_streams: DEFAULT_MAX_RISKED_STREAMS,
            max_blocked_streams: DEFAULT_MAX_BLOCKED_STREAMS,
        }
    }
}

impl Config {
    pub fn new(max_table_capacity: usize, max_risked_streams: usize, max_blocked_streams: usize) -> Self {
        Config {
            max_table_capacity,
            max_risked_streams,
            max_blocked_streams,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.max_table_capacity <= QPACK_MAX_DYN_TABLE_SIZE
            && self.max_risked_streams <= QPACK_MAX_MAX_RISKED_STREAMS
    }
}
