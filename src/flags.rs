// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Bit flags shared by the encoder and decoder, built with `bitflags!`
//! the way HTTP/2 frame flags are built in `http2/frame/*.rs`, instead
//! of hand-rolled `u8` masks.

use bitflags::bitflags;

bitflags! {
    /// Caller-supplied per-header encode options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncodeFlags: u8 {
        /// Never add this header to the dynamic table, even if indexing
        /// would otherwise be chosen.
        const NO_INDEX = 0b01;
        /// Mark the header as sensitive: always emit a literal that is
        /// itself flagged never-indexed on the wire, so intermediaries
        /// must not index it either.
        const NEVER_INDEX = 0b10;
    }
}

bitflags! {
    /// Flags carried per-entry in a decoded `HeaderSet`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const NEVER_INDEX = 0b01;
    }
}
