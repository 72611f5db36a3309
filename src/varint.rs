// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Prefix-integer codec (RFC 7541 §5.1 / RFC 9204 §4.1.1).
//!
//! Generalizes `hpack::decoder::decode_integer`, which
//! required the whole encoded integer to already be present in a single
//! slice, into a byte-level resumable state machine: the caller may feed
//! the decoder any number of bytes at a time and re-enter after a
//! `NeedMore` result.

use algorithm::buf::{Bt, BtMut};

use crate::error::{IntCodecError, ParseStatus};

/// Number of bytes an integer of this value will take to encode with the
/// given prefix size, mirroring `val2len` from the RFC 7541 §5.1 pseudocode.
pub fn encoded_len(prefix_bits: u8, value: u64) -> usize {
    debug_assert!((3..=8).contains(&prefix_bits));
    let prefix_max = (1u64 << prefix_bits) - 1;
    if value < prefix_max {
        return 1;
    }
    let mut remaining = value - prefix_max;
    let mut n = 1usize;
    loop {
        n += 1;
        if remaining < 0x80 {
            return n;
        }
        remaining >>= 7;
    }
}

/// Encodes `value` into the low `prefix_bits` bits of the first byte,
/// ORed with the caller-supplied `flag_bits` (already shifted into the
/// remaining high bits of that byte), followed by zero or more
/// continuation bytes.
pub fn encode<B: BtMut>(out: &mut B, flag_bits: u8, prefix_bits: u8, value: u64) {
    debug_assert!((3..=8).contains(&prefix_bits));
    let prefix_max = (1u64 << prefix_bits) - 1;
    if value < prefix_max {
        out.put_u8(flag_bits | value as u8);
        return;
    }
    out.put_u8(flag_bits | prefix_max as u8);
    let mut remaining = value - prefix_max;
    while remaining >= 0x80 {
        out.put_u8(((remaining & 0x7f) as u8) | 0x80);
        remaining >>= 7;
    }
    out.put_u8(remaining as u8);
}

/// At most this many continuation bytes are accepted; any more makes the
/// represented value exceed 64 bits regardless of their content, so
/// decoding fails fast rather than accumulating in a widened integer
/// indefinitely.
const MAX_CONTINUATION_BYTES: u8 = 10;

/// Resumable decode state for a single prefix integer.
#[derive(Debug, Clone, Copy)]
pub struct IntDecoder {
    /// `None` until the first (prefix) byte has been consumed.
    started: bool,
    /// Accumulated value so far, not counting the prefix contribution
    /// until `started` -- widened to `u128` so intermediate sums never
    /// panic on overflow; the final `u64`-range check happens once, at
    /// the point a terminating byte is seen. This is an equivalent,
    /// simpler restatement of the exact bit-position bookkeeping a
    /// C-style resumable integer decoder tracks as `{resume, val, M, nread}`;
    /// the observable
    /// contract -- accept iff the true value is representable in 64
    /// bits, reject otherwise -- is identical.
    val: u128,
    shift: u32,
    nread: u8,
    prefix_bits: u8,
}

impl IntDecoder {
    pub fn new(prefix_bits: u8) -> Self {
        debug_assert!((3..=8).contains(&prefix_bits));
        IntDecoder {
            started: false,
            val: 0,
            shift: 0,
            nread: 0,
            prefix_bits,
        }
    }

    /// Resumes decoding from `buf`. On `NeedMore`, `self` retains
    /// whatever partial progress was made so the caller can re-enter
    /// with more bytes later (possibly from a different buffer).
    pub fn step<B: Bt>(&mut self, buf: &mut B) -> Result<ParseStatus<u64>, IntCodecError> {
        if !self.started {
            let Some(b) = buf.get_next() else {
                return Ok(ParseStatus::NeedMore);
            };
            let prefix_max = (1u64 << self.prefix_bits) - 1;
            let v = (b as u64) & prefix_max;
            if v < prefix_max {
                return Ok(ParseStatus::Done(v));
            }
            self.val = v as u128;
            self.started = true;
        }

        loop {
            let Some(b) = buf.get_next() else {
                return Ok(ParseStatus::NeedMore);
            };
            self.nread += 1;
            if self.nread > MAX_CONTINUATION_BYTES {
                return Err(IntCodecError::Overflow);
            }
            self.val += ((b & 0x7f) as u128) << self.shift;
            if self.val > u64::MAX as u128 {
                return Err(IntCodecError::Overflow);
            }
            if b & 0x80 == 0 {
                return Ok(ParseStatus::Done(self.val as u64));
            }
            self.shift += 7;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::BinaryMut;

    fn roundtrip(prefix_bits: u8, value: u64) {
        let mut out = BinaryMut::new();
        encode(&mut out, 0, prefix_bits, value);
        assert_eq!(out.remaining(), encoded_len(prefix_bits, value));
        let mut dec = IntDecoder::new(prefix_bits);
        let got = dec.step(&mut out).unwrap();
        assert_eq!(got, ParseStatus::Done(value));
    }

    #[test]
    fn small_values_fit_in_prefix() {
        roundtrip(5, 10);
        roundtrip(8, 254);
    }

    #[test]
    fn large_values_need_continuation() {
        roundtrip(5, 1337);
        roundtrip(7, 1_000_000);
        roundtrip(6, (1u64 << 40) + 12345);
    }

    #[test]
    fn exact_prefix_boundary_uses_continuation() {
        // value == 2^prefix - 1 must NOT fit in the prefix alone.
        roundtrip(3, 7);
        roundtrip(4, 15);
    }

    #[test]
    fn byte_at_a_time_resumes_correctly() {
        let mut out = BinaryMut::new();
        encode(&mut out, 0, 5, 1_000_000);
        let bytes: Vec<u8> = out.chunk().to_vec();
        let mut dec = IntDecoder::new(5);
        let mut result = None;
        for b in &bytes {
            let mut chunk = &[*b][..];
            match dec.step(&mut chunk).unwrap() {
                ParseStatus::Done(v) => {
                    result = Some(v);
                    break;
                }
                ParseStatus::NeedMore => continue,
                ParseStatus::Blocked => unreachable!(),
            }
        }
        assert_eq!(result, Some(1_000_000));
    }

    #[test]
    fn overflow_sequence_is_rejected() {
        // 11 continuation bytes, all with the continuation bit set: the
        // represented value would exceed 2^64 - 1.
        let mut bytes = vec![31u8]; // 5-bit prefix all-ones
        for _ in 0..11 {
            bytes.push(0xff);
        }
        bytes.push(0x01);
        let mut buf = &bytes[..];
        let mut dec = IntDecoder::new(5);
        let err = dec.step(&mut buf).unwrap_err();
        assert_eq!(err, IntCodecError::Overflow);
    }

    #[test]
    fn needs_more_on_empty_input() {
        let mut buf: &[u8] = &[];
        let mut dec = IntDecoder::new(5);
        assert_eq!(dec.step(&mut buf).unwrap(), ParseStatus::NeedMore);
    }
}
