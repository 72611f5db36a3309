// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Canonical static Huffman codec (RFC 7541 Appendix B).
//!
//! `hpack::huffman` ships a decoder only, and a
//! non-resumable, bit-at-a-time one (`BitIterator` walking the whole
//! slice against a `HashMap<(code, len), symbol>` built via
//! `lazy_static!`). That table -- `HUFFMAN_CODE_ARRAY` -- is kept
//! verbatim in `huffman_tables.rs` and is still exactly what the
//! *encoder* below wants (direct `(code, bit_length)` lookup per
//! symbol). The decoder is rebuilt as the table-driven, nibble-at-a-
//! time, byte-resumable state machine a streaming QPACK decoder needs: a
//! `256-state x 16-nibble` transition table, generated once (at
//! `lazy_static!` init, mirroring how `header_index.rs` builds
//! `STATIC_TABLE`/`STATIC_HASH` from a raw array) by walking the bit
//! trie implied by the canonical codes.

use algorithm::buf::{Bt, BtMut};
use lazy_static::lazy_static;

use crate::error::HuffmanError;
use crate::huffman_tables::HUFFMAN_CODE_ARRAY;

/// Symbol 256 is End-of-String; it must never appear as a decoded
/// symbol in a real header string.
const EOS_SYMBOL: u16 = 256;

// ---------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------

/// Number of bits `encode` would emit for `data`, not counting the final
/// byte-alignment padding.
pub fn encoded_bit_len(data: &[u8]) -> usize {
    data.iter()
        .map(|&b| HUFFMAN_CODE_ARRAY[b as usize].1 as usize)
        .sum()
}

/// Number of bytes `encode` would emit for `data`, including padding.
pub fn encoded_len(data: &[u8]) -> usize {
    (encoded_bit_len(data) + 7) / 8
}

/// Encodes `data` with the canonical Huffman code, padding the final
/// byte with one-bits. Uses a 40-bit shift register: every code is at
/// most 30 bits, so appending one more code to up to 7 residual bits
/// never overflows 40 bits before a byte is flushed out.
pub fn encode<B: BtMut>(out: &mut B, data: &[u8]) {
    let mut reg: u64 = 0;
    let mut nbits: u32 = 0;

    for &byte in data {
        let (code, len) = HUFFMAN_CODE_ARRAY[byte as usize];
        reg = (reg << len) | (code as u64);
        nbits += len as u32;
        while nbits >= 8 {
            nbits -= 8;
            out.put_u8(((reg >> nbits) & 0xff) as u8);
        }
    }

    if nbits > 0 {
        let pad = 8 - nbits;
        let byte = ((reg << pad) | ((1u64 << pad) - 1)) & 0xff;
        out.put_u8(byte as u8);
    }
}

// ---------------------------------------------------------------------
// Decoder: generated nibble-at-a-time DFA
// ---------------------------------------------------------------------

bitflags::bitflags! {
    /// Per-(state, nibble) transition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransitionFlags: u8 {
        /// Ending the string immediately after this transition (no more
        /// input bytes) is a legal EOS-safe boundary: the bits consumed
        /// since the last symbol boundary are all-ones and at most 7.
        const ACCEPTED = 0b001;
        /// A symbol was completed by this transition; see `symbol`.
        const SYMBOL   = 0b010;
        /// No valid transition exists (malformed input). Never produced
        /// by the generated table below, since the canonical Huffman
        /// tree is complete, but kept so callers and future tables can
        /// rely on the contract.
        const FAIL     = 0b100;
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    next_state: u16,
    flags: TransitionFlags,
    symbol: u16,
}

/// A node of the bit-trie built from the canonical codes, used only at
/// table-generation time.
enum TrieNode {
    Leaf(u16),
    Internal(Box<[Option<TrieNode>; 2]>),
}

impl TrieNode {
    fn new_internal() -> Self {
        TrieNode::Internal(Box::new([None, None]))
    }

    fn insert(&mut self, code: u32, len: u8, symbol: u16) {
        if len == 0 {
            *self = TrieNode::Leaf(symbol);
            return;
        }
        if let TrieNode::Leaf(_) = self {
            unreachable!("huffman code table is not prefix-free");
        }
        let TrieNode::Internal(children) = self else {
            unreachable!()
        };
        let top_bit = ((code >> (len - 1)) & 1) as usize;
        let child = &mut children[top_bit];
        if child.is_none() {
            *child = Some(TrieNode::new_internal());
        }
        child.as_mut().unwrap().insert(code, len - 1, symbol);
    }

    fn child(&self, bit: u8) -> Option<&TrieNode> {
        match self {
            TrieNode::Internal(children) => children[bit as usize].as_ref(),
            TrieNode::Leaf(_) => None,
        }
    }
}

/// Builds the root of the canonical Huffman bit-trie from
/// `HUFFMAN_CODE_ARRAY`.
fn build_trie() -> TrieNode {
    let mut root = TrieNode::new_internal();
    for (symbol, &(code, len)) in HUFFMAN_CODE_ARRAY.iter().enumerate() {
        root.insert(code, len, symbol as u16);
    }
    root
}

/// Identifies a resume point: a node in the bit-trie together with how
/// many of the bits leading to it (since the last completed symbol)
/// were all ones -- used only to compute `ACCEPTED` for the state that
/// resolves to this node.
struct DecodeTables {
    table: Vec<[Transition; 16]>,
}

fn generate_tables() -> DecodeTables {
    let root = build_trie();

    // BFS over distinct resume nodes. `states[i]` is the trie node
    // (by pointer path) that state `i` resumes decoding from; state 0
    // is always the trie root.
    let mut states: Vec<*const TrieNode> = Vec::new();
    let mut index_of: std::collections::HashMap<*const TrieNode, u16> = std::collections::HashMap::new();
    states.push(&root as *const TrieNode);
    index_of.insert(&root as *const TrieNode, 0);

    let mut table: Vec<[Transition; 16]> = Vec::new();

    let mut i = 0;
    while i < states.len() {
        let start_ptr = states[i];
        // SAFETY: `root` (and every node reachable from it) lives for
        // the duration of this function; pointers are only ever
        // dereferenced while `root` is alive.
        let start: &TrieNode = unsafe { &*start_ptr };

        let mut row = [Transition {
            next_state: 0,
            flags: TransitionFlags::empty(),
            symbol: 0,
        }; 16];

        for nibble in 0u8..16 {
            let mut cur: &TrieNode = start;
            let mut symbol_out: Option<u16> = None;
            let mut pending_all_ones = true;
            let mut pending_len = 0u8;

            for shift in (0..4).rev() {
                let bit = (nibble >> shift) & 1;
                if bit == 0 {
                    pending_all_ones = false;
                }
                let next = match cur.child(bit) {
                    Some(n) => n,
                    None => {
                        // Canonical Huffman tree is complete; this
                        // branch exists only as a defensive fallback.
                        debug_assert!(false, "incomplete huffman trie");
                        cur
                    }
                };
                match next {
                    TrieNode::Leaf(sym) => {
                        debug_assert!(
                            symbol_out.is_none(),
                            "more than one symbol completed within a single nibble"
                        );
                        symbol_out = Some(*sym);
                        cur = &root;
                        pending_all_ones = true;
                        pending_len = 0;
                    }
                    TrieNode::Internal(_) => {
                        cur = next;
                        pending_len += 1;
                    }
                }
            }

            let next_ptr = cur as *const TrieNode;
            let next_state = *index_of.entry(next_ptr).or_insert_with(|| {
                states.push(next_ptr);
                (states.len() - 1) as u16
            });

            let mut flags = TransitionFlags::empty();
            if let Some(sym) = symbol_out {
                flags |= TransitionFlags::SYMBOL;
            }
            if pending_all_ones && pending_len <= 7 {
                flags |= TransitionFlags::ACCEPTED;
            }

            row[nibble as usize] = Transition {
                next_state,
                flags,
                symbol: symbol_out.unwrap_or(0),
            };
        }

        table.push(row);
        i += 1;
    }

    DecodeTables { table }
}

lazy_static! {
    static ref DECODE_TABLE: DecodeTables = generate_tables();
}

/// Resumable, byte-at-a-time Huffman decoder (RFC 7541 §5.2 / Appendix B).
/// Resumption granularity is one whole byte (two nibbles): the caller
/// may hand input in any chunking and re-enter `decode` freely, since
/// all state that survives between calls lives in `state` and `eos`.
pub struct HuffmanDecoder {
    state: u16,
    eos: bool,
}

impl Default for HuffmanDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HuffmanDecoder {
    pub fn new() -> Self {
        HuffmanDecoder { state: 0, eos: false }
    }

    fn apply_nibble(&mut self, nibble: u8, out: &mut Vec<u8>) -> Result<(), HuffmanError> {
        let row = &DECODE_TABLE.table[self.state as usize];
        let t = row[nibble as usize];
        if t.flags.contains(TransitionFlags::FAIL) {
            return Err(HuffmanError::Malformed);
        }
        if t.flags.contains(TransitionFlags::SYMBOL) {
            if t.symbol == EOS_SYMBOL {
                return Err(HuffmanError::EosInString);
            }
            out.push(t.symbol as u8);
        }
        self.state = t.next_state;
        self.eos = t.flags.contains(TransitionFlags::ACCEPTED);
        Ok(())
    }

    /// Consumes as many bytes of `input` as are available, appending
    /// decoded octets to `out`. Call with `final_block = true` once the
    /// encoded string's last byte has been supplied; any other time the
    /// caller expects more bytes later.
    pub fn decode<B: Bt>(&mut self, input: &mut B, out: &mut Vec<u8>, final_block: bool) -> Result<(), HuffmanError> {
        while let Some(byte) = input.get_next() {
            let hi = byte >> 4;
            let lo = byte & 0x0f;
            self.apply_nibble(hi, out)?;
            self.apply_nibble(lo, out)?;
        }
        if final_block && !self.eos {
            return Err(HuffmanError::InvalidPadding);
        }
        Ok(())
    }

    /// One-shot convenience used when the whole encoded string is
    /// already available (the common case at the application layer).
    pub fn decode_all(data: &[u8]) -> Result<Vec<u8>, HuffmanError> {
        let mut dec = HuffmanDecoder::new();
        let mut out = Vec::with_capacity(data.len() * 2);
        let mut buf = data;
        dec.decode(&mut buf, &mut out, true)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::BinaryMut;

    fn roundtrip(s: &[u8]) {
        let mut out = BinaryMut::new();
        encode(&mut out, s);
        let encoded = out.chunk().to_vec();
        let decoded = HuffmanDecoder::decode_all(&encoded).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn known_rfc_vector() {
        // RFC 7541 C.4.1: "www.example.com" Huffman-encoded.
        let encoded = [
            0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff,
        ];
        let decoded = HuffmanDecoder::decode_all(&encoded).unwrap();
        assert_eq!(decoded, b"www.example.com");
    }

    #[test]
    fn roundtrips_ascii_and_binary() {
        roundtrip(b"");
        roundtrip(b"a");
        roundtrip(b"x-custom-header-name");
        roundtrip(b"The quick brown fox jumps over the lazy dog 0123456789!@#$%^&*()");
        roundtrip(&[0u8, 1, 2, 255, 254, 128, 127]);
    }

    #[test]
    fn resumable_decode_matches_one_shot() {
        let s = b"some/longer/path?with=query&and=more-stuff-to-exercise-chunking";
        let mut out = BinaryMut::new();
        encode(&mut out, s);
        let encoded = out.chunk().to_vec();

        let mut dec = HuffmanDecoder::new();
        let mut result = Vec::new();
        for (i, chunk) in encoded.chunks(3).enumerate() {
            let is_last = (i + 1) * 3 >= encoded.len();
            let mut buf = chunk;
            dec.decode(&mut buf, &mut result, is_last).unwrap();
        }
        assert_eq!(result, s);
    }

    #[test]
    fn explicit_eos_symbol_is_rejected() {
        // The all-ones 30-bit EOS code, padded to a full 4 bytes.
        let bytes = [0xff, 0xff, 0xff, 0xff];
        let err = HuffmanDecoder::decode_all(&bytes).unwrap_err();
        assert_eq!(err, HuffmanError::EosInString);
    }
}
