// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Octet-string encode/decode shared by every representation that
//! carries a name or value: a length-prefixed integer (RFC 7541 §5.2)
//! whose prefix byte also carries the Huffman flag as the bit directly
//! above the prefix, followed by that many raw or Huffman-coded octets.

use algorithm::buf::{Bt, BtMut};

use crate::error::{ParseStatus, QpackError};
use crate::huffman::{self, HuffmanDecoder};
use crate::varint::{self, IntDecoder};

/// Encodes `data` choosing Huffman coding whenever it is strictly
/// shorter, the same preference HPACK/QPACK encoders universally use.
/// `base_flag` carries whatever representation-marker bits share this
/// byte with the length prefix; the Huffman bit is ORed in on top.
pub fn encode_string_with_flag<B: BtMut>(out: &mut B, base_flag: u8, prefix_bits: u8, data: &[u8]) {
    let huff_len = huffman::encoded_len(data);
    if huff_len < data.len() {
        let flag = base_flag | (1 << prefix_bits);
        varint::encode(out, flag, prefix_bits, huff_len as u64);
        huffman::encode(out, data);
    } else {
        varint::encode(out, base_flag, prefix_bits, data.len() as u64);
        out.put_slice(data);
    }
}

/// Number of bytes `encode_string_with_flag` would write.
pub fn encoded_string_len(prefix_bits: u8, data: &[u8]) -> usize {
    let huff_len = huffman::encoded_len(data);
    let payload_len = huff_len.min(data.len());
    varint::encoded_len(prefix_bits, payload_len as u64) + payload_len
}

#[derive(Debug)]
enum ReaderState {
    /// Not a single byte has been seen yet, so the Huffman flag bit
    /// (which lives in the same leading byte as the length prefix)
    /// hasn't been captured.
    ReadingLen { dec: IntDecoder },
    ReadingBytes {
        huffman: bool,
        remaining: u64,
        huff: HuffmanDecoder,
        out: Vec<u8>,
    },
}

/// Resumable decoder for one length-prefixed octet string.
pub struct StringReader {
    prefix_bits: u8,
    state: ReaderState,
}

impl StringReader {
    pub fn new(prefix_bits: u8) -> Self {
        StringReader {
            prefix_bits,
            state: ReaderState::ReadingLen {
                dec: IntDecoder::new(prefix_bits),
            },
        }
    }

    pub fn step<B: Bt>(&mut self, buf: &mut B) -> Result<ParseStatus<Vec<u8>>, QpackError> {
        loop {
            match &mut self.state {
                ReaderState::ReadingLen { dec } => {
                    let Some(first_byte) = buf.peek() else {
                        return Ok(ParseStatus::NeedMore);
                    };
                    let huffman = (first_byte >> self.prefix_bits) & 1 == 1;
                    match dec.step(buf).map_err(QpackError::from)? {
                        ParseStatus::NeedMore => return Ok(ParseStatus::NeedMore),
                        ParseStatus::Done(len) => {
                            self.state = ReaderState::ReadingBytes {
                                huffman,
                                remaining: len,
                                huff: HuffmanDecoder::new(),
                                out: Vec::with_capacity(len as usize),
                            };
                        }
                        ParseStatus::Blocked => unreachable!("string length has no BLOCKED state"),
                    }
                }
                ReaderState::ReadingBytes {
                    huffman,
                    remaining,
                    huff,
                    out,
                } => {
                    if *remaining == 0 {
                        return Ok(ParseStatus::Done(std::mem::take(out)));
                    }
                    let contiguous = buf.chunk().len() as u64;
                    if contiguous == 0 {
                        return Ok(ParseStatus::NeedMore);
                    }
                    let take = contiguous.min(*remaining) as usize;
                    if *huffman {
                        let chunk = buf.chunk()[..take].to_vec();
                        buf.advance(take);
                        let mut src: &[u8] = &chunk;
                        *remaining -= take as u64;
                        huff.decode(&mut src, out, *remaining == 0)
                            .map_err(QpackError::from)?;
                    } else {
                        let mut tmp = vec![0u8; take];
                        buf.copy_to_slice(&mut tmp);
                        out.extend_from_slice(&tmp);
                        *remaining -= take as u64;
                    }
                    if *remaining == 0 {
                        return Ok(ParseStatus::Done(std::mem::take(out)));
                    }
                    return Ok(ParseStatus::NeedMore);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::BinaryMut;

    fn roundtrip(prefix_bits: u8, data: &[u8]) {
        let mut out = BinaryMut::new();
        encode_string_with_flag(&mut out, 0, prefix_bits, data);
        assert_eq!(out.remaining(), encoded_string_len(prefix_bits, data));
        let mut reader = StringReader::new(prefix_bits);
        let got = reader.step(&mut out).unwrap();
        assert_eq!(got, ParseStatus::Done(data.to_vec()));
    }

    #[test]
    fn roundtrips_plain_and_huffman_favorable_strings() {
        roundtrip(7, b"v");
        roundtrip(7, b"www.example.com");
        roundtrip(5, b"x-custom-header");
        roundtrip(7, &[0u8, 255, 128, 42]);
    }

    #[test]
    fn resumable_across_chunk_boundaries() {
        let mut out = BinaryMut::new();
        encode_string_with_flag(&mut out, 0, 7, b"www.example.com");
        let bytes: Vec<u8> = out.chunk().to_vec();
        let mut reader = StringReader::new(7);
        let mut result = None;
        for b in &bytes {
            let mut chunk = &[*b][..];
            match reader.step(&mut chunk).unwrap() {
                ParseStatus::Done(v) => {
                    result = Some(v);
                    break;
                }
                ParseStatus::NeedMore => continue,
                ParseStatus::Blocked => unreachable!(),
            }
        }
        assert_eq!(result, Some(b"www.example.com".to_vec()));
    }
}
