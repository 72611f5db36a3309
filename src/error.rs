// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

use std::fmt;

/// Errors raised while decoding a prefix integer (RFC 7541 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCodecError {
    /// The decoded value would not fit in 64 bits.
    Overflow,
    /// `prefix_bits` was outside `1..=8`.
    InvalidPrefix,
}

/// Errors raised while decoding a Huffman-coded octet string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanError {
    /// The decoder reached a state with no valid transition.
    Malformed,
    /// The string did not end on an EOS-safe boundary (padding bits were
    /// not all-ones, or more than 7 bits of padding remained).
    InvalidPadding,
    /// The EOS symbol appeared explicitly in the encoded string.
    EosInString,
}

/// Errors raised by the dynamic table (either side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// A reference named an absolute ID, or a relative/post-base index,
    /// that does not (or no longer) names a live entry.
    InvalidReference,
    /// A `set_max_capacity` call requested a capacity larger than the
    /// connection-level maximum.
    CapacityExceeded { requested: usize, max: usize },
}

/// The single error type returned by the core for protocol/fatal
/// conditions. Recoverable conditions (buffer exhaustion,
/// `NEED_MORE`, `BLOCKED`) are not errors -- they are ordinary status
/// values, since they are not failures and preserve resumable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpackError {
    IntCodec(IntCodecError),
    Huffman(HuffmanError),
    Table(TableError),
    /// The leading byte of an encoder-stream or header-block instruction
    /// did not match any known representation.
    InvalidInstruction(u8),
    /// Required Insert Count on the wire exceeded `2 * max_entries`.
    RequiredInsertCountTooLarge,
    /// `start_header` called while another header block is still open on
    /// the same encoder (`LSQPACK_ENC_HEADER` in the source).
    HeaderAlreadyOpen,
    /// `end_header` / `encode` called with no header block open.
    NoHeaderOpen,
    /// Decoder-stream instruction referenced a stream with no in-flight
    /// header block.
    UnknownStream,
}

impl QpackError {
    #[inline]
    fn description_str(&self) -> &'static str {
        match self {
            QpackError::IntCodec(IntCodecError::Overflow) => "integer exceeds 64-bit range",
            QpackError::IntCodec(IntCodecError::InvalidPrefix) => "invalid integer prefix size",
            QpackError::Huffman(HuffmanError::Malformed) => "malformed huffman code",
            QpackError::Huffman(HuffmanError::InvalidPadding) => "invalid huffman padding",
            QpackError::Huffman(HuffmanError::EosInString) => "huffman EOS symbol in string",
            QpackError::Table(TableError::InvalidReference) => "reference to non-existent table entry",
            QpackError::Table(TableError::CapacityExceeded { .. }) => "new capacity exceeds max capacity",
            QpackError::InvalidInstruction(_) => "invalid encoder/decoder stream instruction",
            QpackError::RequiredInsertCountTooLarge => "required insert count exceeds 2 * max entries",
            QpackError::HeaderAlreadyOpen => "a header block is already open on this encoder",
            QpackError::NoHeaderOpen => "no header block is open",
            QpackError::UnknownStream => "decoder-stream instruction for unknown stream",
        }
    }
}

impl fmt::Display for QpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for QpackError {}

impl From<IntCodecError> for QpackError {
    fn from(e: IntCodecError) -> Self {
        QpackError::IntCodec(e)
    }
}

impl From<HuffmanError> for QpackError {
    fn from(e: HuffmanError) -> Self {
        QpackError::Huffman(e)
    }
}

impl From<TableError> for QpackError {
    fn from(e: TableError) -> Self {
        QpackError::Table(e)
    }
}

pub type QpackResult<T> = Result<T, QpackError>;

/// Outcome of a single `Encoder::encode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// Both the encoder-stream and header-block bytes (if any) were
    /// emitted in full.
    Ok,
    /// The encoder-stream output buffer could not hold the bytes this
    /// representation needs; nothing was written for this call.
    NoBufEncoder,
    /// The header-block output buffer could not hold the bytes this
    /// representation needs; nothing was written for this call.
    NoBufHeaderBlock,
}

/// Outcome of a resumable parse step that is not itself an error: either
/// it produced `T`, or it needs more input, or (header-block parsing
/// only) it is waiting on dynamic-table insertions that have not
/// arrived at the decoder yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    Done(T),
    NeedMore,
    Blocked,
}
