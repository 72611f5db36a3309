// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Decoder-stream instructions consumed by the encoder (RFC 9204 §4.4):
//! Header Acknowledgement, Stream Cancellation and Insert Count
//! Increment. New module: HPACK has no back-channel stream at all,
//! since its table updates travel embedded in the same direction as the
//! header blocks that use them.
//!
//! Structured as a resumable state machine exactly like `varint::IntDecoder`
//! and `strings::StringReader`, even though today's only caller
//! (`Encoder::decoder_stream_in`) always hands it a complete instruction
//! at once -- a transport that delivers this stream in arbitrary byte
//! chunks would need the same resumability the header-block path has.

use algorithm::buf::Bt;
use log::trace;

use crate::error::{ParseStatus, QpackError};
use crate::varint::IntDecoder;
use crate::Encoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderInstruction {
    HeaderAck(u64),
    StreamCancel(u64),
    InsertCountIncrement(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    HeaderAck,
    StreamCancel,
    InsertCountIncrement,
}

enum AckState {
    Idle,
    Reading { kind: Kind, dec: IntDecoder },
}

/// Resumable parser for the decoder-to-encoder instruction stream.
pub struct AckProcessor {
    state: AckState,
}

impl Default for AckProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl AckProcessor {
    pub fn new() -> Self {
        AckProcessor { state: AckState::Idle }
    }

    pub fn step<B: Bt>(&mut self, buf: &mut B) -> Result<ParseStatus<DecoderInstruction>, QpackError> {
        loop {
            match &mut self.state {
                AckState::Idle => {
                    let Some(first_byte) = buf.peek() else {
                        return Ok(ParseStatus::NeedMore);
                    };
                    let (kind, prefix_bits) = if first_byte & 0x80 != 0 {
                        (Kind::HeaderAck, 7)
                    } else if first_byte & 0x40 != 0 {
                        (Kind::StreamCancel, 6)
                    } else {
                        (Kind::InsertCountIncrement, 6)
                    };
                    self.state = AckState::Reading {
                        kind,
                        dec: IntDecoder::new(prefix_bits),
                    };
                }
                AckState::Reading { kind, dec } => match dec.step(buf).map_err(QpackError::from)? {
                    ParseStatus::NeedMore => return Ok(ParseStatus::NeedMore),
                    ParseStatus::Blocked => unreachable!("decoder-stream integers have no BLOCKED state"),
                    ParseStatus::Done(n) => {
                        let instruction = match kind {
                            Kind::HeaderAck => DecoderInstruction::HeaderAck(n),
                            Kind::StreamCancel => DecoderInstruction::StreamCancel(n),
                            Kind::InsertCountIncrement => DecoderInstruction::InsertCountIncrement(n),
                        };
                        self.state = AckState::Idle;
                        return Ok(ParseStatus::Done(instruction));
                    }
                },
            }
        }
    }
}

/// Parses and applies one complete decoder-stream instruction from
/// `buf`. `buf` must already hold the whole instruction; a trailing
/// partial instruction is reported as `InvalidInstruction` rather than
/// left pending, since `Encoder::decoder_stream_in` has no way to carry
/// state across separate calls today.
pub(crate) fn apply_decoder_stream_instruction(enc: &mut Encoder, buf: &mut &[u8]) -> Result<(), QpackError> {
    let mut p = AckProcessor::new();
    match p.step(buf)? {
        ParseStatus::Done(DecoderInstruction::HeaderAck(stream_id)) => {
            trace!("decoder stream: header ack for stream {}", stream_id);
            enc.ack_header(stream_id)
        }
        ParseStatus::Done(DecoderInstruction::StreamCancel(stream_id)) => {
            trace!("decoder stream: stream cancellation for stream {}", stream_id);
            enc.cancel_stream(stream_id);
            Ok(())
        }
        ParseStatus::Done(DecoderInstruction::InsertCountIncrement(n)) => {
            trace!("decoder stream: insert count increment {}", n);
            enc.insert_count_increment(n)
        }
        ParseStatus::NeedMore => Err(QpackError::InvalidInstruction(0)),
        ParseStatus::Blocked => unreachable!("decoder-stream instructions have no BLOCKED state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::BinaryMut;

    use crate::config::Config;
    use crate::flags::EncodeFlags;

    #[test]
    fn parses_all_three_instruction_kinds() {
        let mut p = AckProcessor::new();
        let mut buf: &[u8] = &[0x80 | 4]; // header ack, stream 4
        assert_eq!(p.step(&mut buf).unwrap(), ParseStatus::Done(DecoderInstruction::HeaderAck(4)));

        let mut p = AckProcessor::new();
        let mut buf: &[u8] = &[0x40 | 7]; // stream cancel, stream 7
        assert_eq!(
            p.step(&mut buf).unwrap(),
            ParseStatus::Done(DecoderInstruction::StreamCancel(7))
        );

        let mut p = AckProcessor::new();
        let mut buf: &[u8] = &[2]; // insert count increment 2
        assert_eq!(
            p.step(&mut buf).unwrap(),
            ParseStatus::Done(DecoderInstruction::InsertCountIncrement(2))
        );
    }

    #[test]
    fn encoder_applies_header_ack_via_decoder_stream_in() {
        let mut enc = Encoder::new(Config::new(4096, 16, 16)).unwrap();
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(4, 0).unwrap();
        enc.encode(&mut enc_buf, &mut hea_buf, b"x", b"y", EncodeFlags::empty()).unwrap();
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();

        enc.decoder_stream_in(&[0x80 | 4]).unwrap();
    }
}
