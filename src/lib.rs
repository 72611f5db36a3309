// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! QPACK (RFC 9204) header compression for HTTP/3, generalized from this
//! crate's own HPACK implementation: the same resumable, byte-at-a-time
//! codec style, extended with the dynamic table's encoder/decoder split,
//! the encoder/decoder instruction streams, and blocking semantics that
//! HPACK's single in-band table never needed.

#[macro_use]
extern crate bitflags;

pub mod ack;
pub mod blocked_streams;
pub mod config;
pub mod decoder;
pub mod decoder_enc_stream;
pub mod decoder_header_block;
pub mod dyn_table_dec;
pub mod dyn_table_enc;
pub mod encoder;
pub mod error;
pub mod flags;
mod huffman;
mod huffman_tables;
pub mod static_table;
mod strings;
pub mod varint;

pub use ack::{AckProcessor, DecoderInstruction};
pub use blocked_streams::BlockedStreams;
pub use config::Config;
pub use decoder::{Decoder, DecoderHost};
pub use decoder_enc_stream::DecoderEncoderStreamParser;
pub use decoder_header_block::{DecoderHeaderBlockParser, HeaderField, HeaderSet};
pub use dyn_table_dec::{DecoderDynTable, DecoderEntry};
pub use dyn_table_enc::{DynMatch, EncoderDynTable};
pub use encoder::Encoder;
pub use error::{EncodeStatus, HuffmanError, IntCodecError, ParseStatus, QpackError, QpackResult, TableError};
pub use flags::{EncodeFlags, HeaderFlags};
