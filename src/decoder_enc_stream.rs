// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! Parses the encoder-stream instructions a peer encoder sends (RFC
//! 9204 §4.3), applying each one to a `DecoderDynTable` as it completes.
//! Resumable the same way `varint::IntDecoder` and `strings::StringReader`
//! are: `step` can be re-entered with more bytes after a `NeedMore`.

use algorithm::buf::Bt;
use log::trace;

use crate::dyn_table_dec::DecoderDynTable;
use crate::error::{ParseStatus, QpackError, TableError};
use crate::static_table;
use crate::strings::StringReader;
use crate::varint::IntDecoder;

#[derive(Debug)]
enum State {
    Idle,
    /// Insert With Name Reference (`1 T NameIndex`): reading the name
    /// index, then the value string.
    InsNameRefIndex { static_name: bool, dec: IntDecoder },
    InsNameRefValue { name: Vec<u8>, reader: StringReader },
    /// Insert Without Name Reference (`01 H NameLen...Name`): reading
    /// the literal name, then the value string.
    InsLitName { reader: StringReader },
    InsLitValue { name: Vec<u8>, reader: StringReader },
    /// Duplicate (`000 Index`): reading the relative index of the entry
    /// to duplicate.
    Duplicate { dec: IntDecoder },
    /// Set Dynamic Table Capacity (`001 Capacity`).
    SetCapacity { dec: IntDecoder },
}

/// Resumable parser for the encoder-to-decoder instruction stream.
pub struct DecoderEncoderStreamParser {
    state: State,
}

impl Default for DecoderEncoderStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderEncoderStreamParser {
    pub fn new() -> Self {
        DecoderEncoderStreamParser { state: State::Idle }
    }

    /// Drives the parser with as much of `buf` as is available,
    /// applying every instruction it completes to `table`. Returns once
    /// `buf` is exhausted mid-instruction; the caller re-enters with
    /// more bytes by calling `step` again.
    pub fn step<B: Bt>(
        &mut self,
        buf: &mut B,
        table: &mut DecoderDynTable,
        connection_max_capacity: usize,
    ) -> Result<(), QpackError> {
        loop {
            match &mut self.state {
                State::Idle => {
                    let Some(first_byte) = buf.peek() else {
                        return Ok(());
                    };
                    self.state = if first_byte & 0x80 != 0 {
                        State::InsNameRefIndex {
                            static_name: first_byte & 0x40 != 0,
                            dec: IntDecoder::new(6),
                        }
                    } else if first_byte & 0x40 != 0 {
                        State::InsLitName {
                            reader: StringReader::new(5),
                        }
                    } else if first_byte & 0x20 != 0 {
                        State::SetCapacity { dec: IntDecoder::new(5) }
                    } else {
                        State::Duplicate { dec: IntDecoder::new(5) }
                    };
                }
                State::InsNameRefIndex { static_name, dec } => match dec.step(buf).map_err(QpackError::from)? {
                    ParseStatus::NeedMore => return Ok(()),
                    ParseStatus::Blocked => unreachable!(),
                    ParseStatus::Done(idx) => {
                        let name = if *static_name {
                            static_table::get(idx as usize)
                                .ok_or(QpackError::Table(TableError::InvalidReference))?
                                .0
                                .as_bytes()
                                .to_vec()
                        } else {
                            // Relative index: 0 is the most recently
                            // inserted entry.
                            let abs_id = table
                                .ins_count()
                                .checked_sub(idx)
                                .ok_or(QpackError::Table(TableError::InvalidReference))?;
                            table
                                .get(abs_id)
                                .ok_or(QpackError::Table(TableError::InvalidReference))?
                                .name
                                .clone()
                        };
                        self.state = State::InsNameRefValue {
                            name,
                            reader: StringReader::new(7),
                        };
                    }
                },
                State::InsNameRefValue { name, reader } => match reader.step(buf)? {
                    ParseStatus::NeedMore => return Ok(()),
                    ParseStatus::Blocked => unreachable!(),
                    ParseStatus::Done(value) => {
                        let id = table.insert(std::mem::take(name), value);
                        trace!("insert with name reference -> entry {}", id);
                        self.state = State::Idle;
                    }
                },
                State::InsLitName { reader } => match reader.step(buf)? {
                    ParseStatus::NeedMore => return Ok(()),
                    ParseStatus::Blocked => unreachable!(),
                    ParseStatus::Done(name) => {
                        self.state = State::InsLitValue {
                            name,
                            reader: StringReader::new(7),
                        };
                    }
                },
                State::InsLitValue { name, reader } => match reader.step(buf)? {
                    ParseStatus::NeedMore => return Ok(()),
                    ParseStatus::Blocked => unreachable!(),
                    ParseStatus::Done(value) => {
                        let id = table.insert(std::mem::take(name), value);
                        trace!("insert literal -> entry {}", id);
                        self.state = State::Idle;
                    }
                },
                State::Duplicate { dec } => match dec.step(buf).map_err(QpackError::from)? {
                    ParseStatus::NeedMore => return Ok(()),
                    ParseStatus::Blocked => unreachable!(),
                    ParseStatus::Done(idx) => {
                        let abs_id = table
                            .ins_count()
                            .checked_sub(idx)
                            .ok_or(QpackError::Table(TableError::InvalidReference))?;
                        let entry = table.get(abs_id).ok_or(QpackError::Table(TableError::InvalidReference))?;
                        let new_id = table.insert(entry.name.clone(), entry.value.clone());
                        trace!("duplicated entry {} -> {}", abs_id, new_id);
                        self.state = State::Idle;
                    }
                },
                State::SetCapacity { dec } => match dec.step(buf).map_err(QpackError::from)? {
                    ParseStatus::NeedMore => return Ok(()),
                    ParseStatus::Blocked => unreachable!(),
                    ParseStatus::Done(n) => {
                        table.set_max_capacity(n as usize, connection_max_capacity)?;
                        trace!("set dynamic table capacity to {}", n);
                        self.state = State::Idle;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::BinaryMut;

    use crate::config::QPACK_MAX_DYN_TABLE_SIZE;
    use crate::strings;
    use crate::varint;

    #[test]
    fn insert_with_static_name_ref() {
        let mut enc_stream = BinaryMut::new();
        varint::encode(&mut enc_stream, 0xc0, 6, 17); // T=1 static idx 17 (:method: GET)
        strings::encode_string_with_flag(&mut enc_stream, 0, 7, b"PATCH");
        let mut bytes: &[u8] = enc_stream.chunk();

        let mut table = DecoderDynTable::new(4096);
        let mut parser = DecoderEncoderStreamParser::new();
        parser.step(&mut bytes, &mut table, QPACK_MAX_DYN_TABLE_SIZE).unwrap();

        let e = table.get(1).unwrap();
        assert_eq!(&e.name, b":method");
        assert_eq!(&e.value, b"PATCH");
    }

    #[test]
    fn insert_literal_with_no_name_ref() {
        let mut enc_stream = BinaryMut::new();
        strings::encode_string_with_flag(&mut enc_stream, 0x40, 5, b"x-custom");
        strings::encode_string_with_flag(&mut enc_stream, 0, 7, b"v");
        let mut bytes: &[u8] = enc_stream.chunk();

        let mut table = DecoderDynTable::new(4096);
        let mut parser = DecoderEncoderStreamParser::new();
        parser.step(&mut bytes, &mut table, QPACK_MAX_DYN_TABLE_SIZE).unwrap();

        let e = table.get(1).unwrap();
        assert_eq!(&e.name, b"x-custom");
        assert_eq!(&e.value, b"v");
    }

    #[test]
    fn duplicate_reinserts_as_new_entry() {
        let mut table = DecoderDynTable::new(4096);
        table.insert(b"x-custom".to_vec(), b"v".to_vec());

        let mut enc_stream = BinaryMut::new();
        varint::encode(&mut enc_stream, 0x00, 5, 0); // duplicate relative index 0 (most recent)
        let mut bytes: &[u8] = enc_stream.chunk();

        let mut parser = DecoderEncoderStreamParser::new();
        parser.step(&mut bytes, &mut table, QPACK_MAX_DYN_TABLE_SIZE).unwrap();

        assert_eq!(table.ins_count(), 2);
        let e = table.get(2).unwrap();
        assert_eq!(&e.name, b"x-custom");
    }

    #[test]
    fn set_capacity_updates_table() {
        let mut table = DecoderDynTable::new(4096);
        let mut enc_stream = BinaryMut::new();
        varint::encode(&mut enc_stream, 0x20, 5, 1024);
        let mut bytes: &[u8] = enc_stream.chunk();

        let mut parser = DecoderEncoderStreamParser::new();
        parser.step(&mut bytes, &mut table, QPACK_MAX_DYN_TABLE_SIZE).unwrap();
        assert_eq!(table.max_capacity(), 1024);
    }

    #[test]
    fn resumable_across_a_byte_at_a_time_feed() {
        let mut enc_stream = BinaryMut::new();
        strings::encode_string_with_flag(&mut enc_stream, 0x40, 5, b"x-custom-quite-long-name");
        strings::encode_string_with_flag(&mut enc_stream, 0, 7, b"value-goes-here");
        let bytes: Vec<u8> = enc_stream.chunk().to_vec();

        let mut table = DecoderDynTable::new(4096);
        let mut parser = DecoderEncoderStreamParser::new();
        for b in &bytes {
            let mut chunk = &[*b][..];
            parser.step(&mut chunk, &mut table, QPACK_MAX_DYN_TABLE_SIZE).unwrap();
        }
        let e = table.get(1).unwrap();
        assert_eq!(&e.name, b"x-custom-quite-long-name");
        assert_eq!(&e.value, b"value-goes-here");
    }
}
