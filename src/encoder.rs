// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! The QPACK encoder. Generalizes `hpack::encoder::Encoder`,
//! whose `encode_header_into` is a stub with
//! its body commented out, into the real decision engine: a table
//! search against both the static and dynamic tables, risk management,
//! and emission of both the encoder-stream and header-block bytes.

use algorithm::buf::BtMut;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};

use crate::ack::apply_decoder_stream_instruction;
use crate::config::{Config, QPACK_MAX_ABS_ID};
use crate::dyn_table_enc::{DynMatch, EncoderDynTable};
use crate::error::{EncodeStatus, QpackError, TableError};
use crate::flags::EncodeFlags;
use crate::static_table::{self, StaticMatch};
use crate::strings;
use crate::varint;

/// Largest number of bytes a prefix integer can take regardless of
/// prefix width: one prefix byte plus up to ten continuation bytes
/// (RFC 7541 §5.1 bounds a 64-bit value to at most 10 continuation
/// bytes). Used only as a conservative upper bound for representations
/// that reference an entry not yet inserted, whose final absolute ID --
/// and therefore its exact encoded width -- isn't known until after the
/// capacity check.
const MAX_VARINT_LEN: usize = 11;

/// One header's resolved wire action (the encoder's decision matrix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncAction {
    None,
    /// `index` is the static table's 1-based index when `static_name` is
    /// set, otherwise the dynamic table's relative index (computed
    /// against the current insert count, since the instruction is
    /// written before the new entry is inserted).
    InsNameRef { index: u64, static_name: bool },
    InsLit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaAction {
    IndexedStat(u64),
    IndexedDynBaseRel(u64),
    /// `0` is a sentinel meaning "the entry this call is about to
    /// insert"; patched to the real absolute ID once known.
    IndexedPostBase(u64),
    Lit,
    LitWithNameStat(u64),
    LitWithNameDynBaseRel(u64),
    LitWithNamePostBase(u64),
}

/// Does this action's embedded ID still need patching once the new
/// entry's absolute ID is known?
fn targets_new_entry(action: &HeaAction) -> bool {
    matches!(action, HeaAction::IndexedPostBase(0) | HeaAction::LitWithNamePostBase(0))
}

struct OpenBlock {
    stream_id: u64,
    seqno: u64,
    base: u64,
    n_risked: usize,
    others_at_risk: bool,
    min_ref_id: u64,
    max_ref_id: u64,
    use_dynamic_table: bool,
    /// Abs IDs this block has referenced or inserted, for ack/cancel
    /// ref-count bookkeeping once the block closes.
    referenced: Vec<u64>,
}

struct PendingBlock {
    #[allow(dead_code)]
    seqno: u64,
    largest_ref: u64,
    referenced: Vec<u64>,
    counted_as_at_risk: bool,
}

pub struct Encoder {
    config: Config,
    dyn_table: EncoderDynTable,
    max_acked_id: u64,
    cur_streams_at_risk: usize,
    open: Option<OpenBlock>,
    /// FIFO of not-yet-acked blocks per stream, oldest first -- a
    /// header-ack always closes the oldest pending block on its stream.
    pending: HashMap<u64, VecDeque<PendingBlock>>,
}

impl Encoder {
    pub fn new(config: Config) -> Result<Self, QpackError> {
        if !config.is_valid() {
            return Err(QpackError::Table(TableError::CapacityExceeded {
                requested: config.max_table_capacity,
                max: crate::config::QPACK_MAX_DYN_TABLE_SIZE,
            }));
        }
        Ok(Encoder {
            dyn_table: EncoderDynTable::new(config.max_table_capacity),
            config,
            max_acked_id: 0,
            cur_streams_at_risk: 0,
            open: None,
            pending: HashMap::new(),
        })
    }

    /// Changes the dynamic table's capacity, emitting the "Set Dynamic
    /// Table Capacity" encoder-stream instruction (RFC 9204 §4.3.1) so
    /// the peer decoder stays in sync.
    pub fn set_max_capacity<B: BtMut>(&mut self, enc_buf: &mut B, n: usize) -> Result<(), QpackError> {
        self.dyn_table
            .set_max_capacity(n, crate::config::QPACK_MAX_DYN_TABLE_SIZE)
            .map_err(QpackError::from)?;
        debug!("dynamic table capacity set to {}", n);
        varint::encode(enc_buf, 0x20, 5, n as u64);
        Ok(())
    }

    pub fn start_header(&mut self, stream_id: u64, seqno: u64) -> Result<(), QpackError> {
        if self.open.is_some() {
            return Err(QpackError::HeaderAlreadyOpen);
        }
        let others_at_risk = self
            .pending
            .get(&stream_id)
            .map(|q| q.iter().any(|b| b.counted_as_at_risk))
            .unwrap_or(false);
        self.open = Some(OpenBlock {
            stream_id,
            seqno,
            base: self.dyn_table.ins_count(),
            n_risked: 0,
            others_at_risk,
            min_ref_id: 0,
            max_ref_id: 0,
            use_dynamic_table: self.config.max_table_capacity > 0,
            referenced: Vec::new(),
        });
        Ok(())
    }

    fn may_risk(&self, open: &OpenBlock) -> bool {
        if open.n_risked == 0 && !open.others_at_risk && self.cur_streams_at_risk >= self.config.max_risked_streams {
            warn!(
                "risk budget exhausted: {}/{} streams already at risk, stream {} will not risk a new reference",
                self.cur_streams_at_risk, self.config.max_risked_streams, open.stream_id
            );
            return false;
        }
        true
    }

    /// Resolves the encoder's decision matrix for one header, returning
    /// the encoder-stream action and the header-block action. Mutates
    /// `self.dyn_table`'s `search_cutoff` via `can_evict_to_fit`'s
    /// dry-run side effect, but inserts nothing.
    fn decide(&mut self, name: &[u8], value: &[u8], flags: EncodeFlags, open: &OpenBlock) -> (EncAction, HeaAction) {
        if flags.contains(EncodeFlags::NEVER_INDEX) {
            let static_match = static_table::find(
                std::str::from_utf8(name).unwrap_or(""),
                std::str::from_utf8(value).unwrap_or(""),
            );
            if let StaticMatch::NameOnly(idx) = static_match {
                return (EncAction::None, HeaAction::LitWithNameStat(idx as u64));
            }
            let dyn_match = self.dyn_table.find(name, value, true, self.max_acked_id);
            if let DynMatch::NameMatch(id) = dyn_match {
                if id <= open.base {
                    return (EncAction::None, HeaAction::LitWithNameDynBaseRel(id));
                }
            }
            return (EncAction::None, HeaAction::Lit);
        }

        let needed = 32 + name.len() + value.len();
        let may_risk = self.may_risk(open);
        let may_index = !flags.contains(EncodeFlags::NO_INDEX)
            && open.use_dynamic_table
            && self.dyn_table.ins_count() < QPACK_MAX_ABS_ID
            && self.dyn_table.can_evict_to_fit(needed);

        let static_match = static_table::find(
            std::str::from_utf8(name).unwrap_or(""),
            std::str::from_utf8(value).unwrap_or(""),
        );
        let dyn_match = self.dyn_table.find(name, value, may_risk, self.max_acked_id);

        enum Table {
            Static,
            Dynamic,
        }
        // Static full match beats everything; otherwise prefer a dynamic
        // full match, then a static name-only match, then a dynamic
        // name-only match -- exact matches (permanent, one byte on the
        // wire) outrank name-only ones, and static outranks dynamic when
        // both only match by name.
        let (found, table, value_matched, match_id) = match static_match {
            StaticMatch::NameAndValue(idx) => (true, Table::Static, true, idx as u64),
            StaticMatch::NameOnly(idx) => match dyn_match {
                DynMatch::FullMatch(id) => (true, Table::Dynamic, true, id),
                _ => (true, Table::Static, false, idx as u64),
            },
            StaticMatch::None => match dyn_match {
                DynMatch::FullMatch(id) => (true, Table::Dynamic, true, id),
                DynMatch::NameMatch(id) => (true, Table::Dynamic, false, id),
                DynMatch::None => (false, Table::Dynamic, false, 0),
            },
        };

        if !found {
            return if !may_index {
                (EncAction::None, HeaAction::Lit)
            } else if !may_risk {
                (EncAction::InsLit, HeaAction::Lit)
            } else {
                (EncAction::InsLit, HeaAction::IndexedPostBase(0))
            };
        }

        match table {
            Table::Static => {
                if value_matched {
                    (EncAction::None, HeaAction::IndexedStat(match_id))
                } else if !may_index {
                    (EncAction::None, HeaAction::LitWithNameStat(match_id))
                } else if may_risk {
                    (
                        EncAction::InsNameRef {
                            index: match_id,
                            static_name: true,
                        },
                        HeaAction::IndexedPostBase(0),
                    )
                } else {
                    (
                        EncAction::InsNameRef {
                            index: match_id,
                            static_name: true,
                        },
                        HeaAction::LitWithNameStat(match_id),
                    )
                }
            }
            Table::Dynamic => {
                let base_rel_or_post_base = |id: u64| {
                    if id <= open.base {
                        HeaAction::IndexedDynBaseRel(id)
                    } else {
                        HeaAction::IndexedPostBase(id)
                    }
                };
                let lit_base_rel_or_post_base = |id: u64| {
                    if id <= open.base {
                        HeaAction::LitWithNameDynBaseRel(id)
                    } else {
                        HeaAction::LitWithNamePostBase(id)
                    }
                };
                if value_matched {
                    (EncAction::None, base_rel_or_post_base(match_id))
                } else if !may_index {
                    (EncAction::None, lit_base_rel_or_post_base(match_id))
                } else {
                    let rel = self.dyn_table.ins_count() - match_id;
                    let enc_action = EncAction::InsNameRef {
                        index: rel,
                        static_name: false,
                    };
                    if may_risk {
                        (enc_action, HeaAction::LitWithNamePostBase(0))
                    } else {
                        (enc_action, lit_base_rel_or_post_base(match_id))
                    }
                }
            }
        }
    }

    /// Encodes one header. `enc_buf`/`hea_buf` receive encoder-stream and
    /// header-block bytes respectively; nothing is written to either on
    /// a `NOBUF_*` result.
    pub fn encode<E: BtMut, H: BtMut>(
        &mut self,
        enc_buf: &mut E,
        hea_buf: &mut H,
        name: &[u8],
        value: &[u8],
        flags: EncodeFlags,
    ) -> Result<EncodeStatus, QpackError> {
        let Some(mut open) = self.open.take() else {
            return Err(QpackError::NoHeaderOpen);
        };

        let (enc_action, hea_action) = self.decide(name, value, flags, &open);
        trace!("encode: action={:?} hea={:?} stream={}", enc_action, hea_action, open.stream_id);

        let enc_needed = match enc_action {
            EncAction::None => 0,
            EncAction::InsNameRef { index, .. } => varint::encoded_len(6, index) + strings::encoded_string_len(7, value),
            EncAction::InsLit => strings::encoded_string_len(5, name) + strings::encoded_string_len(7, value),
        };
        if enc_buf.remaining_mut() < enc_needed {
            self.open = Some(open);
            return Ok(EncodeStatus::NoBufEncoder);
        }

        let hea_needed = hea_action_len(&hea_action, name, value);
        if hea_buf.remaining_mut() < hea_needed {
            self.open = Some(open);
            return Ok(EncodeStatus::NoBufHeaderBlock);
        }

        match enc_action {
            EncAction::None => {}
            EncAction::InsNameRef { index, static_name } => {
                let flag = 0x80 | if static_name { 0x40 } else { 0x00 };
                varint::encode(enc_buf, flag, 6, index);
                strings::encode_string_with_flag(enc_buf, 0, 7, value);
            }
            EncAction::InsLit => {
                strings::encode_string_with_flag(enc_buf, 0x40, 5, name);
                strings::encode_string_with_flag(enc_buf, 0, 7, value);
            }
        }

        let new_abs_id = if !matches!(enc_action, EncAction::None) {
            let id = self.dyn_table.insert(name, value);
            debug!("inserted dynamic entry {} ({} bytes used of {})", id, self.dyn_table.cur_size(), self.dyn_table.max_capacity());
            Some(id)
        } else {
            None
        };

        let hea_action = if targets_new_entry(&hea_action) {
            let id = new_abs_id.expect("sentinel action always follows an insert");
            match hea_action {
                HeaAction::IndexedPostBase(_) => HeaAction::IndexedPostBase(id),
                HeaAction::LitWithNamePostBase(_) => HeaAction::LitWithNamePostBase(id),
                other => other,
            }
        } else {
            hea_action
        };

        emit_header_block(hea_buf, &hea_action, open.base, name, value, flags);

        if let Some(id) = referenced_abs_id(&hea_action) {
            self.dyn_table.inc_ref(id);
            open.referenced.push(id);
            open.max_ref_id = open.max_ref_id.max(id);
            open.min_ref_id = if open.min_ref_id == 0 { id } else { open.min_ref_id.min(id) };
            if id > self.max_acked_id {
                open.n_risked += 1;
            }
        }

        self.open = Some(open);
        Ok(EncodeStatus::Ok)
    }

    /// Writes the header-block prefix and closes the block, registering
    /// it for ack/cancel tracking if it referenced anything.
    pub fn end_header<B: BtMut>(&mut self, buf: &mut B) -> Result<usize, QpackError> {
        let Some(open) = self.open.take() else {
            return Err(QpackError::NoHeaderOpen);
        };

        let max_entries = self.config.max_table_capacity / 32;
        // RFC 9204 defines Required Insert Count against 0-based absolute
        // indices ("1 + largest index referenced"); this crate's abs_id is
        // 1-based, so the same quantity is just `max_ref_id` itself --
        // adding another `+1` here would double-count and make the decoder
        // wait for an insertion that never needs to happen.
        let ric_raw = open.max_ref_id;
        let wire_ric = if ric_raw == 0 || max_entries == 0 {
            0
        } else {
            (ric_raw % (2 * max_entries as u64)) + 1
        };

        let before = buf.remaining_mut();
        varint::encode(buf, 0, 8, wire_ric);
        if open.base >= ric_raw {
            varint::encode(buf, 0x00, 7, open.base - ric_raw);
        } else {
            varint::encode(buf, 0x80, 7, ric_raw - open.base - 1);
        }
        let written = before.saturating_sub(buf.remaining_mut());

        if !open.referenced.is_empty() {
            let counted = open.n_risked > 0 && !open.others_at_risk;
            if counted {
                self.cur_streams_at_risk += 1;
            }
            self.pending.entry(open.stream_id).or_default().push_back(PendingBlock {
                seqno: open.seqno,
                largest_ref: open.max_ref_id,
                referenced: open.referenced,
                counted_as_at_risk: counted,
            });
        }

        Ok(written)
    }

    pub fn decoder_stream_in(&mut self, bytes: &[u8]) -> Result<(), QpackError> {
        let mut buf: &[u8] = bytes;
        while !buf.is_empty() {
            apply_decoder_stream_instruction(self, &mut buf)?;
        }
        Ok(())
    }

    pub(crate) fn ack_header(&mut self, stream_id: u64) -> Result<(), QpackError> {
        let Some(q) = self.pending.get_mut(&stream_id) else {
            return Err(QpackError::UnknownStream);
        };
        let Some(block) = q.pop_front() else {
            return Err(QpackError::UnknownStream);
        };
        if block.largest_ref > self.max_acked_id {
            self.max_acked_id = block.largest_ref;
        }
        for id in &block.referenced {
            self.dyn_table.dec_ref(*id);
        }
        if block.counted_as_at_risk {
            self.cur_streams_at_risk = self.cur_streams_at_risk.saturating_sub(1);
        }
        if q.is_empty() {
            self.pending.remove(&stream_id);
        }
        Ok(())
    }

    pub(crate) fn insert_count_increment(&mut self, n: u64) -> Result<(), QpackError> {
        let new_acked = self.max_acked_id + n;
        if new_acked > self.dyn_table.ins_count() {
            return Err(QpackError::RequiredInsertCountTooLarge);
        }
        self.max_acked_id = new_acked;
        Ok(())
    }

    pub(crate) fn cancel_stream(&mut self, stream_id: u64) {
        if let Some(q) = self.pending.remove(&stream_id) {
            for block in q {
                for id in &block.referenced {
                    self.dyn_table.dec_ref(*id);
                }
                if block.counted_as_at_risk {
                    self.cur_streams_at_risk = self.cur_streams_at_risk.saturating_sub(1);
                }
            }
        }
    }
}

fn referenced_abs_id(action: &HeaAction) -> Option<u64> {
    match *action {
        HeaAction::IndexedDynBaseRel(id) | HeaAction::IndexedPostBase(id) => Some(id),
        HeaAction::LitWithNameDynBaseRel(id) | HeaAction::LitWithNamePostBase(id) => Some(id),
        _ => None,
    }
}

/// Conservative upper bound on the bytes `emit_header_block` will write
/// for `action`. Representations whose ID is still the "new entry"
/// sentinel use `MAX_VARINT_LEN` since the real absolute ID, and
/// therefore its exact width, isn't known until after this check.
fn hea_action_len(action: &HeaAction, name: &[u8], value: &[u8]) -> usize {
    match *action {
        HeaAction::IndexedStat(idx) => varint::encoded_len(6, idx),
        HeaAction::IndexedDynBaseRel(_) => MAX_VARINT_LEN,
        HeaAction::IndexedPostBase(0) => MAX_VARINT_LEN,
        HeaAction::IndexedPostBase(id) => varint::encoded_len(4, id),
        HeaAction::Lit => 1 + strings::encoded_string_len(3, name) + strings::encoded_string_len(7, value),
        HeaAction::LitWithNameStat(_) => 1 + strings::encoded_string_len(7, value),
        HeaAction::LitWithNameDynBaseRel(_) => MAX_VARINT_LEN + strings::encoded_string_len(7, value),
        HeaAction::LitWithNamePostBase(_) => MAX_VARINT_LEN + strings::encoded_string_len(7, value),
    }
}

fn emit_header_block<B: BtMut>(buf: &mut B, action: &HeaAction, base: u64, name: &[u8], value: &[u8], flags: EncodeFlags) {
    let never = flags.contains(EncodeFlags::NEVER_INDEX);
    match *action {
        HeaAction::IndexedStat(idx) => varint::encode(buf, 0xc0, 6, idx),
        HeaAction::IndexedDynBaseRel(id) => varint::encode(buf, 0x80, 6, base - id - 1),
        HeaAction::IndexedPostBase(id) => varint::encode(buf, 0x10, 4, id - base - 1),
        HeaAction::Lit => {
            let n_bit = if never { 0x10 } else { 0x00 };
            strings::encode_string_with_flag(buf, 0x20 | n_bit, 3, name);
            strings::encode_string_with_flag(buf, 0, 7, value);
        }
        HeaAction::LitWithNameStat(idx) => {
            let n_bit = if never { 0x20 } else { 0x00 };
            varint::encode(buf, 0x50 | n_bit, 4, idx);
            strings::encode_string_with_flag(buf, 0, 7, value);
        }
        HeaAction::LitWithNameDynBaseRel(id) => {
            let n_bit = if never { 0x20 } else { 0x00 };
            varint::encode(buf, 0x40 | n_bit, 4, base - id - 1);
            strings::encode_string_with_flag(buf, 0, 7, value);
        }
        HeaAction::LitWithNamePostBase(id) => {
            let n_bit = if never { 0x08 } else { 0x00 };
            varint::encode(buf, n_bit, 3, id - base - 1);
            strings::encode_string_with_flag(buf, 0, 7, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::{BinaryMut, Bt};

    fn new_encoder(cap: usize) -> Encoder {
        Encoder::new(Config::new(cap, 16, 16)).unwrap()
    }

    #[test]
    fn scenario_1_static_only_round_trip() {
        let mut enc = new_encoder(0);
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(4, 0).unwrap();
        for (name, value) in [(":method", "GET"), (":path", "/"), (":scheme", "https")] {
            let status = enc
                .encode(&mut enc_buf, &mut hea_buf, name.as_bytes(), value.as_bytes(), EncodeFlags::empty())
                .unwrap();
            assert_eq!(status, EncodeStatus::Ok);
        }
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();
        let mut all = prefix.chunk().to_vec();
        all.extend_from_slice(hea_buf.chunk());
        assert_eq!(all, vec![0x00, 0x00, 0xd1, 0xc1, 0xd7]);
        assert!(enc_buf.chunk().is_empty());
    }

    #[test]
    fn scenario_2_single_insert_and_reference() {
        let mut enc = new_encoder(4096);
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(4, 0).unwrap();
        let status = enc
            .encode(&mut enc_buf, &mut hea_buf, b"x-custom", b"v", EncodeFlags::empty())
            .unwrap();
        assert_eq!(status, EncodeStatus::Ok);
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();
        assert_eq!(prefix.chunk(), &[0x02, 0x80]);
        assert_eq!(hea_buf.chunk(), &[0x10]);
        assert!(!enc_buf.chunk().is_empty());
    }

    #[test]
    fn ack_raises_max_acked_id_and_releases_ref() {
        let mut enc = new_encoder(4096);
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(4, 0).unwrap();
        enc.encode(&mut enc_buf, &mut hea_buf, b"x-custom", b"v", EncodeFlags::empty())
            .unwrap();
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();
        assert_eq!(enc.cur_streams_at_risk, 1);
        enc.ack_header(4).unwrap();
        assert_eq!(enc.max_acked_id, 1);
        assert_eq!(enc.cur_streams_at_risk, 0);
    }

    #[test]
    fn post_base_index_overflows_into_two_bytes_past_fifteen_entries() {
        // 16 distinct headers referenced post-base in the same block push
        // the 16th one's relative index to 15, overflowing the 4-bit
        // prefix (max single-byte value 14) into a continuation byte.
        let mut enc = new_encoder(4096);
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(4, 0).unwrap();
        let mut last_len_before = 0;
        for i in 0..16 {
            last_len_before = hea_buf.chunk().len();
            let name = format!("x-header-{}", i);
            enc.encode(&mut enc_buf, &mut hea_buf, name.as_bytes(), b"v", EncodeFlags::empty())
                .unwrap();
        }
        let last_bytes = &hea_buf.chunk()[last_len_before..];
        assert_eq!(last_bytes, &[0x1f, 0x00]);
    }

    #[test]
    fn cancel_during_pending_ack_matches_scenario_6() {
        let mut enc = new_encoder(4096);
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(7, 0).unwrap();
        enc.encode(&mut enc_buf, &mut hea_buf, b"a", b"1", EncodeFlags::empty())
            .unwrap();
        enc.encode(&mut enc_buf, &mut hea_buf, b"b", b"2", EncodeFlags::empty())
            .unwrap();
        enc.encode(&mut enc_buf, &mut hea_buf, b"c", b"3", EncodeFlags::empty())
            .unwrap();
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();
        assert!(enc.pending.contains_key(&7));
        enc.cancel_stream(7);
        assert!(!enc.pending.contains_key(&7));
        assert_eq!(enc.max_acked_id, 0);
    }
}
