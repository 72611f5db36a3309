// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! The decoder-side connection object, tying `DecoderDynTable`,
//! `DecoderEncoderStreamParser`, `DecoderHeaderBlockParser` and
//! `BlockedStreams` together into the four calls a caller actually
//! needs: feed encoder-stream bytes in, register a header block, feed
//! its bytes in, and get told when it is done. The host's side of that
//! exchange -- handing over more bytes, learning a block can resume,
//! writing decoder-stream bytes back, and receiving a finished header
//! list -- becomes a plain trait rather than four separate function
//! pointers, the same way callback-shaped C APIs elsewhere in this
//! crate become a `Serialize`-style trait.

use std::collections::HashMap;

use algorithm::buf::{Bt, BinaryMut};
use log::{debug, trace};

use crate::blocked_streams::BlockedStreams;
use crate::config::Config;
use crate::decoder_enc_stream::DecoderEncoderStreamParser;
use crate::decoder_header_block::{DecoderHeaderBlockParser, HeaderSet};
use crate::dyn_table_dec::DecoderDynTable;
use crate::error::{ParseStatus, QpackError, TableError};
use crate::varint;

/// Callbacks a `Decoder` drives as header blocks arrive and complete.
/// A decoder never touches sockets or stream buffers directly -- the
/// host owns those and is told what to do through these four methods.
pub trait DecoderHost {
    /// A header block the decoder previously reported `NeedMore` for (or
    /// a brand-new one) is ready to be read again; the host should call
    /// `Decoder::header_read` with whatever new bytes it has.
    fn wantread_header_block(&mut self, stream_id: u64);

    /// The decoder produced bytes that must be sent on the decoder
    /// stream back to the peer encoder (header acknowledgement, stream
    /// cancellation, or insert count increment).
    fn write_decoder(&mut self, bytes: &[u8]);

    /// A header block finished decoding; `headers` is the complete,
    /// ordered field list for `stream_id`/`seqno`.
    fn header_block_done(&mut self, stream_id: u64, seqno: u64, headers: HeaderSet);

    /// A header block could not be completed because it referenced a
    /// dynamic-table entry that no longer exists or an index out of
    /// range -- a connection-fatal condition per RFC 9204 §2.2.3.
    fn header_block_error(&mut self, stream_id: u64, seqno: u64, err: QpackError);
}

struct PendingHeaderBlock {
    seqno: u64,
    parser: DecoderHeaderBlockParser,
}

/// The QPACK decoder for one connection.
pub struct Decoder {
    config: Config,
    table: DecoderDynTable,
    enc_stream: DecoderEncoderStreamParser,
    blocked: BlockedStreams,
    /// Header blocks currently open (being read or sitting `Blocked`),
    /// keyed by stream ID. RFC 9204 allows at most one header block in
    /// flight per stream at a time.
    streams: HashMap<u64, PendingHeaderBlock>,
    /// Insert count already reported to the peer encoder via Insert
    /// Count Increment; `enc_stream_in` sends the delta each time the
    /// table advances past it.
    acked_ins_count: u64,
}

impl Decoder {
    pub fn new(config: Config) -> Self {
        Decoder {
            table: DecoderDynTable::new(config.max_table_capacity),
            enc_stream: DecoderEncoderStreamParser::new(),
            blocked: BlockedStreams::new(config.max_blocked_streams),
            streams: HashMap::new(),
            acked_ins_count: 0,
            config,
        }
    }

    pub fn table_capacity(&self) -> usize {
        self.table.max_capacity()
    }

    /// Feeds bytes received on the encoder stream to the dynamic table,
    /// then wakes and re-drives any header blocks that were `Blocked` on
    /// an insert count this advanced past, and tells the peer encoder
    /// how many inserts have now been seen via Insert Count Increment.
    pub fn enc_stream_in<B: Bt, H: DecoderHost>(&mut self, buf: &mut B, host: &mut H) -> Result<(), QpackError> {
        self.enc_stream.step(buf, &mut self.table, self.config.max_table_capacity)?;

        let ins_count = self.table.ins_count();
        if ins_count > self.acked_ins_count {
            let mut out = BinaryMut::new();
            varint::encode(&mut out, 0x00, 6, ins_count - self.acked_ins_count);
            host.write_decoder(out.chunk());
            trace!("insert count increment {} -> {}", self.acked_ins_count, ins_count);
            self.acked_ins_count = ins_count;
        }

        for (stream_id, seqno) in self.blocked.pop_up_to(ins_count) {
            debug!("stream {} (seqno {}) unblocked at insert count {}", stream_id, seqno, ins_count);
            host.wantread_header_block(stream_id);
        }
        Ok(())
    }

    /// Registers a new header block of `header_block_size` declared
    /// bytes on `stream_id`/`seqno`. The host should follow up with
    /// `header_read` as bytes for it become available.
    pub fn header_in(&mut self, stream_id: u64, seqno: u64, header_block_size: u64) -> Result<(), QpackError> {
        if self.streams.contains_key(&stream_id) {
            return Err(QpackError::HeaderAlreadyOpen);
        }
        self.streams.insert(
            stream_id,
            PendingHeaderBlock {
                seqno,
                parser: DecoderHeaderBlockParser::new(header_block_size),
            },
        );
        Ok(())
    }

    /// Drives the header block registered for `stream_id` with as much
    /// of `buf` as is available. Calls `header_block_done` and drops the
    /// block's state once it completes; otherwise leaves it registered
    /// (either waiting on more bytes, or `Blocked` on the dynamic table,
    /// in which case `wantread_header_block` fires once it can resume).
    pub fn header_read<B: Bt, H: DecoderHost>(&mut self, stream_id: u64, buf: &mut B, host: &mut H) -> Result<(), QpackError> {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Err(QpackError::UnknownStream);
        };

        match entry.parser.step(buf, &self.table) {
            Ok(ParseStatus::NeedMore) => Ok(()),
            Ok(ParseStatus::Blocked) => {
                let seqno = entry.seqno;
                let required = entry.parser.blocked_on().unwrap_or(0);
                if !self.blocked.insert(stream_id, seqno, required) {
                    let entry = self.streams.remove(&stream_id).expect("checked above");
                    let err = QpackError::Table(TableError::InvalidReference);
                    host.header_block_error(stream_id, entry.seqno, err);
                    return Err(err);
                }
                trace!("stream {} blocked on insert count {}", stream_id, required);
                Ok(())
            }
            Ok(ParseStatus::Done(headers)) => {
                let entry = self.streams.remove(&stream_id).expect("checked above");
                let mut out = BinaryMut::new();
                varint::encode(&mut out, 0x80, 7, stream_id);
                host.write_decoder(out.chunk());
                trace!("header ack for stream {} (seqno {})", stream_id, entry.seqno);
                host.header_block_done(stream_id, entry.seqno, headers);
                Ok(())
            }
            Err(e) => {
                let entry = self.streams.remove(&stream_id).expect("checked above");
                host.header_block_error(stream_id, entry.seqno, e);
                Err(e)
            }
        }
    }

    /// Abandons a header block (the stream it belongs to was reset) and
    /// tells the peer encoder so it can release any at-risk bookkeeping
    /// it still holds for it.
    pub fn cancel_stream<H: DecoderHost>(&mut self, stream_id: u64, host: &mut H) {
        self.streams.remove(&stream_id);
        self.blocked.cancel_stream(stream_id);
        let mut out = BinaryMut::new();
        varint::encode(&mut out, 0x40, 6, stream_id);
        host.write_decoder(out.chunk());
        trace!("stream cancellation for stream {}", stream_id);
    }

    /// Rust ownership already frees a `HeaderSet` the moment it goes out
    /// of scope; this exists only so callers translating from the C
    /// `destroy_header_set` API have somewhere obvious to call.
    pub fn destroy_header_set(&self, _headers: HeaderSet) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use algorithm::buf::BinaryMut;

    use crate::encoder::Encoder;
    use crate::flags::EncodeFlags;

    #[derive(Default)]
    struct RecordingHost {
        decoder_stream_out: Vec<u8>,
        done: Vec<(u64, u64, HeaderSet)>,
        wants_read: Vec<u64>,
        errors: Vec<(u64, u64)>,
    }

    impl DecoderHost for RecordingHost {
        fn wantread_header_block(&mut self, stream_id: u64) {
            self.wants_read.push(stream_id);
        }
        fn write_decoder(&mut self, bytes: &[u8]) {
            self.decoder_stream_out.extend_from_slice(bytes);
        }
        fn header_block_done(&mut self, stream_id: u64, seqno: u64, headers: HeaderSet) {
            self.done.push((stream_id, seqno, headers));
        }
        fn header_block_error(&mut self, stream_id: u64, seqno: u64, _err: QpackError) {
            self.errors.push((stream_id, seqno));
        }
    }

    fn full_block(enc: &mut Encoder, headers: &[(&[u8], &[u8])], stream_id: u64, seqno: u64) -> (Vec<u8>, Vec<u8>) {
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(stream_id, seqno).unwrap();
        for (name, value) in headers {
            enc.encode(&mut enc_buf, &mut hea_buf, name, value, EncodeFlags::empty()).unwrap();
        }
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();
        let mut block = prefix.chunk().to_vec();
        block.extend_from_slice(hea_buf.chunk());
        (enc_buf.chunk().to_vec(), block)
    }

    #[test]
    fn static_only_block_decodes_immediately() {
        let mut enc = Encoder::new(Config::new(0, 16, 16)).unwrap();
        let (_enc_stream, block) = full_block(&mut enc, &[(b":method", b"GET")], 4, 0);

        let mut dec = Decoder::new(Config::new(0, 16, 16));
        let mut host = RecordingHost::default();
        dec.header_in(4, 0, block.len() as u64).unwrap();
        let mut buf: &[u8] = &block;
        dec.header_read(4, &mut buf, &mut host).unwrap();

        assert_eq!(host.done.len(), 1);
        assert_eq!(host.done[0].2.fields[0].name, b":method");
        assert!(!dec.streams.contains_key(&4));
    }

    #[test]
    fn blocked_block_resumes_after_encoder_stream_catches_up() {
        let mut enc = Encoder::new(Config::new(4096, 16, 16)).unwrap();
        let (enc_stream, block) = full_block(&mut enc, &[(b"x-custom", b"v")], 4, 0);

        let mut dec = Decoder::new(Config::new(4096, 16, 16));
        let mut host = RecordingHost::default();
        dec.header_in(4, 0, block.len() as u64).unwrap();
        let mut buf: &[u8] = &block;
        dec.header_read(4, &mut buf, &mut host).unwrap();
        assert!(host.done.is_empty());
        assert!(dec.streams.contains_key(&4));

        let mut enc_bytes: &[u8] = &enc_stream;
        dec.enc_stream_in(&mut enc_bytes, &mut host).unwrap();
        assert_eq!(host.wants_read, vec![4]);

        dec.header_read(4, &mut buf, &mut host).unwrap();
        assert_eq!(host.done.len(), 1);
        assert_eq!(host.done[0].2.fields[0].name, b"x-custom");
    }

    #[test]
    fn enc_stream_in_emits_insert_count_increment() {
        let mut enc = Encoder::new(Config::new(4096, 16, 16)).unwrap();
        let mut enc_buf = BinaryMut::new();
        let mut hea_buf = BinaryMut::new();
        enc.start_header(4, 0).unwrap();
        enc.encode(&mut enc_buf, &mut hea_buf, b"x-custom", b"v", EncodeFlags::empty()).unwrap();
        let mut prefix = BinaryMut::new();
        enc.end_header(&mut prefix).unwrap();

        let mut dec = Decoder::new(Config::new(4096, 16, 16));
        let mut host = RecordingHost::default();
        let mut enc_bytes: &[u8] = enc_buf.chunk();
        dec.enc_stream_in(&mut enc_bytes, &mut host).unwrap();

        assert_eq!(host.decoder_stream_out, vec![1]); // ICI prefix 6 bits, value 1
    }

    #[test]
    fn cancel_stream_drops_pending_block_and_writes_instruction() {
        let mut enc = Encoder::new(Config::new(4096, 16, 16)).unwrap();
        let (_enc_stream, block) = full_block(&mut enc, &[(b"x-custom", b"v")], 9, 0);

        let mut dec = Decoder::new(Config::new(4096, 16, 16));
        let mut host = RecordingHost::default();
        dec.header_in(9, 0, block.len() as u64).unwrap();
        let mut buf: &[u8] = &block;
        dec.header_read(9, &mut buf, &mut host).unwrap();
        assert!(dec.streams.contains_key(&9));

        dec.cancel_stream(9, &mut host);
        assert!(!dec.streams.contains_key(&9));
        assert_eq!(host.decoder_stream_out, vec![0x40 | 9]);
    }
}
