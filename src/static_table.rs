// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh

//! The QPACK static table (RFC 9204 Appendix A), 99 entries, indexed
//! from 0 -- unlike HPACK's combined static+dynamic index space (which
//! starts at 1), QPACK encodes the static index directly on the wire
//! with no offset.
//!
//! Structured exactly like the `hpack::header_index` module: a raw
//! `&'static [(&str, &str)]` plus a `lazy_static!`-built lookup map for
//! encode-by-name-and-value, with direct indexing for decode-by-index.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// (name, value) -- QPACK static indices are 0-based; index `i` in this
/// array is wire index `i`.
static STATIC_TABLE_RAW: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    ("strict-transport-security", "max-age=31536000; includesubdomains"),
    ("strict-transport-security", "max-age=31536000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

pub const STATIC_TABLE_LEN: usize = STATIC_TABLE_RAW.len();

/// Result of looking a header up in the static table by name and,
/// optionally, value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticMatch {
    /// Both name and value matched entry at this 0-based static index.
    NameAndValue(usize),
    /// Only the name matched, at this 0-based static index (the first
    /// one found, per `find_header`'s scan order).
    NameOnly(usize),
    None,
}

lazy_static! {
    /// Grouped by name for the same dispatch `find_header`
    /// uses: a name-level hash first, then a value-level hash only for
    /// names that repeat in the table (`:method`, `:path`, `:scheme`,
    /// `:status`, etc). Single-value names skip straight to `NameOnly`.
    static ref BY_NAME: HashMap<&'static str, HashMap<&'static str, usize>> = {
        let mut h: HashMap<&'static str, HashMap<&'static str, usize>> = HashMap::new();
        for (idx, &(name, value)) in STATIC_TABLE_RAW.iter().enumerate() {
            h.entry(name).or_default().insert(value, idx);
        }
        h
    };
}

/// Returns the `(name, value)` pair at 0-based static index `idx`, or
/// `None` if out of range.
pub fn get(idx: usize) -> Option<(&'static str, &'static str)> {
    STATIC_TABLE_RAW.get(idx).copied()
}

/// Looks up `(name, value)` against the static table, preferring an
/// exact name+value match and falling back to a name-only match.
pub fn find(name: &str, value: &str) -> StaticMatch {
    let Some(by_value) = BY_NAME.get(name) else {
        return StaticMatch::None;
    };
    if let Some(&idx) = by_value.get(value) {
        return StaticMatch::NameAndValue(idx);
    }
    // Any entry with this name will do for a name-only reference; the
    // lowest static index is as good as any other and keeps the choice
    // deterministic.
    by_value
        .values()
        .min()
        .copied()
        .map(StaticMatch::NameOnly)
        .unwrap_or(StaticMatch::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_99_entries() {
        assert_eq!(STATIC_TABLE_LEN, 99);
    }

    #[test]
    fn known_entries_match_rfc9204_appendix_a() {
        assert_eq!(get(0), Some((":authority", "")));
        assert_eq!(get(1), Some((":path", "/")));
        assert_eq!(get(17), Some((":method", "GET")));
        assert_eq!(get(23), Some((":scheme", "https")));
        assert_eq!(get(98), Some(("x-frame-options", "sameorigin")));
        assert_eq!(get(99), None);
    }

    #[test]
    fn find_prefers_exact_value_match() {
        assert_eq!(find(":method", "GET"), StaticMatch::NameAndValue(17));
        assert_eq!(find(":path", "/"), StaticMatch::NameAndValue(1));
        assert_eq!(find(":scheme", "https"), StaticMatch::NameAndValue(23));
        assert_eq!(find(":method", "PATCH"), StaticMatch::NameOnly(15));
        assert_eq!(find("user-agent", "anything"), StaticMatch::NameOnly(95));
        assert_eq!(find("x-no-such-header", ""), StaticMatch::None);
    }
}
