// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-disk message record codec (§3.1, §4.1).
//!
//! ```text
//!  total_len:u32   low 31 bits = record length; bit 31 = "has headers"
//!  seq:u64         sequence number; bit 63 = "erased/tombstone"
//!  ts:i64          nanoseconds since Unix epoch
//!  subj_len:u16
//!  subject:bytes[subj_len]
//!  [ hdr_len:u32, headers:bytes[hdr_len] ]   iff bit 31 of total_len set
//!  payload:bytes
//!  hash:bytes[8]
//! ```

use crate::error::{Result, StoreError};
use crate::hash::KeyedHasher;
use byteorder::{ByteOrder, LittleEndian};

/// High bit of `total_len` / idx slot values.
pub const HBIT: u32 = 1 << 31;
/// High bit of a `seq` field, marking a tombstone/erased record.
pub const ERASED_BIT: u64 = 1 << 63;

/// Fixed header: `total_len(4) + seq(8) + ts(8) + subj_len(2)`.
pub const FIXED_HEADER_LEN: usize = 4 + 8 + 8 + 2;
/// Trailing hash length.
pub const HASH_LEN: usize = 8;
/// Smallest possible record: empty subject, no headers, no payload.
pub const EMPTY_RECORD_LEN: usize = FIXED_HEADER_LEN + HASH_LEN;

/// A decoded record. Payload/subject/headers are owned copies sized exactly
/// to their content (never a sub-slice of a larger shared buffer), per
/// §4.1's requirement that the decoder not let callers see into adjacent
/// cache bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub seq: u64,
    pub ts: i64,
    pub subject: Vec<u8>,
    pub headers: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// `true` if bit 63 of the on-disk `seq` field was set (tombstone).
    pub erased: bool,
}

/// Computes the exact on-disk size of a record with the given parts.
pub fn encoded_size(subject: &[u8], headers: Option<&[u8]>, payload: &[u8]) -> usize {
    let hdr = headers.map(|h| 4 + h.len()).unwrap_or(0);
    FIXED_HEADER_LEN + subject.len() + hdr + payload.len() + HASH_LEN
}

/// Encodes a record into `buf`, appending to whatever is already there.
/// Returns the number of bytes written. Fails with `MsgTooLarge` if the
/// encoded size would set bit 31 of `total_len`.
pub fn encode(
    buf: &mut Vec<u8>,
    hasher: &KeyedHasher,
    seq: u64,
    ts: i64,
    subject: &[u8],
    headers: Option<&[u8]>,
    payload: &[u8],
) -> Result<usize> {
    let rl = encoded_size(subject, headers, payload);
    if rl as u64 >= HBIT as u64 {
        return Err(StoreError::MsgTooLarge(rl));
    }

    let mut total_len = rl as u32;
    if headers.is_some() {
        total_len |= HBIT;
    }

    let start = buf.len();
    buf.reserve(rl);

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    LittleEndian::write_u32(&mut fixed[0..4], total_len);
    LittleEndian::write_u64(&mut fixed[4..12], seq);
    LittleEndian::write_i64(&mut fixed[12..20], ts);
    LittleEndian::write_u16(&mut fixed[20..22], subject.len() as u16);
    buf.extend_from_slice(&fixed);
    buf.extend_from_slice(subject);

    if let Some(h) = headers {
        let mut hdr_len = [0u8; 4];
        LittleEndian::write_u32(&mut hdr_len, h.len() as u32);
        buf.extend_from_slice(&hdr_len);
        buf.extend_from_slice(h);
    }

    buf.extend_from_slice(payload);

    let seq_bytes = seq.to_le_bytes();
    let ts_bytes = ts.to_le_bytes();
    let subj_len_bytes = (subject.len() as u16).to_le_bytes();
    let mut hashed_parts: Vec<&[u8]> = vec![&seq_bytes, &ts_bytes, &subj_len_bytes, subject];
    if let Some(h) = headers {
        hashed_parts.push(h);
    }
    hashed_parts.push(payload);
    let digest = hasher.hash64(&hashed_parts);
    buf.extend_from_slice(&digest.to_le_bytes());

    Ok(buf.len() - start)
}

/// Writes a bare tombstone record (`seq | ERASED_BIT`, zero timestamp,
/// empty subject/headers/payload), used by `skip` (§4.2) and secure erase
/// (§4.2 `remove`).
pub fn encode_tombstone(buf: &mut Vec<u8>, hasher: &KeyedHasher, seq: u64) -> usize {
    encode(buf, hasher, seq | ERASED_BIT, 0, &[], None, &[])
        .expect("empty tombstone record always fits")
}

/// Builds an in-place secure-erase replacement for a live record of length
/// `rl`: same framing and total length, `seq | ERASED_BIT`, zero timestamp,
/// empty subject/headers, and `rl - EMPTY_RECORD_LEN` bytes of random
/// payload, terminated by a freshly computed trailing hash (§4.2 `remove`,
/// secure path). The result is always exactly `rl` bytes, preserving the
/// neighboring records' offsets.
pub fn encode_erased(rl: usize, hasher: &KeyedHasher, seq: u64, rng: &mut impl rand::RngCore) -> Vec<u8> {
    let payload_len = rl.saturating_sub(EMPTY_RECORD_LEN);
    let mut payload = vec![0u8; payload_len];
    rng.fill_bytes(&mut payload);
    let mut buf = Vec::with_capacity(rl);
    encode(&mut buf, hasher, seq | ERASED_BIT, 0, &[], None, &payload)
        .expect("erased record always fits within the original record's length");
    debug_assert_eq!(buf.len(), rl);
    buf
}

/// Decodes one record from `buf[0..]`. `buf` may be longer than the
/// record; only the first `rl` bytes (as read from the header) are
/// consumed. If `hasher` is provided, the trailing hash is recomputed and
/// checked; mismatch is `BadMsg`.
pub fn decode(buf: &[u8], hasher: Option<&KeyedHasher>) -> Result<(DecodedRecord, usize)> {
    if buf.len() < FIXED_HEADER_LEN {
        return Err(StoreError::BadMsg("buffer shorter than fixed header".into()));
    }

    let total_len = LittleEndian::read_u32(&buf[0..4]);
    let has_headers = total_len & HBIT != 0;
    let rl = (total_len & !HBIT) as usize;
    if rl == 0 {
        return Err(StoreError::BadMsg("zero-length record (corruption marker)".into()));
    }
    if rl > buf.len() {
        return Err(StoreError::BadMsg(format!(
            "record length {rl} exceeds available buffer {}",
            buf.len()
        )));
    }

    let raw_seq = LittleEndian::read_u64(&buf[4..12]);
    let erased = raw_seq & ERASED_BIT != 0;
    let seq = raw_seq & !ERASED_BIT;
    let ts = LittleEndian::read_i64(&buf[12..20]);
    let subj_len = LittleEndian::read_u16(&buf[20..22]) as usize;

    let mut cursor = FIXED_HEADER_LEN;
    let dlen_min = cursor + subj_len;
    if dlen_min > rl {
        return Err(StoreError::BadMsg("subject length exceeds record length".into()));
    }
    let subject = buf[cursor..cursor + subj_len].to_vec();
    cursor += subj_len;

    let headers = if has_headers {
        if cursor + 4 > rl {
            return Err(StoreError::BadMsg("truncated header length field".into()));
        }
        let hdr_len = LittleEndian::read_u32(&buf[cursor..cursor + 4]) as usize;
        cursor += 4;
        if cursor + hdr_len > rl {
            return Err(StoreError::BadMsg("header length exceeds record length".into()));
        }
        let h = buf[cursor..cursor + hdr_len].to_vec();
        cursor += hdr_len;
        Some(h)
    } else {
        None
    };

    if cursor + HASH_LEN > rl {
        return Err(StoreError::BadMsg("record too short for trailing hash".into()));
    }
    let payload_len = rl - cursor - HASH_LEN;
    let payload = buf[cursor..cursor + payload_len].to_vec();
    cursor += payload_len;
    let trailing_hash = LittleEndian::read_u64(&buf[cursor..cursor + HASH_LEN]);

    if let Some(hasher) = hasher {
        let seq_bytes = raw_seq.to_le_bytes();
        let ts_bytes = ts.to_le_bytes();
        let subj_len_bytes = (subj_len as u16).to_le_bytes();
        let mut parts: Vec<&[u8]> = vec![&seq_bytes, &ts_bytes, &subj_len_bytes, &subject];
        if let Some(h) = &headers {
            parts.push(h);
        }
        parts.push(&payload);
        let expected = hasher.hash64(&parts);
        if expected != trailing_hash {
            return Err(StoreError::BadMsg("hash mismatch".into()));
        }
    }

    Ok((
        DecodedRecord {
            seq: if erased { 0 } else { seq },
            ts,
            subject,
            headers,
            payload,
            erased,
        },
        rl,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> KeyedHasher {
        KeyedHasher::from_seed("orders-1")
    }

    #[test]
    fn encoded_size_matches_spec_formula() {
        let subj = b"foo";
        let payload = b"hello";
        assert_eq!(encoded_size(subj, None, payload), 22 + 3 + 5 + 8);
        assert_eq!(
            encoded_size(subj, Some(b"hdr"), payload),
            22 + 3 + (4 + 3) + 5 + 8
        );
    }

    #[test]
    fn round_trip_no_headers() {
        let h = hasher();
        let mut buf = Vec::new();
        let written = encode(&mut buf, &h, 1, 1_000, b"foo", None, b"hello").unwrap();
        assert_eq!(written, encoded_size(b"foo", None, b"hello"));
        assert_eq!(buf.len(), written);

        let (rec, rl) = decode(&buf, Some(&h)).unwrap();
        assert_eq!(rl, written);
        assert_eq!(rec.seq, 1);
        assert_eq!(rec.ts, 1_000);
        assert_eq!(rec.subject, b"foo");
        assert_eq!(rec.headers, None);
        assert_eq!(rec.payload, b"hello");
        assert!(!rec.erased);
    }

    #[test]
    fn round_trip_with_headers() {
        let h = hasher();
        let mut buf = Vec::new();
        encode(&mut buf, &h, 7, 42, b"a.b.c", Some(b"k:v\r\n"), b"payload").unwrap();
        let (rec, _) = decode(&buf, Some(&h)).unwrap();
        assert_eq!(rec.headers.as_deref(), Some(&b"k:v\r\n"[..]));
        assert_eq!(rec.payload, b"payload");
    }

    #[test]
    fn tombstone_round_trip() {
        let h = hasher();
        let mut buf = Vec::new();
        let n = encode_tombstone(&mut buf, &h, 9);
        assert_eq!(n, EMPTY_RECORD_LEN);
        let (rec, _) = decode(&buf, Some(&h)).unwrap();
        assert!(rec.erased);
        assert_eq!(rec.seq, 0);
    }

    #[test]
    fn bad_hash_detected() {
        let h = hasher();
        let mut buf = Vec::new();
        encode(&mut buf, &h, 1, 0, b"x", None, b"y").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let err = decode(&buf, Some(&h)).unwrap_err();
        assert!(matches!(err, StoreError::BadMsg(_)));
    }

    #[test]
    fn zero_length_marks_corruption() {
        let buf = vec![0u8; FIXED_HEADER_LEN];
        let err = decode(&buf, None).unwrap_err();
        assert!(matches!(err, StoreError::BadMsg(_)));
    }

    #[test]
    fn encode_erased_preserves_length() {
        let h = hasher();
        let mut buf = Vec::new();
        encode(&mut buf, &h, 4, 55, b"subj", None, b"some payload bytes").unwrap();
        let rl = buf.len();

        let mut rng = rand::thread_rng();
        let erased = encode_erased(rl, &h, 4, &mut rng);
        assert_eq!(erased.len(), rl);

        let (rec, consumed) = decode(&erased, Some(&h)).unwrap();
        assert_eq!(consumed, rl);
        assert!(rec.erased);
        assert_eq!(rec.seq, 0);
        assert!(rec.subject.is_empty());
    }

    #[test]
    fn too_large_rejected() {
        let h = hasher();
        let mut buf = Vec::new();
        let huge_payload = vec![0u8; HBIT as usize];
        let err = encode(&mut buf, &h, 1, 0, b"x", None, &huge_payload).unwrap_err();
        assert!(matches!(err, StoreError::MsgTooLarge(_)));
    }
}
