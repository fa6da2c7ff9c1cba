//! Internal keys are the engine's ordering primitive: a user key followed by an 8-byte
//! little-endian trailer packing a 56-bit sequence number and an 8-bit entry kind,
//! `(seq_num << 8) | kind`.
//!
//! Ordering is user key ascending (by the user comparator), ties broken by trailer *descending*,
//! so that newer entries -- and, at equal sequence numbers, non-deletion kinds -- sort first.

use crate::cmp::Comparator;
use crate::types::SequenceNumber;

use std::cmp::Ordering;

use integer_encoding::FixedInt;

pub const KIND_DELETE: u8 = 0;
pub const KIND_SET: u8 = 1;
pub const KIND_MERGE: u8 = 2;
pub const KIND_RANGE_DELETE: u8 = 15;

/// The largest valid kind; doubles as the seek sentinel so that a lookup key for sequence number
/// `s` sorts before every entry of the same user key with seq_num <= s.
pub const KIND_MAX: u8 = 15;

const TRAILER_SIZE: usize = 8;

pub fn valid_kind(kind: u8) -> bool {
    matches!(kind, KIND_DELETE | KIND_SET | KIND_MERGE | KIND_RANGE_DELETE)
}

pub fn trailer(seq: SequenceNumber, kind: u8) -> u64 {
    (seq << 8) | kind as u64
}

/// Appends the encoding of (user_key, seq, kind) to dst.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, kind: u8) {
    dst.extend_from_slice(user_key);
    let mut tr = [0u8; TRAILER_SIZE];
    trailer(seq, kind).encode_fixed(&mut tr).unwrap();
    dst.extend_from_slice(&tr);
}

pub fn make_internal_key(user_key: &[u8], seq: SequenceNumber, kind: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    append_internal_key(&mut key, user_key, seq, kind);
    key
}

/// Splits an internal key into (user_key, seq_num, kind). Returns None for keys too short to
/// carry a trailer.
pub fn parse_internal_key(ikey: &[u8]) -> Option<(&[u8], SequenceNumber, u8)> {
    if ikey.len() < TRAILER_SIZE {
        return None;
    }
    let split = ikey.len() - TRAILER_SIZE;
    let tr = u64::decode_fixed(&ikey[split..]).unwrap();
    Some((&ikey[..split], tr >> 8, (tr & 0xff) as u8))
}

/// The user-key portion of an internal key. Keys too short to carry a trailer yield an empty
/// user key.
pub fn user_key(ikey: &[u8]) -> &[u8] {
    if ikey.len() < TRAILER_SIZE {
        return &[];
    }
    &ikey[..ikey.len() - TRAILER_SIZE]
}

fn decode_trailer(ikey: &[u8]) -> u64 {
    debug_assert!(ikey.len() >= TRAILER_SIZE);
    u64::decode_fixed(&ikey[ikey.len() - TRAILER_SIZE..]).unwrap()
}

pub fn seq_num(ikey: &[u8]) -> SequenceNumber {
    decode_trailer(ikey) >> 8
}

pub fn kind(ikey: &[u8]) -> u8 {
    (decode_trailer(ikey) & 0xff) as u8
}

/// Rewrites the kind of an encoded internal key in place.
pub fn set_kind(ikey: &mut [u8], kind: u8) {
    let len = ikey.len();
    debug_assert!(len >= TRAILER_SIZE);
    ikey[len - TRAILER_SIZE] = kind;
}

/// Compares two internal keys: user keys ascending per `ucmp`, ties broken by trailer descending.
pub fn cmp_internal_key(ucmp: &dyn Comparator, a: &[u8], b: &[u8]) -> Ordering {
    match ucmp.compare(user_key(a), user_key(b)) {
        Ordering::Equal => decode_trailer(b).cmp(&decode_trailer(a)),
        o => o,
    }
}

/// A LookupKey is the encoding of a (user_key, snapshot) pair for seeking: it sorts before every
/// entry of the same user key whose sequence number is at most the snapshot.
pub struct LookupKey {
    key: Vec<u8>,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> LookupKey {
        LookupKey {
            key: make_internal_key(user_key, seq, KIND_MAX),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.key
    }

    pub fn user_key(&self) -> &[u8] {
        user_key(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::DefaultCmp;

    #[test]
    fn test_ikey_roundtrip() {
        let k = make_internal_key(b"grape", 123, KIND_SET);
        let (ukey, seq, kind) = parse_internal_key(&k).unwrap();
        assert_eq!(ukey, b"grape");
        assert_eq!(seq, 123);
        assert_eq!(kind, KIND_SET);
        assert!(parse_internal_key(b"short").is_none());
    }

    #[test]
    fn test_ikey_ordering() {
        let cmp = DefaultCmp;
        // User keys ascending.
        let a = make_internal_key(b"apple", 5, KIND_SET);
        let b = make_internal_key(b"banana", 5, KIND_SET);
        assert_eq!(cmp_internal_key(&cmp, &a, &b), Ordering::Less);

        // Same user key: newer sequence numbers sort first.
        let new = make_internal_key(b"k", 9, KIND_SET);
        let old = make_internal_key(b"k", 3, KIND_SET);
        assert_eq!(cmp_internal_key(&cmp, &new, &old), Ordering::Less);

        // Same sequence number: higher kinds sort first.
        let set = make_internal_key(b"k", 4, KIND_SET);
        let del = make_internal_key(b"k", 4, KIND_DELETE);
        assert_eq!(cmp_internal_key(&cmp, &set, &del), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_sorts_before_visible_entries() {
        let cmp = DefaultCmp;
        let lk = LookupKey::new(b"k", 7);
        let visible = make_internal_key(b"k", 7, KIND_SET);
        let newer = make_internal_key(b"k", 8, KIND_SET);
        assert!(cmp_internal_key(&cmp, lk.internal_key(), &visible) <= Ordering::Equal);
        assert_eq!(cmp_internal_key(&cmp, &newer, lk.internal_key()), Ordering::Less);
    }

    #[test]
    fn test_set_kind() {
        let mut k = make_internal_key(b"k", 11, KIND_MERGE);
        set_kind(&mut k, KIND_SET);
        assert_eq!(kind(&k), KIND_SET);
        assert_eq!(seq_num(&k), 11);
    }
}
