//! Document revision identifiers.
//!
//! A [`RevisionId`] is a 64-bit hybrid logical clock value. Revisions are
//! totally ordered; the revision tree and the range protocol both rely on
//! that ordering.
//!
//! # Wire Encoding
//!
//! On the wire revisions travel as short base64-style strings using an
//! alphabet sorted by ASCII value, most significant digit first and without
//! leading zero digits:
//!
//! ```text
//! -0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz
//! ^ digit 0                                                      ^ digit 63
//! ```
//!
//! Comparing two encoded values by `(len, bytes)` gives the same order as
//! comparing the integers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const HLC_ALPHABET: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Longest encoding of a u64 (64 bits / 6 bits per digit, rounded up).
const HLC_MAX_LEN: usize = 11;

fn digit_value(c: u8) -> Option<u64> {
    let v = match c {
        b'-' => 0,
        b'0'..=b'9' => 1 + (c - b'0'),
        b'A'..=b'Z' => 11 + (c - b'A'),
        b'_' => 37,
        b'a'..=b'z' => 38 + (c - b'a'),
        _ => return None,
    };
    Some(u64::from(v))
}

/// An opaque, totally ordered document revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RevisionId(u64);

impl RevisionId {
    pub const MIN: RevisionId = RevisionId(0);
    pub const MAX: RevisionId = RevisionId(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Encode as an HLC string.
    pub fn to_hlc(self) -> String {
        if self.0 == 0 {
            return "-".to_string();
        }
        let mut buf = [0u8; HLC_MAX_LEN];
        let mut pos = HLC_MAX_LEN;
        let mut v = self.0;
        while v > 0 {
            pos -= 1;
            buf[pos] = HLC_ALPHABET[(v & 0x3f) as usize];
            v >>= 6;
        }
        // Alphabet is pure ASCII.
        String::from_utf8_lossy(&buf[pos..]).into_owned()
    }

    /// Decode an HLC string. Returns `None` for empty, oversized or
    /// malformed input.
    pub fn from_hlc(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > HLC_MAX_LEN {
            return None;
        }
        let mut v: u64 = 0;
        for c in s.bytes() {
            let d = digit_value(c)?;
            v = v.checked_mul(64)?.checked_add(d)?;
        }
        Some(Self(v))
    }

    /// Next revision in order, saturating at [`RevisionId::MAX`].
    pub fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hlc())
    }
}

impl From<u64> for RevisionId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Serialize for RevisionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hlc())
    }
}

impl<'de> Deserialize<'de> for RevisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Older leaders send plain numeric revisions.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Hlc(String),
            Numeric(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Numeric(v) => Ok(RevisionId(v)),
            Raw::Hlc(s) => {
                if let Some(rev) = RevisionId::from_hlc(&s) {
                    return Ok(rev);
                }
                s.parse::<u64>().map(RevisionId).map_err(|_| {
                    serde::de::Error::custom(format!("invalid revision id: {s:?}"))
                })
            }
        }
    }
}

/// An inclusive range `[low, high]` of revisions.
///
/// Serialized as a two-element array, which is what the ranges endpoint
/// expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(RevisionId, RevisionId)", into = "(RevisionId, RevisionId)")]
pub struct RevisionRange {
    pub low: RevisionId,
    pub high: RevisionId,
}

impl RevisionRange {
    pub fn new(low: RevisionId, high: RevisionId) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, rev: RevisionId) -> bool {
        self.low <= rev && rev <= self.high
    }

    /// True if `self` ends strictly before `other` begins.
    pub fn precedes(&self, other: &RevisionRange) -> bool {
        self.high < other.low
    }
}

impl From<(RevisionId, RevisionId)> for RevisionRange {
    fn from((low, high): (RevisionId, RevisionId)) -> Self {
        Self { low, high }
    }
}

impl From<RevisionRange> for (RevisionId, RevisionId) {
    fn from(r: RevisionRange) -> Self {
        (r.low, r.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hlc_known_values() {
        assert_eq!(RevisionId::new(0).to_hlc(), "-");
        assert_eq!(RevisionId::new(1).to_hlc(), "0");
        assert_eq!(RevisionId::new(63).to_hlc(), "z");
        assert_eq!(RevisionId::new(64).to_hlc(), "0-");
        assert_eq!(RevisionId::MAX.to_hlc().len(), HLC_MAX_LEN);
    }

    #[test]
    fn test_hlc_decode_rejects_garbage() {
        assert_eq!(RevisionId::from_hlc(""), None);
        assert_eq!(RevisionId::from_hlc("abc!"), None);
        assert_eq!(RevisionId::from_hlc("zzzzzzzzzzzz"), None);
        // 11 digits of 'z' overflows 64 bits
        assert_eq!(RevisionId::from_hlc("zzzzzzzzzzz"), None);
    }

    #[test]
    fn test_hlc_order_matches_integer_order() {
        let values = [0u64, 1, 63, 64, 4095, 4096, 1 << 40, u64::MAX - 1, u64::MAX];
        for pair in values.windows(2) {
            let a = RevisionId::new(pair[0]).to_hlc();
            let b = RevisionId::new(pair[1]).to_hlc();
            assert!((a.len(), a.as_bytes()) < (b.len(), b.as_bytes()), "{a} vs {b}");
        }
    }

    #[test]
    fn test_revision_serde_accepts_string_and_number() {
        let rev: RevisionId = serde_json::from_str("\"0-\"").unwrap();
        assert_eq!(rev, RevisionId::new(64));

        let rev: RevisionId = serde_json::from_str("12345").unwrap();
        assert_eq!(rev, RevisionId::new(12345));

        assert!(serde_json::from_str::<RevisionId>("\"!!\"").is_err());
        assert_eq!(serde_json::to_string(&RevisionId::new(64)).unwrap(), "\"0-\"");
    }

    #[test]
    fn test_range_serializes_as_pair() {
        let range = RevisionRange::new(RevisionId::new(1), RevisionId::new(64));
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "[\"0\",\"0-\"]");
        let parsed: RevisionRange = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, range);
    }

    #[test]
    fn test_range_contains_and_precedes() {
        let a = RevisionRange::new(RevisionId::new(10), RevisionId::new(20));
        let b = RevisionRange::new(RevisionId::new(21), RevisionId::new(30));
        assert!(a.contains(RevisionId::new(10)));
        assert!(a.contains(RevisionId::new(20)));
        assert!(!a.contains(RevisionId::new(21)));
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));
    }
}
