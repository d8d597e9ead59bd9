//! Offset codec: opaque `<read-seq>_<byte-offset>` tokens and the `-1`/`now`
//! sentinels used to address a position in a stream.
//!
//! The encoding is ASCII, 16-digit zero-padded on each side of the `_`, so
//! lexicographic comparison on the encoded form equals numeric comparison on
//! `(read_seq, byte_offset)`.

use std::cmp::Ordering;

/// The offset of an empty, freshly created stream.
pub const INITIAL_OFFSET: &str = "0000000000000000_0000000000000000";

/// A query-string offset value, as received from a client before it is
/// resolved against a concrete stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetQuery {
    /// `-1`, or the parameter omitted entirely.
    Start,
    /// `now` — resolves to the stream's current tail at request time.
    Now,
    /// A concrete, previously issued offset token.
    At(String),
}

/// A query string value did not match `-1 | now | \d+_\d+`.
#[derive(Debug, thiserror::Error)]
#[error("invalid offset: {0}")]
pub struct InvalidOffset(pub String);

impl OffsetQuery {
    /// Parse a raw query-string value. `None` is treated the same as `-1`.
    pub fn parse(raw: Option<&str>) -> Result<Self, InvalidOffset> {
        match raw {
            None => Ok(OffsetQuery::Start),
            Some("-1") => Ok(OffsetQuery::Start),
            Some("now") => Ok(OffsetQuery::Now),
            Some(s) if is_valid_token(s) => Ok(OffsetQuery::At(s.to_string())),
            Some(s) => Err(InvalidOffset(s.to_string())),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, OffsetQuery::Start)
    }

    pub fn is_now(&self) -> bool {
        matches!(self, OffsetQuery::Now)
    }

    /// Resolve against a stream's current tail offset, turning `Now` into a
    /// concrete token. `Start` has no concrete resolution (it means "replay
    /// from the beginning") and is returned as `None`.
    pub fn resolve(&self, current_offset: &str) -> Option<String> {
        match self {
            OffsetQuery::Start => None,
            OffsetQuery::Now => Some(current_offset.to_string()),
            OffsetQuery::At(s) => Some(s.clone()),
        }
    }
}

/// `\d+_\d+` — any run of digits, an underscore, any run of digits.
fn is_valid_token(s: &str) -> bool {
    let Some((a, b)) = s.split_once('_') else {
        return false;
    };
    !a.is_empty() && !b.is_empty() && a.bytes().all(|c| c.is_ascii_digit()) && b.bytes().all(|c| c.is_ascii_digit())
}

/// Encode `(read_seq, byte_offset)` into the canonical 16-digit padded form.
pub fn encode(read_seq: u64, byte_offset: u64) -> String {
    format!("{read_seq:016}_{byte_offset:016}")
}

/// Decode a token into `(read_seq, byte_offset)`. Returns `None` if the
/// numeric fields overflow `u64`; grammar validity should already have been
/// checked via [`OffsetQuery::parse`].
pub fn decode(token: &str) -> Option<(u64, u64)> {
    let (a, b) = token.split_once('_')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

/// Lexicographic comparison, which by the zero-padding invariant equals
/// numeric ordering on `(read_seq, byte_offset)`.
pub fn compare(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_pads_to_sixteen_digits() {
        assert_eq!(encode(0, 0), INITIAL_OFFSET);
        assert_eq!(encode(0, 1024), "0000000000000000_0000000000001024");
        assert_eq!(encode(1, 0), "0000000000000001_0000000000000000");
    }

    #[test]
    fn decode_roundtrips() {
        assert_eq!(decode("0000000000000000_0000000000001024"), Some((0, 1024)));
        assert_eq!(decode("invalid"), None);
        assert_eq!(decode("abc_def"), None);
    }

    #[test]
    fn parse_sentinels() {
        assert_eq!(OffsetQuery::parse(None).unwrap(), OffsetQuery::Start);
        assert_eq!(OffsetQuery::parse(Some("-1")).unwrap(), OffsetQuery::Start);
        assert_eq!(OffsetQuery::parse(Some("now")).unwrap(), OffsetQuery::Now);
    }

    #[test]
    fn parse_token() {
        let q = OffsetQuery::parse(Some("0000000000000000_0000000000000009")).unwrap();
        assert_eq!(q, OffsetQuery::At("0000000000000000_0000000000000009".to_string()));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(OffsetQuery::parse(Some("")).is_err());
        assert!(OffsetQuery::parse(Some("abc")).is_err());
        assert!(OffsetQuery::parse(Some("1_2_3")).is_err());
        assert!(OffsetQuery::parse(Some("_1")).is_err());
    }

    #[test]
    fn resolve_now_uses_current_tail() {
        let q = OffsetQuery::Now;
        assert_eq!(q.resolve("x"), Some("x".to_string()));
        assert_eq!(OffsetQuery::Start.resolve("x"), None);
    }

    #[test]
    fn compare_is_lexicographic_and_numeric() {
        let a = encode(0, 100);
        let b = encode(0, 200);
        let c = encode(1, 0);
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &c), Ordering::Less);
        assert_eq!(compare(&a, &a), Ordering::Equal);
    }
}
