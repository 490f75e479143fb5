//! Request and received-header containers, grounded on `aihttpheaders.h`'s
//! `AIHTTPHeaders` / `AIHTTPReceivedHeaders` pair.
//!
//! The outbound side (`RequestHeaders`) is an ordered, case-sensitive map
//! with three insertion policies. The inbound side (`ReceivedHeaders`) is a
//! multimap compared under the original's bit-5-masking case fold, which
//! is preserved here including its documented quirk.

use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// How `RequestHeaders::add` resolves a collision with an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMergeMode {
    /// The header must not already exist; returns `Err` if it does.
    New,
    /// Overwrite any existing value.
    ReplaceIfExists,
    /// Leave the existing value untouched if the key is already present.
    KeepExisting,
}

/// Outbound headers attached to an `EasyRequest`. Case-sensitive key
/// storage (HTTP header names round-trip as given); insertion order is not
/// significant, so a sorted map is used rather than reproducing the
/// original's uninsertion-order `std::map` 1:1 in spirit only.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pairs: BTreeMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut headers = Self::new();
        headers.pairs.insert(key.into(), value.into());
        headers
    }

    /// Add a header under the given merge policy.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>, mode: HeaderMergeMode) -> Result<()> {
        let key = key.into();
        match mode {
            HeaderMergeMode::New => {
                if self.pairs.contains_key(&key) {
                    return Err(CoreError::DuplicateHeader(key));
                }
                self.pairs.insert(key, value.into());
            }
            HeaderMergeMode::ReplaceIfExists => {
                self.pairs.insert(key, value.into());
            }
            HeaderMergeMode::KeepExisting => {
                self.pairs.entry(key).or_insert_with(|| value.into());
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build a `reqwest::header::HeaderMap` for dispatch.
    pub fn to_header_map(&self) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in self.iter() {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                map.append(name, val);
            }
        }
        map
    }
}

/// Returns true if `c1` and `c2` compare equal under the original's bit-5
/// masking fold. Preserved verbatim, including the documented quirk that
/// it also equates the non-letter ranges `@[\]^` and `` `{|}~ `` (any
/// printable ASCII character with bit 5 set maps to the same bucket as
/// its bit-5-clear counterpart, not just letters).
fn char_eq_bit5(c1: u8, c2: u8) -> bool {
    (c1 | 0x20) == (c2 | 0x20)
}

fn key_eq_bit5(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).all(|(x, y)| char_eq_bit5(x, y))
}

/// Debug-only helper flagging header names that the bit-5 fold equates
/// with each other despite not being case variants of the same letters
/// (the `@[\]^` / `` `{|}~ `` quirk). Not called in production paths; a
/// diagnostic for anyone adding a header name and wondering why it
/// collided with an unrelated one.
pub fn flag_bit5_quirk(key: &str) -> bool {
    key.bytes().any(|b| matches!(b, b'@'..=b'^') ) && key.bytes().any(|b| matches!(b, b'`'..=b'~'))
}

/// Inbound response headers. A multimap compared under the bit-5 fold, so
/// `Content-Type` and `content-type` (and `CONTENT-TYPE`) are the same
/// bucket; insertion order within a bucket is preserved for `get_values`.
#[derive(Debug, Clone, Default)]
pub struct ReceivedHeaders {
    entries: Vec<(String, String)>,
}

impl ReceivedHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| key_eq_bit5(k, key))
    }

    /// First value for `key`, under the fold comparison.
    pub fn get_first_value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| key_eq_bit5(k, key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order, under the fold comparison.
    pub fn get_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| key_eq_bit5(k, key))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if the two keys compare equal under the fold, matching
    /// `AIHTTPReceivedHeaders::equal`.
    pub fn equal(key1: &str, key2: &str) -> bool {
        key_eq_bit5(key1, key2)
    }

    pub fn from_reqwest(headers: &reqwest::header::HeaderMap) -> Self {
        let mut received = Self::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                received.add_header(name.as_str().to_string(), value.to_string());
            }
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_mode_rejects_duplicate() {
        let mut headers = RequestHeaders::new();
        headers.add("X-Foo", "1", HeaderMergeMode::New).unwrap();
        assert!(headers.add("X-Foo", "2", HeaderMergeMode::New).is_err());
    }

    #[test]
    fn replace_if_exists_overwrites() {
        let mut headers = RequestHeaders::new();
        headers.add("X-Foo", "1", HeaderMergeMode::New).unwrap();
        headers.add("X-Foo", "2", HeaderMergeMode::ReplaceIfExists).unwrap();
        assert_eq!(headers.get("X-Foo"), Some("2"));
    }

    #[test]
    fn keep_existing_does_not_overwrite() {
        let mut headers = RequestHeaders::new();
        headers.add("X-Foo", "1", HeaderMergeMode::New).unwrap();
        headers.add("X-Foo", "2", HeaderMergeMode::KeepExisting).unwrap();
        assert_eq!(headers.get("X-Foo"), Some("1"));
    }

    #[test]
    fn received_headers_fold_case() {
        let mut received = ReceivedHeaders::new();
        received.add_header("Content-Type", "text/plain");
        assert_eq!(received.get_first_value("content-type"), Some("text/plain"));
        assert_eq!(received.get_first_value("CONTENT-TYPE"), Some("text/plain"));
        assert!(ReceivedHeaders::equal("Set-Cookie", "set-cookie"));
    }

    #[test]
    fn received_headers_preserves_multiple_values_in_order() {
        let mut received = ReceivedHeaders::new();
        received.add_header("Set-Cookie", "a=1");
        received.add_header("set-cookie", "b=2");
        let values: Vec<_> = received.get_values("SET-COOKIE").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn bit5_quirk_equates_non_letter_ranges() {
        // '@' (0x40) | 0x20 == '`' (0x60), so these fold equal despite
        // neither being a letter.
        assert!(key_eq_bit5("@", "`"));
        assert!(flag_bit5_quirk("@header`name"));
    }
}
