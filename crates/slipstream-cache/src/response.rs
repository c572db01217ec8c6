//! Response records and the cache metadata carried in their headers
//!
//! Cached responses keep their bookkeeping in ordinary response headers so the
//! persisted layout stays a plain `(status, headers, body)` triple:
//!
//! - `x-cache-timestamp`: milliseconds since the Unix epoch when the entry was stored
//! - `x-cache-access-count`: number of times the entry has been served
//! - `x-cache-game-content`: `true` when the entry belongs to the game asset class
//! - `x-cache-stale`: `true` only on degraded responses served after retries failed
//!
//! Missing or malformed values parse as zero / `false`, never as an error.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header carrying the store timestamp in epoch milliseconds
pub const HEADER_TIMESTAMP: &str = "x-cache-timestamp";
/// Header carrying the hit counter
pub const HEADER_ACCESS_COUNT: &str = "x-cache-access-count";
/// Header flagging game content
pub const HEADER_GAME_CONTENT: &str = "x-cache-game-content";
/// Header flagging a stale fallback response
pub const HEADER_STALE: &str = "x-cache-stale";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Case-insensitive header map with deterministic ordering.
///
/// Names are stored lowercased. Repeated headers are folded into a single
/// comma-separated value, except `set-cookie`, whose values may contain commas
/// and are kept one per line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

/// Headers that must never be folded
const UNFOLDED_HEADERS: &[&str] = &["set-cookie"];

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of the header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of the header, in arrival order.
    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Replaces all values of the header.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), vec![value.into()]);
    }

    /// Adds a value without dropping the existing ones.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) {
        let name = name.as_ref().to_ascii_lowercase();
        let unfolded = UNFOLDED_HEADERS.contains(&name.as_str());
        let values = self.0.entry(name).or_default();
        if !unfolded && let Some(existing) = values.last_mut() {
            existing.push_str(", ");
            existing.push_str(value.as_ref());
        } else {
            values.push(value.as_ref().to_string());
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// One `(name, value)` pair per value, so unfolded headers repeat.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A response as produced by the upstream proxy and as held in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 200 response with the given content type.
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type", content_type);
        Self::new(200, headers, body)
    }

    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
    }

    /// Cache bookkeeping parsed from the headers.
    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata::from_headers(&self.headers)
    }

    /// Stamps a freshly stored entry: timestamp `now_ms`, access count 1, and the
    /// game-content flag when requested.
    pub fn stamp_fresh(&mut self, now_ms: u64, game_content: bool) {
        self.headers.insert(HEADER_TIMESTAMP, now_ms.to_string());
        self.headers.insert(HEADER_ACCESS_COUNT, "1");
        if game_content {
            self.headers.insert(HEADER_GAME_CONTENT, "true");
        }
    }

    pub fn set_access_count(&mut self, count: u64) {
        self.headers.insert(HEADER_ACCESS_COUNT, count.to_string());
    }

    pub fn mark_stale(&mut self) {
        self.headers.insert(HEADER_STALE, "true");
    }

    pub fn is_stale(&self) -> bool {
        self.headers.get(HEADER_STALE) == Some("true")
    }
}

/// Cache bookkeeping for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Epoch milliseconds, 0 when unknown
    pub stored_at_ms: u64,
    pub access_count: u64,
    pub is_game_content: bool,
}

impl EntryMetadata {
    pub fn from_headers(headers: &Headers) -> Self {
        let parse = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
        };

        Self {
            stored_at_ms: parse(HEADER_TIMESTAMP),
            access_count: parse(HEADER_ACCESS_COUNT),
            is_game_content: headers
                .get(HEADER_GAME_CONTENT)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
        }
    }

    /// Age at `now_ms`; entries without a timestamp are treated as age zero.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        if self.stored_at_ms == 0 {
            0
        } else {
            now_ms.saturating_sub(self.stored_at_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/html; charset=utf-8");
        assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
        assert!(headers.contains("CONTENT-TYPE"));

        headers.append("Vary", "Accept");
        headers.append("vary", "Origin");
        assert_eq!(headers.get("vary"), Some("Accept, Origin"));
    }

    #[test]
    fn test_set_cookie_values_stay_separate() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT");
        headers.append("set-cookie", "b=2");

        let cookies: Vec<&str> = headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT", "b=2"]);
        assert_eq!(headers.iter().filter(|(name, _)| *name == "set-cookie").count(), 2);
        assert_eq!(headers.len(), 1);

        headers.insert("set-cookie", "c=3");
        assert_eq!(headers.get_all("set-cookie").count(), 1);
    }

    #[test]
    fn test_stamp_and_metadata() {
        let mut response = Response::ok("application/wasm", &b"\0asm"[..]);
        response.stamp_fresh(1_700_000_000_000, true);

        let meta = response.metadata();
        assert_eq!(meta.stored_at_ms, 1_700_000_000_000);
        assert_eq!(meta.access_count, 1);
        assert!(meta.is_game_content);

        response.set_access_count(7);
        assert_eq!(response.metadata().access_count, 7);
    }

    #[test]
    fn test_missing_metadata_is_zero() {
        let mut headers = Headers::new();
        headers.insert(HEADER_TIMESTAMP, "garbage");
        let meta = EntryMetadata::from_headers(&headers);
        assert_eq!(meta, EntryMetadata::default());
        assert_eq!(meta.age_ms(u64::MAX), 0);
    }

    #[test]
    fn test_stale_marker() {
        let mut response = Response::ok("text/css", "body{}");
        assert!(!response.is_stale());
        response.mark_stale();
        assert!(response.is_stale());
        assert!(response.is_success());
    }

    #[test]
    fn test_is_html() {
        assert!(Response::ok("Text/HTML", "").is_html());
        assert!(!Response::ok("application/javascript", "").is_html());
        assert!(!Response::new(200, Headers::new(), "").is_html());
    }
}
