//! Ordered name/value metadata accompanying the start or end of a stream.
//!
//! Lookup is case-insensitive and multi-value semantics are preserved: the
//! same key may appear more than once and `get` returns the first value while
//! `get_all` returns every value in insertion order. Unlike an HTTP header
//! map, reserved pseudo-keys such as `:path` and `:status` are storable,
//! since the transport envelope carries them in-band.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Code, Status};

/// The full method path of a call, `/Service/Method`.
pub const PATH: &str = ":path";
/// The HTTP status pseudo-header mirrored by HTTP/2 transports.
pub const STATUS: &str = ":status";
/// The negotiated payload encoding, `application/grpc+{codec}`.
pub const CONTENT_TYPE: &str = "content-type";
/// Final status code of a call, decimal ASCII.
pub const GRPC_STATUS: &str = "grpc-status";
/// Human-readable companion to [`GRPC_STATUS`], percent-encoded.
pub const GRPC_MESSAGE: &str = "grpc-message";
/// Call deadline in the gRPC ASCII form (value plus unit suffix).
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
/// Message compression scheme. Always `identity` for this crate.
pub const GRPC_ENCODING: &str = "grpc-encoding";

/// A set of metadata entries.
///
/// # Examples
///
/// ```
/// # use weft::metadata::MetadataMap;
/// let mut map = MetadataMap::new();
///
/// map.insert("x-host", "example.com");
/// map.append("x-number", "123");
/// map.append("X-Number", "456");
///
/// assert_eq!(map.get("x-host"), Some("example.com"));
/// assert_eq!(map.get_all("x-number").count(), 2);
/// ```
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataMap {
    entries: Vec<(String, String)>,
}

impl MetadataMap {
    /// Create an empty map.
    pub fn new() -> Self {
        MetadataMap::default()
    }

    /// Create an empty map with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        MetadataMap {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Number of entries, counting repeated keys once per value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if at least one value is associated with `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// First value associated with `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Every value associated with `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Associate `value` with `key`, replacing any previous values.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = lower(key.into());
        self.entries.retain(|(name, _)| *name != key);
        self.entries.push((key, value.into()));
    }

    /// Associate an additional `value` with `key`, keeping previous values.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((lower(key.into()), value.into()));
    }

    /// Remove every value associated with `key`, returning the first.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain(|(name, value)| {
            if name.eq_ignore_ascii_case(key) {
                if removed.is_none() {
                    removed = Some(value.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    /// Append every entry of `other` to this map.
    pub fn merge(&mut self, other: MetadataMap) {
        self.entries.extend(other.entries);
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn lower(key: String) -> String {
    if key.bytes().any(|b| b.is_ascii_uppercase()) {
        key.to_ascii_lowercase()
    } else {
        key
    }
}

impl std::fmt::Debug for MetadataMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

impl FromIterator<(String, String)> for MetadataMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut map = MetadataMap::new();
        for (key, value) in iter {
            map.append(key, value);
        }
        map
    }
}

/// Encode a duration in the `grpc-timeout` ASCII form.
///
/// The finest unit that fits in eight decimal digits is chosen, as the gRPC
/// HTTP/2 mapping requires.
pub fn fmt_grpc_timeout(duration: Duration) -> String {
    const MAX: u128 = 99_999_999;

    let nanos = duration.as_nanos();
    if nanos <= MAX {
        format!("{}n", nanos)
    } else if nanos / 1_000 <= MAX {
        format!("{}u", nanos / 1_000)
    } else if nanos / 1_000_000 <= MAX {
        format!("{}m", nanos / 1_000_000)
    } else {
        format!("{}S", duration.as_secs().min(MAX as u64))
    }
}

/// Parse a `grpc-timeout` value back into a duration.
pub fn parse_grpc_timeout(value: &str) -> Result<Duration, Status> {
    let invalid = || Status::new(Code::InvalidArgument, format!("invalid grpc-timeout: {value:?}"));

    if value.len() < 2 || value.len() > 9 {
        return Err(invalid());
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "H" => Ok(Duration::from_secs(amount * 3600)),
        "M" => Ok(Duration::from_secs(amount * 60)),
        "S" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_millis(amount)),
        "u" => Ok(Duration::from_micros(amount)),
        "n" => Ok(Duration::from_nanos(amount)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut map = MetadataMap::new();
        map.insert("X-Host", "example.com");

        assert_eq!(map.get("x-host"), Some("example.com"));
        assert_eq!(map.get("X-HOST"), Some("example.com"));
        assert!(map.contains_key("x-Host"));
    }

    #[test]
    fn append_preserves_multi_value_order() {
        let mut map = MetadataMap::new();
        map.append("k", "1");
        map.append("K", "2");
        map.append("k", "3");

        assert_eq!(map.get("k"), Some("1"));
        let all: Vec<_> = map.get_all("k").collect();
        assert_eq!(all, ["1", "2", "3"]);
    }

    #[test]
    fn insert_replaces_all_values() {
        let mut map = MetadataMap::new();
        map.append("k", "1");
        map.append("k", "2");
        map.insert("k", "3");

        assert_eq!(map.get_all("k").count(), 1);
        assert_eq!(map.get("k"), Some("3"));
    }

    #[test]
    fn pseudo_keys_are_storable() {
        let mut map = MetadataMap::new();
        map.insert(PATH, "/Echo/echo");
        assert_eq!(map.get(":path"), Some("/Echo/echo"));
    }

    #[test]
    fn grpc_timeout_round_trip() {
        for duration in [
            Duration::from_nanos(1),
            Duration::from_micros(250),
            Duration::from_millis(100),
            Duration::from_secs(5),
            Duration::from_secs(3600),
        ] {
            let encoded = fmt_grpc_timeout(duration);
            assert_eq!(parse_grpc_timeout(&encoded).unwrap(), duration);
        }
    }

    #[test]
    fn grpc_timeout_rejects_garbage() {
        for bad in ["", "5", "x", "12", "99999999999S", "5q"] {
            assert!(parse_grpc_timeout(bad).is_err(), "{bad:?} parsed");
        }
    }
}
