//! Request-scoped key/value metadata carried by a [`CallContext`](crate::CallContext).

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Keys ending in this suffix carry binary values, stored base64 encoded.
pub const BINARY_SUFFIX: &str = "-bin";

/// Call metadata. Keys are case-insensitive and stored lower-cased.
///
/// Cloning is cheap; the map is copied on the first write after a clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Arc<BTreeMap<String, String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `key` and returns the stored value.
    ///
    /// Values of binary keys are returned as stored, still encoded.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key.to_ascii_lowercase().as_str())
            .map(String::as_str)
    }

    /// Looks up a binary key and decodes its value.
    pub fn get_bin(&self, key: &str) -> Option<Vec<u8>> {
        let key = key.to_ascii_lowercase();
        if !key.ends_with(BINARY_SUFFIX) {
            return None;
        }
        let value = self.entries.get(&key)?;
        STANDARD.decode(value).ok()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert(&mut self, key: &str, value: impl AsRef<[u8]>) {
        let (key, value) = encode(key, value.as_ref());
        Arc::make_mut(&mut self.entries).insert(key, value);
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        Arc::make_mut(&mut self.entries).remove(&key.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn encode(key: &str, value: &[u8]) -> (String, String) {
    let key = key.to_ascii_lowercase();
    let value = if key.ends_with(BINARY_SUFFIX) {
        STANDARD.encode(value)
    } else {
        String::from_utf8_lossy(value).into_owned()
    };
    (key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_folded() {
        let mut md = Metadata::new();
        md.insert("X-Request-ID", "abc");

        assert_eq!(md.get("x-request-id"), Some("abc"));
        assert_eq!(md.get("X-REQUEST-ID"), Some("abc"));
        assert_eq!(md.iter().next(), Some(("x-request-id", "abc")));
    }

    #[test]
    fn binary_values_are_base64_encoded() {
        let mut md = Metadata::new();
        md.insert("Trace-Bin", [0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(md.get("trace-bin"), Some("3q2+7w=="));
        assert_eq!(md.get_bin("trace-bin"), Some(vec![0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(md.get_bin("missing-bin"), None);
    }

    #[test]
    fn clones_do_not_share_writes() {
        let mut a = Metadata::new();
        a.insert("k", "1");
        let mut b = a.clone();
        b.insert("k", "2");

        assert_eq!(a.get("k"), Some("1"));
        assert_eq!(b.get("k"), Some("2"));
        assert_eq!(b.remove("K"), Some("2".to_string()));
        assert!(b.is_empty());
    }
}
