//! Producer-side messages and their property encoding.
//!
//! Properties travel as a single string: every entry is written as
//! `name 0x01 value 0x02`.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Separates a property name from its value.
pub const NAME_VALUE_SEPARATOR: char = '\u{1}';

/// Terminates each property entry.
pub const PROPERTY_SEPARATOR: char = '\u{2}';

/// Property holding the message keys.
pub const PROPERTY_KEYS: &str = "KEYS";

/// Property holding the message tags.
pub const PROPERTY_TAGS: &str = "TAGS";

/// A message a producer sends to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            properties: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_keys(self, keys: impl Into<String>) -> Self {
        self.with_property(PROPERTY_KEYS, keys)
    }

    pub fn with_tags(self, tags: impl Into<String>) -> Self {
        self.with_property(PROPERTY_TAGS, tags)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn keys(&self) -> Option<&str> {
        self.property(PROPERTY_KEYS)
    }

    pub fn tags(&self) -> Option<&str> {
        self.property(PROPERTY_TAGS)
    }
}

/// Encodes properties into their wire string.
pub fn properties_to_string(properties: &BTreeMap<String, String>) -> String {
    let mut encoded = String::new();
    for (name, value) in properties {
        encoded.push_str(name);
        encoded.push(NAME_VALUE_SEPARATOR);
        encoded.push_str(value);
        encoded.push(PROPERTY_SEPARATOR);
    }
    encoded
}

/// Decodes a wire string back into properties.
///
/// Entries without exactly one name/value separator are skipped.
pub fn string_to_properties(encoded: &str) -> BTreeMap<String, String> {
    encoded
        .split(PROPERTY_SEPARATOR)
        .filter_map(|entry| {
            let mut parts = entry.split(NAME_VALUE_SEPARATOR);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(value), None) => Some((name.to_string(), value.to_string())),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_to_string() {
        let message = Message::new("orders", "x").with_keys("k1").with_tags("tagA");
        assert_eq!(
            properties_to_string(&message.properties),
            "KEYS\u{1}k1\u{2}TAGS\u{1}tagA\u{2}"
        );
        assert_eq!(properties_to_string(&BTreeMap::new()), "");
    }

    #[test]
    fn test_string_to_properties() {
        let decoded = string_to_properties("KEYS\u{1}k1\u{2}TAGS\u{1}tagA\u{2}");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["KEYS"], "k1");
        assert_eq!(decoded["TAGS"], "tagA");
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let decoded = string_to_properties("a\u{1}1\u{2}broken\u{2}b\u{1}2\u{1}3\u{2}c\u{1}\u{2}");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["a"], "1");
        assert_eq!(decoded["c"], "");
        assert!(string_to_properties("").is_empty());
    }

    #[test]
    fn test_accessors() {
        let message = Message::new("orders", "x").with_property("region", "eu");
        assert_eq!(message.property("region"), Some("eu"));
        assert_eq!(message.keys(), None);
        assert_eq!(message.with_tags("t").tags(), Some("t"));
    }
}
