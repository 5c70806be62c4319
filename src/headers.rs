use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One or many values for a single header name.
///
/// Serialized as a bare string or an array of strings, matching the recorded
/// wire shape: a name only becomes an array once more than one value shares
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::One(value) => Some(value),
            Self::Many(values) => values.first().map(String::as_str),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::One(existing) => {
                *self = Self::Many(vec![std::mem::take(existing), value]);
            }
            Self::Many(values) => values.push(value),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::One(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

/// Case-insensitive header multimap.
///
/// Names are normalized to lower-case on insert and lookup. Iteration order
/// is the sorted name order, which keeps fingerprints and serialized
/// recordings deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap {
    entries: BTreeMap<String, HeaderValue>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing values for `name`.
    pub fn set(&mut self, name: &str, value: impl Into<HeaderValue>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Adds a value, keeping existing values for the same name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        match self.entries.get_mut(&name) {
            Some(existing) => existing.push(value.into()),
            None => {
                self.entries.insert(name, HeaderValue::One(value.into()));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    /// First value for `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::first)
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Expands the map into one `(name, value)` pair per value occurrence,
    /// in sorted name order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            match value {
                HeaderValue::One(value) => pairs.push((name.clone(), value.clone())),
                HeaderValue::Many(values) => {
                    pairs.extend(values.iter().map(|value| (name.clone(), value.clone())));
                }
            }
        }
        pairs
    }

    /// Rebuilds a map from stored name/value pairs.
    ///
    /// Duplicates collapse into [`HeaderValue::Many`] only when more than one
    /// value shares a name; a single occurrence stays a bare string.
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<String>,
    {
        let mut map = Self::new();
        for (name, value) in pairs {
            map.append(name.as_ref(), value);
        }
        map
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::{HeaderMap, HeaderValue};

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "application/json");

        assert_eq!(headers.first("content-type"), Some("application/json"));
        assert_eq!(headers.first("CONTENT-TYPE"), Some("application/json"));
        assert!(headers.contains("Content-type"));
    }

    #[test]
    fn set_replaces_and_append_accumulates() {
        let mut headers = HeaderMap::new();
        headers.set("Accept", "text/html");
        headers.set("accept", "application/json");
        assert_eq!(
            headers.get("accept"),
            Some(&HeaderValue::One("application/json".to_owned()))
        );

        headers.append("set-cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        assert_eq!(
            headers.get("set-cookie"),
            Some(&HeaderValue::Many(vec!["a=1".to_owned(), "b=2".to_owned()]))
        );
    }

    #[test]
    fn from_pairs_collapses_only_repeated_names() {
        let headers = HeaderMap::from_pairs([
            ("Content-Type", "text/plain"),
            ("Set-Cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);

        assert_eq!(
            headers.get("content-type"),
            Some(&HeaderValue::One("text/plain".to_owned()))
        );
        assert_eq!(
            headers.get("set-cookie"),
            Some(&HeaderValue::Many(vec!["a=1".to_owned(), "b=2".to_owned()]))
        );
    }

    #[test]
    fn pairs_round_trip_in_sorted_order() {
        let mut headers = HeaderMap::new();
        headers.set("b-header", "2");
        headers.set("a-header", "1");
        headers.append("c-header", "3");
        headers.append("c-header", "4");

        let pairs = headers.to_pairs();
        assert_eq!(
            pairs,
            vec![
                ("a-header".to_owned(), "1".to_owned()),
                ("b-header".to_owned(), "2".to_owned()),
                ("c-header".to_owned(), "3".to_owned()),
                ("c-header".to_owned(), "4".to_owned()),
            ]
        );
        assert_eq!(HeaderMap::from_pairs(pairs), headers);
    }

    #[test]
    fn serializes_values_as_string_or_array() {
        let headers = HeaderMap::from_pairs([
            ("content-type", "text/plain"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);

        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content-type": "text/plain",
                "set-cookie": ["a=1", "b=2"],
            })
        );

        let parsed: HeaderMap = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, headers);
    }
}
