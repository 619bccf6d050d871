//! Bracket-notation query string encoding
//!
//! Serializes nested parameter records the way browser form helpers do:
//! `{municipio: {id: 1}}` becomes `municipio%5Bid%5D=1`.

use url::form_urlencoded::byte_serialize;

/// A value in a query parameter tree
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    /// Plain value, encoded as-is
    Scalar(String),
    /// Nested record, keys rendered as `parent[child]`
    Map(Vec<(String, QueryValue)>),
    /// Sequence, rendered as repeated `parent[]`
    List(Vec<QueryValue>),
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Scalar(value)
    }
}

impl From<u64> for QueryValue {
    fn from(value: u64) -> Self {
        QueryValue::Scalar(value.to_string())
    }
}

/// Ordered top-level query parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    entries: Vec<(String, QueryValue)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter, keeping insertion order
    pub fn push(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten the tree into `(key, value)` pairs with bracketed keys
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            flatten(key, value, &mut out);
        }
        out
    }

    /// Percent-encode and join all pairs with `&`
    pub fn encode(&self) -> String {
        self.pairs()
            .iter()
            .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

fn flatten(prefix: &str, value: &QueryValue, out: &mut Vec<(String, String)>) {
    match value {
        QueryValue::Scalar(v) => out.push((prefix.to_string(), v.clone())),
        QueryValue::Map(fields) => {
            for (key, nested) in fields {
                flatten(&format!("{prefix}[{key}]"), nested, out);
            }
        }
        QueryValue::List(items) => {
            for item in items {
                flatten(&format!("{prefix}[]"), item, out);
            }
        }
    }
}

/// Form-urlencoded byte serialization of a single key or value
pub fn encode_component(input: &str) -> String {
    byte_serialize(input.as_bytes()).collect()
}
