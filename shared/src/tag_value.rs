//! This module provides [TagValue], the closed set of value shapes an embedded image tag may take, along with the
//! normalization rules applied before a tag is persisted.
//!
//! Raw tag values arrive in whatever form the container decoder produced (rationals, byte strings, nested
//! sequences).  [TagValue::normalize] folds all of those into values that survive a round trip through JSON.

use {
    serde_derive::{Deserialize, Serialize},
    serde_json::{Map, Number, Value as JsonValue},
    std::collections::BTreeMap,
};

/// Flat mapping of tag name to normalized value, as stored in a photo record
pub type Metadata = BTreeMap<String, TagValue>;

/// A single tag value
///
/// `Rational` and `Bytes` only appear before normalization; [TagValue::normalize] replaces them with `Float`,
/// `Absent`, or `Text`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum TagValue {
    /// Explicitly absent, e.g. a rational with a zero denominator
    Absent,
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Rational { numerator: i64, denominator: i64 },
    Sequence(Vec<TagValue>),
    Mapping(BTreeMap<String, TagValue>),
    /// Anything the decoder could not give a structure to; passed through unchanged
    Raw(JsonValue),
}

impl TagValue {
    /// Recursively normalize this value.
    ///
    /// Rationals become floats, or [TagValue::Absent] when they have no defined value (zero denominator).  Byte
    /// strings are decoded as UTF-8 with invalid sequences replaced.  Sequences and mappings are normalized
    /// element-wise, and everything else is returned unchanged.
    pub fn normalize(self) -> Self {
        match self {
            TagValue::Rational {
                numerator,
                denominator,
            } => {
                if denominator == 0 {
                    TagValue::Absent
                } else {
                    let value = numerator as f64 / denominator as f64;

                    if value.is_nan() {
                        TagValue::Absent
                    } else {
                        TagValue::Float(value)
                    }
                }
            }

            TagValue::Bytes(bytes) => TagValue::Text(String::from_utf8_lossy(&bytes).into_owned()),

            TagValue::Sequence(items) => {
                TagValue::Sequence(items.into_iter().map(TagValue::normalize).collect())
            }

            TagValue::Mapping(map) => TagValue::Mapping(
                map.into_iter()
                    .map(|(key, value)| (key, value.normalize()))
                    .collect(),
            ),

            other => other,
        }
    }

    /// Collapse a sequence of sequences into a single sequence.
    ///
    /// Only exactly one level of nesting is flattened: if any inner sequence itself contains a sequence, or the
    /// outer sequence mixes scalars and sequences, the value is returned as is.
    pub fn flatten(self) -> Self {
        match self {
            TagValue::Sequence(items)
                if !items.is_empty()
                    && items.iter().all(|item| match item {
                        TagValue::Sequence(inner) => {
                            !inner.iter().any(|v| matches!(v, TagValue::Sequence(_)))
                        }
                        _ => false,
                    }) =>
            {
                TagValue::Sequence(
                    items
                        .into_iter()
                        .flat_map(|item| match item {
                            TagValue::Sequence(inner) => inner,
                            other => vec![other],
                        })
                        .collect(),
                )
            }

            other => other,
        }
    }

    /// Return the text content of this value, if it is text
    pub fn as_text(&self) -> Option<&str> {
        if let TagValue::Text(text) = self {
            Some(text)
        } else {
            None
        }
    }
}

impl From<TagValue> for JsonValue {
    fn from(value: TagValue) -> Self {
        match value {
            TagValue::Absent => JsonValue::Null,
            TagValue::Integer(n) => JsonValue::Number(n.into()),
            TagValue::Float(f) => Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            TagValue::Text(text) => JsonValue::String(text),
            bytes @ TagValue::Bytes(_) => bytes.normalize().into(),
            rational @ TagValue::Rational { .. } => rational.normalize().into(),
            TagValue::Sequence(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            TagValue::Mapping(map) => JsonValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, JsonValue::from(value)))
                    .collect::<Map<_, _>>(),
            ),
            TagValue::Raw(value) => value,
        }
    }
}

impl From<JsonValue> for TagValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => TagValue::Absent,
            JsonValue::Number(n) => {
                if let Some(n) = n.as_i64() {
                    TagValue::Integer(n)
                } else if let Some(f) = n.as_f64() {
                    TagValue::Float(f)
                } else {
                    TagValue::Raw(JsonValue::Number(n))
                }
            }
            JsonValue::String(text) => TagValue::Text(text),
            JsonValue::Array(items) => {
                TagValue::Sequence(items.into_iter().map(TagValue::from).collect())
            }
            JsonValue::Object(map) => TagValue::Mapping(
                map.into_iter()
                    .map(|(key, value)| (key, TagValue::from(value)))
                    .collect(),
            ),
            other => TagValue::Raw(other),
        }
    }
}
