//! Connector Framework operation types
//!
//! Types exchanged by a page fetch: attribute sets, typed attribute values,
//! requested attribute descriptors and the page response.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A flat object produced by a connector: attribute name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet {
    /// Map of attribute name to attribute value(s).
    #[serde(flatten)]
    attributes: HashMap<String, AttributeValue>,
}

impl AttributeSet {
    /// Create a new empty attribute set.
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Set an attribute using builder pattern.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Get a single-valued string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_string())
    }

    /// Get a multi-valued string attribute.
    pub fn get_strings(&self, name: &str) -> Option<Vec<&str>> {
        self.get(name).map(|v| v.as_strings())
    }

    /// Check if an attribute exists.
    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Get the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Iterate over all attributes.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes.iter()
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self {
            attributes: iter.into_iter().collect(),
        }
    }
}

/// A JSON-native attribute value, single or multi-valued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// No value (null).
    Null,
    /// A single string value.
    String(String),
    /// A single integer value.
    Integer(i64),
    /// A single boolean value.
    Boolean(bool),
    /// A single floating-point value.
    Float(f64),
    /// Multiple values.
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Get as a string if this is a single string value.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as strings (works for both single and multi-valued).
    pub fn as_strings(&self) -> Vec<&str> {
        match self {
            AttributeValue::String(s) => vec![s.as_str()],
            AttributeValue::Array(arr) => arr.iter().filter_map(|v| v.as_string()).collect(),
            _ => vec![],
        }
    }

    /// Get as an integer if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as a boolean if this is a boolean value.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as an array if this is multi-valued.
    pub fn as_array(&self) -> Option<&Vec<AttributeValue>> {
        match self {
            AttributeValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(vec: Vec<T>) -> Self {
        AttributeValue::Array(vec.into_iter().map(Into::into).collect())
    }
}

/// Scalar type a raw attribute value is coerced into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    #[default]
    String,
    Bool,
    Int64,
    Double,
    Duration,
    DateTime,
}

/// An attribute requested by the caller for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeConfig {
    /// Attribute name on the datasource side.
    pub external_id: String,

    /// Declared scalar type.
    #[serde(default)]
    pub attribute_type: AttributeType,

    /// Whether the attribute is multi-valued.
    #[serde(default)]
    pub list: bool,

    /// Whether the attribute uniquely identifies the object.
    #[serde(default)]
    pub unique_id: bool,
}

impl AttributeConfig {
    /// Single-valued attribute of the given type.
    pub fn new(external_id: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            external_id: external_id.into(),
            attribute_type,
            list: false,
            unique_id: false,
        }
    }

    /// Mark the attribute as multi-valued.
    pub fn as_list(mut self) -> Self {
        self.list = true;
        self
    }

    /// Mark the attribute as the unique id.
    pub fn as_unique_id(mut self) -> Self {
        self.unique_id = true;
        self
    }
}

/// Result of a page fetch.
///
/// A non-2xx `status_code` means the datasource rejected the request; the
/// caller applies its own retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    pub status_code: u16,

    /// Value of a `Retry-After` hint, if the datasource sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,

    #[serde(default)]
    pub objects: Vec<AttributeSet>,

    /// Opaque cursor for the next page; absent once the sync is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl PageResponse {
    /// Successful page.
    pub fn ok(objects: Vec<AttributeSet>, next_cursor: Option<String>) -> Self {
        Self {
            status_code: 200,
            retry_after: None,
            objects,
            next_cursor,
        }
    }

    /// Status-coded rejection with no objects.
    pub fn rejected(status_code: u16) -> Self {
        Self {
            status_code,
            retry_after: None,
            objects: Vec::new(),
            next_cursor: None,
        }
    }

    /// Whether the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Get the number of objects in this page.
    pub fn count(&self) -> usize {
        self.objects.len()
    }
}
