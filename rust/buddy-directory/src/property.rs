//! Buddy property sets and their wire encoding.
//!
//! A property set is an unordered name → typed value mapping. A missing name
//! means "unknown", which is distinct from an empty string value.

use crate::stanza::{Element, NS_OLPC_BUDDY_PROPS};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Str(_) => "str",
            PropertyValue::Int(_) => "int",
            PropertyValue::UInt(_) => "uint",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Parses a value from its wire `type` attribute and text content.
    pub fn parse(type_name: &str, text: &str) -> Option<Self> {
        match type_name {
            "str" => Some(PropertyValue::Str(text.to_string())),
            "int" | "int64" => text.trim().parse().ok().map(PropertyValue::Int),
            "uint" | "uint64" => text.trim().parse().ok().map(PropertyValue::UInt),
            "bool" => match text.trim() {
                "1" | "true" => Some(PropertyValue::Bool(true)),
                "0" | "false" => Some(PropertyValue::Bool(false)),
                _ => None,
            },
            "bytes" => STANDARD.decode(text.trim()).ok().map(PropertyValue::Bytes),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            PropertyValue::Str(s) => s.clone(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::UInt(u) => u.to_string(),
            PropertyValue::Bool(b) => String::from(if *b { "1" } else { "0" }),
            PropertyValue::Bytes(b) => STANDARD.encode(b),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<u64> for PropertyValue {
    fn from(u: u64) -> Self {
        PropertyValue::UInt(u)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySet(BTreeMap<String, PropertyValue>);

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    /// Overwrites the keys present in `other`, leaving the rest untouched.
    pub fn update_from(&mut self, other: &PropertySet) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Reads the `property` children of a `properties` element.
    ///
    /// Entries without a name, with an unknown type or with a value that does
    /// not parse are skipped.
    pub fn from_element(properties: &Element) -> Self {
        let mut set = PropertySet::new();
        for property in properties.children_named("property") {
            let Some(name) = property.attr("name") else {
                tracing::debug!("skipping property without name");
                continue;
            };
            let type_name = property.attr("type").unwrap_or("str");
            match PropertyValue::parse(type_name, &property.text) {
                Some(value) => set.insert(name, value),
                None => tracing::debug!(name, type_name, "skipping unparsable property"),
            }
        }
        set
    }

    pub fn to_element(&self) -> Element {
        let mut properties = Element::new("properties").with_ns(NS_OLPC_BUDDY_PROPS);
        for (name, value) in &self.0 {
            properties.push(
                Element::new("property")
                    .with_attr("type", value.type_name())
                    .with_attr("name", name.as_str())
                    .with_text(value.to_wire()),
            );
        }
        properties
    }
}

impl FromIterator<(String, PropertyValue)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
