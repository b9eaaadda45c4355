//! Decoded records.
use std::collections::{BTreeMap, btree_map};

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringArray(Vec<String>),
    RecordArray(Vec<Record>),
    /// A value selected from a union of types.
    Union(Box<Value>),
}

/// A mapping from field name to value.
///
/// A record is created by a decoder, mapped once, then dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Value {
    /// Returns the value wrapped by any number of unions.
    pub fn effective(&self) -> &Value {
        let mut value = self;
        while let Value::Union(inner) = value {
            value = inner;
        }
        value
    }

    pub fn into_effective(self) -> Value {
        let mut value = self;
        while let Value::Union(inner) = value {
            value = *inner;
        }
        value
    }

    pub fn is_null(&self) -> bool {
        matches!(self.effective(), Value::Null)
    }

    /// A short name of the value's variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self.effective() {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::StringArray(_) => "string array",
            Value::RecordArray(_) => "record array",
            Value::Union(_) => "union",
        }
    }
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, returning the record.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.into(), value.into())
    }

    /// Returns the raw value of the field, union wrappers included.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns the effective value of the field. Missing fields are null.
    pub fn value(&self, name: &str) -> &Value {
        self.fields
            .get(name)
            .map(Value::effective)
            .unwrap_or(&Value::Null)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.fields.iter()
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::StringArray(value)
    }
}

impl From<Vec<&str>> for Value {
    fn from(value: Vec<&str>) -> Self {
        Value::StringArray(value.into_iter().map(String::from).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_unwrapped() {
        let value = Value::Union(Box::new(Value::Union(Box::new(Value::Int(3)))));
        assert_eq!(value.effective(), &Value::Int(3));
        assert_eq!(value.kind(), "int");
        assert_eq!(value.clone().into_effective(), Value::Int(3));
        assert!(Value::Union(Box::new(Value::Null)).is_null());
    }

    #[test]
    fn test_missing_field_is_null() {
        let record = Record::new()
            .with("a", "x")
            .with("b", Value::Union(Box::new(Value::Bool(true))));
        assert_eq!(record.value("a"), &Value::String("x".to_string()));
        assert_eq!(record.value("b"), &Value::Bool(true));
        assert_eq!(record.value("missing"), &Value::Null);
        assert!(record.get("missing").is_none());
    }
}
