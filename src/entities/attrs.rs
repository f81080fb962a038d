//! Frame property storage: string key → typed multi-value.
//!
//! Each key holds a list of values of one type (ints, floats or data blobs). Appending a
//! value of a different type to an existing key is refused. Frames carry one `Attrs` each;
//! it is cloned along with the frame on property copies and on copy-on-write.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Generic attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Data(Vec<u8>),
}

impl AttrValue {
    fn same_kind(&self, other: &AttrValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Attribute container. Keys are kept sorted so iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attrs {
    #[serde(default)]
    map: BTreeMap<String, Vec<AttrValue>>,
}

impl Attrs {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Replace all values of `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.map.insert(key.into(), vec![value]);
    }

    /// Append a value to `key`. Returns false (and changes nothing) on a type mismatch.
    pub fn append(&mut self, key: impl Into<String>, value: AttrValue) -> bool {
        let values = self.map.entry(key.into()).or_default();
        if let Some(first) = values.first() {
            if !first.same_kind(&value) {
                return false;
            }
        }
        values.push(value);
        true
    }

    /// First value of `key`.
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.map.get(key).and_then(|v| v.first())
    }

    /// All values of `key`.
    pub fn get_all(&self, key: &str) -> &[AttrValue] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_data(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(AttrValue::Data(v)) => Some(v),
            _ => None,
        }
    }

    /// Get int value with custom default
    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn set_int(&mut self, key: impl Into<String>, v: i64) {
        self.set(key, AttrValue::Int(v));
    }

    pub fn set_float(&mut self, key: impl Into<String>, v: f64) {
        self.set(key, AttrValue::Float(v));
    }

    pub fn set_data(&mut self, key: impl Into<String>, v: impl Into<Vec<u8>>) {
        self.set(key, AttrValue::Data(v.into()));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_append_accumulates() {
        let mut a = Attrs::new();
        a.set_int("_Index", 3);
        assert!(a.append("_Index", AttrValue::Int(4)));
        assert_eq!(a.get_all("_Index").len(), 2);
        assert_eq!(a.get_int("_Index"), Some(3));

        a.set_int("_Index", 9);
        assert_eq!(a.get_all("_Index"), &[AttrValue::Int(9)]);
    }

    #[test]
    fn append_refuses_mixed_types() {
        let mut a = Attrs::new();
        a.set_float("gain", 0.5);
        assert!(!a.append("gain", AttrValue::Int(1)));
        assert_eq!(a.get_all("gain").len(), 1);
        assert_eq!(a.get_int("gain"), None);
        assert_eq!(a.get_float("gain"), Some(0.5));
    }

    #[test]
    fn keys_are_sorted() {
        let mut a = Attrs::new();
        a.set_data("b", b"x".to_vec());
        a.set_int("a", 1);
        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(a.remove("a"));
        assert!(!a.contains("a"));
        assert_eq!(a.get_data("b"), Some(&b"x"[..]));
    }
}
