//! Records: ordered name/value maps.
//!
//! We build and throw away lots of these (every create input, every fetched row), so instead of a hashmap we use a
//! `SmallVec` of entries and linear lookups.  Rows are narrow enough that this wins.
use smallvec::SmallVec;

use crate::value::Value;

#[derive(Clone, Debug, PartialEq)]
struct RecordEntry {
    name: String,
    value: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    entries: SmallVec<[RecordEntry; 16]>,
}

impl Record {
    pub fn new() -> Self {
        Default::default()
    }

    /// Builder-style [Record::insert].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set `name` to `value`, replacing any previous value but keeping its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(e) => Some(std::mem::replace(&mut e.value, value)),
            None => {
                self.entries.push(RecordEntry { name, value });
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(idx).value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut ret = Record::new();
        for (k, v) in iter {
            ret.insert(k, v);
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_position() {
        let mut r = Record::new().with("a", 1).with("b", "two");
        assert_eq!(r.insert("a", 3), Some(Value::Integer(1)));
        assert_eq!(r.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(r.get("a"), Some(&Value::Integer(3)));
        assert_eq!(r.remove("b"), Some(Value::from("two")));
        assert_eq!(r.len(), 1);
    }
}
