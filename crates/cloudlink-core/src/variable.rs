//! Cloud variables and the session-local store.

use cloudlink_protocol::{normalize_name, packet::display_name, VariableEntry, MAX_VALUE_LENGTH};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Why a value was refused before sending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Cloud variable value cannot be empty")]
    Empty,

    /// Only ASCII digits are allowed.
    #[error("Cloud variables can only be set to a combination of numbers, got {0:?}")]
    NotNumeric(String),

    #[error("Cloud variable values must be at most {max} characters, got {0}", max = MAX_VALUE_LENGTH)]
    TooLong(usize),
}

/// Check that `value` is a non-empty run of at most 256 ASCII digits.
///
/// # Errors
///
/// Returns the first rule the value breaks.
pub fn validate_value(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty);
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::NotNumeric(value.to_string()));
    }
    let length = value.chars().count();
    if length > MAX_VALUE_LENGTH {
        return Err(ValidationError::TooLong(length));
    }
    Ok(())
}

/// A named cloud variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudVariable {
    /// Canonical (prefixed) name.
    pub name: String,
    pub value: String,
}

impl CloudVariable {
    #[must_use]
    pub fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: normalize_name(name),
            value: value.into(),
        }
    }

    /// Name without the cloud prefix.
    #[must_use]
    pub fn display_name(&self) -> &str {
        display_name(&self.name)
    }
}

/// Outcome of applying a server `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    Updated,
    /// The name was unknown and a new entry was added.
    Created,
}

/// Variables by canonical name, iterated in insertion order.
#[derive(Debug, Default, Clone)]
pub struct VariableStore {
    values: HashMap<String, String>,
    order: Vec<String>,
}

impl VariableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a handshake reply; later duplicates win.
    #[must_use]
    pub fn from_entries(entries: Vec<VariableEntry>) -> Self {
        let mut store = Self::new();
        for entry in entries {
            store.upsert(&entry.name, entry.value);
        }
        store
    }

    /// Look up a value; `name` may be bare or prefixed.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&normalize_name(name)).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&normalize_name(name))
    }

    /// Insert or overwrite. Returns `true` if the name already existed.
    pub fn upsert(&mut self, name: &str, value: impl Into<String>) -> bool {
        let name = normalize_name(name);
        let existed = self.values.contains_key(&name);
        if !existed {
            self.order.push(name.clone());
        }
        self.values.insert(name, value.into());
        existed
    }

    /// Apply a value pushed by the server.
    pub fn apply_remote(&mut self, name: &str, value: impl Into<String>) -> RemoteUpdate {
        if self.upsert(name, value) {
            RemoteUpdate::Updated
        } else {
            RemoteUpdate::Created
        }
    }

    /// Remove a variable. Returns `true` if it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = normalize_name(name);
        if self.values.remove(&name).is_none() {
            return false;
        }
        self.order.retain(|n| n != &name);
        true
    }

    /// Replace the whole store with a fresh handshake reply.
    pub fn replace(&mut self, fresh: VariableStore) {
        *self = fresh;
    }

    /// Overlay a fresh handshake reply; server values win, local-only
    /// variables are kept.
    pub fn merge(&mut self, fresh: VariableStore) {
        for variable in fresh.snapshot() {
            self.upsert(&variable.name, variable.value);
        }
    }

    /// Copy of every variable, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CloudVariable> {
        self.order
            .iter()
            .filter_map(|name| {
                self.values.get(name).map(|value| CloudVariable {
                    name: name.clone(),
                    value: value.clone(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_value() {
        assert!(validate_value("42").is_ok());
        assert!(validate_value("0").is_ok());
        assert!(validate_value(&"1".repeat(256)).is_ok());

        assert_eq!(validate_value(""), Err(ValidationError::Empty));
        assert_eq!(
            validate_value("12a"),
            Err(ValidationError::NotNumeric("12a".into()))
        );
        assert!(matches!(validate_value("-5"), Err(ValidationError::NotNumeric(_))));
        assert!(matches!(validate_value("1.5"), Err(ValidationError::NotNumeric(_))));
        assert!(matches!(validate_value("٣"), Err(ValidationError::NotNumeric(_))));
        assert_eq!(
            validate_value(&"1".repeat(257)),
            Err(ValidationError::TooLong(257))
        );
    }

    #[test]
    fn test_store_normalizes_names() {
        let mut store = VariableStore::new();
        assert!(!store.upsert("score", "1"));
        assert!(store.upsert("☁ score", "2"));

        assert_eq!(store.get("score"), Some("2"));
        assert_eq!(store.get("☁ score"), Some("2"));
        assert!(store.contains("score"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_keeps_insertion_order() {
        let mut store = VariableStore::new();
        store.upsert("b", "1");
        store.upsert("a", "2");
        store.upsert("c", "3");
        store.upsert("b", "4");
        store.remove("a");

        let names: Vec<_> = store.snapshot().iter().map(|v| v.display_name().to_string()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(store.get("b"), Some("4"));
    }

    #[test]
    fn test_apply_remote() {
        let mut store = VariableStore::new();
        assert_eq!(store.apply_remote("☁ y", "7"), RemoteUpdate::Created);
        assert_eq!(store.apply_remote("☁ y", "8"), RemoteUpdate::Updated);
        assert_eq!(store.get("y"), Some("8"));
    }

    #[test]
    fn test_replace_discards_local_state() {
        let mut store = VariableStore::new();
        store.upsert("local", "1");
        store.upsert("shared", "1");

        let fresh = VariableStore::from_entries(vec![VariableEntry {
            name: "☁ shared".into(),
            value: "9".into(),
        }]);
        store.replace(fresh);

        assert!(!store.contains("local"));
        assert_eq!(store.get("shared"), Some("9"));
    }

    #[test]
    fn test_merge_keeps_local_state() {
        let mut store = VariableStore::new();
        store.upsert("local", "1");
        store.upsert("shared", "1");

        let fresh = VariableStore::from_entries(vec![
            VariableEntry {
                name: "☁ shared".into(),
                value: "9".into(),
            },
            VariableEntry {
                name: "☁ remote".into(),
                value: "3".into(),
            },
        ]);
        store.merge(fresh);

        assert_eq!(store.get("local"), Some("1"));
        assert_eq!(store.get("shared"), Some("9"));
        assert_eq!(store.get("remote"), Some("3"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_remove_missing() {
        let mut store = VariableStore::new();
        assert!(!store.remove("ghost"));
        assert!(store.is_empty());
    }
}
