//! Capability state store boundary.

use crate::convert::TypedValue;
use crate::error::StoreError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Where accepted capability updates are written.
///
/// Owned by the hosting application. A failed write is logged by the adapter
/// and never stops frame processing.
pub trait CapabilityStore: Send + Sync + 'static {
    fn set_value(&self, field: &str, value: &TypedValue) -> Result<(), StoreError>;
}

/// In-memory store, optionally limited to a set of capabilities.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, TypedValue>>,
    writes: RwLock<Vec<(String, TypedValue)>>,
    allowed: Option<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects writes to capabilities not in `fields`.
    pub fn with_capabilities<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(fields.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn get(&self, field: &str) -> Option<TypedValue> {
        self.values.read().get(field).cloned()
    }

    /// Every accepted write in order.
    pub fn history(&self) -> Vec<(String, TypedValue)> {
        self.writes.read().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.read().len()
    }
}

impl CapabilityStore for MemoryStore {
    fn set_value(&self, field: &str, value: &TypedValue) -> Result<(), StoreError> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(field) {
                return Err(StoreError::UnknownCapability(field.to_string()));
            }
        }
        self.values.write().insert(field.to_string(), value.clone());
        self.writes.write().push((field.to_string(), value.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_values_and_history() {
        let store = MemoryStore::new();
        store.set_value("onoff", &TypedValue::Bool(true)).unwrap();
        store.set_value("onoff", &TypedValue::Bool(false)).unwrap();
        assert_eq!(store.get("onoff"), Some(TypedValue::Bool(false)));
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.history()[0], ("onoff".to_string(), TypedValue::Bool(true)));
    }

    #[test]
    fn rejects_unknown_capability() {
        let store = MemoryStore::with_capabilities(["measure_battery"]);
        assert_eq!(
            store.set_value("onoff", &TypedValue::Bool(true)),
            Err(StoreError::UnknownCapability("onoff".into()))
        );
        assert!(store.set_value("measure_battery", &TypedValue::Integer(80)).is_ok());
    }
}
