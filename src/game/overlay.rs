//! Layered entity state
//!
//! Reads check the instance's own fields first and fall back to the template's
//! `baseState`; writes always land in the instance layer. The template map is shared,
//! never copied.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::template::Template;

/// Two-level state view: instance overrides over template defaults
#[derive(Debug, Clone)]
pub struct StateOverlay {
    template: Arc<Template>,
    overrides: Map<String, Value>,
}

impl StateOverlay {
    pub fn new(template: Arc<Template>, overrides: Map<String, Value>) -> Self {
        Self {
            template,
            overrides,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.overrides
            .get(key)
            .or_else(|| self.template.base_state.get(key))
    }

    /// Typed read; `Ok(None)` when the field is unset in both layers
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
        self.get(key)
            .map(|v| T::deserialize(v))
            .transpose()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Whether the instance layer holds its own value for `key`
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.overrides.insert(key.into(), value);
    }

    pub fn set_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Drop the instance value so reads fall back to the template again
    pub fn reset(&mut self, key: &str) -> Option<Value> {
        self.overrides.remove(key)
    }

    /// Every field name visible through the overlay
    pub fn keys(&self) -> BTreeSet<&str> {
        self.template
            .base_state
            .keys()
            .chain(self.overrides.keys())
            .map(String::as_str)
            .collect()
    }

    /// Instance layer only, as persisted
    pub fn overrides(&self) -> &Map<String, Value> {
        &self.overrides
    }

    /// Flattened view of both layers
    pub fn merged(&self) -> Map<String, Value> {
        let mut merged = self.template.base_state.clone();
        for (key, value) in &self.overrides {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
