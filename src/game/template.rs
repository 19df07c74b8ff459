//! Entity templates
//!
//! A template is the immutable, shared definition a group of entities derives its
//! default state and capabilities from.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capability set an entity is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorKind {
    /// Identity, state and event/request plumbing only
    Base,
    /// Base plus a physics body
    Physical,
    /// Physical plus hit points, stats and powers
    Actor,
    /// Actor plus flight input handlers
    Ship,
}

impl BehaviorKind {
    pub fn name(&self) -> &'static str {
        match self {
            BehaviorKind::Base => "base",
            BehaviorKind::Physical => "physical",
            BehaviorKind::Actor => "actor",
            BehaviorKind::Ship => "ship",
        }
    }

    pub fn is_physical(&self) -> bool {
        !matches!(self, BehaviorKind::Base)
    }

    pub fn is_actor(&self) -> bool {
        matches!(self, BehaviorKind::Actor | BehaviorKind::Ship)
    }

    pub fn is_ship(&self) -> bool {
        matches!(self, BehaviorKind::Ship)
    }
}

impl std::fmt::Display for BehaviorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable entity definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Unique key
    pub name: String,
    pub behavior: BehaviorKind,
    /// Defaults for every field an instance does not override
    #[serde(default)]
    pub base_state: Map<String, Value>,
}

impl Template {
    pub fn new(name: impl Into<String>, behavior: BehaviorKind, base_state: Value) -> Self {
        let base_state = match base_state {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            behavior,
            base_state,
        }
    }
}
