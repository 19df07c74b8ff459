//! Entity replication
//!
//! Throttled, dirty-field-tracking update messages:
//! - `accumulator` - per-entity pending set and throttle decisions
//! - payload builders for full and delta `update entity` messages

pub mod accumulator;

pub use accumulator::{PendingUpdate, Throttle, UpdateAccumulator};

use serde_json::{Map, Value};

use super::overlay::StateOverlay;

/// Delta payload: the id plus each dirty field's present value
///
/// Fields that are unset in both state layers are omitted.
pub fn delta_payload<'a, I>(id: &str, state: &StateOverlay, fields: I) -> Value
where
    I: IntoIterator<Item = &'a String>,
{
    let mut payload = Map::new();
    payload.insert("id".to_string(), Value::String(id.to_string()));
    for field in fields {
        if let Some(value) = state.get(field) {
            payload.insert(field.clone(), value.clone());
        }
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::template::{BehaviorKind, Template};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn test_delta_payload() {
        let template = Arc::new(Template::new(
            "Buoy",
            BehaviorKind::Base,
            json!({ "color": "red", "size": 3 }),
        ));
        let mut state = StateOverlay::new(template, Map::new());
        state.set("size", json!(4));

        let dirty: BTreeSet<String> = ["size", "color", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            delta_payload("e-1", &state, &dirty),
            json!({ "id": "e-1", "size": 4, "color": "red" })
        );
    }
}
