//! Actor capability
//!
//! Hit points, combat stats, tier and powers. `ActorView` is the typed surface
//! over the actor's fields in entity state:
//! - `hitpoints` / `maxHitpoints` (`0 <= hitpoints <= maxHitpoints`)
//! - `stats` (`{hit, crit, block, dodge}`)
//! - `tier` (scales power output, default 1)
//! - `powers` (`name -> {coolDownEnds}`)

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::Capability;
use crate::error::EntityError;
use crate::game::combat::CombatStats;
use crate::game::entity::Entity;
use crate::game::overlay::StateOverlay;
use crate::game::powers::{Power, PowerRegistry};

pub mod fields {
    pub const HITPOINTS: &str = "hitpoints";
    pub const MAX_HITPOINTS: &str = "maxHitpoints";
    pub const STATS: &str = "stats";
    pub const TIER: &str = "tier";
    pub const POWERS: &str = "powers";
    pub const COOLDOWN_ENDS: &str = "coolDownEnds";
}

/// Entity event that fires a power
pub const ACTIVATE_POWER: &str = "activate power";

const DEFAULT_MAX_HITPOINTS: f64 = 100.0;

#[derive(Debug, Deserialize)]
struct ActivatePower {
    power: String,
    #[serde(default)]
    target: Option<String>,
}

/// Resolved power modules of one actor
pub struct Actor {
    powers: BTreeMap<String, Arc<dyn Power>>,
}

impl Actor {
    /// Resolve every power declared in `state.powers`
    pub fn resolve(state: &StateOverlay, registry: &PowerRegistry) -> Result<Self, EntityError> {
        let declared: Map<String, Value> = state
            .get_as(fields::POWERS)
            .map_err(|e| EntityError::Validation(format!("field 'powers': {}", e)))?
            .unwrap_or_default();

        let powers = declared
            .keys()
            .map(|name| {
                registry
                    .get(name)
                    .map(|power| (name.clone(), power))
                    .ok_or_else(|| EntityError::UnknownPower(name.clone()))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self { powers })
    }

    pub fn power(&self, name: &str) -> Option<Arc<dyn Power>> {
        self.powers.get(name).cloned()
    }

    pub fn power_names(&self) -> impl Iterator<Item = &str> {
        self.powers.keys().map(String::as_str)
    }
}

impl Capability for Actor {
    fn name(&self) -> &'static str {
        "actor"
    }

    fn install(&self, entity: &Entity) -> Result<(), EntityError> {
        entity.register_event_handler(ACTIVATE_POWER, |entity: Arc<Entity>, payload: Value| async move {
            let request: ActivatePower = serde_json::from_value(payload)
                .map_err(|e| EntityError::Validation(format!("{}: {}", ACTIVATE_POWER, e)))?;

            let power = entity
                .actor()
                .and_then(|actor| actor.power(&request.power))
                .ok_or_else(|| EntityError::UnknownPower(request.power.clone()))?;
            let target = match request.target {
                Some(id) => Some(entity.lookup(&id).ok_or(EntityError::NotFound(id))?),
                None => None,
            };

            let activation = power.activate(&entity, target).await?;
            debug!(
                entity_id = %entity.id(),
                power = %request.power,
                activation = ?activation,
                "Power activated"
            );
            Ok(())
        });
        Ok(())
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("powers", &self.powers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Typed access to an actor entity's combat state
#[derive(Debug, Clone, Copy)]
pub struct ActorView<'a> {
    entity: &'a Entity,
    actor: &'a Actor,
}

impl<'a> ActorView<'a> {
    pub(crate) fn new(entity: &'a Entity, actor: &'a Actor) -> Self {
        Self { entity, actor }
    }

    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    pub fn actor(&self) -> &'a Actor {
        self.actor
    }

    pub fn max_hitpoints(&self) -> f64 {
        self.entity.with_state(max_hitpoints)
    }

    pub fn hitpoints(&self) -> f64 {
        self.entity.with_state(hitpoints)
    }

    pub fn stats(&self) -> CombatStats {
        self.entity
            .get_as(fields::STATS)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn tier(&self) -> u32 {
        self.entity.get_as(fields::TIER).ok().flatten().unwrap_or(1)
    }

    pub fn is_dead(&self) -> bool {
        self.hitpoints() <= 0.0
    }

    /// Lose hit points, never below zero; returns the new value
    pub fn damage(&self, amount: f64) -> f64 {
        self.adjust_hitpoints(-amount.max(0.0))
    }

    /// Gain hit points, never above the maximum; returns the new value
    pub fn heal(&self, amount: f64) -> f64 {
        self.adjust_hitpoints(amount.max(0.0))
    }

    fn adjust_hitpoints(&self, delta: f64) -> f64 {
        let value = self.entity.with_state_mut(|state| {
            let max = max_hitpoints(state);
            let value = (hitpoints(state) + delta).clamp(0.0, max);
            state.set(fields::HITPOINTS, Value::from(value));
            value
        });
        self.entity.update(Some(&[fields::HITPOINTS]));
        value
    }

    /// Milliseconds left on a power's cooldown at `now`
    pub fn cooldown_remaining(&self, power: &str, now: i64) -> u64 {
        let ends = self.entity.with_state(|state| {
            state
                .get(fields::POWERS)
                .and_then(|powers| powers.get(power))
                .and_then(|entry| entry.get(fields::COOLDOWN_ENDS))
                .and_then(Value::as_i64)
                .unwrap_or(0)
        });
        u64::try_from(ends.saturating_sub(now)).unwrap_or(0)
    }

    /// Record when a power becomes usable again
    pub fn start_cooldown(&self, power: &str, ends: i64) -> Result<(), EntityError> {
        self.entity.with_state_mut(|state| {
            let mut powers = match state.get(fields::POWERS) {
                Some(Value::Object(powers)) => powers.clone(),
                _ => Map::new(),
            };
            let entry = powers
                .entry(power.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match entry {
                Value::Object(entry) => {
                    entry.insert(fields::COOLDOWN_ENDS.to_string(), Value::from(ends));
                }
                _ => {
                    return Err(EntityError::Validation(format!(
                        "power entry '{}' is not an object",
                        power
                    )))
                }
            }
            state.set(fields::POWERS, Value::Object(powers));
            Ok(())
        })?;
        self.entity.update(Some(&[fields::POWERS]));
        Ok(())
    }
}

fn max_hitpoints(state: &StateOverlay) -> f64 {
    state
        .get(fields::MAX_HITPOINTS)
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_MAX_HITPOINTS)
}

fn hitpoints(state: &StateOverlay) -> f64 {
    state
        .get(fields::HITPOINTS)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| max_hitpoints(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::state_from_value;
    use crate::game::testing::harness;
    use crate::game::powers::BASIC_ATTACK;
    use serde_json::json;

    #[tokio::test]
    async fn test_unknown_power_fails_construction() {
        let h = harness();
        let err = h
            .manager
            .create(
                "Drone",
                None,
                state_from_value(json!({ "powers": { "orbital_strike": {} } })),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EntityError::CreateFailed { ref source, .. }
                if matches!(**source, EntityError::UnknownPower(ref p) if p == "orbital_strike")
        ));
        assert_eq!(h.manager.count(), 0);
    }

    #[tokio::test]
    async fn test_hitpoints_clamp() {
        let h = harness();
        let drone = h
            .manager
            .create("Drone", None, state_from_value(json!({ "hitpoints": 30 })))
            .await
            .unwrap();
        let actor = drone.require_actor().unwrap();

        assert_eq!(actor.max_hitpoints(), 50.0);
        assert_eq!(actor.damage(45.0), 0.0);
        assert!(actor.is_dead());
        assert_eq!(actor.heal(500.0), 50.0);
        assert_eq!(actor.damage(-10.0), 50.0);
        assert_eq!(drone.get("hitpoints"), Some(json!(50.0)));
    }

    #[tokio::test]
    async fn test_cooldown_bookkeeping() {
        let h = harness();
        let drone = h.manager.create("Drone", None, Map::new()).await.unwrap();
        let actor = drone.require_actor().unwrap();

        assert_eq!(actor.cooldown_remaining(BASIC_ATTACK, 1_000), 0);
        actor.start_cooldown(BASIC_ATTACK, 2_500).unwrap();
        assert_eq!(actor.cooldown_remaining(BASIC_ATTACK, 1_000), 1_500);
        assert_eq!(actor.cooldown_remaining(BASIC_ATTACK, 3_000), 0);

        // Other declared powers keep their template entries
        let powers = drone.get("powers").unwrap();
        assert!(powers.get("basic_heal").is_some());
    }

    #[tokio::test]
    async fn test_activate_power_event() {
        let h = harness();
        let attacker = h.manager.create("Drone", None, Map::new()).await.unwrap();
        let defender = h.manager.create("Drone", None, Map::new()).await.unwrap();

        attacker
            .on_event(
                ACTIVATE_POWER,
                json!({ "power": "basic_attack", "target": defender.id() }),
            )
            .await;
        assert_eq!(defender.require_actor().unwrap().hitpoints(), 40.0);

        // Unknown power and target are logged and dropped
        attacker
            .on_event(ACTIVATE_POWER, json!({ "power": "orbital_strike" }))
            .await;
        attacker
            .on_event(
                ACTIVATE_POWER,
                json!({ "power": "basic_heal", "target": "nobody" }),
            )
            .await;
        assert_eq!(attacker.require_actor().unwrap().hitpoints(), 50.0);
    }

    #[tokio::test]
    async fn test_non_actor_has_no_view() {
        let h = harness();
        let buoy = h.manager.create("Buoy", None, Map::new()).await.unwrap();
        assert!(buoy.as_actor().is_none());
        assert!(buoy.require_actor().is_err());
    }
}
