//! Ship capability: flight input handlers
//!
//! Each input event carries `{value}` and adjusts the physics proxy's targets.
//! Angular targets are in radians per second around the body axes:
//! heading turns about y, pitch about z, roll about x. Throttle adds to the
//! forward (x) linear target. The proxy clamps every target before storing it.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::Capability;
use crate::error::EntityError;
use crate::game::entity::Entity;
use crate::physics::proxy::{fields, PhysicsProxy};
use crate::physics::Vec3;

pub mod events {
    pub const HEADING: &str = "heading";
    pub const PITCH: &str = "pitch";
    pub const ROLL: &str = "roll";
    pub const THROTTLE: &str = "throttle";
    pub const ALL_STOP: &str = "all-stop";
}

#[derive(Debug, Deserialize)]
struct Input {
    #[serde(default)]
    value: f64,
}

fn input(name: &str, payload: Value) -> Result<f64, EntityError> {
    if payload.is_null() {
        return Ok(0.0);
    }
    let input: Input = serde_json::from_value(payload)
        .map_err(|e| EntityError::Validation(format!("{}: {}", name, e)))?;
    if !input.value.is_finite() {
        return Err(EntityError::Validation(format!("{}: value is not finite", name)));
    }
    Ok(input.value)
}

fn proxy(entity: &Entity) -> Result<Arc<PhysicsProxy>, EntityError> {
    entity
        .physical()
        .ok_or_else(|| EntityError::MissingCapability(entity.id().to_string(), "physical"))?
        .require_proxy(entity)
}

fn set_angular(entity: &Entity, f: impl FnOnce(&mut Vec3)) -> Result<Vec3, EntityError> {
    let proxy = proxy(entity)?;
    let mut target = proxy.target_angular_velocity();
    f(&mut target);
    let stored = proxy.set_target_angular_velocity(entity, target)?;
    entity.update(Some(&[fields::TARGET_ANGULAR_VELOCITY]));
    Ok(stored)
}

fn set_linear(entity: &Entity, f: impl FnOnce(&mut Vec3)) -> Result<Vec3, EntityError> {
    let proxy = proxy(entity)?;
    let mut target = proxy.target_linear_velocity();
    f(&mut target);
    let stored = proxy.set_target_linear_velocity(entity, target)?;
    entity.update(Some(&[fields::TARGET_LINEAR_VELOCITY]));
    Ok(stored)
}

/// Stop all motion goals; the controller brings the ship to rest
pub fn all_stop(entity: &Entity) -> Result<(), EntityError> {
    let proxy = proxy(entity)?;
    proxy.set_target_linear_velocity(entity, Vec3::ZERO)?;
    proxy.set_target_angular_velocity(entity, Vec3::ZERO)?;
    entity.update(Some(&[
        fields::TARGET_LINEAR_VELOCITY,
        fields::TARGET_ANGULAR_VELOCITY,
    ]));
    Ok(())
}

#[derive(Debug, Default)]
pub struct Ship;

impl Ship {
    pub fn new() -> Self {
        Self
    }
}

impl Capability for Ship {
    fn name(&self) -> &'static str {
        "ship"
    }

    fn install(&self, entity: &Entity) -> Result<(), EntityError> {
        entity.register_event_handler(events::HEADING, |entity: Arc<Entity>, payload| async move {
            let value = input(events::HEADING, payload)?;
            let stored = set_angular(&entity, |t| t.y = value)?;
            debug!(entity_id = %entity.id(), target = ?stored, "Heading input");
            Ok(())
        });

        entity.register_event_handler(events::PITCH, |entity: Arc<Entity>, payload| async move {
            let value = input(events::PITCH, payload)?;
            set_angular(&entity, |t| t.z = value)?;
            Ok(())
        });

        entity.register_event_handler(events::ROLL, |entity: Arc<Entity>, payload| async move {
            let value = input(events::ROLL, payload)?;
            set_angular(&entity, |t| t.x = value)?;
            Ok(())
        });

        entity.register_event_handler(events::THROTTLE, |entity: Arc<Entity>, payload| async move {
            let value = input(events::THROTTLE, payload)?;
            let stored = set_linear(&entity, |t| t.x += value)?;
            debug!(entity_id = %entity.id(), target = ?stored, "Throttle input");
            Ok(())
        });

        entity.register_event_handler(events::ALL_STOP, |entity: Arc<Entity>, _| async move {
            all_stop(&entity)
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::harness;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_ship_installs_every_layer() {
        let h = harness();
        let ship = h.manager.create("Ares", None, Map::new()).await.unwrap();

        assert!(ship.physical().is_some());
        assert!(ship.as_actor().is_some());
        assert!(ship.has_event_handler(events::HEADING));
        assert!(ship.has_event_handler(events::ALL_STOP));
        assert!(ship.has_event_handler(crate::game::capability::actor::ACTIVATE_POWER));
        assert_eq!(h.physics.proxy_count(), 1);
    }

    #[tokio::test]
    async fn test_heading_is_clamped_to_turn_rate() {
        let h = harness();
        let ship = h.manager.create("Ares", None, Map::new()).await.unwrap();

        ship.on_event(events::HEADING, json!({ "value": 0.5 })).await;
        let target: Vec3 = ship
            .get_as(fields::TARGET_ANGULAR_VELOCITY)
            .unwrap()
            .unwrap();
        assert_eq!(target, Vec3::new(0.0, 0.5, 0.0));

        // turnRate is 90 degrees per second
        ship.on_event(events::PITCH, json!({ "value": 10.0 })).await;
        let target: Vec3 = ship
            .get_as(fields::TARGET_ANGULAR_VELOCITY)
            .unwrap()
            .unwrap();
        assert!((target.z - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert_eq!(target.y, 0.5);
        assert!(ship.is_unsaved());
    }

    #[tokio::test]
    async fn test_throttle_accumulates_and_all_stop_clears() {
        let h = harness();
        let ship = h.manager.create("Ares", None, Map::new()).await.unwrap();

        ship.on_event(events::THROTTLE, json!({ "value": 30.0 })).await;
        ship.on_event(events::THROTTLE, json!({ "value": 30.0 })).await;
        let proxy = ship.physical().unwrap().proxy().unwrap();
        assert_eq!(proxy.target_linear_velocity(), Vec3::new(60.0, 0.0, 0.0));

        // maxSpeed.x is 100
        ship.on_event(events::THROTTLE, json!({ "value": 500.0 })).await;
        assert_eq!(proxy.target_linear_velocity(), Vec3::new(100.0, 0.0, 0.0));

        ship.on_event(events::ROLL, json!({ "value": -0.25 })).await;
        ship.on_event(events::ALL_STOP, Value::Null).await;
        assert_eq!(proxy.target_linear_velocity(), Vec3::ZERO);
        assert_eq!(proxy.target_angular_velocity(), Vec3::ZERO);
    }

    #[tokio::test]
    async fn test_unload_detaches_body() {
        let h = harness();
        let ship = h.manager.create("Ares", None, Map::new()).await.unwrap();
        assert_eq!(h.physics.body_count(), 1);

        h.manager.unload(ship.id()).await;
        assert_eq!(h.physics.proxy_count(), 0);
        assert_eq!(h.physics.body_count(), 0);
        assert!(ship.physical().unwrap().proxy().is_none());
        assert!(!ship.has_event_handler(events::HEADING));
    }
}
