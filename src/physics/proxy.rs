//! Physics proxy
//!
//! Binds a physical entity's kinematic state to a body in the shared engine:
//! - pull: copies logical state (including externally written teleports) into the body
//! - drive: feeds the target-velocity controller
//! - push: copies the simulated result back into logical state and flags replication

use std::sync::Weak;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use super::controller::{ControllerParams, TargetVelocityController};
use super::engine::{Body, BodyDesc, BodyId, PhysicsEngine};
use super::math::{Quat, Vec3};
use crate::error::EntityError;
use crate::game::entity::{Entity, EntityId};
use crate::game::overlay::StateOverlay;

/// Kinematic and tuning field names in entity state
pub mod fields {
    pub const POSITION: &str = "position";
    pub const ORIENTATION: &str = "orientation";
    pub const LINEAR_VELOCITY: &str = "linearVelocity";
    pub const ANGULAR_VELOCITY: &str = "angularVelocity";
    pub const TARGET_LINEAR_VELOCITY: &str = "targetLinearVelocity";
    pub const TARGET_ANGULAR_VELOCITY: &str = "targetAngularVelocity";
    pub const LINEAR_RESPONSIVENESS: &str = "linearResponsiveness";
    pub const ANGULAR_RESPONSIVENESS: &str = "angularResponsiveness";
    pub const MAX_SPEED: &str = "maxSpeed";
    pub const TURN_RATE: &str = "turnRate";
    pub const MASS: &str = "mass";

    /// Fields rewritten by the push phase
    pub const KINEMATIC: [&str; 4] = [POSITION, ORIENTATION, LINEAR_VELOCITY, ANGULAR_VELOCITY];
}

/// Changes smaller than this are not replicated
const PUSH_EPSILON: f64 = 1e-6;

fn read_field<T: DeserializeOwned>(
    state: &StateOverlay,
    key: &str,
) -> Result<Option<T>, EntityError> {
    state
        .get_as(key)
        .map_err(|e| EntityError::Validation(format!("field '{}': {}", key, e)))
}

/// Controller tuning, defaulting absent fields
fn read_params(state: &StateOverlay) -> Result<ControllerParams, EntityError> {
    let defaults = ControllerParams::default();
    Ok(ControllerParams {
        max_speed: read_field(state, fields::MAX_SPEED)?.unwrap_or(defaults.max_speed),
        turn_rate: read_field(state, fields::TURN_RATE)?.unwrap_or(defaults.turn_rate),
        linear_responsiveness: read_field(state, fields::LINEAR_RESPONSIVENESS)?
            .unwrap_or(defaults.linear_responsiveness),
        angular_responsiveness: read_field(state, fields::ANGULAR_RESPONSIVENESS)?
            .unwrap_or(defaults.angular_responsiveness),
    })
}

/// Position, orientation and velocities of one body
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Kinematics {
    pub position: Vec3,
    pub orientation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Kinematics {
    /// Read from entity state, defaulting absent fields
    pub fn read(state: &StateOverlay) -> Result<Self, EntityError> {
        Ok(Self {
            position: read_field(state, fields::POSITION)?.unwrap_or_default(),
            orientation: read_field(state, fields::ORIENTATION)?.unwrap_or_default(),
            linear_velocity: read_field(state, fields::LINEAR_VELOCITY)?.unwrap_or_default(),
            angular_velocity: read_field(state, fields::ANGULAR_VELOCITY)?.unwrap_or_default(),
        })
    }

    fn from_body(body: &Body) -> Self {
        Self {
            position: body.position,
            orientation: body.orientation,
            linear_velocity: body.linear_velocity,
            angular_velocity: body.angular_velocity,
        }
    }

    fn apply_to(&self, body: &mut Body) {
        body.position = self.position;
        body.orientation = self.orientation.normalize();
        body.linear_velocity = self.linear_velocity;
        body.angular_velocity = self.angular_velocity;
    }

    fn write(&self, state: &mut StateOverlay) -> Result<(), EntityError> {
        let to_value = |key: &str, v: serde_json::Result<serde_json::Value>| {
            v.map_err(|e| EntityError::Validation(format!("field '{}': {}", key, e)))
        };
        state.set(
            fields::POSITION,
            to_value(fields::POSITION, serde_json::to_value(self.position))?,
        );
        state.set(
            fields::ORIENTATION,
            to_value(fields::ORIENTATION, serde_json::to_value(self.orientation))?,
        );
        state.set(
            fields::LINEAR_VELOCITY,
            to_value(fields::LINEAR_VELOCITY, serde_json::to_value(self.linear_velocity))?,
        );
        state.set(
            fields::ANGULAR_VELOCITY,
            to_value(fields::ANGULAR_VELOCITY, serde_json::to_value(self.angular_velocity))?,
        );
        Ok(())
    }

    fn approx_eq(&self, other: &Kinematics) -> bool {
        self.position.approx_eq(other.position, PUSH_EPSILON)
            && self.orientation.approx_eq(other.orientation, PUSH_EPSILON)
            && self.linear_velocity.approx_eq(other.linear_velocity, PUSH_EPSILON)
            && self.angular_velocity.approx_eq(other.angular_velocity, PUSH_EPSILON)
    }
}

/// Everything needed to attach an entity to the engine, read once from its state
#[derive(Debug, Clone)]
pub struct PhysicalSetup {
    pub body: BodyDesc,
    pub params: ControllerParams,
    pub target_linear: Vec3,
    pub target_angular: Vec3,
}

impl PhysicalSetup {
    pub fn read(state: &StateOverlay) -> Result<Self, EntityError> {
        let kinematics = Kinematics::read(state)?;
        let params = read_params(state)?;

        Ok(Self {
            body: BodyDesc {
                mass: read_field(state, fields::MASS)?.unwrap_or(1.0),
                position: kinematics.position,
                orientation: kinematics.orientation,
                linear_velocity: kinematics.linear_velocity,
                angular_velocity: kinematics.angular_velocity,
            },
            params,
            target_linear: read_field(state, fields::TARGET_LINEAR_VELOCITY)?.unwrap_or_default(),
            target_angular: read_field(state, fields::TARGET_ANGULAR_VELOCITY)?
                .unwrap_or_default(),
        })
    }
}

/// Adapter between one entity and its body
#[derive(Debug)]
pub struct PhysicsProxy {
    entity_id: EntityId,
    entity: Weak<Entity>,
    body: BodyId,
    controller: Mutex<TargetVelocityController>,
    last_pushed: Mutex<Option<Kinematics>>,
}

impl PhysicsProxy {
    pub(super) fn new(
        entity_id: EntityId,
        entity: Weak<Entity>,
        body: BodyId,
        setup: &PhysicalSetup,
    ) -> Self {
        let mut controller = TargetVelocityController::new(setup.params);
        controller.set_target_linear(setup.target_linear);
        controller.set_target_angular(setup.target_angular);

        Self {
            entity_id,
            entity,
            body,
            controller: Mutex::new(controller),
            last_pushed: Mutex::new(None),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn body_id(&self) -> BodyId {
        self.body
    }

    /// Whether the owning entity still exists
    pub fn is_bound(&self) -> bool {
        self.entity.strong_count() > 0
    }

    pub fn target_linear_velocity(&self) -> Vec3 {
        self.controller.lock().target_linear()
    }

    pub fn target_angular_velocity(&self) -> Vec3 {
        self.controller.lock().target_angular()
    }

    pub fn controller_params(&self) -> ControllerParams {
        *self.controller.lock().params()
    }

    /// Set the linear goal; the clamped value is written to entity state and returned
    pub fn set_target_linear_velocity(
        &self,
        entity: &Entity,
        target: Vec3,
    ) -> Result<Vec3, EntityError> {
        let stored = self.controller.lock().set_target_linear(target);
        entity.set_value(fields::TARGET_LINEAR_VELOCITY, &stored)?;
        Ok(stored)
    }

    /// Set the angular goal (rad/s); the clamped value is written to entity state and returned
    pub fn set_target_angular_velocity(
        &self,
        entity: &Entity,
        target: Vec3,
    ) -> Result<Vec3, EntityError> {
        let stored = self.controller.lock().set_target_angular(target);
        entity.set_value(fields::TARGET_ANGULAR_VELOCITY, &stored)?;
        Ok(stored)
    }

    /// Pull phase: copy logical state into the body and apply controller output
    ///
    /// Tuning fields are re-read every pull, so runtime changes take effect on the next tick.
    pub fn sync_to_body(&self, engine: &mut PhysicsEngine, dt: f64) -> Result<(), EntityError> {
        let entity = self
            .entity
            .upgrade()
            .ok_or_else(|| EntityError::NotFound(self.entity_id.clone()))?;

        let (kinematics, params, target_linear, target_angular) = entity.with_state(|state| {
            Ok::<_, EntityError>((
                Kinematics::read(state)?,
                read_params(state)?,
                read_field::<Vec3>(state, fields::TARGET_LINEAR_VELOCITY)?,
                read_field::<Vec3>(state, fields::TARGET_ANGULAR_VELOCITY)?,
            ))
        })?;

        let body = engine
            .body_mut(self.body)
            .ok_or_else(|| EntityError::NotFound(format!("body {}", self.body)))?;
        kinematics.apply_to(body);

        let mut controller = self.controller.lock();
        if *controller.params() != params {
            controller.set_params(params);
        }
        if let Some(target) = target_linear {
            controller.set_target_linear(target);
        }
        if let Some(target) = target_angular {
            controller.set_target_angular(target);
        }
        controller.drive(body, dt);

        Ok(())
    }

    /// Read the body's simulated state
    pub fn snapshot(&self, engine: &PhysicsEngine) -> Option<Kinematics> {
        engine.body(self.body).map(Kinematics::from_body)
    }

    /// Push phase: write the simulated state back and flag it for replication and save
    pub fn sync_to_model(&self, kinematics: Kinematics) -> Result<(), EntityError> {
        let entity = self
            .entity
            .upgrade()
            .ok_or_else(|| EntityError::NotFound(self.entity_id.clone()))?;

        {
            let mut last = self.last_pushed.lock();
            if last.map_or(false, |prev| prev.approx_eq(&kinematics)) {
                return Ok(());
            }
            *last = Some(kinematics);
        }

        entity.with_state_mut(|state| kinematics.write(state))?;
        entity.update(Some(&fields::KINEMATIC));
        Ok(())
    }
}
