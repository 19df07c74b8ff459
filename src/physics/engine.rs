//! Rigid-body physics engine
//!
//! A deliberately small integrator: semi-implicit Euler for linear motion, unit inertia
//! for rotation, quaternion orientation. Forces and torques accumulate between steps and
//! are cleared after each one.

use std::collections::HashMap;

use tracing::warn;

use super::math::{Quat, Vec3};

/// Handle of a body inside the engine
pub type BodyId = u64;

/// Initial parameters for a new body
#[derive(Debug, Clone, Copy)]
pub struct BodyDesc {
    pub mass: f64,
    pub position: Vec3,
    pub orientation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Default for BodyDesc {
    fn default() -> Self {
        Self {
            mass: 1.0,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }
}

/// A simulated rigid body
#[derive(Debug, Clone)]
pub struct Body {
    pub mass: f64,
    pub position: Vec3,
    pub orientation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    force: Vec3,
    torque: Vec3,
}

impl Body {
    fn from_desc(desc: BodyDesc) -> Self {
        Self {
            mass: if desc.mass > 0.0 { desc.mass } else { 1.0 },
            position: desc.position,
            orientation: desc.orientation.normalize(),
            linear_velocity: desc.linear_velocity,
            angular_velocity: desc.angular_velocity,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
        }
    }

    /// Accumulate a force (world frame) for the next step
    pub fn apply_force(&mut self, force: Vec3) {
        self.force += force;
    }

    /// Accumulate a torque (world frame) for the next step
    pub fn apply_torque(&mut self, torque: Vec3) {
        self.torque += torque;
    }

    fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.orientation.is_finite()
            && self.linear_velocity.is_finite()
            && self.angular_velocity.is_finite()
    }

    fn integrate(&mut self, dt: f64) {
        self.linear_velocity += self.force * (dt / self.mass);
        self.angular_velocity += self.torque * dt;
        self.position += self.linear_velocity * dt;
        self.orientation = self.orientation.integrate(self.angular_velocity, dt);
        self.force = Vec3::ZERO;
        self.torque = Vec3::ZERO;
    }
}

/// The shared physics world
#[derive(Debug)]
pub struct PhysicsEngine {
    bodies: HashMap<BodyId, Body>,
    next_id: BodyId,
    simulation_rate: u32,
    /// Last known finite state of every body, restored when a step diverges
    last_good: HashMap<BodyId, Body>,
}

impl PhysicsEngine {
    /// Create an engine simulating at `simulation_rate` steps per second
    pub fn new(simulation_rate: u32) -> Self {
        Self {
            bodies: HashMap::new(),
            next_id: 1,
            simulation_rate: simulation_rate.max(1),
            last_good: HashMap::new(),
        }
    }

    pub fn simulation_rate(&self) -> u32 {
        self.simulation_rate
    }

    pub fn add_body(&mut self, desc: BodyDesc) -> BodyId {
        let id = self.next_id;
        self.next_id += 1;
        let body = Body::from_desc(desc);
        self.last_good.insert(id, body.clone());
        self.bodies.insert(id, body);
        id
    }

    pub fn remove_body(&mut self, id: BodyId) -> Option<Body> {
        self.last_good.remove(&id);
        self.bodies.remove(&id)
    }

    pub fn body(&self, id: BodyId) -> Option<&Body> {
        self.bodies.get(&id)
    }

    pub fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        self.bodies.get_mut(&id)
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    /// Advance every body by `dt` seconds
    ///
    /// Returns the ids of bodies whose state went non-finite; those are rolled back to
    /// their state before the step with velocities zeroed.
    pub fn step(&mut self, dt: f64) -> Vec<BodyId> {
        let mut reset = Vec::new();
        if !(dt.is_finite() && dt > 0.0) {
            return reset;
        }

        for (id, body) in self.bodies.iter_mut() {
            body.integrate(dt);

            if body.is_finite() {
                self.last_good.insert(*id, body.clone());
            } else {
                warn!(body_id = *id, "Body diverged, restoring last finite state");
                let mut restored = self
                    .last_good
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Body::from_desc(BodyDesc::default()));
                restored.linear_velocity = Vec3::ZERO;
                restored.angular_velocity = Vec3::ZERO;
                *body = restored;
                reset.push(*id);
            }
        }

        reset
    }
}
