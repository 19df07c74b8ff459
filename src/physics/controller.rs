//! Target-velocity controller
//!
//! Converts a goal velocity (body frame) into the force and torque applied to a body.
//! The controller closes a fraction of the remaining error each step, scaled by the
//! responsiveness parameters, so actual velocity approaches the goal smoothly and
//! never overshoots it.

use serde::{Deserialize, Serialize};

use super::engine::Body;
use super::math::Vec3;

/// Default maximum speed per axis (units/s)
pub const DEFAULT_MAX_SPEED: Vec3 = Vec3 {
    x: 100.0,
    y: 50.0,
    z: 50.0,
};

/// Default turn rate (degrees/s)
pub const DEFAULT_TURN_RATE: f64 = 90.0;

/// Default responsiveness (fraction of velocity error closed per second)
pub const DEFAULT_RESPONSIVENESS: Vec3 = Vec3 {
    x: 2.0,
    y: 2.0,
    z: 2.0,
};

/// Controller tuning read from entity state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerParams {
    /// Maximum linear speed along each body axis
    pub max_speed: Vec3,
    /// Maximum angular speed around each body axis, in degrees per second
    pub turn_rate: f64,
    pub linear_responsiveness: Vec3,
    pub angular_responsiveness: Vec3,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            max_speed: DEFAULT_MAX_SPEED,
            turn_rate: DEFAULT_TURN_RATE,
            linear_responsiveness: DEFAULT_RESPONSIVENESS,
            angular_responsiveness: DEFAULT_RESPONSIVENESS,
        }
    }
}

impl ControllerParams {
    /// Turn rate limit per axis in radians per second
    pub fn angular_limit(&self) -> Vec3 {
        Vec3::splat(self.turn_rate.to_radians())
    }
}

/// Smoothing controller owned by a physics proxy
#[derive(Debug, Clone, Default)]
pub struct TargetVelocityController {
    params: ControllerParams,
    target_linear: Vec3,
    target_angular: Vec3,
}

impl TargetVelocityController {
    pub fn new(params: ControllerParams) -> Self {
        Self {
            params,
            target_linear: Vec3::ZERO,
            target_angular: Vec3::ZERO,
        }
    }

    pub fn params(&self) -> &ControllerParams {
        &self.params
    }

    pub fn set_params(&mut self, params: ControllerParams) {
        self.params = params;
        self.target_linear = self.target_linear.clamp_abs(params.max_speed);
        self.target_angular = self.target_angular.clamp_abs(params.angular_limit());
    }

    pub fn target_linear(&self) -> Vec3 {
        self.target_linear
    }

    pub fn target_angular(&self) -> Vec3 {
        self.target_angular
    }

    /// Set the linear goal, clamped to `[-maxSpeed, maxSpeed]`; returns the stored value
    pub fn set_target_linear(&mut self, target: Vec3) -> Vec3 {
        self.target_linear = target.clamp_abs(self.params.max_speed);
        self.target_linear
    }

    /// Set the angular goal (rad/s), clamped to the turn rate; returns the stored value
    pub fn set_target_angular(&mut self, target: Vec3) -> Vec3 {
        self.target_angular = target.clamp_abs(self.params.angular_limit());
        self.target_angular
    }

    /// Apply the force and torque that move `body` toward the goal over the next `dt` seconds
    pub fn drive(&self, body: &mut Body, dt: f64) {
        if !(dt.is_finite() && dt > 0.0) {
            return;
        }

        let desired_linear = body.orientation.rotate(self.target_linear);
        let linear_change = Self::velocity_change(
            body.linear_velocity,
            desired_linear,
            self.params.linear_responsiveness,
            dt,
        );
        body.apply_force(linear_change * (body.mass / dt));

        let desired_angular = body.orientation.rotate(self.target_angular);
        let angular_change = Self::velocity_change(
            body.angular_velocity,
            desired_angular,
            self.params.angular_responsiveness,
            dt,
        );
        body.apply_torque(angular_change * (1.0 / dt));
    }

    /// Fraction of the error to close this step, per axis, never more than all of it
    fn velocity_change(current: Vec3, desired: Vec3, responsiveness: Vec3, dt: f64) -> Vec3 {
        let gain = |r: f64| (r.abs() * dt).min(1.0);
        let error = desired - current;
        Vec3::new(
            error.x * gain(responsiveness.x),
            error.y * gain(responsiveness.y),
            error.z * gain(responsiveness.z),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::engine::{BodyDesc, PhysicsEngine};

    #[test]
    fn test_targets_are_clamped() {
        let mut controller = TargetVelocityController::new(ControllerParams {
            max_speed: Vec3::new(10.0, 5.0, 5.0),
            turn_rate: 180.0,
            ..ControllerParams::default()
        });

        let stored = controller.set_target_linear(Vec3::new(25.0, -9.0, 1.0));
        assert_eq!(stored, Vec3::new(10.0, -5.0, 1.0));

        let stored = controller.set_target_angular(Vec3::new(0.0, 10.0, -10.0));
        assert!((stored.y - std::f64::consts::PI).abs() < 1e-12);
        assert!((stored.z + std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn test_converges_without_overshoot() {
        let mut engine = PhysicsEngine::new(60);
        let id = engine.add_body(BodyDesc {
            mass: 3.0,
            ..BodyDesc::default()
        });

        let mut controller = TargetVelocityController::new(ControllerParams::default());
        controller.set_target_linear(Vec3::new(40.0, 0.0, 0.0));

        let dt = 1.0 / 60.0;
        let mut previous = 0.0;
        for _ in 0..600 {
            controller.drive(engine.body_mut(id).unwrap(), dt);
            engine.step(dt);
            let vx = engine.body(id).unwrap().linear_velocity.x;
            assert!(vx >= previous, "velocity should rise monotonically");
            assert!(vx <= 40.0 + 1e-9, "velocity must not overshoot the goal");
            previous = vx;
        }

        assert!((previous - 40.0).abs() < 0.1);
    }

    #[test]
    fn test_smoothing_is_gradual() {
        let mut engine = PhysicsEngine::new(60);
        let id = engine.add_body(BodyDesc::default());
        let mut controller = TargetVelocityController::new(ControllerParams::default());
        controller.set_target_linear(Vec3::new(50.0, 0.0, 0.0));

        controller.drive(engine.body_mut(id).unwrap(), 1.0 / 60.0);
        engine.step(1.0 / 60.0);

        let vx = engine.body(id).unwrap().linear_velocity.x;
        assert!(vx > 0.0 && vx < 50.0);
    }
}
