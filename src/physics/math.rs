//! Vector and quaternion math for the physics engine
//!
//! Both types serialize as plain `{x, y, z}` / `{w, x, y, z}` objects, which is also
//! how they are stored in entity state.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// 3D vector for physics calculations
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn splat(v: f64) -> Self {
        Self { x: v, y: v, z: v }
    }

    #[inline]
    pub fn length(&self) -> f64 {
        self.length_sq().sqrt()
    }

    #[inline]
    pub fn length_sq(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    #[inline]
    pub fn dot(&self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(&self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    /// Component-wise product
    #[inline]
    pub fn scale(&self, other: Vec3) -> Vec3 {
        Vec3::new(self.x * other.x, self.y * other.y, self.z * other.z)
    }

    /// Clamp each component to `[-limit, limit]` of the matching component of `limit`
    pub fn clamp_abs(&self, limit: Vec3) -> Vec3 {
        let clamp = |v: f64, l: f64| {
            let l = l.abs();
            v.clamp(-l, l)
        };
        Vec3::new(
            clamp(self.x, limit.x),
            clamp(self.y, limit.y),
            clamp(self.z, limit.z),
        )
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Approximate equality used to suppress no-op replication
    pub fn approx_eq(&self, other: Vec3, epsilon: f64) -> bool {
        (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    #[inline]
    fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl AddAssign for Vec3 {
    #[inline]
    fn add_assign(&mut self, other: Vec3) {
        self.x += other.x;
        self.y += other.y;
        self.z += other.z;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    #[inline]
    fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    #[inline]
    fn mul(self, s: f64) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;

    #[inline]
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

/// Unit quaternion describing an orientation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quat {
    pub w: f64,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Rotation of `angle` radians around `axis`
    pub fn from_axis_angle(axis: Vec3, angle: f64) -> Self {
        let len = axis.length();
        if len == 0.0 {
            return Self::IDENTITY;
        }
        let half = angle * 0.5;
        let s = half.sin() / len;
        Self::new(half.cos(), axis.x * s, axis.y * s, axis.z * s)
    }

    pub fn length(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len > 0.0 && len.is_finite() {
            Self::new(self.w / len, self.x / len, self.y / len, self.z / len)
        } else {
            Self::IDENTITY
        }
    }

    pub fn conjugate(&self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this orientation
    pub fn rotate(&self, v: Vec3) -> Vec3 {
        let qv = Quat::new(0.0, v.x, v.y, v.z);
        let r = *self * qv * self.conjugate();
        Vec3::new(r.x, r.y, r.z)
    }

    /// Advance the orientation by an angular velocity (rad/s, world frame) over `dt` seconds
    pub fn integrate(&self, angular_velocity: Vec3, dt: f64) -> Self {
        let spin = Quat::new(0.0, angular_velocity.x, angular_velocity.y, angular_velocity.z);
        let delta = spin * *self;
        Quat::new(
            self.w + 0.5 * delta.w * dt,
            self.x + 0.5 * delta.x * dt,
            self.y + 0.5 * delta.y * dt,
            self.z + 0.5 * delta.z * dt,
        )
        .normalize()
    }

    pub fn is_finite(&self) -> bool {
        self.w.is_finite() && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn approx_eq(&self, other: Quat, epsilon: f64) -> bool {
        (self.w - other.w).abs() <= epsilon
            && (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }
}

impl Mul for Quat {
    type Output = Quat;

    fn mul(self, o: Quat) -> Quat {
        Quat::new(
            self.w * o.w - self.x * o.x - self.y * o.y - self.z * o.z,
            self.w * o.x + self.x * o.w + self.y * o.z - self.z * o.y,
            self.w * o.y - self.x * o.z + self.y * o.w + self.z * o.x,
            self.w * o.z + self.x * o.y - self.y * o.x + self.z * o.w,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_clamp_abs() {
        let v = Vec3::new(12.0, -40.0, 3.0).clamp_abs(Vec3::new(10.0, 20.0, 5.0));
        assert_eq!(v, Vec3::new(10.0, -20.0, 3.0));
    }

    #[test]
    fn test_rotate_quarter_turn() {
        let q = Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), FRAC_PI_2);
        let v = q.rotate(Vec3::new(1.0, 0.0, 0.0));
        assert!(v.approx_eq(Vec3::new(0.0, 1.0, 0.0), EPS));
    }

    #[test]
    fn test_integrate_stays_normalized() {
        let mut q = Quat::IDENTITY;
        for _ in 0..600 {
            q = q.integrate(Vec3::new(0.3, -1.2, 0.5), 1.0 / 60.0);
        }
        assert!((q.length() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_integrate_matches_axis_angle() {
        let mut q = Quat::IDENTITY;
        let steps = 10_000;
        for _ in 0..steps {
            q = q.integrate(Vec3::new(0.0, FRAC_PI_2, 0.0), 1.0 / steps as f64);
        }
        let expected = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), FRAC_PI_2);
        assert!(q.approx_eq(expected, 1e-3));
    }

    #[test]
    fn test_deserialize_partial() {
        let v: Vec3 = serde_json::from_str(r#"{"x": 2.5}"#).unwrap();
        assert_eq!(v, Vec3::new(2.5, 0.0, 0.0));
    }
}
