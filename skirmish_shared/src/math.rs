//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! Angles are radians unless a function name says otherwise.

use std::f32::consts::{PI, TAU};
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::{codec::ByteStream, error::CodecError};

/// 2D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn distance_sq(self, other: Self) -> f32 {
        (other - self).len_sq()
    }

    pub fn distance(self, other: Self) -> f32 {
        self.distance_sq(other).sqrt()
    }

    /// Direction from `self` to `other`, in `[0, 2π)`.
    pub fn angle_to(self, other: Self) -> f32 {
        let d = other - self;
        if d.x == 0.0 && d.y == 0.0 {
            return 0.0;
        }
        d.y.atan2(d.x).rem_euclid(TAU)
    }

    /// Unit vector pointing along `angle`.
    pub fn from_angle(angle: f32) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        self + (to - self) * t
    }

    pub fn write_to(self, out: &mut ByteStream) {
        out.write_f32(self.x);
        out.write_f32(self.y);
    }

    pub fn read_from(input: &mut ByteStream) -> Result<Self, CodecError> {
        Ok(Self::new(input.read_f32()?, input.read_f32()?))
    }
}

impl Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

pub fn to_radians(degrees: f32) -> f32 {
    degrees / 180.0 * PI
}

pub fn to_degrees(radians: f32) -> f32 {
    radians / PI * 180.0
}

/// Wraps an angle into `[0, 2π)`.
pub fn normalize_angle(angle: f32) -> f32 {
    angle.rem_euclid(TAU)
}

/// Rotates `current` toward `target` by at most `speed`, taking the short way
/// around the circle. Returns the normalized result.
pub fn smooth_angle(current: f32, target: f32, speed: f32) -> f32 {
    let current = normalize_angle(current);
    let target = normalize_angle(target);
    let mut diff = target - current;
    if diff > PI {
        diff -= TAU;
    } else if diff < -PI {
        diff += TAU;
    }
    if diff.abs() <= speed {
        target
    } else {
        normalize_angle(current + speed * diff.signum())
    }
}

/// Packs an angle as whole degrees in `[0, 360)`.
pub fn angle_to_wire(angle: f32) -> u16 {
    (to_degrees(normalize_angle(angle)).round() as u16) % 360
}

pub fn angle_from_wire(degrees: u16) -> f32 {
    to_radians(f32::from(degrees % 360))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec2_lerp_midpoint() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(2.0, 4.0);
        assert_eq!(a.lerp(b, 0.5), Vec2::new(1.0, 2.0));
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Vec2::new(1.0, 1.0);
        let b = Vec2::new(4.0, 5.0);
        assert_eq!(a.distance_sq(b), 25.0);
        assert_eq!(a.distance(b), 5.0);
    }

    #[test]
    fn angle_to_covers_full_circle() {
        let o = Vec2::ZERO;
        assert_eq!(o.angle_to(Vec2::new(1.0, 0.0)), 0.0);
        assert!((o.angle_to(Vec2::new(0.0, -1.0)) - 1.5 * PI).abs() < 1e-5);
    }

    #[test]
    fn smooth_angle_takes_short_way() {
        let step = to_radians(10.0);
        let next = smooth_angle(to_radians(355.0), to_radians(20.0), step);
        assert!((next - to_radians(5.0)).abs() < 1e-4);

        // Close enough snaps to the target.
        let snapped = smooth_angle(to_radians(15.0), to_radians(20.0), step);
        assert!((snapped - to_radians(20.0)).abs() < 1e-5);
    }

    #[test]
    fn wire_angles_are_whole_degrees() {
        assert_eq!(angle_to_wire(to_radians(90.0)), 90);
        assert_eq!(angle_to_wire(to_radians(-90.0)), 270);
        assert_eq!(angle_to_wire(to_radians(359.8)), 0);
        assert!((angle_from_wire(180) - PI).abs() < 1e-6);
    }
}
