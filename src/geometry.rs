//! Fixed-point plane geometry.
//!
//! [`Vec2`] and [`Rect`] are plain value pairs/quadruples of [`Fixed`]. They
//! exist so that no simulation-touching path ever needs a float: rotation,
//! length and overlap tests all stay in deterministic integer arithmetic.

use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use crate::error::ArithmeticError;
use crate::fixed::Fixed;

/// A two-component fixed-point vector.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: Fixed,
    /// Vertical component.
    pub y: Fixed,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Vec2 = Vec2 {
        x: Fixed::ZERO,
        y: Fixed::ZERO,
    };

    /// Creates a vector from components.
    #[inline]
    #[must_use]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Vec2 { x, y }
    }

    /// Creates a vector from integer components.
    #[inline]
    #[must_use]
    pub const fn from_ints(x: i64, y: i64) -> Self {
        Vec2 {
            x: Fixed::from_int(x),
            y: Fixed::from_int(y),
        }
    }

    /// Dot product.
    #[inline]
    #[must_use]
    pub fn dot(self, other: Self) -> Fixed {
        self.x * other.x + self.y * other.y
    }

    /// Squared length. Cheaper than [`Vec2::length`] and sufficient for
    /// comparisons.
    #[inline]
    #[must_use]
    pub fn length_squared(self) -> Fixed {
        self.dot(self)
    }

    /// Euclidean length.
    #[inline]
    #[must_use]
    pub fn length(self) -> Fixed {
        self.length_squared().sqrt()
    }

    /// Rotates the vector by an angle in degrees (counter-clockwise).
    #[must_use]
    pub fn rotate(self, angle: Fixed) -> Self {
        let sin = angle.sin();
        let cos = angle.cos();
        Vec2 {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }

    /// The vector scaled to unit length, or an error for the zero vector.
    #[inline]
    pub fn try_normalize(self) -> Result<Self, ArithmeticError> {
        let len = self.length();
        Ok(Vec2 {
            x: self.x.try_div(len)?,
            y: self.y.try_div(len)?,
        })
    }

    /// Angle of the vector in degrees, measured from the positive x axis;
    /// `(0, 0)` maps to `0`.
    #[inline]
    #[must_use]
    pub fn angle(self) -> Fixed {
        Fixed::atan2(self.y, self.x)
    }
}

impl Add for Vec2 {
    type Output = Vec2;

    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Vec2 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec2 {
    type Output = Vec2;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl SubAssign for Vec2 {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for Vec2 {
    type Output = Vec2;

    #[inline]
    fn neg(self) -> Self::Output {
        Vec2::new(-self.x, -self.y)
    }
}

impl Mul<Fixed> for Vec2 {
    type Output = Vec2;

    #[inline]
    fn mul(self, rhs: Fixed) -> Self::Output {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// An axis-aligned fixed-point rectangle, used by the collision broad phase.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Rect {
    /// Left edge.
    pub x: Fixed,
    /// Top edge.
    pub y: Fixed,
    /// Width (non-negative).
    pub width: Fixed,
    /// Height (non-negative).
    pub height: Fixed,
}

impl Rect {
    /// Creates a rectangle from origin and extent.
    #[inline]
    #[must_use]
    pub const fn new(x: Fixed, y: Fixed, width: Fixed, height: Fixed) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle's center point.
    #[inline]
    #[must_use]
    pub fn center(self) -> Vec2 {
        Vec2::new(self.x + (self.width >> 1), self.y + (self.height >> 1))
    }

    /// Whether the point lies inside (edges inclusive on the low side,
    /// exclusive on the high side).
    #[inline]
    #[must_use]
    pub fn contains(self, point: Vec2) -> bool {
        point.x >= self.x
            && point.y >= self.y
            && point.x < self.x + self.width
            && point.y < self.y + self.height
    }

    /// Whether two rectangles overlap (touching edges do not count).
    #[inline]
    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    /// Grows the rectangle by `amount` on every side.
    #[must_use]
    pub fn inflate(self, amount: Fixed) -> Self {
        Rect {
            x: self.x - amount,
            y: self.y - amount,
            width: self.width + amount + amount,
            height: self.height + amount + amount,
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn v(x: i64, y: i64) -> Vec2 {
        Vec2::from_ints(x, y)
    }

    #[test]
    fn vector_arithmetic() {
        assert_eq!(v(1, 2) + v(3, 4), v(4, 6));
        assert_eq!(v(3, 4) - v(1, 2), v(2, 2));
        assert_eq!(-v(1, -2), v(-1, 2));
        assert_eq!(v(1, 2) * Fixed::from_int(3), v(3, 6));
    }

    #[test]
    fn dot_and_length() {
        assert_eq!(v(3, 4).dot(v(3, 4)), Fixed::from_int(25));
        assert_eq!(v(3, 4).length(), Fixed::from_int(5));
        assert_eq!(Vec2::ZERO.length(), Fixed::ZERO);
    }

    #[test]
    fn rotate_quarter_turn() {
        let rotated = v(1, 0).rotate(Fixed::from_int(90));
        assert_eq!(rotated, v(0, 1));
        let back = rotated.rotate(Fixed::from_int(-90));
        assert_eq!(back, v(1, 0));
    }

    #[test]
    fn rotate_half_turn() {
        assert_eq!(v(2, 3).rotate(Fixed::from_int(180)), v(-2, -3));
    }

    #[test]
    fn normalize_unit_axes() {
        assert_eq!(v(5, 0).try_normalize().unwrap(), v(1, 0));
        assert!(Vec2::ZERO.try_normalize().is_err());
    }

    #[test]
    fn angle_of_axes() {
        assert_eq!(v(1, 0).angle(), Fixed::ZERO);
        assert_eq!(v(0, 1).angle(), Fixed::from_int(90));
        assert_eq!(v(-1, 0).angle(), Fixed::from_int(180));
    }

    #[test]
    fn rect_contains() {
        let r = Rect::new(
            Fixed::ZERO,
            Fixed::ZERO,
            Fixed::from_int(10),
            Fixed::from_int(10),
        );
        assert!(r.contains(v(0, 0)));
        assert!(r.contains(v(9, 9)));
        assert!(!r.contains(v(10, 10)));
        assert!(!r.contains(v(-1, 5)));
    }

    #[test]
    fn rect_intersection() {
        let a = Rect::new(
            Fixed::ZERO,
            Fixed::ZERO,
            Fixed::from_int(10),
            Fixed::from_int(10),
        );
        let b = Rect::new(
            Fixed::from_int(5),
            Fixed::from_int(5),
            Fixed::from_int(10),
            Fixed::from_int(10),
        );
        let c = Rect::new(
            Fixed::from_int(10),
            Fixed::ZERO,
            Fixed::from_int(5),
            Fixed::from_int(5),
        );
        assert!(a.intersects(b));
        assert!(b.intersects(a));
        // touching edges do not overlap
        assert!(!a.intersects(c));
    }

    #[test]
    fn rect_inflate_and_center() {
        let r = Rect::new(
            Fixed::from_int(2),
            Fixed::from_int(2),
            Fixed::from_int(4),
            Fixed::from_int(4),
        );
        assert_eq!(r.center(), v(4, 4));
        let grown = r.inflate(Fixed::ONE);
        assert_eq!(grown.x, Fixed::from_int(1));
        assert_eq!(grown.width, Fixed::from_int(6));
    }
}
