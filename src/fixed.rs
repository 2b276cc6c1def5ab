//! Deterministic fixed-point arithmetic.
//!
//! [`Fixed`] is a signed 64-bit integer with 12 implicit fractional bits.
//! Every operation is implemented in integer arithmetic only, so two peers
//! running the same command stream produce bit-identical raw values on any
//! platform, which is the foundation the synchronization scheme rests on.
//!
//! Angles are measured in **degrees**. `sin`/`cos` are driven by a 91-entry
//! first-quadrant lookup table (one entry per whole degree, linearly
//! interpolated between entries) with quadrant folding; the inverse functions
//! search the same table, so the forward and inverse paths agree on the same
//! deterministic approximation.
//!
//! Division by zero and the square root of a negative value are the only
//! non-total operations. The `try_*` forms return [`ArithmeticError`]; the
//! operator forms panic, because inside a lockstep simulation hitting either
//! means the peers have already diverged.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Rem, Shl, Shr, Sub, SubAssign};

use crate::error::ArithmeticError;

/// Number of fractional bits in a [`Fixed`] value.
pub const FRACTIONAL_BITS: u32 = 12;

const ONE_RAW: i64 = 1 << FRACTIONAL_BITS;
const FRAC_MASK: i64 = ONE_RAW - 1;

/// Raw units in a quarter turn (90 degrees).
const QUARTER_RAW: i64 = 90 * ONE_RAW;
/// Raw units in a full turn (360 degrees).
const FULL_TURN_RAW: i64 = 360 * ONE_RAW;

/// First-quadrant sine table: `round(sin(d°) * 4096)` for `d` in `0..=90`.
///
/// The entries are strictly increasing, which the inverse functions rely on.
const SIN_TABLE: [i64; 91] = [
    0, 71, 143, 214, 286, 357, 428, 499, 570, 641, //
    711, 782, 852, 921, 991, 1060, 1129, 1198, 1266, 1334, //
    1401, 1468, 1534, 1600, 1666, 1731, 1796, 1860, 1923, 1986, //
    2048, 2110, 2171, 2231, 2290, 2349, 2408, 2465, 2522, 2578, //
    2633, 2687, 2741, 2793, 2845, 2896, 2946, 2996, 3044, 3091, //
    3138, 3183, 3228, 3271, 3314, 3355, 3396, 3435, 3474, 3511, //
    3547, 3582, 3617, 3650, 3681, 3712, 3742, 3770, 3798, 3824, //
    3849, 3873, 3896, 3917, 3937, 3956, 3974, 3991, 4006, 4021, //
    4034, 4046, 4056, 4065, 4074, 4080, 4086, 4090, 4094, 4095, //
    4096,
];

/// A deterministic Q.12 fixed-point number stored in an `i64`.
///
/// Equality and ordering are bit-exact on the raw integer. Arithmetic widens
/// to `i128` internally, so multiplication and division are closed over the
/// full representable range.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Fixed(i64);

impl Fixed {
    /// Zero.
    pub const ZERO: Fixed = Fixed(0);
    /// One.
    pub const ONE: Fixed = Fixed(ONE_RAW);
    /// One half.
    pub const HALF: Fixed = Fixed(ONE_RAW / 2);
    /// 90 degrees, for use with the degree-based trigonometry.
    pub const QUARTER_TURN: Fixed = Fixed(QUARTER_RAW);
    /// 180 degrees.
    pub const HALF_TURN: Fixed = Fixed(180 * ONE_RAW);
    /// 360 degrees.
    pub const FULL_TURN: Fixed = Fixed(FULL_TURN_RAW);

    /// Builds a value directly from its raw bit representation.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Fixed(raw)
    }

    /// Returns the raw bit representation.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Converts an integer to fixed point exactly.
    #[inline]
    #[must_use]
    pub const fn from_int(value: i64) -> Self {
        Fixed(value << FRACTIONAL_BITS)
    }

    /// Builds the fixed-point quotient `num / den`.
    ///
    /// # Panics
    /// Panics if `den` is zero; use [`Fixed::try_from_ratio`] to handle that
    /// case as a value.
    #[inline]
    #[must_use]
    pub fn from_ratio(num: i64, den: i64) -> Self {
        match Self::try_from_ratio(num, den) {
            Ok(value) => value,
            Err(err) => panic!("Fixed::from_ratio: {}", err),
        }
    }

    /// Fallible form of [`Fixed::from_ratio`].
    #[inline]
    pub fn try_from_ratio(num: i64, den: i64) -> Result<Self, ArithmeticError> {
        if den == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        let wide = (i128::from(num) << FRACTIONAL_BITS) / i128::from(den);
        Ok(Fixed(wide as i64))
    }

    /// Truncates toward zero to an integer.
    #[inline]
    #[must_use]
    pub const fn to_int(self) -> i64 {
        self.0 / ONE_RAW
    }

    /// Lossy conversion for display-side consumers (HUD, debug overlays).
    ///
    /// Must never feed back into simulation state.
    #[inline]
    #[must_use]
    pub fn to_f32(self) -> f32 {
        self.0 as f32 / ONE_RAW as f32
    }

    /// Absolute value.
    #[inline]
    #[must_use]
    pub const fn abs(self) -> Self {
        Fixed(self.0.abs())
    }

    /// The smaller of `self` and `other`.
    #[inline]
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Fixed(self.0.min(other.0))
    }

    /// The larger of `self` and `other`.
    #[inline]
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Fixed(self.0.max(other.0))
    }

    /// Fallible division.
    #[inline]
    pub fn try_div(self, rhs: Self) -> Result<Self, ArithmeticError> {
        if rhs.0 == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        let wide = (i128::from(self.0) << FRACTIONAL_BITS) / i128::from(rhs.0);
        Ok(Fixed(wide as i64))
    }

    /// Fallible remainder.
    #[inline]
    pub fn try_rem(self, rhs: Self) -> Result<Self, ArithmeticError> {
        if rhs.0 == 0 {
            return Err(ArithmeticError::DivisionByZero);
        }
        Ok(Fixed(self.0 % rhs.0))
    }

    /// Square root.
    ///
    /// `sqrt(0) == 0`. Negative inputs are a domain error.
    #[inline]
    pub fn try_sqrt(self) -> Result<Self, ArithmeticError> {
        if self.0 < 0 {
            return Err(ArithmeticError::NegativeSqrt);
        }
        // sqrt(raw / 4096) * 4096 == isqrt(raw * 4096)
        let wide = (self.0 as u128) << FRACTIONAL_BITS;
        Ok(Fixed(isqrt_u128(wide) as i64))
    }

    /// Square root, panicking on a negative input.
    ///
    /// # Panics
    /// Panics if `self` is negative. Treated as a simulation bug, because a
    /// peer that does not hit the same negative value has already desynced.
    #[inline]
    #[must_use]
    pub fn sqrt(self) -> Self {
        match self.try_sqrt() {
            Ok(value) => value,
            Err(err) => panic!("Fixed::sqrt: {}", err),
        }
    }

    /// Sine of an angle in degrees.
    #[must_use]
    pub fn sin(self) -> Self {
        let mut angle = self.0 % FULL_TURN_RAW;
        if angle < 0 {
            angle += FULL_TURN_RAW;
        }
        let quadrant = angle / QUARTER_RAW;
        let within = angle % QUARTER_RAW;
        let value = match quadrant {
            0 => first_quadrant_sin(within),
            1 => first_quadrant_sin(QUARTER_RAW - within),
            2 => -first_quadrant_sin(within),
            _ => -first_quadrant_sin(QUARTER_RAW - within),
        };
        Fixed(value)
    }

    /// Cosine of an angle in degrees.
    #[inline]
    #[must_use]
    pub fn cos(self) -> Self {
        Fixed(self.0 + QUARTER_RAW).sin()
    }

    /// Tangent of an angle in degrees.
    ///
    /// Fails where the cosine is zero (odd multiples of 90 degrees).
    #[inline]
    pub fn try_tan(self) -> Result<Self, ArithmeticError> {
        self.sin().try_div(self.cos())
    }

    /// Tangent of an angle in degrees.
    ///
    /// # Panics
    /// Panics at odd multiples of 90 degrees; see [`Fixed::try_tan`].
    #[inline]
    #[must_use]
    pub fn tan(self) -> Self {
        match self.try_tan() {
            Ok(value) => value,
            Err(err) => panic!("Fixed::tan: {}", err),
        }
    }

    /// Inverse sine, returning degrees in `[-90, 90]`.
    ///
    /// Inputs outside `[-1, 1]` are clamped to the domain boundary, keeping
    /// the operation total.
    #[must_use]
    pub fn asin(self) -> Self {
        let clamped = self.0.clamp(-ONE_RAW, ONE_RAW);
        if clamped < 0 {
            return -Fixed(-clamped).asin();
        }
        Fixed(first_quadrant_asin(clamped))
    }

    /// Inverse tangent, returning degrees in `(-90, 90)`.
    #[inline]
    #[must_use]
    pub fn atan(self) -> Self {
        Self::atan2(self, Fixed::ONE)
    }

    /// Four-quadrant inverse tangent of `y / x`, returning degrees in
    /// `(-180, 180]`. `atan2(0, 0)` is defined as `0`.
    #[must_use]
    pub fn atan2(y: Self, x: Self) -> Self {
        if x.0 == 0 && y.0 == 0 {
            return Fixed::ZERO;
        }
        if x.0 == 0 {
            return if y.0 > 0 {
                Fixed(QUARTER_RAW)
            } else {
                Fixed(-QUARTER_RAW)
            };
        }
        let base = atan_abs(y.0.abs(), x.0.abs());
        if x.0 > 0 {
            if y.0 >= 0 {
                Fixed(base)
            } else {
                Fixed(-base)
            }
        } else if y.0 >= 0 {
            Fixed(180 * ONE_RAW - base)
        } else {
            Fixed(base - 180 * ONE_RAW)
        }
    }
}

/// Sine over `[0, 90]` degrees in raw angle units, with linear interpolation
/// between whole-degree table entries.
fn first_quadrant_sin(angle_raw: i64) -> i64 {
    debug_assert!((0..=QUARTER_RAW).contains(&angle_raw));
    let degree = (angle_raw >> FRACTIONAL_BITS) as usize;
    let frac = angle_raw & FRAC_MASK;
    let base = SIN_TABLE[degree];
    if frac == 0 {
        return base;
    }
    let next = SIN_TABLE[degree + 1];
    base + (((next - base) * frac) >> FRACTIONAL_BITS)
}

/// Inverse of [`first_quadrant_sin`]: maps a raw sine value in `[0, 4096]` to
/// raw degrees in `[0, 90 * 4096]`.
fn first_quadrant_asin(value: i64) -> i64 {
    debug_assert!((0..=ONE_RAW).contains(&value));
    // binary search the whole-degree bracket containing `value`
    let degree = match SIN_TABLE.binary_search(&value) {
        Ok(exact) => return (exact as i64) << FRACTIONAL_BITS,
        Err(above) => above - 1,
    };
    let base = SIN_TABLE[degree];
    let next = SIN_TABLE[degree + 1];
    let frac = ((value - base) << FRACTIONAL_BITS) / (next - base);
    ((degree as i64) << FRACTIONAL_BITS) + frac
}

/// `atan(y_abs / x_abs)` in raw degree units, both operands non-negative and
/// not both zero, result in `[0, 90 * 4096]`.
///
/// Binary search over the angle: `a <= atan(y/x)` iff `sin(a)*x <= cos(a)*y`,
/// which is monotone over the first quadrant.
fn atan_abs(y_abs: i64, x_abs: i64) -> i64 {
    if x_abs == 0 {
        return QUARTER_RAW;
    }
    let mut lo = 0i64;
    let mut hi = QUARTER_RAW;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let sin = first_quadrant_sin(mid);
        let cos = first_quadrant_sin(QUARTER_RAW - mid);
        if i128::from(sin) * i128::from(x_abs) <= i128::from(cos) * i128::from(y_abs) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Integer square root (floor) over `u128`.
fn isqrt_u128(value: u128) -> u128 {
    if value < 2 {
        return value;
    }
    let shift = (128 - value.leading_zeros()).div_ceil(2);
    let mut guess = 1u128 << shift;
    loop {
        let next = (guess + value / guess) / 2;
        if next >= guess {
            break;
        }
        guess = next;
    }
    guess
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let int = self.0 / ONE_RAW;
        let frac = (self.0 % ONE_RAW).unsigned_abs() * 10_000 / ONE_RAW as u64;
        if self.0 < 0 && int == 0 {
            write!(f, "-{}.{:04}", int, frac)
        } else {
            write!(f, "{}.{:04}", int, frac)
        }
    }
}

impl Add for Fixed {
    type Output = Fixed;

    #[inline]
    fn add(self, rhs: Self) -> Self::Output {
        Fixed(self.0 + rhs.0)
    }
}

impl AddAssign for Fixed {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        Fixed(self.0 - rhs.0)
    }
}

impl SubAssign for Fixed {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Fixed {
    type Output = Fixed;

    #[inline]
    fn neg(self) -> Self::Output {
        Fixed(-self.0)
    }
}

impl Mul for Fixed {
    type Output = Fixed;

    #[inline]
    fn mul(self, rhs: Self) -> Self::Output {
        let wide = (i128::from(self.0) * i128::from(rhs.0)) >> FRACTIONAL_BITS;
        Fixed(wide as i64)
    }
}

impl MulAssign for Fixed {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl Div for Fixed {
    type Output = Fixed;

    /// # Panics
    /// Panics on division by zero; see [`Fixed::try_div`].
    #[inline]
    fn div(self, rhs: Self) -> Self::Output {
        match self.try_div(rhs) {
            Ok(value) => value,
            Err(err) => panic!("Fixed division: {}", err),
        }
    }
}

impl Rem for Fixed {
    type Output = Fixed;

    /// # Panics
    /// Panics on a zero divisor; see [`Fixed::try_rem`].
    #[inline]
    fn rem(self, rhs: Self) -> Self::Output {
        match self.try_rem(rhs) {
            Ok(value) => value,
            Err(err) => panic!("Fixed remainder: {}", err),
        }
    }
}

impl Shl<u32> for Fixed {
    type Output = Fixed;

    #[inline]
    fn shl(self, rhs: u32) -> Self::Output {
        Fixed(self.0 << rhs)
    }
}

impl Shr<u32> for Fixed {
    type Output = Fixed;

    #[inline]
    fn shr(self, rhs: u32) -> Self::Output {
        Fixed(self.0 >> rhs)
    }
}

impl From<i64> for Fixed {
    #[inline]
    fn from(value: i64) -> Self {
        Fixed::from_int(value)
    }
}

// #########
// # TESTS #
// #########


// =============================================================================
// Property-Based Tests
// =============================================================================
