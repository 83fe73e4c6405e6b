//! Rational values stored in VM memory.
//!
//! The VM has a single non-integer type. Two representations implement
//! [`Rational`]: [`Fixed8`], a signed 24.8 fixed-point number, and `f32`. Both
//! occupy four little-endian bytes. [`DefaultRational`] picks one at build
//! time through the `float-rational` feature; memory, the PID bank and the VM
//! are generic over the trait.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Upper bound on [`Rational::WIDTH`].
pub const MAX_RATIONAL_WIDTH: usize = 8;

pub trait Rational:
    Copy
    + Default
    + PartialEq
    + PartialOrd
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    /// Encoded size in bytes, at most [`MAX_RATIONAL_WIDTH`].
    const WIDTH: usize;
    const NAME: &'static str;

    fn zero() -> Self;

    /// Decode from exactly `WIDTH` little-endian bytes.
    fn decode(bytes: &[u8]) -> Self;

    /// Encode into exactly `WIDTH` little-endian bytes.
    fn encode(self, out: &mut [u8]);

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;

    fn is_zero(self) -> bool {
        self == Self::zero()
    }

    /// Real-valued remainder with the sign of the dividend (C `fmod`).
    fn rem_real(self, rhs: Self) -> Self {
        Self::from_f64(self.to_f64() % rhs.to_f64())
    }

    fn clamp_to(self, min: Self, max: Self) -> Self {
        if self > max {
            max
        } else if self < min {
            min
        } else {
            self
        }
    }
}

#[cfg(not(feature = "float-rational"))]
pub type DefaultRational = Fixed8;
#[cfg(feature = "float-rational")]
pub type DefaultRational = f32;

/// Signed 24.8 fixed point. Raw `0x0000_1400` is 20.0.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed8(i32);

impl Fixed8 {
    pub const FRACTION_BITS: u32 = 8;
    pub const ONE: Fixed8 = Fixed8(1 << Self::FRACTION_BITS);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn from_int(value: i32) -> Self {
        Self(value.wrapping_shl(Self::FRACTION_BITS))
    }
}

impl Add for Fixed8 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Fixed8 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl Mul for Fixed8 {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        // Division rather than a shift so negative products truncate toward zero.
        let wide = (self.0 as i64 * rhs.0 as i64) / (1i64 << Self::FRACTION_BITS);
        Self(wide as i32)
    }
}

impl Div for Fixed8 {
    type Output = Self;
    /// Saturates on a zero divisor; the VM rejects zero before dividing.
    fn div(self, rhs: Self) -> Self {
        if rhs.0 == 0 {
            return if self.0 < 0 {
                Self(i32::MIN)
            } else {
                Self(i32::MAX)
            };
        }
        let wide = ((self.0 as i64) << Self::FRACTION_BITS) / rhs.0 as i64;
        Self(wide as i32)
    }
}

impl Neg for Fixed8 {
    type Output = Self;
    fn neg(self) -> Self {
        Self(self.0.wrapping_neg())
    }
}

impl fmt::Debug for Fixed8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed8({} / 0x{:08X})", self.to_f64(), self.0 as u32)
    }
}

impl fmt::Display for Fixed8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_f64(), f)
    }
}

impl Rational for Fixed8 {
    const WIDTH: usize = 4;
    const NAME: &'static str = "fixed24.8";

    fn zero() -> Self {
        Self(0)
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        Self(i32::from_le_bytes(raw))
    }

    fn encode(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.0.to_le_bytes());
    }

    fn from_f64(value: f64) -> Self {
        Self((value * (1u32 << Self::FRACTION_BITS) as f64) as i32)
    }

    fn to_f64(self) -> f64 {
        self.0 as f64 / (1u32 << Self::FRACTION_BITS) as f64
    }

    // Both operands share the scale, so the raw remainder is exact.
    fn rem_real(self, rhs: Self) -> Self {
        if rhs.0 == 0 {
            return Self(0);
        }
        Self(self.0.wrapping_rem(rhs.0))
    }
}

impl Rational for f32 {
    const WIDTH: usize = 4;
    const NAME: &'static str = "f32";

    fn zero() -> Self {
        0.0
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(raw)
    }

    fn encode(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn rem_real(self, rhs: Self) -> Self {
        self % rhs
    }
}
