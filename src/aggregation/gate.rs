use std::num::NonZeroUsize;

use super::ThresholdErr;

/// Slack when rounding `fraction * roster` up, so that `0.1 * 30` still requires 3.
const CEIL_SLACK: f64 = 1e-9;

/// A share of the roster, always within `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fraction(f64);

impl Fraction {
    /// Creates a new `Fraction`.
    ///
    /// # Returns
    /// A `ThresholdErr` if `value` isn't within `(0, 1]`, `NaN` included.
    pub fn new(value: f64) -> Result<Self, ThresholdErr> {
        if value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ThresholdErr::FractionOutOfRange(value))
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

/// Decides when a round holds enough contributions to be aggregated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Full once a fixed amount of contributions is reached.
    Absolute(NonZeroUsize),
    /// Full once `ceil(fraction * roster size)` contributions are reached.
    Relative(Fraction),
}

impl Threshold {
    /// Creates an absolute `Threshold`.
    ///
    /// # Returns
    /// A `ThresholdErr` if `count` is zero.
    pub fn absolute(count: usize) -> Result<Self, ThresholdErr> {
        NonZeroUsize::new(count)
            .map(Self::Absolute)
            .ok_or(ThresholdErr::ZeroCount)
    }

    /// Creates a relative `Threshold`.
    ///
    /// # Returns
    /// A `ThresholdErr` if `fraction` isn't within `(0, 1]`.
    pub fn relative(fraction: f64) -> Result<Self, ThresholdErr> {
        Fraction::new(fraction).map(Self::Relative)
    }

    /// Every node of the roster must contribute.
    pub fn everyone() -> Self {
        Self::Relative(Fraction(1.0))
    }

    /// The amount of contributions needed given the current roster size.
    ///
    /// The roster size is read at evaluation time, a shrinking roster lowers a relative threshold.
    pub fn required(&self, roster_size: usize) -> usize {
        match *self {
            Self::Absolute(count) => count.get(),
            Self::Relative(fraction) => {
                let exact = fraction.get() * roster_size as f64;
                (exact - CEIL_SLACK).ceil().max(0.0) as usize
            }
        }
    }

    /// Whether `contributions` fill the round, a round with no contributions is never full.
    pub fn is_full(&self, contributions: usize, roster_size: usize) -> bool {
        contributions > 0 && contributions >= self.required(roster_size)
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::everyone()
    }
}
