//! [`InputFilter`] – deadzone clamping of raw analog samples.
//!
//! The first `axis_count` entries of a sample are treated as axes in
//! `[-1, 1]`; any remaining entries are buttons in `[0, 1]` and pass through
//! untouched.  An axis whose magnitude is strictly below the deadzone is
//! emitted as exactly `0.0`; every other value is emitted unchanged.
//!
//! An optional axis map routes raw device axes onto the output axes before
//! the deadzone is applied, so any gamepad layout can drive channels 1..8.
//!
//! A smoothing coefficient is accepted and validated so that device profiles
//! can carry it, but it is not mixed into the output: the filter emits the
//! deadzone-clamped raw value.

use teleop_types::AXIS_COUNT;
use thiserror::Error;

/// Default deadzone used by operator consoles.
pub const DEFAULT_DEADZONE: f64 = 0.03;

/// Default smoothing coefficient (stored, not applied).
pub const DEFAULT_SMOOTHING: f64 = 0.25;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("deadzone must lie in [0, 1), got {0}")]
    InvalidDeadzone(f64),
    #[error("smoothing must lie in [0, 1], got {0}")]
    InvalidSmoothing(f64),
    #[error("axis map must name {expected} axes, got {actual}")]
    InvalidAxisMap { expected: usize, actual: usize },
}

/// Pure, synchronous per-tick input filter.
///
/// # Example
///
/// ```
/// use teleop_hal::filter::InputFilter;
///
/// let filter = InputFilter::new(0.05, 0.25).unwrap();
/// let out = filter.apply(&[0.02, -0.6, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.01]);
/// assert_eq!(out[0], 0.0);   // inside the deadzone
/// assert_eq!(out[1], -0.6);  // passed through
/// assert_eq!(out[8], 0.01);  // buttons are never filtered
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InputFilter {
    deadzone: f64,
    smoothing: f64,
    axis_count: usize,
    axis_map: Option<Vec<usize>>,
}

impl Default for InputFilter {
    fn default() -> Self {
        Self {
            deadzone: DEFAULT_DEADZONE,
            smoothing: DEFAULT_SMOOTHING,
            axis_count: AXIS_COUNT,
            axis_map: None,
        }
    }
}

impl InputFilter {
    /// Build a filter over the standard 8-axis layout.
    pub fn new(deadzone: f64, smoothing: f64) -> Result<Self, FilterError> {
        if !(0.0..1.0).contains(&deadzone) {
            return Err(FilterError::InvalidDeadzone(deadzone));
        }
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(FilterError::InvalidSmoothing(smoothing));
        }
        Ok(Self {
            deadzone,
            smoothing,
            axis_count: AXIS_COUNT,
            axis_map: None,
        })
    }

    /// Override how many leading channels are axes (builder-style). Clears
    /// any axis map.
    pub fn with_axis_count(mut self, axis_count: usize) -> Self {
        self.axis_count = axis_count;
        self.axis_map = None;
        self
    }

    /// Route raw axis `map[i]` to output axis `i`. The map must name exactly
    /// `axis_count` axes; a raw index the device does not report reads as
    /// `0.0`. An empty map means identity.
    pub fn with_axis_map(mut self, map: Vec<usize>) -> Result<Self, FilterError> {
        if map.is_empty() {
            self.axis_map = None;
            return Ok(self);
        }
        if map.len() != self.axis_count {
            return Err(FilterError::InvalidAxisMap {
                expected: self.axis_count,
                actual: map.len(),
            });
        }
        self.axis_map = Some(map);
        Ok(self)
    }

    pub fn deadzone(&self) -> f64 {
        self.deadzone
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    pub fn axis_count(&self) -> usize {
        self.axis_count
    }

    pub fn axis_map(&self) -> Option<&[usize]> {
        self.axis_map.as_deref()
    }

    /// Filter one raw sample. The output has the same length as `raw`.
    pub fn apply(&self, raw: &[f64]) -> Vec<f64> {
        (0..raw.len())
            .map(|i| {
                if i >= self.axis_count {
                    return raw[i];
                }
                let v = match &self.axis_map {
                    Some(map) => raw.get(map[i]).copied().unwrap_or(0.0),
                    None => raw[i],
                };
                if v.abs() < self.deadzone { 0.0 } else { v }
            })
            .collect()
    }
}
