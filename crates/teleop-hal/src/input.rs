//! Generic `InputSource` trait for operator input devices.
//!
//! A source returns the most recent raw sample in channel order (axes then
//! buttons).  When no device is attached it returns `None` and the caller
//! emits a neutral frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An operator input device (gamepad, RC transmitter in HID mode, …).
pub trait InputSource: Send {
    /// Stable identifier, e.g. `"tx12"`.
    fn id(&self) -> &str;

    /// Read the latest raw sample, or `None` when the device is absent.
    fn sample(&mut self) -> Option<Vec<f64>>;
}

/// Replays a fixed list of samples, then reports the device as absent.
///
/// Used by the simulator and by tests.
pub struct ScriptedInput {
    id: String,
    samples: VecDeque<Vec<f64>>,
}

impl ScriptedInput {
    pub fn new(id: impl Into<String>, samples: impl IntoIterator<Item = Vec<f64>>) -> Self {
        Self {
            id: id.into(),
            samples: samples.into_iter().collect(),
        }
    }

    /// Samples not yet consumed.
    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl InputSource for ScriptedInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn sample(&mut self) -> Option<Vec<f64>> {
        self.samples.pop_front()
    }
}

/// A source fed by a separate polling thread: writers overwrite a single
/// slot and the reader always sees the newest value.
#[derive(Clone)]
pub struct LatchedInput {
    id: String,
    slot: Arc<Mutex<Option<Vec<f64>>>>,
}

impl LatchedInput {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the latched sample.
    pub fn set(&self, sample: Vec<f64>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(sample);
    }

    /// Mark the device as disconnected.
    pub fn clear(&self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl InputSource for LatchedInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn sample(&mut self) -> Option<Vec<f64>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
