//! EC probe capability: "read the probe voltage".
//!
//! The controller and calibration engine only see [`EcProbe`]. The hardware
//! implementation lives in `board.rs` (DFR0566 ADC channel); [`SimProbe`]
//! stands in when no hardware is available.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A source of raw EC probe readings.
///
/// Readings are in the probe interface's native unit (millivolts for the
/// DFR0300 probe behind the DFR0566 ADC), which is what the raw EC formula
/// expects.
pub trait EcProbe: Send {
    fn read_voltage(&mut self) -> Result<f64>;
}

/// Probe handle shared by the calibration engine and the EC publisher.
/// Calibration holds the lock for a whole sampling run.
pub type SharedProbe = Arc<Mutex<Box<dyn EcProbe>>>;

// ---------------------------------------------------------------------------
// Simulated probe
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Probe that reports a fixed voltage with optional Gaussian noise.
///
/// Used whenever the expansion board is not available so the control loop,
/// calibration flow and bus surface keep working on a development machine.
pub struct SimProbe {
    voltage: f64,
    noise: f64,
}

impl SimProbe {
    pub fn new(voltage: f64, noise: f64) -> Self {
        Self { voltage, noise }
    }
}

impl EcProbe for SimProbe {
    fn read_voltage(&mut self) -> Result<f64> {
        if self.noise <= 0.0 {
            return Ok(self.voltage);
        }
        Ok((self.voltage + self.noise * approx_std_normal()).max(0.0))
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Probe replaying a fixed list of readings, then failing.
#[cfg(test)]
pub(crate) struct ScriptedProbe {
    readings: std::collections::VecDeque<f64>,
}

#[cfg(test)]
impl ScriptedProbe {
    pub(crate) fn new(readings: &[f64]) -> Self {
        Self {
            readings: readings.iter().copied().collect(),
        }
    }

    /// A probe that returns `voltage` for every one of `n` reads.
    pub(crate) fn constant(voltage: f64, n: usize) -> Self {
        Self::new(&vec![voltage; n])
    }
}

#[cfg(test)]
impl EcProbe for ScriptedProbe {
    fn read_voltage(&mut self) -> Result<f64> {
        self.readings
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted probe exhausted"))
    }
}

#[cfg(test)]
pub(crate) fn shared(probe: impl EcProbe + 'static) -> SharedProbe {
    Arc::new(Mutex::new(Box::new(probe)))
}

// ===========================================================================
// Tests
// ===========================================================================
