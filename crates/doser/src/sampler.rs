//! Stable-voltage sampling for calibration.
//!
//! Takes a burst of probe readings, one per interval, and returns their mean
//! only if the burst is stable (sample standard deviation at or below a
//! threshold). The statistics live in [`summarize`] so they can be tested
//! without a probe or a clock.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::probe::EcProbe;

/// Default number of readings per calibration run.
pub const DEFAULT_SAMPLES: usize = 20;

/// Default pause between readings.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default stability threshold. Empirical guess, never validated against a
/// real probe.
pub const DEFAULT_MAX_STDEV: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub voltage: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("unstable probe voltage: stdev {stdev:.3} exceeds threshold {max_stdev}")]
    Unstable { stdev: f64, max_stdev: f64 },
    #[error("at least 2 readings are needed for a stability check, got {0}")]
    TooFewSamples(usize),
    #[error("probe read failed: {0}")]
    Probe(String),
}

#[derive(Debug, Clone)]
pub struct VoltageSampler {
    pub samples: usize,
    pub interval: Duration,
    pub max_stdev: f64,
}

impl Default for VoltageSampler {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            interval: DEFAULT_INTERVAL,
            max_stdev: DEFAULT_MAX_STDEV,
        }
    }
}

impl VoltageSampler {
    /// Read `samples` voltages from `probe`, pairing each with `temperature`
    /// (constant while there is no temperature probe), and summarise them.
    ///
    /// Sleeps between readings, so callers must not hold the state lock.
    pub async fn sample(
        &self,
        probe: &mut dyn EcProbe,
        temperature: f64,
    ) -> Result<Sample, SampleError> {
        if self.samples < 2 {
            return Err(SampleError::TooFewSamples(self.samples));
        }

        let mut voltages = Vec::with_capacity(self.samples);
        let mut temperatures = Vec::with_capacity(self.samples);

        for i in 0..self.samples {
            let voltage = probe
                .read_voltage()
                .map_err(|e| SampleError::Probe(format!("{e:#}")))?;
            voltages.push(voltage);
            temperatures.push(temperature);

            if i + 1 < self.samples {
                sleep(self.interval).await;
            }
        }

        debug!(?voltages, ?temperatures, "calibration readings collected");
        summarize(&voltages, &temperatures, self.max_stdev)
    }
}

/// Mean voltage and temperature of a burst, or `Unstable` if the voltage
/// stdev exceeds `max_stdev`.
pub fn summarize(
    voltages: &[f64],
    temperatures: &[f64],
    max_stdev: f64,
) -> Result<Sample, SampleError> {
    if voltages.len() < 2 {
        return Err(SampleError::TooFewSamples(voltages.len()));
    }

    let stdev = sample_stdev(voltages);
    if stdev > max_stdev {
        return Err(SampleError::Unstable { stdev, max_stdev });
    }

    let sample = Sample {
        voltage: mean(voltages),
        temperature: mean(temperatures),
    };
    debug!(
        voltage = sample.voltage,
        temperature = sample.temperature,
        stdev,
        "calibration sample accepted"
    );
    Ok(sample)
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample (n-1) standard deviation. Callers guarantee `xs.len() >= 2`.
fn sample_stdev(xs: &[f64]) -> f64 {
    let m = mean(xs);
    let ss: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
    (ss / (xs.len() - 1) as f64).sqrt()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ScriptedProbe;

    fn sampler(samples: usize) -> VoltageSampler {
        VoltageSampler {
            samples,
            interval: Duration::from_secs(1),
            max_stdev: DEFAULT_MAX_STDEV,
        }
    }

    // -- summarize -----------------------------------------------------------

    #[test]
    fn summarize_returns_exact_mean() {
        let voltages = [200.0, 202.0, 198.0, 201.0, 199.0];
        let temps = [25.0; 5];
        let s = summarize(&voltages, &temps, 10.0).unwrap();
        assert_eq!(s.voltage, 200.0);
        assert_eq!(s.temperature, 25.0);
    }

    #[test]
    fn summarize_averages_temperatures() {
        let s = summarize(&[100.0, 100.0], &[20.0, 22.0], 10.0).unwrap();
        assert_eq!(s.temperature, 21.0);
    }

    #[test]
    fn summarize_identical_readings_are_stable() {
        let s = summarize(&[196.0; 20], &[25.0; 20], 10.0).unwrap();
        assert_eq!(s.voltage, 196.0);
    }

    #[test]
    fn summarize_stdev_at_threshold_is_accepted() {
        // stdev of [190, 200, 210] is exactly 10.
        let s = summarize(&[190.0, 200.0, 210.0], &[25.0; 3], 10.0).unwrap();
        assert_eq!(s.voltage, 200.0);
    }

    #[test]
    fn summarize_stdev_above_threshold_is_unstable() {
        let err = summarize(&[100.0, 150.0, 100.0, 150.0], &[25.0; 4], 10.0).unwrap_err();
        match err {
            SampleError::Unstable { stdev, max_stdev } => {
                assert!(stdev > 28.8 && stdev < 28.9, "stdev {stdev}");
                assert_eq!(max_stdev, 10.0);
            }
            other => panic!("expected Unstable, got {other:?}"),
        }
    }

    #[test]
    fn unstable_message_names_stdev_and_threshold() {
        let err = summarize(&[0.0, 100.0], &[25.0; 2], 10.0).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("70.711"), "{msg}");
        assert!(msg.contains("threshold 10"), "{msg}");
    }

    #[test]
    fn summarize_single_reading_rejected() {
        assert_eq!(
            summarize(&[200.0], &[25.0], 10.0),
            Err(SampleError::TooFewSamples(1))
        );
    }

    // -- VoltageSampler::sample ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sample_reads_configured_count() {
        let mut probe = ScriptedProbe::new(&[200.0, 202.0, 198.0, 201.0, 199.0, 500.0]);
        let s = sampler(5).sample(&mut probe, 21.5).await.unwrap();
        assert_eq!(s.voltage, 200.0);
        assert_eq!(s.temperature, 21.5);
        // sixth reading untouched
        assert_eq!(probe.read_voltage().unwrap(), 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sample_waits_between_readings() {
        let start = tokio::time::Instant::now();
        let mut probe = ScriptedProbe::constant(200.0, 4);
        sampler(4).sample(&mut probe, 25.0).await.unwrap();
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4),
            "elapsed {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sample_unstable_returns_error() {
        let mut probe = ScriptedProbe::new(&[100.0, 300.0, 100.0, 300.0]);
        let err = sampler(4).sample(&mut probe, 25.0).await.unwrap_err();
        assert!(matches!(err, SampleError::Unstable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sample_probe_failure_aborts() {
        let mut probe = ScriptedProbe::new(&[200.0, 200.0]);
        let err = sampler(3).sample(&mut probe, 25.0).await.unwrap_err();
        assert!(matches!(err, SampleError::Probe(_)));
    }

    #[tokio::test]
    async fn sample_too_few_configured() {
        let mut probe = ScriptedProbe::constant(200.0, 1);
        let err = sampler(1).sample(&mut probe, 25.0).await.unwrap_err();
        assert_eq!(err, SampleError::TooFewSamples(1));
    }
}
