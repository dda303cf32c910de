//! Two-point EC probe calibration (DFR0300 probe, low/high buffer solution).
//!
//! A calibration run samples the probe while it sits in a buffer solution,
//! works out which buffer it is from the raw EC figure, and stores a k-value
//! for that point. Low and high points are independent: a full two-point
//! calibration takes two runs.
//!
//! ```text
//! NOT_CALIBRATED ──[request]──▶ CALIBRATING ──[stable + known buffer]──▶ CALIBRATED
//!                                    │
//!                                    └──[unstable / unknown buffer]──▶ ERROR
//! ```
//!
//! The aggregate status is always produced by [`derive_status`]; nothing
//! else decides whether the probe counts as calibrated.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::probe::SharedProbe;
use crate::sampler::{Sample, SampleError, VoltageSampler};

/// Probe interface constants (DFR0300 signal board).
pub const RES2: f64 = 820.0;
pub const ECREF: f64 = 200.0;

pub const INITIAL_KVALUE: f64 = 1.0;

/// Buffer solutions, mS/cm at 25 °C.
pub const LOW_BUFFER_SOLUTION: f64 = 1.413;
pub const HIGH_BUFFER_SOLUTION: f64 = 12.88;

/// Raw EC windows used to recognise each buffer (exclusive bounds). The high
/// window's upper bound is 20 rather than the manufacturer's 16.8.
pub const LOW_RAW_EC_RANGE: [f64; 2] = [0.9, 1.9];
pub const HIGH_RAW_EC_RANGE: [f64; 2] = [9.0, 20.0];

pub const DEFAULT_VALIDITY_DAYS: i64 = 28;

const TEMPERATURE_COEFFICIENT: f64 = 0.0185;
const REFERENCE_TEMPERATURE: f64 = 25.0;

// Read-out hysteresis band for switching between the two k-values.
const KVALUE_HIGH_SWITCH: f64 = 2.5;
const KVALUE_LOW_SWITCH: f64 = 2.0;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalibrationStatus {
    #[default]
    NotCalibrated,
    Calibrating,
    Calibrated,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationPoint {
    pub buffer_solution: f64,
    pub voltage: f64,
    pub temperature: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub status: CalibrationStatus,
    pub message: String,
}

impl Default for CalibrationPoint {
    fn default() -> Self {
        Self {
            buffer_solution: 0.0,
            voltage: 0.0,
            temperature: 0.0,
            timestamp: None,
            status: CalibrationStatus::NotCalibrated,
            message: "Not calibrated".to_string(),
        }
    }
}

impl CalibrationPoint {
    fn calibrated_at(&self) -> Option<OffsetDateTime> {
        match self.status {
            CalibrationStatus::Calibrated => self.timestamp,
            _ => None,
        }
    }
}

/// Persisted calibration record. The JSON file holding this is the only
/// durable state of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationData {
    pub kvalue_low: f64,
    pub kvalue_high: f64,
    pub status: CalibrationStatus,
    pub message: String,
    pub point_low: CalibrationPoint,
    pub point_high: CalibrationPoint,
}

impl Default for CalibrationData {
    fn default() -> Self {
        Self {
            kvalue_low: INITIAL_KVALUE,
            kvalue_high: INITIAL_KVALUE,
            status: CalibrationStatus::NotCalibrated,
            message: "Not calibrated".to_string(),
            point_low: CalibrationPoint::default(),
            point_high: CalibrationPoint::default(),
        }
    }
}

impl CalibrationData {
    /// Re-derive `status`/`message` from the points. A stored ERROR from the
    /// last failed run is kept until the next run.
    pub fn refresh(&mut self, now: OffsetDateTime, validity: time::Duration) {
        if self.status == CalibrationStatus::Error {
            return;
        }
        let (status, message) = derive_status(&self.point_low, &self.point_high, now, validity);
        self.status = status;
        self.message = message;
    }

    fn fail(&mut self, message: String) {
        self.status = CalibrationStatus::Error;
        self.message = message;
    }
}

/// Aggregate status of a calibration record.
///
/// Looks at the most recently calibrated point only. Stored k-values are
/// irrelevant: with no calibrated point the result is NOT_CALIBRATED.
pub fn derive_status(
    low: &CalibrationPoint,
    high: &CalibrationPoint,
    now: OffsetDateTime,
    validity: time::Duration,
) -> (CalibrationStatus, String) {
    let latest = [(BufferPoint::Low, low), (BufferPoint::High, high)]
        .into_iter()
        .filter_map(|(which, p)| p.calibrated_at().map(|ts| (which, ts)))
        .max_by_key(|(_, ts)| *ts);

    let Some((which, ts)) = latest else {
        return (CalibrationStatus::NotCalibrated, "Not calibrated".to_string());
    };

    let age = now - ts;
    if age > validity {
        return (
            CalibrationStatus::NotCalibrated,
            format!(
                "Calibration expired: {which} point last calibrated {} days ago",
                age.whole_days()
            ),
        );
    }

    (
        CalibrationStatus::Calibrated,
        format!("{which} point calibrated on {}", ts.date()),
    )
}

// ---------------------------------------------------------------------------
// Calibration maths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPoint {
    Low,
    High,
}

impl std::fmt::Display for BufferPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    pub low_buffer: f64,
    pub high_buffer: f64,
    pub low_range: [f64; 2],
    pub high_range: [f64; 2],
    pub validity: time::Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            low_buffer: LOW_BUFFER_SOLUTION,
            high_buffer: HIGH_BUFFER_SOLUTION,
            low_range: LOW_RAW_EC_RANGE,
            high_range: HIGH_RAW_EC_RANGE,
            validity: time::Duration::days(DEFAULT_VALIDITY_DAYS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Sampling(#[from] SampleError),
    #[error("could not determine the calibration solution in use (raw EC {raw_ec:.3})")]
    UnknownSolution { raw_ec: f64 },
}

/// Uncalibrated EC figure, only good for telling the buffers apart.
pub fn raw_ec(voltage: f64) -> f64 {
    1000.0 * voltage / RES2 / ECREF
}

/// Which buffer solution a raw EC figure belongs to. Bounds are exclusive.
pub fn classify(raw_ec: f64, settings: &CalibrationSettings) -> Option<BufferPoint> {
    let within = |[lo, hi]: [f64; 2]| lo < raw_ec && raw_ec < hi;
    if within(settings.low_range) {
        Some(BufferPoint::Low)
    } else if within(settings.high_range) {
        Some(BufferPoint::High)
    } else {
        None
    }
}

/// EC of a solution at `temperature`, given its value at 25 °C.
pub fn compensate(value: f64, temperature: f64) -> f64 {
    value * (1.0 + TEMPERATURE_COEFFICIENT * (temperature - REFERENCE_TEMPERATURE))
}

/// k-value for a buffer measured at `voltage`, rounded to 2 decimals.
pub fn kvalue(buffer_solution: f64, voltage: f64, temperature: f64) -> f64 {
    let k = RES2 * ECREF * compensate(buffer_solution, temperature) / 1000.0 / voltage;
    (k * 100.0).round() / 100.0
}

/// Fold one stable sample into `data`, touching only the matching point.
/// On error `data` is left unchanged.
pub fn apply_sample(
    data: &mut CalibrationData,
    sample: Sample,
    now: OffsetDateTime,
    settings: &CalibrationSettings,
) -> Result<BufferPoint, CalibrationError> {
    let raw = raw_ec(sample.voltage);
    let which = classify(raw, settings).ok_or(CalibrationError::UnknownSolution { raw_ec: raw })?;

    let buffer = match which {
        BufferPoint::Low => settings.low_buffer,
        BufferPoint::High => settings.high_buffer,
    };
    let k = kvalue(buffer, sample.voltage, sample.temperature);
    let (kvalue_slot, point) = match which {
        BufferPoint::Low => (&mut data.kvalue_low, &mut data.point_low),
        BufferPoint::High => (&mut data.kvalue_high, &mut data.point_high),
    };

    *kvalue_slot = k;
    *point = CalibrationPoint {
        buffer_solution: buffer,
        voltage: sample.voltage,
        temperature: sample.temperature,
        timestamp: Some(now),
        status: CalibrationStatus::Calibrated,
        message: format!("{which} calibration successful"),
    };

    let (status, message) = derive_status(&data.point_low, &data.point_high, now, settings.validity);
    data.status = status;
    data.message = message;

    Ok(which)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs calibration attempts against the shared probe and persists results.
pub struct Calibrator {
    probe: SharedProbe,
    sampler: VoltageSampler,
    settings: CalibrationSettings,
    file: PathBuf,
}

impl Calibrator {
    pub fn new(
        probe: SharedProbe,
        sampler: VoltageSampler,
        settings: CalibrationSettings,
        file: PathBuf,
    ) -> Self {
        Self {
            probe,
            sampler,
            settings,
            file,
        }
    }

    /// One calibration attempt at `temperature`. Never fails: problems end up
    /// as an ERROR status on the returned record, with the previous k-values
    /// intact.
    ///
    /// `started` is the wall-clock time the attempt began; the point is
    /// stamped with the time sampling finished.
    pub async fn calibrate(
        &self,
        existing: CalibrationData,
        temperature: f64,
        started: OffsetDateTime,
    ) -> CalibrationData {
        let mut data = existing;
        let clock = Instant::now();

        let sample = {
            let mut probe = self.probe.lock().await;
            self.sampler.sample(&mut **probe, temperature).await
        };
        let now = started + clock.elapsed();

        let outcome = sample
            .map_err(CalibrationError::from)
            .and_then(|s| apply_sample(&mut data, s, now, &self.settings));

        match outcome {
            Ok(which) => {
                info!(
                    point = %which,
                    kvalue_low = data.kvalue_low,
                    kvalue_high = data.kvalue_high,
                    "ec calibration complete"
                );
                if let Err(e) = save(&self.file, &data) {
                    warn!("calibration not persisted: {e:#}");
                }
            }
            Err(e) => {
                warn!("ec calibration failed: {e}");
                data.fail(e.to_string());
            }
        }

        data
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Load the calibration file. A missing or unreadable file yields defaults.
pub fn load(path: impl AsRef<Path>) -> CalibrationData {
    let path = path.as_ref();
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no calibration file, using defaults");
            return CalibrationData::default();
        }
        Err(e) => {
            warn!(path = %path.display(), "failed to read calibration file: {e}");
            return CalibrationData::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(data) => {
            info!(path = %path.display(), "calibration loaded");
            data
        }
        Err(e) => {
            warn!(path = %path.display(), "invalid calibration file, using defaults: {e}");
            CalibrationData::default()
        }
    }
}

/// Write the calibration file (temp file + rename).
pub fn save(path: impl AsRef<Path>, data: &CalibrationData) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(data).context("failed to encode calibration")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// EC read-out
// ---------------------------------------------------------------------------

/// Converts probe voltages to temperature-compensated EC (mS/cm) using the
/// calibrated k-values. Keeps the k-value currently in use so readings near
/// the switch-over point don't flap between the two.
#[derive(Debug, Clone)]
pub struct EcConverter {
    kvalue: f64,
}

impl EcConverter {
    pub fn new(data: &CalibrationData) -> Self {
        Self {
            kvalue: data.kvalue_low,
        }
    }

    pub fn read_ec(&mut self, voltage: f64, temperature: f64, data: &CalibrationData) -> f64 {
        let raw = raw_ec(voltage);
        let estimate = raw * self.kvalue;
        if estimate > KVALUE_HIGH_SWITCH {
            self.kvalue = data.kvalue_high;
        } else if estimate < KVALUE_LOW_SWITCH {
            self.kvalue = data.kvalue_low;
        }
        raw * self.kvalue / (1.0 + TEMPERATURE_COEFFICIENT * (temperature - REFERENCE_TEMPERATURE))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
