//! TOML config file loading and validation.
//!
//! Every field has a default, so an empty file is a valid config. Unknown
//! keys are rejected to catch typos early.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::calibration::{
    CalibrationSettings, DEFAULT_VALIDITY_DAYS, HIGH_BUFFER_SOLUTION, HIGH_RAW_EC_RANGE,
    LOW_BUFFER_SOLUTION, LOW_RAW_EC_RANGE,
};
use crate::sampler::{VoltageSampler, DEFAULT_MAX_STDEV, DEFAULT_SAMPLES};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// DFR0566 servo and ADC channels are numbered 1-4.
const BOARD_CHANNELS: std::ops::RangeInclusive<u8> = 1..=4;

/// Ten years. Larger values overflow `time::Duration::days`.
const MAX_VALIDITY_DAYS: i64 = 3650;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub controller: ControllerConfig,
    pub pump: PumpConfig,
    pub probe: ProbeConfig,
    pub calibration: CalibrationConfig,
    pub state: StateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mqtt: MqttConfig::default(),
            web: WebConfig::default(),
            controller: ControllerConfig::default(),
            pump: PumpConfig::default(),
            probe: ProbeConfig::default(),
            calibration: CalibrationConfig::default(),
            state: StateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
    /// Prefix of the controller's own topics (`<prefix>/control`, ...).
    pub topic_prefix: String,
    /// Full topic the EC reading arrives on. Not prefixed.
    pub ec_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hydro-doser".to_string(),
            username: None,
            password: None,
            keep_alive_sec: 30,
            topic_prefix: "hydro".to_string(),
            ec_topic: "sensors/sensor/ec1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub loop_delay_sec: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { loop_delay_sec: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PumpConfig {
    pub i2c_bus: u8,
    pub address: u16,
    pub channel: u8,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            address: 0x10,
            channel: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    pub adc_channel: u8,
    pub samples: usize,
    pub sample_interval_ms: u64,
    pub max_stdev: f64,
    /// Solution temperature used for read-out and as the default
    /// calibration temperature (no temperature probe yet).
    pub temperature: f64,
    /// Publish the converted EC on the EC topic this often. Off when unset.
    pub publish_interval_sec: Option<u64>,
    /// Simulated probe level when the board is unavailable.
    pub sim_voltage: f64,
    pub sim_noise: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            adc_channel: 1,
            samples: DEFAULT_SAMPLES,
            sample_interval_ms: 1000,
            max_stdev: DEFAULT_MAX_STDEV,
            temperature: 25.0,
            publish_interval_sec: None,
            sim_voltage: 196.8,
            sim_noise: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    pub file: PathBuf,
    pub validity_days: i64,
    pub low_buffer: f64,
    pub high_buffer: f64,
    pub low_raw_ec_range: [f64; 2],
    pub high_raw_ec_range: [f64; 2],
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("ec_config.json"),
            validity_days: DEFAULT_VALIDITY_DAYS,
            low_buffer: LOW_BUFFER_SOLUTION,
            high_buffer: HIGH_BUFFER_SOLUTION,
            low_raw_ec_range: LOW_RAW_EC_RANGE,
            high_raw_ec_range: HIGH_RAW_EC_RANGE,
        }
    }
}

/// Initial control parameters. All of them can be changed at runtime over
/// MQTT or HTTP; changes are not written back.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub control: bool,
    pub target_ec: f64,
    pub dose_duration: u64,
    pub equilibration_time: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            control: false,
            target_ec: 1.8,
            dose_duration: 5,
            equilibration_time: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs(self.controller.loop_delay_sec)
    }

    pub fn publish_interval(&self) -> Option<Duration> {
        self.probe.publish_interval_sec.map(Duration::from_secs)
    }

    pub fn sampler(&self) -> VoltageSampler {
        VoltageSampler {
            samples: self.probe.samples,
            interval: Duration::from_millis(self.probe.sample_interval_ms),
            max_stdev: self.probe.max_stdev,
        }
    }

    pub fn calibration_settings(&self) -> CalibrationSettings {
        let c = &self.calibration;
        CalibrationSettings {
            low_buffer: c.low_buffer,
            high_buffer: c.high_buffer,
            low_range: c.low_raw_ec_range,
            high_range: c.high_raw_ec_range,
            validity: time::Duration::days(c.validity_days),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole config. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            errors.push(format!(
                "log_level '{}' is not one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        self.validate_mqtt(&mut errors);
        self.validate_hardware(&mut errors);
        self.validate_probe(&mut errors);
        self.validate_calibration(&mut errors);
        self.validate_state(&mut errors);

        if self.web.host.trim().is_empty() {
            errors.push("web.host is empty".to_string());
        }
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
        if self.controller.loop_delay_sec == 0 {
            errors.push("controller.loop_delay_sec must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        } else if m.client_id.starts_with(' ') {
            errors.push(format!(
                "mqtt.client_id '{}' must not start with a space",
                m.client_id
            ));
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password is set without mqtt.username".to_string());
        }
        if m.keep_alive_sec == 0 || m.keep_alive_sec > u16::MAX as u64 {
            errors.push(format!(
                "mqtt.keep_alive_sec {} out of range [1, {}]",
                m.keep_alive_sec,
                u16::MAX
            ));
        }

        for (name, topic) in [("topic_prefix", &m.topic_prefix), ("ec_topic", &m.ec_topic)] {
            if topic.trim().is_empty() {
                errors.push(format!("mqtt.{name} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("mqtt.{name} '{topic}' must not contain wildcards"));
            }
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let p = &self.pump;

        // 7-bit addresses outside the reserved ranges.
        if !(0x08..=0x77).contains(&p.address) {
            errors.push(format!(
                "pump.address {:#04x} is not a valid I2C address (allowed: 0x08-0x77)",
                p.address
            ));
        }
        if !BOARD_CHANNELS.contains(&p.channel) {
            errors.push(format!("pump.channel {} out of range [1, 4]", p.channel));
        }
        if !BOARD_CHANNELS.contains(&self.probe.adc_channel) {
            errors.push(format!(
                "probe.adc_channel {} out of range [1, 4]",
                self.probe.adc_channel
            ));
        }
    }

    fn validate_probe(&self, errors: &mut Vec<String>) {
        let p = &self.probe;

        if p.samples < 2 {
            errors.push(format!("probe.samples must be at least 2, got {}", p.samples));
        }
        if p.sample_interval_ms == 0 {
            errors.push("probe.sample_interval_ms must be positive".to_string());
        }
        if !(p.max_stdev.is_finite() && p.max_stdev > 0.0) {
            errors.push(format!("probe.max_stdev must be positive, got {}", p.max_stdev));
        }
        if !p.temperature.is_finite() {
            errors.push(format!("probe.temperature {} is not a number", p.temperature));
        }
        if p.publish_interval_sec == Some(0) {
            errors.push("probe.publish_interval_sec must be positive when set".to_string());
        }
        if !(p.sim_voltage.is_finite() && p.sim_voltage >= 0.0) {
            errors.push(format!(
                "probe.sim_voltage must be non-negative, got {}",
                p.sim_voltage
            ));
        }
        if !(p.sim_noise.is_finite() && p.sim_noise >= 0.0) {
            errors.push(format!(
                "probe.sim_noise must be non-negative, got {}",
                p.sim_noise
            ));
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let c = &self.calibration;

        if c.file.as_os_str().is_empty() {
            errors.push("calibration.file is empty".to_string());
        }
        if !(1..=MAX_VALIDITY_DAYS).contains(&c.validity_days) {
            errors.push(format!(
                "calibration.validity_days {} out of range [1, {MAX_VALIDITY_DAYS}]",
                c.validity_days
            ));
        }

        for (name, buffer) in [("low_buffer", c.low_buffer), ("high_buffer", c.high_buffer)] {
            if !(buffer.is_finite() && buffer > 0.0) {
                errors.push(format!("calibration.{name} must be positive, got {buffer}"));
            }
        }

        let ranges = [
            ("low_raw_ec_range", c.low_raw_ec_range),
            ("high_raw_ec_range", c.high_raw_ec_range),
        ];
        for (name, [lo, hi]) in ranges {
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                errors.push(format!(
                    "calibration.{name} [{lo}, {hi}] must be an increasing pair"
                ));
            }
        }
        if c.low_raw_ec_range[1] > c.high_raw_ec_range[0] {
            errors.push(format!(
                "calibration.low_raw_ec_range overlaps high_raw_ec_range ({} > {})",
                c.low_raw_ec_range[1], c.high_raw_ec_range[0]
            ));
        }
    }

    fn validate_state(&self, errors: &mut Vec<String>) {
        let s = &self.state;

        if !(s.target_ec.is_finite() && s.target_ec >= 0.0) {
            errors.push(format!(
                "state.target_ec must be non-negative, got {}",
                s.target_ec
            ));
        }
        if s.dose_duration == 0 {
            errors.push("state.dose_duration must be positive".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
