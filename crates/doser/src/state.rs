use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::calibration::{CalibrationData, CalibrationStatus};
use crate::config::StateConfig;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// EC assumed before the first reading arrives. High enough that automatic
/// dosing never fires on it.
pub const EC_SENTINEL: f64 = 999.0;

/// EC recorded when a reading cannot be parsed.
pub const INVALID_EC: f64 = -1.0;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<AppState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct AppState {
    pub started_at: Instant,
    pub mqtt_connected: bool,

    // Control parameters
    pub control: bool,
    pub target_ec: f64,
    pub dose_duration: u64,
    pub equilibration_time: u64,

    // Measurements and accumulators
    pub current_ec: f64,
    pub last_dose_time: Option<OffsetDateTime>,
    pub dose_count: u64,
    pub total_dose_time: u64,

    // One-shot commands
    pub manual_dose: bool,
    pub manual_dose_duration: u64,
    pub calibrate_requested: bool,
    pub calibration_temperature: f64,
    /// Set while the controller samples the probe for a taken request.
    pub calibrating: bool,

    pub calibration: CalibrationData,
    pub calibration_validity: time::Duration,

    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Dose,
    Calibration,
    Command,
    Error,
    System,
}

/// A subset of the control parameters. Used both as the `parameters` bus
/// payload and to report which values a command actually changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equilibration_time: Option<u64>,
}

impl Parameters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Everything the outside world can ask of the controller. Bus messages and
/// HTTP requests are both parsed into these.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    UpdateEc(f64),
    SetControl(bool),
    /// Calibrate at the given temperature, or the last one used.
    RequestCalibration { temperature: Option<f64> },
    ManualDose { duration: u64 },
    ClearManualDose,
    SetParameters(Parameters),
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub control: bool,
    pub current_ec: f64,
    pub target_ec: f64,
    pub dose_duration: u64,
    pub equilibration_time: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_dose_time: Option<OffsetDateTime>,
    pub dose_count: u64,
    pub total_dose_time: u64,
    pub manual_dose: bool,
    pub manual_dose_duration: u64,
    pub calibration_temperature: f64,
    pub calibration_status: CalibrationStatus,
    pub calibration_message: String,
    pub calibration: CalibrationData,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl AppState {
    pub fn new(
        cfg: &StateConfig,
        calibration_temperature: f64,
        calibration: CalibrationData,
        calibration_validity: time::Duration,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            control: cfg.control,
            target_ec: cfg.target_ec,
            dose_duration: cfg.dose_duration,
            equilibration_time: cfg.equilibration_time,
            current_ec: EC_SENTINEL,
            last_dose_time: None,
            dose_count: 0,
            total_dose_time: 0,
            manual_dose: false,
            manual_dose_duration: 0,
            calibrate_requested: false,
            calibration_temperature,
            calibrating: false,
            calibration,
            calibration_validity,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Apply an external command. Returns the parameter values that actually
    /// changed (empty for anything but `SetParameters`).
    pub fn apply(&mut self, cmd: Command) -> Parameters {
        match cmd {
            Command::UpdateEc(ec) => {
                debug!(ec, "ec updated");
                self.current_ec = ec;
            }
            Command::SetControl(on) => {
                if self.control != on {
                    self.control = on;
                    info!(control = on, "control mode changed");
                    let mode = if on { "control" } else { "monitor" };
                    self.push_event(EventKind::Command, format!("mode set to {mode}"));
                }
            }
            Command::RequestCalibration { temperature } => {
                if let Some(t) = temperature {
                    self.calibration_temperature = t;
                }
                self.calibrate_requested = true;
                info!(
                    temperature = self.calibration_temperature,
                    "ec calibration requested"
                );
                self.push_event(
                    EventKind::Command,
                    format!(
                        "calibration requested at {:.1} C",
                        self.calibration_temperature
                    ),
                );
            }
            Command::ManualDose { duration } => {
                self.manual_dose = true;
                self.manual_dose_duration = duration;
                info!(duration_sec = duration, "manual dose requested");
                self.push_event(
                    EventKind::Command,
                    format!("manual dose of {duration}s requested"),
                );
            }
            Command::ClearManualDose => {
                self.manual_dose = false;
                self.manual_dose_duration = 0;
            }
            Command::SetParameters(params) => {
                let changed = self.update_parameters(&params);
                if !changed.is_empty() {
                    info!(?changed, "parameters updated");
                    self.push_event(EventKind::Command, format!("parameters set: {changed:?}"));
                }
                return changed;
            }
        }
        Parameters::default()
    }

    fn update_parameters(&mut self, params: &Parameters) -> Parameters {
        let mut changed = Parameters::default();
        if let Some(v) = params.target_ec {
            if v != self.target_ec {
                self.target_ec = v;
                changed.target_ec = Some(v);
            }
        }
        if let Some(v) = params.dose_duration {
            if v != self.dose_duration {
                self.dose_duration = v;
                changed.dose_duration = Some(v);
            }
        }
        if let Some(v) = params.equilibration_time {
            if v != self.equilibration_time {
                self.equilibration_time = v;
                changed.equilibration_time = Some(v);
            }
        }
        changed
    }

    /// Record a completed pump run. `last_dose_time` never moves backwards.
    pub fn record_dose(&mut self, duration: u64, completed_at: OffsetDateTime, manual: bool) {
        self.last_dose_time = Some(match self.last_dose_time {
            Some(prev) if prev > completed_at => prev,
            _ => completed_at,
        });
        self.dose_count += 1;
        self.total_dose_time += duration;

        let kind = if manual { "manual" } else { "automatic" };
        self.push_event(
            EventKind::Dose,
            format!(
                "{kind} dose of {duration}s (total {} doses, {}s)",
                self.dose_count, self.total_dose_time
            ),
        );
    }

    /// Consume the pending manual dose request. A request made while the
    /// dose runs sets the flag again and is seen on the next tick.
    pub fn take_manual_dose(&mut self) {
        self.manual_dose = false;
    }

    /// Consume the pending calibration request and hand out the record to
    /// calibrate against.
    pub fn take_calibration_request(&mut self) -> CalibrationData {
        self.calibrate_requested = false;
        self.calibrating = true;
        self.calibration.clone()
    }

    /// Store the outcome of a calibration attempt. A request made during the
    /// attempt stays pending.
    pub fn finish_calibration(&mut self, data: CalibrationData) {
        let detail = format!("{:?}: {}", data.status, data.message);
        self.calibration = data;
        self.calibrating = false;
        self.push_event(EventKind::Calibration, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Calibration record as it should be shown right now: CALIBRATING while
    /// a request is pending, otherwise re-derived against `now`.
    pub fn calibration_view(&self, now: OffsetDateTime) -> CalibrationData {
        let mut data = self.calibration.clone();
        if self.calibrate_requested || self.calibrating {
            data.status = CalibrationStatus::Calibrating;
            data.message = "Calibrating".to_string();
        } else {
            data.refresh(now, self.calibration_validity);
        }
        data
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, now: OffsetDateTime) -> StatusResponse {
        let calibration = self.calibration_view(now);
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            control: self.control,
            current_ec: self.current_ec,
            target_ec: self.target_ec,
            dose_duration: self.dose_duration,
            equilibration_time: self.equilibration_time,
            last_dose_time: self.last_dose_time,
            dose_count: self.dose_count,
            total_dose_time: self.total_dose_time,
            manual_dose: self.manual_dose,
            manual_dose_duration: self.manual_dose_duration,
            calibration_temperature: self.calibration_temperature,
            calibration_status: calibration.status,
            calibration_message: calibration.message.clone(),
            calibration,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    /// Status snapshot without the event log, for the retained bus message.
    pub fn to_summary(&self, now: OffsetDateTime) -> StatusResponse {
        let mut status = self.to_status(now);
        status.events.clear();
        status
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPoint;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-10-19 12:00 UTC);

    fn test_state() -> AppState {
        AppState::new(
            &StateConfig::default(),
            25.0,
            CalibrationData::default(),
            time::Duration::days(28),
        )
    }

    // -- new ------------------------------------------------------------------

    #[test]
    fn new_state_uses_config_and_sentinel() {
        let cfg = StateConfig {
            control: true,
            target_ec: 2.0,
            dose_duration: 7,
            equilibration_time: 120,
        };
        let st = AppState::new(&cfg, 21.0, CalibrationData::default(), time::Duration::days(28));
        assert!(st.control);
        assert_eq!(st.target_ec, 2.0);
        assert_eq!(st.dose_duration, 7);
        assert_eq!(st.equilibration_time, 120);
        assert_eq!(st.current_ec, EC_SENTINEL);
        assert_eq!(st.calibration_temperature, 21.0);
        assert_eq!(st.last_dose_time, None);
        assert_eq!(st.dose_count, 0);
    }

    // -- apply ----------------------------------------------------------------

    #[test]
    fn apply_update_ec() {
        let mut st = test_state();
        st.apply(Command::UpdateEc(1.42));
        assert_eq!(st.current_ec, 1.42);
        assert!(st.events.is_empty(), "readings are not events");
    }

    #[test]
    fn apply_set_control_records_only_changes() {
        let mut st = test_state();
        st.apply(Command::SetControl(true));
        st.apply(Command::SetControl(true));
        assert!(st.control);
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].detail, "mode set to control");
    }

    #[test]
    fn apply_request_calibration_keeps_temperature_when_absent() {
        let mut st = test_state();
        st.apply(Command::RequestCalibration {
            temperature: Some(19.5),
        });
        st.calibrate_requested = false;
        st.apply(Command::RequestCalibration { temperature: None });
        assert!(st.calibrate_requested);
        assert_eq!(st.calibration_temperature, 19.5);
    }

    #[test]
    fn apply_manual_dose_and_clear() {
        let mut st = test_state();
        st.apply(Command::ManualDose { duration: 12 });
        assert!(st.manual_dose);
        assert_eq!(st.manual_dose_duration, 12);

        st.apply(Command::ClearManualDose);
        assert!(!st.manual_dose);
        assert_eq!(st.manual_dose_duration, 0);
    }

    #[test]
    fn apply_parameters_reports_changed_subset() {
        let mut st = test_state();
        let changed = st.apply(Command::SetParameters(Parameters {
            target_ec: Some(2.1),
            dose_duration: Some(StateConfig::default().dose_duration),
            equilibration_time: Some(600),
        }));
        assert_eq!(
            changed,
            Parameters {
                target_ec: Some(2.1),
                dose_duration: None,
                equilibration_time: Some(600),
            }
        );
        assert_eq!(st.target_ec, 2.1);
        assert_eq!(st.equilibration_time, 600);
    }

    #[test]
    fn apply_parameters_no_change_no_event() {
        let mut st = test_state();
        let changed = st.apply(Command::SetParameters(Parameters::default()));
        assert!(changed.is_empty());
        assert!(st.events.is_empty());
    }

    #[test]
    fn parameters_json_skips_unset_fields() {
        let p = Parameters {
            target_ec: Some(1.5),
            ..Parameters::default()
        };
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"target_ec":1.5}"#);
    }

    // -- record_dose ----------------------------------------------------------

    #[test]
    fn record_dose_accumulates() {
        let mut st = test_state();
        st.record_dose(5, NOW, false);
        st.record_dose(8, NOW + time::Duration::seconds(30), true);
        assert_eq!(st.dose_count, 2);
        assert_eq!(st.total_dose_time, 13);
        assert_eq!(st.last_dose_time, Some(NOW + time::Duration::seconds(30)));
        assert!(st.events.back().unwrap().detail.starts_with("manual dose of 8s"));
    }

    #[test]
    fn record_dose_never_moves_last_dose_time_back() {
        let mut st = test_state();
        st.record_dose(5, NOW, false);
        st.record_dose(5, NOW - time::Duration::minutes(1), false);
        assert_eq!(st.last_dose_time, Some(NOW));
        assert_eq!(st.dose_count, 2);
    }

    // -- calibration view -----------------------------------------------------

    #[test]
    fn pending_request_shows_calibrating() {
        let mut st = test_state();
        st.apply(Command::RequestCalibration { temperature: None });
        let status = st.to_status(NOW);
        assert_eq!(status.calibration_status, CalibrationStatus::Calibrating);
    }

    #[test]
    fn taken_request_shows_calibrating_until_finished() {
        let mut st = test_state();
        st.apply(Command::RequestCalibration { temperature: None });
        st.take_calibration_request();

        assert!(!st.calibrate_requested);
        let status = st.to_status(NOW);
        assert_eq!(status.calibration_status, CalibrationStatus::Calibrating);

        st.finish_calibration(CalibrationData::default());
        assert!(!st.calibrating);
        let status = st.to_status(NOW);
        assert_eq!(status.calibration_status, CalibrationStatus::NotCalibrated);
    }

    #[test]
    fn request_during_calibration_stays_pending() {
        let mut st = test_state();
        st.apply(Command::RequestCalibration { temperature: None });
        st.take_calibration_request();
        st.apply(Command::RequestCalibration {
            temperature: Some(20.0),
        });

        st.finish_calibration(CalibrationData::default());

        assert!(st.calibrate_requested);
        assert_eq!(st.calibration_temperature, 20.0);
    }

    #[test]
    fn finish_calibration_stores_result() {
        let mut st = test_state();
        st.apply(Command::RequestCalibration { temperature: None });
        st.take_calibration_request();

        let mut data = CalibrationData::default();
        data.kvalue_low = 1.18;
        data.point_low = CalibrationPoint {
            buffer_solution: 1.413,
            voltage: 196.8,
            temperature: 25.0,
            timestamp: Some(NOW),
            status: CalibrationStatus::Calibrated,
            message: "Calibrated".into(),
        };
        st.finish_calibration(data);

        assert!(!st.calibrate_requested);
        assert_eq!(st.calibration.kvalue_low, 1.18);
        let status = st.to_status(NOW + time::Duration::days(1));
        assert_eq!(status.calibration_status, CalibrationStatus::Calibrated);
        assert_eq!(st.events.back().unwrap().kind, EventKind::Calibration);
    }

    #[test]
    fn expired_calibration_shows_not_calibrated() {
        let mut st = test_state();
        st.calibration.point_high = CalibrationPoint {
            timestamp: Some(NOW - time::Duration::days(40)),
            status: CalibrationStatus::Calibrated,
            ..CalibrationPoint::default()
        };
        let status = st.to_status(NOW);
        assert_eq!(status.calibration_status, CalibrationStatus::NotCalibrated);
        assert!(status.calibration_message.contains("expired"));
    }

    // -- events ---------------------------------------------------------------

    #[test]
    fn event_buffer_is_bounded() {
        let mut st = test_state();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = test_state();
        st.record_system("first".into());
        st.record_error("second".into());
        let status = st.to_status(NOW);
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Error);
        assert_eq!(status.events[1].detail, "first");
    }

    #[test]
    fn summary_omits_events() {
        let mut st = test_state();
        st.record_system("started".into());
        let json = serde_json::to_value(st.to_summary(NOW)).unwrap();
        assert!(json.get("events").is_none());
        assert_eq!(json["current_ec"], 999.0);
        assert_eq!(json["calibration_status"], "NOT_CALIBRATED");
        assert!(json["last_dose_time"].is_null());
    }
}
