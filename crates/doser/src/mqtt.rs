//! Bus surface: topic names, payload parsing and state publishing.
//!
//! Everything inbound is turned into a [`Command`] and applied under the
//! state lock; the event loop itself lives in `main.rs`.

use rumqttc::{AsyncClient, QoS};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::state::{AppState, Command, Parameters, SharedState, INVALID_EC};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub ec: String,
    pub control: String,
    pub calibrate: String,
    pub manual_dose: String,
    pub parameters: String,
    pub state: String,
}

impl Topics {
    pub fn new(prefix: &str, ec_topic: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            ec: ec_topic.to_string(),
            control: format!("{prefix}/control"),
            calibrate: format!("{prefix}/calibrate"),
            manual_dose: format!("{prefix}/manual_dose"),
            parameters: format!("{prefix}/parameters"),
            state: format!("{prefix}/state"),
        }
    }

    /// Topics the controller subscribes to.
    pub fn inbound(&self) -> [&str; 5] {
        [
            &self.ec,
            &self.control,
            &self.calibrate,
            &self.manual_dose,
            &self.parameters,
        ]
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn payload_str(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

/// Parse an EC reading. Non-finite values are rejected.
pub(crate) fn parse_ec(payload: &[u8]) -> Result<f64, String> {
    let s = payload_str(payload);
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("invalid ec reading '{s}'")),
    }
}

/// Parse a "0"/"1" control payload.
pub(crate) fn parse_control(payload: &[u8]) -> Result<bool, String> {
    let s = payload_str(payload);
    match s.as_str() {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(format!("unknown control payload '{s}' (use 0/1)")),
    }
}

/// Only the EC probe can be calibrated, requested with payload "ec".
pub(crate) fn parse_calibrate(payload: &[u8]) -> Result<(), String> {
    let s = payload_str(payload);
    if s == "ec" {
        Ok(())
    } else {
        Err(format!("unknown calibration target '{s}' (use ec)"))
    }
}

/// Parse a manual dose duration in whole seconds.
pub(crate) fn parse_manual_dose(payload: &[u8]) -> Result<u64, String> {
    let s = payload_str(payload);
    s.parse::<u64>()
        .map_err(|e| format!("invalid manual dose duration '{s}': {e}"))
}

pub(crate) fn parse_parameters(payload: &[u8]) -> Result<Parameters, String> {
    let params: Parameters = serde_json::from_slice(payload)
        .map_err(|e| format!("invalid parameters json: {e}"))?;
    if let Some(ec) = params.target_ec {
        if !ec.is_finite() || ec < 0.0 {
            return Err(format!("invalid target_ec {ec}"));
        }
    }
    if params.dose_duration == Some(0) {
        return Err("dose_duration must be positive".to_string());
    }
    Ok(params)
}

/// Translate one inbound message into a command. Bad payloads are logged;
/// most are dropped, but the EC and manual-dose topics map them to an
/// explicit reset.
pub(crate) fn parse_message(topics: &Topics, topic: &str, payload: &[u8]) -> Option<Command> {
    if topic == topics.ec {
        return Some(match parse_ec(payload) {
            Ok(ec) => Command::UpdateEc(ec),
            Err(msg) => {
                warn!("{msg}");
                Command::UpdateEc(INVALID_EC)
            }
        });
    }

    let parsed = if topic == topics.control {
        parse_control(payload).map(Command::SetControl)
    } else if topic == topics.calibrate {
        parse_calibrate(payload).map(|()| Command::RequestCalibration { temperature: None })
    } else if topic == topics.manual_dose {
        match parse_manual_dose(payload) {
            Ok(duration) => Ok(Command::ManualDose { duration }),
            Err(msg) => {
                warn!("{msg}");
                return Some(Command::ClearManualDose);
            }
        }
    } else if topic == topics.parameters {
        parse_parameters(payload).map(Command::SetParameters)
    } else {
        debug!(%topic, "unhandled topic");
        return None;
    };

    match parsed {
        Ok(cmd) => Some(cmd),
        Err(msg) => {
            warn!(%topic, "{msg}");
            None
        }
    }
}

/// Apply an inbound publish to the shared state.
pub async fn handle_publish(shared: &SharedState, topics: &Topics, topic: &str, payload: &[u8]) {
    debug!(%topic, payload = %String::from_utf8_lossy(payload), "message received");
    let Some(cmd) = parse_message(topics, topic, payload) else {
        return;
    };
    let mut st = shared.write().await;
    st.apply(cmd);
}

// ---------------------------------------------------------------------------
// State publishing
// ---------------------------------------------------------------------------

/// Publishes the retained state snapshot without ever waiting on the
/// client's request queue.
#[derive(Clone)]
pub struct StatePublisher {
    client: AsyncClient,
    topic: String,
}

impl StatePublisher {
    pub fn new(client: AsyncClient, topics: &Topics) -> Self {
        Self {
            client,
            topic: topics.state.clone(),
        }
    }

    /// Publish the current snapshot. Returns false if it was dropped.
    pub fn publish(&self, st: &AppState, now: OffsetDateTime) -> bool {
        let payload = match serde_json::to_vec(&st.to_summary(now)) {
            Ok(p) => p,
            Err(e) => {
                warn!("state not published: {e}");
                return false;
            }
        };
        match self
            .client
            .try_publish(&self.topic, QoS::AtLeastOnce, true, payload)
        {
            Ok(()) => {
                debug!(topic = %self.topic, "state published");
                true
            }
            Err(e) => {
                warn!(topic = %self.topic, "state not published: {e}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationData;
    use crate::config::StateConfig;
    use rumqttc::MqttOptions;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn topics() -> Topics {
        Topics::new("hydro", "sensors/sensor/ec1")
    }

    fn test_state() -> AppState {
        AppState::new(
            &StateConfig::default(),
            25.0,
            CalibrationData::default(),
            time::Duration::days(28),
        )
    }

    fn test_shared() -> SharedState {
        Arc::new(RwLock::new(test_state()))
    }

    // -- Topics -------------------------------------------------------------

    #[test]
    fn topics_are_prefixed_except_ec() {
        let t = topics();
        assert_eq!(t.control, "hydro/control");
        assert_eq!(t.calibrate, "hydro/calibrate");
        assert_eq!(t.manual_dose, "hydro/manual_dose");
        assert_eq!(t.parameters, "hydro/parameters");
        assert_eq!(t.state, "hydro/state");
        assert_eq!(t.ec, "sensors/sensor/ec1");
    }

    #[test]
    fn topics_trailing_slash_in_prefix() {
        assert_eq!(Topics::new("farm/", "ec").control, "farm/control");
    }

    #[test]
    fn inbound_excludes_state() {
        let t = topics();
        assert!(!t.inbound().contains(&t.state.as_str()));
        assert!(t.inbound().contains(&"sensors/sensor/ec1"));
    }

    // -- parse_ec -----------------------------------------------------------

    #[test]
    fn parse_ec_valid() {
        assert_eq!(parse_ec(b"1.534"), Ok(1.534));
        assert_eq!(parse_ec(b" 2 \n"), Ok(2.0));
    }

    #[test]
    fn parse_ec_garbage() {
        assert!(parse_ec(b"unavailable").is_err());
        assert!(parse_ec(b"").is_err());
        assert!(parse_ec(b"NaN").is_err());
    }

    // -- parse_control ------------------------------------------------------

    #[test]
    fn parse_control_values() {
        assert_eq!(parse_control(b"1"), Ok(true));
        assert_eq!(parse_control(b"0"), Ok(false));
        assert!(parse_control(b"on").is_err());
        assert!(parse_control(b"2").is_err());
    }

    // -- parse_calibrate ----------------------------------------------------

    #[test]
    fn parse_calibrate_only_ec() {
        assert_eq!(parse_calibrate(b"ec"), Ok(()));
        assert!(parse_calibrate(b"ph").is_err());
    }

    // -- parse_manual_dose --------------------------------------------------

    #[test]
    fn parse_manual_dose_values() {
        assert_eq!(parse_manual_dose(b"10"), Ok(10));
        assert!(parse_manual_dose(b"2.5").is_err());
        assert!(parse_manual_dose(b"-3").is_err());
    }

    // -- parse_parameters ---------------------------------------------------

    #[test]
    fn parse_parameters_subset() {
        let p = parse_parameters(br#"{"target_ec": 2.0}"#).unwrap();
        assert_eq!(p.target_ec, Some(2.0));
        assert_eq!(p.dose_duration, None);
    }

    #[test]
    fn parse_parameters_malformed() {
        assert!(parse_parameters(b"{target_ec: 2").is_err());
        assert!(parse_parameters(br#"{"dose_duration": "five"}"#).is_err());
        assert!(parse_parameters(br#"{"target_ec": -1.0}"#).is_err());
    }

    #[test]
    fn parse_parameters_zero_dose_duration_rejected() {
        let err = parse_parameters(br#"{"dose_duration": 0, "target_ec": 2.0}"#).unwrap_err();
        assert!(err.contains("dose_duration"), "{err}");
    }

    // -- parse_message ------------------------------------------------------

    #[test]
    fn bad_ec_becomes_invalid_marker() {
        let cmd = parse_message(&topics(), "sensors/sensor/ec1", b"oops");
        assert_eq!(cmd, Some(Command::UpdateEc(INVALID_EC)));
    }

    #[test]
    fn bad_manual_dose_clears_request() {
        let cmd = parse_message(&topics(), "hydro/manual_dose", b"soon");
        assert_eq!(cmd, Some(Command::ClearManualDose));
    }

    #[test]
    fn bad_control_ignored() {
        assert_eq!(parse_message(&topics(), "hydro/control", b"yes"), None);
    }

    #[test]
    fn unknown_topic_ignored() {
        assert_eq!(parse_message(&topics(), "hydro/other", b"1"), None);
    }

    #[test]
    fn calibrate_uses_current_temperature() {
        assert_eq!(
            parse_message(&topics(), "hydro/calibrate", b"ec"),
            Some(Command::RequestCalibration { temperature: None })
        );
    }

    // -- handle_publish -----------------------------------------------------

    #[tokio::test]
    async fn handle_publish_updates_state() {
        let shared = test_shared();
        let t = topics();

        handle_publish(&shared, &t, "sensors/sensor/ec1", b"1.42").await;
        handle_publish(&shared, &t, "hydro/control", b"1").await;
        handle_publish(&shared, &t, "hydro/manual_dose", b"7").await;
        handle_publish(&shared, &t, "hydro/calibrate", b"ec").await;

        let st = shared.read().await;
        assert_eq!(st.current_ec, 1.42);
        assert!(st.control);
        assert!(st.manual_dose);
        assert_eq!(st.manual_dose_duration, 7);
        assert!(st.calibrate_requested);
    }

    #[tokio::test]
    async fn malformed_parameters_change_nothing() {
        let shared = test_shared();
        let before = {
            let st = shared.read().await;
            (st.target_ec, st.dose_duration, st.equilibration_time)
        };

        handle_publish(&shared, &topics(), "hydro/parameters", b"{\"target_ec\": ").await;

        let st = shared.read().await;
        assert_eq!(
            (st.target_ec, st.dose_duration, st.equilibration_time),
            before
        );
    }

    #[tokio::test]
    async fn parameters_apply_subset() {
        let shared = test_shared();
        handle_publish(
            &shared,
            &topics(),
            "hydro/parameters",
            br#"{"dose_duration": 9, "equilibration_time": 300}"#,
        )
        .await;

        let st = shared.read().await;
        assert_eq!(st.dose_duration, 9);
        assert_eq!(st.equilibration_time, 300);
        assert_eq!(st.target_ec, StateConfig::default().target_ec);
    }

    // -- StatePublisher -----------------------------------------------------

    /// Minimal client whose event loop is never polled, so publishes just
    /// accumulate in the request channel. The event loop must stay alive for
    /// the channel to remain open.
    fn test_mqtt(cap: usize) -> (AsyncClient, rumqttc::EventLoop) {
        let opts = MqttOptions::new("test-doser", "127.0.0.1", 1883);
        AsyncClient::new(opts, cap)
    }

    #[tokio::test]
    async fn publisher_queues_snapshot() {
        let (client, _el) = test_mqtt(10);
        let publisher = StatePublisher::new(client, &topics());

        let st = test_state();
        assert!(publisher.publish(&st, OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn publisher_full_queue_drops_message() {
        let (client, _el) = test_mqtt(1);
        let publisher = StatePublisher::new(client, &topics());
        let st = test_state();

        assert!(publisher.publish(&st, OffsetDateTime::now_utc()));
        assert!(!publisher.publish(&st, OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn publisher_closed_client_drops_message() {
        let (client, el) = test_mqtt(10);
        drop(el);
        let publisher = StatePublisher::new(client, &topics());

        assert!(!publisher.publish(&test_state(), OffsetDateTime::now_utc()));
    }
}
