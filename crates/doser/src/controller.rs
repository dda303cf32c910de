//! EC dosing controller: one decision per tick, in strict priority order.
//!
//! ```text
//! tick ──▶ calibrate requested? ──yes──▶ Calibrate (take request)
//!                │ no
//!                ▼
//!          manual dose? ────────yes──▶ ManualDose (take request)
//!                │ no
//!                ▼
//!          control && ec < target && cooled down? ──yes──▶ AutoDose
//!                │ no
//!                ▼
//!              Idle
//! ```
//!
//! The decision is a pure function of the state and the clock. The state
//! lock is only taken to decide and to write results, never while the
//! pump runs or the probe is sampled. Requests are taken when decided, so
//! one that arrives mid-action waits for the next tick.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::calibration::Calibrator;
use crate::mqtt::StatePublisher;
use crate::pump::{Pump, PumpError};
use crate::state::{AppState, SharedState};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Idle,
    Calibrate { temperature: f64 },
    ManualDose { duration: u64 },
    AutoDose { duration: u64 },
}

/// Whether enough time has passed since the last dose. Never dosed counts
/// as cooled down.
pub fn cooldown_elapsed(
    last_dose_time: Option<OffsetDateTime>,
    equilibration_time: u64,
    now: OffsetDateTime,
) -> bool {
    let Some(last) = last_dose_time else {
        return true;
    };
    let wait = time::Duration::seconds(i64::try_from(equilibration_time).unwrap_or(i64::MAX));
    now - last > wait
}

pub fn decide(st: &AppState, now: OffsetDateTime) -> Action {
    if st.calibrate_requested {
        return Action::Calibrate {
            temperature: st.calibration_temperature,
        };
    }
    if st.manual_dose {
        return Action::ManualDose {
            duration: st.manual_dose_duration,
        };
    }
    if st.control
        && st.current_ec < st.target_ec
        && cooldown_elapsed(st.last_dose_time, st.equilibration_time, now)
    {
        return Action::AutoDose {
            duration: st.dose_duration,
        };
    }
    Action::Idle
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct Controller {
    shared: SharedState,
    pump: Pump,
    calibrator: Calibrator,
    publisher: StatePublisher,
    loop_delay: Duration,
}

impl Controller {
    pub fn new(
        shared: SharedState,
        pump: Pump,
        calibrator: Calibrator,
        publisher: StatePublisher,
        loop_delay: Duration,
    ) -> Self {
        Self {
            shared,
            pump,
            calibrator,
            publisher,
            loop_delay,
        }
    }

    /// Run the control loop forever. Intended to be `tokio::spawn`-ed from
    /// main.
    pub async fn run(mut self) {
        let mut ticker = interval(self.loop_delay);
        // A long dose or calibration delays the next tick instead of
        // triggering a burst of catch-up ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            loop_delay_sec = self.loop_delay.as_secs_f64(),
            mock_pump = self.pump.is_mock(),
            "controller started"
        );

        loop {
            ticker.tick().await;
            self.tick(OffsetDateTime::now_utc()).await;
        }
    }

    /// Evaluate the state once and carry out the chosen action.
    pub async fn tick(&mut self, now: OffsetDateTime) -> Action {
        let (action, calibration) = {
            let mut st = self.shared.write().await;
            let action = decide(&st, now);
            let calibration = match action {
                Action::Calibrate { .. } => Some(st.take_calibration_request()),
                Action::ManualDose { .. } => {
                    st.take_manual_dose();
                    None
                }
                Action::Idle | Action::AutoDose { .. } => None,
            };
            (action, calibration)
        };

        match &action {
            Action::Idle => {}
            Action::Calibrate { temperature } => {
                info!(temperature, "calibrating ec probe");
                let existing = calibration.unwrap_or_default();
                let data = self.calibrator.calibrate(existing, *temperature, now).await;
                self.shared.write().await.finish_calibration(data);
            }
            Action::ManualDose { duration } => self.dose(*duration, true, now).await,
            Action::AutoDose { duration } => self.dose(*duration, false, now).await,
        }

        action
    }

    async fn dose(&mut self, duration: u64, manual: bool, started: OffsetDateTime) {
        let kind = if manual { "manual" } else { "automatic" };
        let clock = Instant::now();
        let result = self.pump.run(Duration::from_secs(duration)).await;
        let completed = started + clock.elapsed();

        let mut st = self.shared.write().await;
        match result {
            Ok(()) => {
                st.record_dose(duration, completed, manual);
                info!(
                    kind,
                    duration_sec = duration,
                    dose_count = st.dose_count,
                    total_dose_time = st.total_dose_time,
                    ec = st.current_ec,
                    "dose complete"
                );
                self.publisher.publish(&st, completed);
            }
            // The pump ran for the full duration, so the dose counts and the
            // cooldown starts.
            Err(e @ PumpError::Stop { .. }) => {
                st.record_dose(duration, completed, manual);
                error!(kind, duration_sec = duration, "{e}");
                st.record_error(format!("{kind} dose: {e}"));
                self.publisher.publish(&st, completed);
            }
            Err(e @ PumpError::Start(_)) => {
                warn!(kind, duration_sec = duration, "dose failed: {e}");
                st.record_error(format!("{kind} dose failed: {e}"));
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
