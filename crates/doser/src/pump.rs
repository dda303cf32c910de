//! Peristaltic dosing pump driven by a continuous-rotation servo.
//!
//! Angle 0 is full speed forward, 90 is stopped. The hardware servo channel
//! lives in `board.rs` behind the `hardware` feature; [`MockServo`] records
//! moves and logs them when no board is available.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info};

pub const FORWARD_ANGLE: u8 = 0;
pub const NEUTRAL_ANGLE: u8 = 90;

/// Something that can hold a servo at an angle (0-180).
pub trait Servo: Send {
    fn move_to(&mut self, angle: u8) -> Result<()>;
}

/// A failed pump run. `Stop` means the pump did run forward for the whole
/// duration, so the dose reached the reservoir.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("failed to start pump: {0:#}")]
    Start(anyhow::Error),
    #[error("failed to stop pump after {ran:?}: {cause:#}")]
    Stop { ran: Duration, cause: anyhow::Error },
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

pub struct Pump {
    servo: Box<dyn Servo>,
    mock: bool,
}

impl Pump {
    pub fn new(servo: Box<dyn Servo>, mock: bool) -> Self {
        Self { servo, mock }
    }

    pub fn mock() -> Self {
        Self::new(Box::new(MockServo::default()), true)
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    /// Run the pump forward for `duration`, then stop it.
    ///
    /// The stop is guaranteed: if this future is dropped mid-dose the guard
    /// still moves the servo back to neutral.
    pub async fn run(&mut self, duration: Duration) -> Result<(), PumpError> {
        info!(
            duration_sec = duration.as_secs_f64(),
            mock = self.mock,
            "dosing"
        );

        self.servo
            .move_to(FORWARD_ANGLE)
            .map_err(PumpError::Start)?;
        let guard = NeutralGuard {
            servo: &mut self.servo,
            armed: true,
        };

        sleep(duration).await;

        guard
            .release()
            .map_err(|cause| PumpError::Stop { ran: duration, cause })
    }
}

/// Returns the servo to neutral when dropped unless released explicitly.
struct NeutralGuard<'a> {
    servo: &'a mut Box<dyn Servo>,
    armed: bool,
}

impl NeutralGuard<'_> {
    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.servo.move_to(NEUTRAL_ANGLE)
    }
}

impl Drop for NeutralGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.servo.move_to(NEUTRAL_ANGLE) {
            error!("failed to stop pump after interrupted dose: {e:#}");
        }
    }
}

// ---------------------------------------------------------------------------
// Mock servo (development: no hardware, logs moves)
// ---------------------------------------------------------------------------

/// In-memory servo. Clones share the same move history.
#[derive(Clone, Default)]
pub struct MockServo {
    moves: Arc<Mutex<Vec<u8>>>,
}

impl MockServo {
    /// Every angle requested so far, oldest first.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn moves(&self) -> Vec<u8> {
        self.moves.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl Servo for MockServo {
    fn move_to(&mut self, angle: u8) -> Result<()> {
        info!(angle, "[mock-servo] move");
        if let Ok(mut moves) = self.moves.lock() {
            moves.push(angle);
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
