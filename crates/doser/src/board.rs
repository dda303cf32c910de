//! DFRobot DFR0566 IO expansion board over I2C: servo PWM for the dosing
//! pump and the ADC channel the EC probe is wired to.
//!
//! The register helpers are plain functions so they can be tested on any
//! machine; the driver itself needs the `hardware` feature (rppal).

#[cfg(feature = "hardware")]
use tracing::error;
#[cfg(not(feature = "hardware"))]
use tracing::warn;

use crate::config::Config;
use crate::probe::{EcProbe, SimProbe};
use crate::pump::Pump;

// ── DFR0566 register addresses ──────────────────────────────────────────────

#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
mod reg {
    pub const PID: u8 = 0x01;
    pub const VID: u8 = 0x02;
    pub const PWM_CONTROL: u8 = 0x03;
    pub const PWM_FREQ: u8 = 0x04;
    /// Two bytes per channel starting here.
    pub const PWM_DUTY1: u8 = 0x06;
    pub const ADC_CTRL: u8 = 0x0e;
    /// Two bytes per channel starting here.
    pub const ADC_VAL1: u8 = 0x0f;
}

/// Identity reported by a genuine board.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
const BOARD_PID: u8 = 0xdf;
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
const BOARD_VID: u8 = 0x10;

/// Hobby servos expect a 50 Hz frame.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
const SERVO_FREQ_HZ: u16 = 50;

// ── Register helpers ────────────────────────────────────────────────────────

#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
fn pwm_duty_register(channel: u8) -> u8 {
    reg::PWM_DUTY1 + (channel - 1) * 2
}

#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
fn adc_register(channel: u8) -> u8 {
    reg::ADC_VAL1 + (channel - 1) * 2
}

/// Duty cycle (percent) for a servo angle: 0.5 ms pulse at 0, 2.5 ms at 180,
/// in a 20 ms frame.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
fn servo_duty(angle: u8) -> f64 {
    let pulse_ms = 0.5 + f64::from(angle.min(180)) / 90.0;
    pulse_ms / 20.0 * 100.0
}

/// The board takes duty as whole percent plus one decimal digit.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
fn duty_bytes(duty: f64) -> [u8; 2] {
    let whole = duty.trunc() as u8;
    let tenths = ((duty * 10.0).round() as u32 % 10) as u8;
    [whole, tenths]
}

#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
fn adc_value(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "hardware")]
mod hw {
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, ensure, Context, Result};
    use rppal::i2c::I2c;
    use tracing::{debug, info};

    use super::*;
    use crate::pump::{Servo, NEUTRAL_ANGLE};

    /// One handle to the board, shared by the servo and ADC channels.
    pub type SharedBoard = Arc<Mutex<ExpansionBoard>>;

    pub struct ExpansionBoard {
        i2c: I2c,
    }

    impl ExpansionBoard {
        /// Open `bus`, check the board identity, and enable servo PWM and
        /// the ADC.
        pub fn open(bus: u8, addr: u16) -> Result<Self> {
            let mut i2c = I2c::with_bus(bus).with_context(|| format!("failed to open i2c bus {bus}"))?;
            i2c.set_slave_address(addr)
                .with_context(|| format!("failed to select i2c address {addr:#04x}"))?;

            let mut board = Self { i2c };
            board.identify()?;

            // Frequency can only change with PWM stopped.
            board.write(reg::PWM_CONTROL, &[0x00])?;
            board.write(reg::PWM_FREQ, &SERVO_FREQ_HZ.to_be_bytes())?;
            board.write(reg::PWM_CONTROL, &[0x01])?;
            board.write(reg::ADC_CTRL, &[0x01])?;

            info!(
                bus,
                addr = format_args!("0x{addr:02x}"),
                "dfr0566 expansion board initialised"
            );
            Ok(board)
        }

        fn identify(&mut self) -> Result<()> {
            let mut pid = [0u8; 1];
            let mut vid = [0u8; 1];
            self.read(reg::PID, &mut pid)?;
            self.read(reg::VID, &mut vid)?;
            ensure!(
                pid[0] == BOARD_PID && vid[0] == BOARD_VID,
                "unexpected board identity pid={:#04x} vid={:#04x}",
                pid[0],
                vid[0]
            );
            Ok(())
        }

        fn write(&mut self, register: u8, data: &[u8]) -> Result<()> {
            self.i2c
                .block_write(register, data)
                .with_context(|| format!("i2c write to register {register:#04x} failed"))
        }

        fn read(&mut self, register: u8, buf: &mut [u8]) -> Result<()> {
            self.i2c
                .block_read(register, buf)
                .with_context(|| format!("i2c read from register {register:#04x} failed"))
        }

        pub fn set_servo(&mut self, channel: u8, angle: u8) -> Result<()> {
            let duty = servo_duty(angle);
            debug!(channel, angle, duty, "servo move");
            self.write(pwm_duty_register(channel), &duty_bytes(duty))
        }

        pub fn read_adc(&mut self, channel: u8) -> Result<u16> {
            let mut buf = [0u8; 2];
            self.read(adc_register(channel), &mut buf)?;
            Ok(adc_value(buf))
        }
    }

    fn lock(board: &SharedBoard) -> Result<std::sync::MutexGuard<'_, ExpansionBoard>> {
        board.lock().map_err(|_| anyhow!("expansion board lock poisoned"))
    }

    pub struct BoardServo {
        pub board: SharedBoard,
        pub channel: u8,
    }

    impl Servo for BoardServo {
        fn move_to(&mut self, angle: u8) -> Result<()> {
            lock(&self.board)?.set_servo(self.channel, angle)
        }
    }

    impl BoardServo {
        pub fn stop(&mut self) -> Result<()> {
            self.move_to(NEUTRAL_ANGLE)
        }
    }

    /// EC probe on an ADC channel. The count is used as millivolts, which is
    /// what the probe's raw EC formula expects.
    pub struct BoardAdc {
        pub board: SharedBoard,
        pub channel: u8,
    }

    impl EcProbe for BoardAdc {
        fn read_voltage(&mut self) -> Result<f64> {
            let raw = lock(&self.board)?.read_adc(self.channel)?;
            Ok(f64::from(raw))
        }
    }
}

// ── Selection ───────────────────────────────────────────────────────────────

/// Build the pump and EC probe. Falls back to the mock pump and simulated
/// probe when the board is not compiled in or cannot be opened.
pub fn connect(cfg: &Config) -> (Pump, Box<dyn EcProbe>) {
    #[cfg(feature = "hardware")]
    match open_hardware(cfg) {
        Ok(parts) => return parts,
        Err(e) => error!(
            "expansion board unavailable, using mock pump and simulated probe: {e:#}"
        ),
    }

    #[cfg(not(feature = "hardware"))]
    warn!("built without hardware support, using mock pump and simulated probe");

    simulated(cfg)
}

#[cfg(feature = "hardware")]
fn open_hardware(cfg: &Config) -> anyhow::Result<(Pump, Box<dyn EcProbe>)> {
    use std::sync::{Arc, Mutex};

    let board = Arc::new(Mutex::new(hw::ExpansionBoard::open(
        cfg.pump.i2c_bus,
        cfg.pump.address,
    )?));

    let mut servo = hw::BoardServo {
        board: Arc::clone(&board),
        channel: cfg.pump.channel,
    };
    // Never start with the pump running from a previous crash.
    servo.stop()?;

    let adc = hw::BoardAdc {
        board,
        channel: cfg.probe.adc_channel,
    };
    Ok((Pump::new(Box::new(servo), false), Box::new(adc)))
}

fn simulated(cfg: &Config) -> (Pump, Box<dyn EcProbe>) {
    (
        Pump::mock(),
        Box::new(SimProbe::new(cfg.probe.sim_voltage, cfg.probe.sim_noise)),
    )
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Register addressing --------------------------------------------------

    #[test]
    fn pwm_duty_registers_are_two_apart() {
        assert_eq!(pwm_duty_register(1), 0x06);
        assert_eq!(pwm_duty_register(2), 0x08);
        assert_eq!(pwm_duty_register(4), 0x0c);
    }

    #[test]
    fn adc_registers_are_two_apart() {
        assert_eq!(adc_register(1), 0x0f);
        assert_eq!(adc_register(2), 0x11);
        assert_eq!(adc_register(4), 0x15);
    }

    // -- Servo duty -----------------------------------------------------------

    #[test]
    fn servo_duty_forward_is_2_5_percent() {
        assert!((servo_duty(0) - 2.5).abs() < 1e-9);
        assert_eq!(duty_bytes(servo_duty(0)), [2, 5]);
    }

    #[test]
    fn servo_duty_neutral_is_7_5_percent() {
        assert!((servo_duty(90) - 7.5).abs() < 1e-9);
        assert_eq!(duty_bytes(servo_duty(90)), [7, 5]);
    }

    #[test]
    fn servo_duty_clamps_angle() {
        assert_eq!(servo_duty(255), servo_duty(180));
        assert_eq!(duty_bytes(servo_duty(180)), [12, 5]);
    }

    #[test]
    fn duty_bytes_whole_percent() {
        assert_eq!(duty_bytes(10.0), [10, 0]);
    }

    // -- ADC ------------------------------------------------------------------

    #[test]
    fn adc_value_is_big_endian() {
        assert_eq!(adc_value([0x00, 0xc5]), 197);
        assert_eq!(adc_value([0x0f, 0xff]), 4095);
    }

    // -- connect --------------------------------------------------------------

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn connect_without_hardware_uses_mock() {
        let mut cfg = Config::default();
        cfg.probe.sim_voltage = 200.0;
        cfg.probe.sim_noise = 0.0;

        let (pump, mut probe) = connect(&cfg);

        assert!(pump.is_mock());
        assert_eq!(probe.read_voltage().unwrap(), 200.0);
    }
}
