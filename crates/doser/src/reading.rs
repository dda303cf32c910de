//! Periodic EC probe publisher.
//!
//! Reads the probe, converts the voltage with the current calibration and
//! publishes the EC on the EC topic. The controller picks the value up from
//! the broker like any other EC source, so an external sensor bridge and
//! this task are interchangeable.

use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::calibration::EcConverter;
use crate::probe::SharedProbe;
use crate::state::SharedState;

pub struct EcPublisher {
    probe: SharedProbe,
    shared: SharedState,
    client: AsyncClient,
    topic: String,
    temperature: f64,
    converter: Option<EcConverter>,
}

impl EcPublisher {
    pub fn new(
        probe: SharedProbe,
        shared: SharedState,
        client: AsyncClient,
        topic: String,
        temperature: f64,
    ) -> Self {
        Self {
            probe,
            shared,
            client,
            topic,
            temperature,
            converter: None,
        }
    }

    /// Take one probe reading and convert it to EC (mS/cm).
    ///
    /// Waits for the probe if a calibration run currently holds it.
    pub async fn read_ec(&mut self) -> Result<f64> {
        let voltage = {
            let mut probe = self.probe.lock().await;
            probe.read_voltage().context("probe read failed")?
        };
        let calibration = self.shared.read().await.calibration.clone();
        let converter = self
            .converter
            .get_or_insert_with(|| EcConverter::new(&calibration));
        Ok(converter.read_ec(voltage, self.temperature, &calibration))
    }

    /// Read and publish one EC value.
    pub async fn publish_once(&mut self) -> Result<f64> {
        let ec = self.read_ec().await?;
        self.client
            .try_publish(&self.topic, QoS::AtMostOnce, false, format!("{ec:.3}"))
            .with_context(|| format!("failed to publish ec to {}", self.topic))?;
        debug!(ec, topic = %self.topic, "ec published");
        Ok(ec)
    }

    /// Publish every `every` until the process exits.
    pub async fn run(mut self, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            topic = %self.topic,
            interval_sec = every.as_secs_f64(),
            "ec publisher started"
        );

        loop {
            ticker.tick().await;
            if let Err(e) = self.publish_once().await {
                warn!("ec reading skipped: {e:#}");
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
    use crate::probe::{shared as shared_probe, ScriptedProbe};
    use crate::state::AppState;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn test_shared(calibration: CalibrationData) -> SharedState {
        Arc::new(RwLock::new(AppState::new(
            &StateConfig::default(),
            25.0,
            calibration,
            time::Duration::days(28),
        )))
    }

    fn test_mqtt() -> (AsyncClient, rumqttc::EventLoop) {
        let opts = rumqttc::MqttOptions::new("test-reading", "127.0.0.1", 1883);
        AsyncClient::new(opts, 10)
    }

    fn publisher(readings: &[f64], calibration: CalibrationData, client: AsyncClient) -> EcPublisher {
        EcPublisher::new(
            shared_probe(ScriptedProbe::new(readings)),
            test_shared(calibration),
            client,
            "sensors/sensor/ec1".to_string(),
            25.0,
        )
    }

    // -- read_ec ----------------------------------------------------------------

    #[tokio::test]
    async fn uncalibrated_reading_is_raw_ec() {
        let (client, _el) = test_mqtt();
        let mut p = publisher(&[196.8], CalibrationData::default(), client);

        let ec = p.read_ec().await.unwrap();
        assert!((ec - 1.2).abs() < 1e-9, "ec {ec}");
    }

    #[tokio::test]
    async fn reading_uses_calibrated_kvalue() {
        let calibration = CalibrationData {
            kvalue_low: 1.18,
            ..CalibrationData::default()
        };
        let (client, _el) = test_mqtt();
        let mut p = publisher(&[196.8], calibration, client);

        let ec = p.read_ec().await.unwrap();
        assert!((ec - 1.416).abs() < 1e-9, "ec {ec}");
    }

    #[tokio::test]
    async fn reading_picks_up_new_calibration() {
        let (client, _el) = test_mqtt();
        let mut p = publisher(&[196.8, 196.8], CalibrationData::default(), client);
        p.read_ec().await.unwrap();

        p.shared.write().await.calibration.kvalue_low = 1.5;

        let ec = p.read_ec().await.unwrap();
        assert!((ec - 1.8).abs() < 1e-9, "ec {ec}");
    }

    // -- publish_once -----------------------------------------------------------

    #[tokio::test]
    async fn publish_once_returns_published_value() {
        let (client, _el) = test_mqtt();
        let mut p = publisher(&[196.8], CalibrationData::default(), client);
        let ec = p.publish_once().await.unwrap();
        assert!((ec - 1.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn publish_once_probe_failure() {
        let (client, _el) = test_mqtt();
        let mut p = publisher(&[], CalibrationData::default(), client);
        let err = p.publish_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("probe read failed"));
    }

    #[tokio::test]
    async fn publish_once_closed_client() {
        let (client, el) = test_mqtt();
        drop(el);
        let mut p = publisher(&[196.8], CalibrationData::default(), client);
        let err = p.publish_once().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to publish ec"));
    }
}
