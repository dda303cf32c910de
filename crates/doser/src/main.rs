mod board;
mod calibration;
mod config;
mod controller;
mod mqtt;
mod probe;
mod pump;
mod reading;
mod sampler;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use calibration::Calibrator;
use controller::Controller;
use mqtt::{StatePublisher, Topics};
use probe::SharedProbe;
use reading::EcPublisher;
use state::AppState;

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    init_tracing(&cfg.log_level);
    info!(config = %config_path, "hydro-doser starting");

    // ── Calibration record ──────────────────────────────────────────
    let settings = cfg.calibration_settings();
    let mut calibration = calibration::load(&cfg.calibration.file);
    calibration.refresh(OffsetDateTime::now_utc(), settings.validity);
    info!(
        status = ?calibration.status,
        kvalue_low = calibration.kvalue_low,
        kvalue_high = calibration.kvalue_high,
        "{}",
        calibration.message
    );

    // ── Pump + probe ────────────────────────────────────────────────
    let (pump, probe) = board::connect(&cfg);
    let probe: SharedProbe = Arc::new(Mutex::new(probe));

    // ── Shared state ────────────────────────────────────────────────
    let shared = Arc::new(RwLock::new(AppState::new(
        &cfg.state,
        cfg.probe.temperature,
        calibration,
        settings.validity,
    )));
    {
        let mut st = shared.write().await;
        st.record_system(format!("doser started (mock pump: {})", pump.is_mock()));
    }

    // ── MQTT client ─────────────────────────────────────────────────
    let topics = Topics::new(&cfg.mqtt.topic_prefix, &cfg.mqtt.ec_topic);
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    if let Some(username) = &cfg.mqtt.username {
        mqttoptions.set_credentials(username, cfg.mqtt.password.as_deref().unwrap_or_default());
    }
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Web server ──────────────────────────────────────────────────
    let web_state = Arc::clone(&shared);
    let web_cfg = cfg.web.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, &web_cfg).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Controller ──────────────────────────────────────────────────
    let calibrator = Calibrator::new(
        Arc::clone(&probe),
        cfg.sampler(),
        settings,
        cfg.calibration.file.clone(),
    );
    let controller = Controller::new(
        Arc::clone(&shared),
        pump,
        calibrator,
        StatePublisher::new(client.clone(), &topics),
        cfg.loop_delay(),
    );
    tokio::spawn(controller.run());

    // ── EC publisher (optional) ─────────────────────────────────────
    if let Some(every) = cfg.publish_interval() {
        let publisher = EcPublisher::new(
            probe,
            Arc::clone(&shared),
            client.clone(),
            topics.ec.clone(),
            cfg.probe.temperature,
        );
        tokio::spawn(publisher.run(every));
    }

    // ── MQTT event loop ─────────────────────────────────────────────
    info!(
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        topics = ?topics.inbound(),
        "connecting to mqtt"
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                mqtt::handle_publish(&shared, &topics, &p.topic, &p.payload).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Subscriptions do not survive a clean-session reconnect.
                for topic in topics.inbound() {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        warn!(%topic, "subscribe failed: {e}");
                    }
                }
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    // Only the first failure of an outage goes in the event log.
                    if st.mqtt_connected {
                        st.mqtt_connected = false;
                        st.record_error(format!("mqtt error: {e}"));
                    }
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// `RUST_LOG` wins when set; otherwise the configured level applies.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
