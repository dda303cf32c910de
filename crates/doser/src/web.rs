use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::WebConfig;
use crate::state::{Command, Parameters, SharedState, StatusResponse};

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

// Form-style keys. Values may be JSON numbers or numeric strings.

#[derive(Debug, Default, Deserialize)]
struct ControlRequest {
    mode: Option<String>,
    #[serde(rename = "target-ec")]
    target_ec: Option<Value>,
    #[serde(rename = "dose-duration")]
    dose_duration: Option<Value>,
    #[serde(rename = "equilibration-time")]
    equilibration_time: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DoseRequest {
    #[serde(rename = "manual-dose-duration")]
    duration: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CalibrateRequest {
    #[serde(rename = "calibrate-ecprobe-temperature")]
    temperature: Option<Value>,
}

#[derive(Serialize)]
struct ParametersResponse {
    parameters: Parameters,
}

#[derive(Serialize)]
struct StatusEnvelope {
    state: StatusResponse,
}

#[derive(Serialize)]
struct Outcome {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn success() -> Json<Outcome> {
    Json(Outcome {
        status: "success",
        error: None,
    })
}

/// Rejected input: 422 with the reason.
struct Invalid(String);

impl IntoResponse for Invalid {
    fn into_response(self) -> Response {
        debug!("rejected request: {}", self.0);
        let body = Outcome {
            status: "failure",
            error: Some(self.0),
        };
        (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

fn parse_f64(name: &str, v: &Value) -> Result<f64, Invalid> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|x| x.is_finite())
        .ok_or_else(|| Invalid(format!("{name}: expected a number, got {v}")))
}

fn parse_u64(name: &str, v: &Value) -> Result<u64, Invalid> {
    let parsed = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Invalid(format!("{name}: expected a whole number of seconds, got {v}")))
}

fn required<'a>(name: &str, v: &'a Option<Value>) -> Result<&'a Value, Invalid> {
    v.as_ref().ok_or_else(|| Invalid(format!("{name}: missing")))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/control", post(control))
        .route("/dose", post(dose))
        .route("/calibrate_ec", post(calibrate_ec))
        .route("/status", get(status))
        .with_state(state)
}

/// Switch between control and monitor mode and update the control
/// parameters. Every field is validated before anything is applied.
async fn control(
    State(state): State<SharedState>,
    Json(req): Json<ControlRequest>,
) -> Result<Json<ParametersResponse>, Invalid> {
    let control = match req.mode.as_deref() {
        None => None,
        Some("control") => Some(true),
        Some("monitor") => Some(false),
        Some(other) => return Err(Invalid(format!("mode: unknown mode '{other}'"))),
    };

    let params = Parameters {
        target_ec: req
            .target_ec
            .as_ref()
            .map(|v| parse_f64("target-ec", v))
            .transpose()?,
        dose_duration: req
            .dose_duration
            .as_ref()
            .map(|v| parse_u64("dose-duration", v))
            .transpose()?,
        equilibration_time: req
            .equilibration_time
            .as_ref()
            .map(|v| parse_u64("equilibration-time", v))
            .transpose()?,
    };
    if params.target_ec.is_some_and(|ec| ec < 0.0) {
        return Err(Invalid("target-ec: must not be negative".to_string()));
    }
    if params.dose_duration == Some(0) {
        return Err(Invalid("dose-duration: must be positive".to_string()));
    }

    let mut st = state.write().await;
    if let Some(on) = control {
        st.apply(Command::SetControl(on));
    }
    let changed = st.apply(Command::SetParameters(params));
    info!(?changed, control = st.control, "/control applied");

    Ok(Json(ParametersResponse {
        parameters: changed,
    }))
}

async fn dose(
    State(state): State<SharedState>,
    Json(req): Json<DoseRequest>,
) -> Result<impl IntoResponse, Invalid> {
    let name = "manual-dose-duration";
    let duration = parse_u64(name, required(name, &req.duration)?)?;

    state.write().await.apply(Command::ManualDose { duration });
    Ok(success())
}

async fn calibrate_ec(
    State(state): State<SharedState>,
    Json(req): Json<CalibrateRequest>,
) -> Result<impl IntoResponse, Invalid> {
    let name = "calibrate-ecprobe-temperature";
    let temperature = parse_f64(name, required(name, &req.temperature)?)?;

    state.write().await.apply(Command::RequestCalibration {
        temperature: Some(temperature),
    });
    Ok(success())
}

async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(StatusEnvelope {
        state: st.to_status(OffsetDateTime::now_utc()),
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: SharedState, cfg: &WebConfig) -> Result<()> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind web address {addr}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
