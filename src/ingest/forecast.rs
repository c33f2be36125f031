/// Forecasting Service Client
///
/// Requests future predictions from the external forecasting service (an
/// ML model server) for a single sensor or for every active sensor in a
/// river basin. The service is an untrusted source: responses are parsed
/// here into `RawPrediction`s, and all value validation happens in
/// `predictions::PredictionLifecycleManager` exactly as for manual entry.
///
/// Endpoints, where `{base}` carries the service's `/api` prefix:
///   POST {base}/forecast/run
///        { sensor_code, model_code?, prediction_hours, step_hours }
///   POST {base}/forecast/run-basin
///        { river_basin_code, only_active, prediction_hours, step_hours }

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{PredictedQuantity, RawPrediction};

/// Horizon limits the service accepts, in hours.
pub const MIN_PREDICTION_HOURS: u32 = 1;
pub const MAX_PREDICTION_HOURS: u32 = 24;
pub const MIN_STEP_HOURS: f64 = 0.1;
pub const MAX_STEP_HOURS: f64 = 6.0;

#[derive(Debug, Error)]
pub enum ForecastError {
    /// Rejected before any request was sent.
    #[error("invalid forecast request: {0}")]
    InvalidRequest(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forecast service returned status {0}")]
    Status(u16),
    #[error("Parse error: {0}")]
    Parse(String),
}

// ============================================================================
// Wire Structures
// ============================================================================

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    sensor_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_code: Option<&'a str>,
    prediction_hours: u32,
    step_hours: f64,
}

#[derive(Debug, Serialize)]
struct BasinRequest<'a> {
    river_basin_code: &'a str,
    only_active: bool,
    prediction_hours: u32,
    step_hours: f64,
}

/// One sensor's forecast as returned by the service.
#[derive(Debug, Deserialize)]
pub struct ForecastRunResponse {
    pub sensor_code: String,
    pub model_code: String,
    /// What `predicted_value` measures; the models predict water level
    /// unless they say otherwise.
    #[serde(default = "default_quantity")]
    pub quantity: PredictedQuantity,
    pub predictions: Vec<ForecastPoint>,
}

#[derive(Debug, Deserialize)]
pub struct ForecastPoint {
    pub prediction_for_ts: String,
    pub predicted_value: f64,
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct BasinRunResponse {
    pub river_basin_code: String,
    #[serde(default)]
    pub runs: Vec<ForecastRunResponse>,
    #[serde(default)]
    pub failed: Vec<BasinSensorFailure>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BasinSensorFailure {
    pub sensor_code: String,
    pub error: String,
}

fn default_quantity() -> PredictedQuantity {
    PredictedQuantity::WaterLevel
}

/// Parsed forecast for one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRun {
    pub sensor_code: String,
    pub model_code: String,
    pub predictions: Vec<RawPrediction>,
}

/// Parsed basin forecast: per-sensor runs plus the sensors the service
/// could not forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct BasinForecast {
    pub river_basin_code: String,
    pub runs: Vec<ForecastRun>,
    pub failed: Vec<BasinSensorFailure>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a service timestamp. Offset-less timestamps are taken as UTC,
/// which is what the service emits.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ForecastError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|e| ForecastError::Parse(format!("bad timestamp '{}': {}", raw, e)))
}

impl TryFrom<ForecastRunResponse> for ForecastRun {
    type Error = ForecastError;

    fn try_from(resp: ForecastRunResponse) -> Result<Self, Self::Error> {
        let predictions = resp
            .predictions
            .iter()
            .map(|p| -> Result<RawPrediction, ForecastError> {
                Ok(RawPrediction {
                    predicted_for: parse_timestamp(&p.prediction_for_ts)?,
                    value: p.predicted_value,
                    quantity: resp.quantity,
                    confidence: p.confidence_score,
                    model_code: resp.model_code.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ForecastRun {
            sensor_code: resp.sensor_code,
            model_code: resp.model_code,
            predictions,
        })
    }
}

/// Parse a `/forecast/run` response body.
pub fn parse_run_response(body: &str) -> Result<ForecastRun, ForecastError> {
    let resp: ForecastRunResponse =
        serde_json::from_str(body).map_err(|e| ForecastError::Parse(e.to_string()))?;
    ForecastRun::try_from(resp)
}

/// Parse a `/forecast/run-basin` response body.
pub fn parse_basin_response(body: &str) -> Result<BasinForecast, ForecastError> {
    let resp: BasinRunResponse =
        serde_json::from_str(body).map_err(|e| ForecastError::Parse(e.to_string()))?;
    let runs = resp
        .runs
        .into_iter()
        .map(ForecastRun::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BasinForecast {
        river_basin_code: resp.river_basin_code,
        runs,
        failed: resp.failed,
    })
}

// ============================================================================
// API Client
// ============================================================================

/// Anything that can hand the pipeline a forecast batch.
pub trait ForecastSource {
    fn fetch_sensor(&self, sensor_code: &str) -> Result<ForecastRun, ForecastError>;

    fn fetch_basin(&self, river_basin_code: &str) -> Result<BasinForecast, ForecastError>;
}

#[derive(Debug, Clone)]
pub struct ForecastClient {
    http: reqwest::blocking::Client,
    base_url: String,
    model_code: Option<String>,
    prediction_hours: u32,
    step_hours: f64,
    only_active: bool,
}

impl ForecastClient {
    /// Build a client, validating the horizon before any request is made.
    pub fn new(
        base_url: &str,
        timeout: Duration,
        prediction_hours: u32,
        step_hours: f64,
    ) -> Result<Self, ForecastError> {
        validate_horizon(prediction_hours, step_hours)?;
        let http = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(ForecastClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_code: None,
            prediction_hours,
            step_hours,
            only_active: true,
        })
    }

    /// Pin a specific model instead of the sensor's assigned one.
    pub fn with_model(mut self, model_code: &str) -> Self {
        self.model_code = Some(model_code.to_string());
        self
    }

    /// Include inactive sensors in basin runs.
    pub fn include_inactive(mut self) -> Self {
        self.only_active = false;
        self
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<String, ForecastError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(body)
            .send()?;

        if !response.status().is_success() {
            return Err(ForecastError::Status(response.status().as_u16()));
        }
        Ok(response.text()?)
    }
}

impl ForecastSource for ForecastClient {
    fn fetch_sensor(&self, sensor_code: &str) -> Result<ForecastRun, ForecastError> {
        let body = self.post(
            "/forecast/run",
            &RunRequest {
                sensor_code,
                model_code: self.model_code.as_deref(),
                prediction_hours: self.prediction_hours,
                step_hours: self.step_hours,
            },
        )?;
        let run = parse_run_response(&body)?;
        if run.sensor_code != sensor_code {
            return Err(ForecastError::Parse(format!(
                "asked for sensor {} but received {}",
                sensor_code, run.sensor_code
            )));
        }
        Ok(run)
    }

    fn fetch_basin(&self, river_basin_code: &str) -> Result<BasinForecast, ForecastError> {
        let body = self.post(
            "/forecast/run-basin",
            &BasinRequest {
                river_basin_code,
                only_active: self.only_active,
                prediction_hours: self.prediction_hours,
                step_hours: self.step_hours,
            },
        )?;
        parse_basin_response(&body)
    }
}

/// The service accepts 1–24 hour horizons at 0.1–6.0 hour steps.
pub fn validate_horizon(prediction_hours: u32, step_hours: f64) -> Result<(), ForecastError> {
    if !(MIN_PREDICTION_HOURS..=MAX_PREDICTION_HOURS).contains(&prediction_hours) {
        return Err(ForecastError::InvalidRequest(format!(
            "prediction_hours must be between {} and {}, got {}",
            MIN_PREDICTION_HOURS, MAX_PREDICTION_HOURS, prediction_hours
        )));
    }
    if !(MIN_STEP_HOURS..=MAX_STEP_HOURS).contains(&step_hours) {
        return Err(ForecastError::InvalidRequest(format!(
            "step_hours must be between {} and {}, got {}",
            MIN_STEP_HOURS, MAX_STEP_HOURS, step_hours
        )));
    }
    Ok(())
}
