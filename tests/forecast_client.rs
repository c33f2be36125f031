/// Integration tests for the forecasting service client
///
/// Tests verify:
/// 1. Request bodies sent to /forecast/run and /forecast/run-basin
/// 2. Parsing of service responses into raw predictions
/// 3. Error mapping for non-2xx statuses and malformed bodies
/// 4. End-to-end: fetched forecast replaces stored predictions
///
/// The service is replaced by a local mockito server; no network needed.

use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use mockito::Matcher;
use serde_json::json;

use ffws_discharge::PredictionLifecycleManager;
use ffws_discharge::ingest::forecast::{ForecastClient, ForecastError, ForecastSource};
use ffws_discharge::model::{FormulaKind, PredictedQuantity};
use ffws_discharge::predictions::{SensorOutcome, run_basin_forecast, run_sensor_forecast};
use ffws_discharge::store::{MemoryStore, RecordStore};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn client(server: &mockito::Server) -> ForecastClient {
    ForecastClient::new(&server.url(), Duration::from_secs(5), 3, 1.0)
        .expect("horizon is valid")
}

fn run_body(sensor: &str) -> String {
    json!({
        "sensor_code": sensor,
        "model_code": "DHOMPO_LSTM",
        "predictions": [
            {"prediction_for_ts": "2024-06-01T13:00:00Z", "predicted_value": 1.0, "confidence_score": 0.9},
            {"prediction_for_ts": "2024-06-01T14:00:00Z", "predicted_value": 2.0, "confidence_score": 0.8},
            {"prediction_for_ts": "2024-06-01T15:00:00Z", "predicted_value": 3.0, "confidence_score": 0.7}
        ]
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[test]
fn test_fetch_sensor_sends_horizon_and_parses_points() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/forecast/run")
        .match_body(Matcher::PartialJson(json!({
            "sensor_code": "AWLR-01",
            "model_code": "DHOMPO_LSTM",
            "prediction_hours": 3,
            "step_hours": 1.0
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(run_body("AWLR-01"))
        .create();

    let run = client(&server)
        .with_model("DHOMPO_LSTM")
        .fetch_sensor("AWLR-01")
        .expect("fetch should succeed");

    mock.assert();
    assert_eq!(run.predictions.len(), 3);
    assert_eq!(run.predictions[2].value, 3.0);
    assert_eq!(run.predictions[0].quantity, PredictedQuantity::WaterLevel);
}

#[test]
fn test_base_url_prefix_is_kept() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/api/forecast/run")
        .with_status(200)
        .with_body(run_body("AWLR-01"))
        .create();

    let base = format!("{}/api/", server.url());
    let run = ForecastClient::new(&base, Duration::from_secs(5), 3, 1.0)
        .expect("horizon is valid")
        .fetch_sensor("AWLR-01")
        .expect("fetch should succeed");

    mock.assert();
    assert_eq!(run.sensor_code, "AWLR-01");
}

#[test]
fn test_server_error_maps_to_status() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("POST", "/forecast/run")
        .with_status(503)
        .with_body("model not loaded")
        .create();

    match client(&server).fetch_sensor("AWLR-01") {
        Err(ForecastError::Status(code)) => assert_eq!(code, 503),
        other => panic!("expected Status(503), got {:?}", other),
    }
}

#[test]
fn test_mismatched_sensor_is_rejected() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("POST", "/forecast/run")
        .with_status(200)
        .with_body(run_body("AWLR-02"))
        .create();

    assert!(matches!(
        client(&server).fetch_sensor("AWLR-01"),
        Err(ForecastError::Parse(_))
    ));
}

#[test]
fn test_malformed_body_is_parse_error() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("POST", "/forecast/run")
        .with_status(200)
        .with_body("{\"sensor_code\": ")
        .create();

    assert!(matches!(
        client(&server).fetch_sensor("AWLR-01"),
        Err(ForecastError::Parse(_))
    ));
}

#[test]
fn test_invalid_horizon_never_reaches_the_service() {
    assert!(matches!(
        ForecastClient::new("http://127.0.0.1:9", Duration::from_secs(1), 48, 1.0),
        Err(ForecastError::InvalidRequest(_))
    ));
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    for sensor in ["AWLR-01", "AWLR-02"] {
        store.add_sensor(sensor, "DEV-A").unwrap();
        store
            .add_curve(
                sensor,
                FormulaKind::Linear { a: 2.0 },
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            )
            .unwrap();
    }
    store
}

#[test]
fn test_sensor_forecast_replaces_stored_predictions() {
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("POST", "/forecast/run")
        .with_status(200)
        .with_body(run_body("AWLR-01"))
        .create();

    let store = seeded_store();
    let manager = PredictionLifecycleManager::new(&store);
    let run_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    let report = run_sensor_forecast(&client(&server), &manager, "AWLR-01", run_at).unwrap();
    assert_eq!(report.inserted(), 3);

    let stored = store.future_predictions("AWLR-01", run_at).unwrap();
    let discharges: Vec<f64> = stored.iter().map(|p| p.predicted_discharge).collect();
    assert_eq!(discharges, [2.0, 4.0, 6.0]);
}

#[test]
fn test_basin_forecast_reports_each_sensor() {
    let mut server = mockito::Server::new();
    let body = json!({
        "river_basin_code": "DHOMPO",
        "runs": [
            serde_json::from_str::<serde_json::Value>(&run_body("AWLR-01")).unwrap(),
            serde_json::from_str::<serde_json::Value>(&run_body("AWLR-02")).unwrap()
        ],
        "failed": [{"sensor_code": "AWLR-03", "error": "no recent observations"}]
    });
    let mock = server
        .mock("POST", "/forecast/run-basin")
        .match_body(Matcher::PartialJson(json!({
            "river_basin_code": "DHOMPO",
            "only_active": true
        })))
        .with_status(200)
        .with_body(body.to_string())
        .create();

    let store = seeded_store();
    let manager = PredictionLifecycleManager::new(&store);
    let run_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

    let summary = run_basin_forecast(&client(&server), &manager, "DHOMPO", run_at).unwrap();
    mock.assert();

    assert_eq!(summary.total_sensors, 3);
    assert_eq!(summary.ok, 2);
    assert_eq!(summary.failed, 1);
    assert!(summary.details.iter().any(|d| matches!(
        d,
        SensorOutcome::Failed { sensor_code, .. } if sensor_code == "AWLR-03"
    )));
    assert_eq!(store.future_predictions("AWLR-02", run_at).unwrap().len(), 3);
}
