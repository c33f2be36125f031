/// Structured logging for the discharge pipeline
///
/// Provides context-rich logging tagged with the emitting component and the
/// sensor involved, plus failure classification so that expected data gaps
/// (a reading with no curve yet, a duplicate observation) stay out of the
/// error stream. Events go through `tracing`; `init_logger` installs a
/// `tracing-subscriber` formatter writing to the console or a log file.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::ingest::forecast::ForecastError;
use crate::model::{EvalError, PipelineError, SelectError, StorageError};

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Parses a config value; unknown names fall back to `Info`.
    pub fn from_name(name: &str) -> LogLevel {
        match name.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Curve,
    Threshold,
    GeoMap,
    Pipeline,
    Forecast,
    Database,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Curve => write!(f, "CURVE"),
            Component::Threshold => write!(f, "THRESH"),
            Component::GeoMap => write!(f, "GEOMAP"),
            Component::Pipeline => write!(f, "PIPE"),
            Component::Forecast => write!(f, "FCST"),
            Component::Database => write!(f, "DB"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - bad input or a record that already exists
    Expected,
    /// Unexpected failure - indicates store or service degradation
    Unexpected,
    /// Unknown - usually missing configuration data an operator must fix
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

pub fn classify_storage_failure(err: &StorageError) -> FailureType {
    match err {
        StorageError::Conflict(_) => FailureType::Expected,
        StorageError::Corrupt(_) => FailureType::Unknown,
        StorageError::Database(_) | StorageError::WriteFailed(_) | StorageError::Poisoned => {
            FailureType::Unexpected
        }
    }
}

pub fn classify_eval_failure(err: &EvalError) -> FailureType {
    match err {
        EvalError::InvalidInput(_) => FailureType::Expected,
        EvalError::NoCurve { .. } | EvalError::EmptyBreakpointTable(_) => FailureType::Unknown,
        EvalError::Storage(e) => classify_storage_failure(e),
    }
}

pub fn classify_select_failure(err: &SelectError) -> FailureType {
    match err {
        SelectError::InvalidInput(_) => FailureType::Expected,
        SelectError::NoMapping { .. } | SelectError::NoRecord(_) => FailureType::Unknown,
        SelectError::Storage(e) => classify_storage_failure(e),
    }
}

pub fn classify_pipeline_failure(err: &PipelineError) -> FailureType {
    match err {
        PipelineError::Eval(e) => classify_eval_failure(e),
        PipelineError::Storage(e) => classify_storage_failure(e),
        PipelineError::PartialBatchFailure { .. } => FailureType::Unknown,
    }
}

pub fn classify_forecast_failure(err: &ForecastError) -> FailureType {
    match err {
        ForecastError::InvalidRequest(_) => FailureType::Expected,
        ForecastError::Http(_) | ForecastError::Status(_) | ForecastError::Parse(_) => {
            FailureType::Unexpected
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `min_level` when set. With `log_file` the output is
/// appended to that file without ANSI colours. Calling this twice keeps the
/// first subscriber.
pub fn init_logger(
    min_level: LogLevel,
    log_file: Option<&str>,
    console_timestamps: bool,
) -> std::io::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(min_level.filter().into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // try_init only fails when a subscriber is already installed.
    let _ = match (log_file, console_timestamps) {
        (Some(path), _) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        (None, true) => builder.try_init(),
        (None, false) => builder.without_time().try_init(),
    };
    Ok(())
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Log a general informational message
pub fn info(source: Component, sensor: Option<&str>, message: &str) {
    tracing::info!(source = %source, sensor = sensor.unwrap_or("-"), "{}", message);
}

/// Log a warning message
pub fn warn(source: Component, sensor: Option<&str>, message: &str) {
    tracing::warn!(source = %source, sensor = sensor.unwrap_or("-"), "{}", message);
}

/// Log an error message
pub fn error(source: Component, sensor: Option<&str>, message: &str) {
    tracing::error!(source = %source, sensor = sensor.unwrap_or("-"), "{}", message);
}

/// Log a debug message
pub fn debug(source: Component, sensor: Option<&str>, message: &str) {
    tracing::debug!(source = %source, sensor = sensor.unwrap_or("-"), "{}", message);
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a failure at the severity its classification calls for.
pub fn log_failure(
    source: Component,
    sensor: &str,
    operation: &str,
    failure_type: FailureType,
    err: &dyn std::error::Error,
) {
    let message = format!("{} failed [{}]: {}", operation, failure_type, err);

    match failure_type {
        FailureType::Expected => debug(source, Some(sensor), &message),
        FailureType::Unexpected => error(source, Some(sensor), &message),
        FailureType::Unknown => warn(source, Some(sensor), &message),
    }
}

pub fn log_storage_failure(source: Component, scope: &str, operation: &str, err: &StorageError) {
    log_failure(source, scope, operation, classify_storage_failure(err), err);
}

pub fn log_pipeline_failure(sensor: &str, operation: &str, err: &PipelineError) {
    log_failure(Component::Pipeline, sensor, operation, classify_pipeline_failure(err), err);
}

pub fn log_select_failure(sensor: &str, operation: &str, err: &SelectError) {
    log_failure(Component::GeoMap, sensor, operation, classify_select_failure(err), err);
}

pub fn log_forecast_failure(sensor: &str, operation: &str, err: &ForecastError) {
    log_failure(Component::Forecast, sensor, operation, classify_forecast_failure(err), err);
}

// ---------------------------------------------------------------------------
// Batch Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of a batch operation (prediction replace, basin run)
pub fn log_batch_summary(
    source: Component,
    scope: &str,
    total: usize,
    successful: usize,
    failed: usize,
) {
    let message = format!(
        "Batch complete: {}/{} successful, {} failed",
        successful, total, failed
    );

    if failed == 0 {
        info(source, Some(scope), &message);
    } else if successful == 0 {
        error(source, Some(scope), &message);
    } else {
        warn(source, Some(scope), &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(LogLevel::from_name("WARN"), LogLevel::Warning);
        assert_eq!(LogLevel::from_name("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_name("chatty"), LogLevel::Info);
    }

    #[test]
    fn test_failure_classification() {
        let no_curve = EvalError::NoCurve {
            sensor_code: "AWLR-01".to_string(),
            at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        };
        assert_eq!(classify_eval_failure(&no_curve), FailureType::Unknown);

        let bad_input = EvalError::InvalidInput("water level -1 is negative".to_string());
        assert_eq!(classify_eval_failure(&bad_input), FailureType::Expected);

        let storage = PipelineError::Storage(StorageError::WriteFailed("disk".to_string()));
        assert_eq!(classify_pipeline_failure(&storage), FailureType::Unexpected);

        let dup = StorageError::Conflict("duplicate".to_string());
        assert_eq!(classify_storage_failure(&dup), FailureType::Expected);
    }

    #[test]
    fn test_component_tags() {
        assert_eq!(Component::Threshold.to_string(), "THRESH");
        assert_eq!(Component::Database.to_string(), "DB");
    }

    #[test]
    fn test_logging_without_subscriber_is_a_no_op() {
        info(Component::System, None, "no subscriber installed");
        log_batch_summary(Component::Forecast, "AWLR-01", 3, 2, 1);
        let poisoned = StorageError::Poisoned;
        log_storage_failure(Component::Threshold, "AWLR-01", "read threshold", &poisoned);
        log_storage_failure(Component::Database, "-", "connect", &poisoned);
    }
}
