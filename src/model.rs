/// Core data types for the discharge pipeline.
///
/// This module defines the shared domain model imported by all other modules:
/// rating curves, threshold definitions, map mappings, the persisted
/// discharge/prediction records and the error taxonomy. It contains no I/O.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// All timestamps in the pipeline are UTC instants.
pub type Timestamp = DateTime<Utc>;

// ---------------------------------------------------------------------------
// Rating curves
// ---------------------------------------------------------------------------

/// The closed set of rating formulas a curve record can carry.
///
/// Coefficients live on the variant that uses them, so a polynomial can
/// never be evaluated without its `c` term and a linear curve never carries
/// a stray exponent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormulaKind {
    /// Q = a · H^b
    Power { a: f64, b: f64 },
    /// Q = a + b·H + c·H²
    Polynomial { a: f64, b: f64, c: f64 },
    /// Q = a · e^(b·H)
    Exponential { a: f64, b: f64 },
    /// Q = a · H
    Linear { a: f64 },
    /// Piecewise-linear lookup in the station's breakpoint set.
    BreakpointTable,
}

impl FormulaKind {
    /// Decodes the stored `(formula_type, a, b, c)` columns.
    ///
    /// Nullable coefficients fall back to the values the admin backend has
    /// always assumed: `b = 1` for power/exponential, `b = c = 0` for
    /// polynomial. `custom` rows have always been evaluated as linear.
    pub fn from_columns(
        formula_type: &str,
        a: f64,
        b: Option<f64>,
        c: Option<f64>,
    ) -> Result<Self, EvalError> {
        match formula_type.trim().to_ascii_lowercase().as_str() {
            "power" => Ok(FormulaKind::Power { a, b: b.unwrap_or(1.0) }),
            "polynomial" => Ok(FormulaKind::Polynomial {
                a,
                b: b.unwrap_or(0.0),
                c: c.unwrap_or(0.0),
            }),
            "exponential" => Ok(FormulaKind::Exponential { a, b: b.unwrap_or(1.0) }),
            "linear" | "custom" => Ok(FormulaKind::Linear { a }),
            "breakpoint-table" | "breakpoint_table" | "breakpoint" => {
                Ok(FormulaKind::BreakpointTable)
            }
            other => Err(EvalError::InvalidInput(format!(
                "unknown formula type '{}'",
                other
            ))),
        }
    }

    /// Storage label, the inverse of `from_columns`.
    pub fn label(&self) -> &'static str {
        match self {
            FormulaKind::Power { .. } => "power",
            FormulaKind::Polynomial { .. } => "polynomial",
            FormulaKind::Exponential { .. } => "exponential",
            FormulaKind::Linear { .. } => "linear",
            FormulaKind::BreakpointTable => "breakpoint-table",
        }
    }
}

/// Human-readable formula with its coefficients, e.g. `Q = 2 × H^1.5`.
impl fmt::Display for FormulaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FormulaKind::Power { a, b } => write!(f, "Q = {} × H^{}", a, b),
            FormulaKind::Polynomial { a, b, c } => write!(f, "Q = {} + {}×H + {}×H²", a, b, c),
            FormulaKind::Exponential { a, b } => write!(f, "Q = {} × e^({}×H)", a, b),
            FormulaKind::Linear { a } => write!(f, "Q = {} × H", a),
            FormulaKind::BreakpointTable => write!(f, "Q = breakpoint table lookup"),
        }
    }
}

/// One versioned rating curve for a sensor.
///
/// `id` is the storage surrogate key; it doubles as insertion order and
/// breaks ties between curves sharing an `effective_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingCurve {
    pub id: i64,
    pub sensor_code: String,
    pub formula: FormulaKind,
    pub effective_date: NaiveDate,
}

/// A single (water level, discharge) point of a breakpoint table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub water_level: f64,
    pub discharge: f64,
}

impl From<(f64, f64)> for Breakpoint {
    fn from((water_level, discharge): (f64, f64)) -> Self {
        Breakpoint { water_level, discharge }
    }
}

/// How a discharge value was obtained from its curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMethod {
    Formula,
    ExactBreakpoint,
    Interpolated,
    /// Level below the lowest breakpoint; lowest discharge returned.
    ClampedLow,
    /// Level above the highest breakpoint; highest discharge returned.
    ClampedHigh,
}

/// Result of evaluating a rating curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discharge {
    /// Flow rate, m³/s.
    pub value: f64,
    /// `false` when the curve produced a negative discharge.
    pub plausible: bool,
    pub curve_id: i64,
    pub method: EvalMethod,
}

// ---------------------------------------------------------------------------
// Threshold types
// ---------------------------------------------------------------------------

/// Alert status tier, in ascending order of severity (`Unknown` first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unknown,
    Normal,
    Warning,
    Critical,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Normal => "normal",
            Status::Warning => "warning",
            Status::Critical => "critical",
        }
    }

    /// Parses a stored status label. Unrecognized labels read as `Unknown`.
    pub fn from_label(label: &str) -> Status {
        match label {
            "normal" => Status::Normal,
            "warning" => Status::Warning,
            "critical" => Status::Critical,
            _ => Status::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A half-open band `[min, max)`; either side may be open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TierRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl TierRange {
    /// Builds a band, rejecting `min >= max` and NaN bounds.
    pub fn new(min: Option<f64>, max: Option<f64>) -> Result<Self, EvalError> {
        if min.is_some_and(f64::is_nan) || max.is_some_and(f64::is_nan) {
            return Err(EvalError::InvalidInput("tier bound is NaN".to_string()));
        }
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo >= hi {
                return Err(EvalError::InvalidInput(format!(
                    "tier min {} must be below max {}",
                    lo, hi
                )));
            }
        }
        Ok(TierRange { min, max })
    }

    /// `[min, ..)` with no upper bound.
    pub fn at_least(min: f64) -> Self {
        TierRange { min: Some(min), max: None }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|lo| value >= lo) && self.max.is_none_or(|hi| value < hi)
    }
}

/// The active normal / warning / critical bands for one sensor.
///
/// A tier left as `None` is not configured and never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdDefinition {
    pub sensor_code: String,
    pub normal: Option<TierRange>,
    pub warning: Option<TierRange>,
    pub critical: Option<TierRange>,
}

// ---------------------------------------------------------------------------
// Map mapping types
// ---------------------------------------------------------------------------

/// Where the bytes of an inundation map live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ref", rename_all = "snake_case")]
pub enum MapAsset {
    /// Direct path in the asset store.
    FilePath(String),
    /// Code of a stored GeoJSON file record.
    Stored(String),
}

/// One discharge range → map association for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoMapping {
    pub id: i64,
    pub geojson_code: String,
    pub device_code: String,
    pub value_min: f64,
    pub value_max: f64,
    pub file_path: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

impl GeoMapping {
    /// Half-open membership test `value_min <= value < value_max`.
    pub fn contains(&self, value: f64) -> bool {
        self.value_min <= value && value < self.value_max
    }

    /// A direct file path wins over the stored-asset code.
    pub fn asset(&self) -> MapAsset {
        match &self.file_path {
            Some(path) if !path.trim().is_empty() => MapAsset::FilePath(path.clone()),
            _ => MapAsset::Stored(self.geojson_code.clone()),
        }
    }
}

/// Reference handed back to callers, who stream the bytes themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRef {
    pub mapping_id: i64,
    pub device_code: String,
    pub asset: MapAsset,
    pub version: Option<String>,
    pub description: Option<String>,
}

impl From<&GeoMapping> for MapRef {
    fn from(m: &GeoMapping) -> Self {
        MapRef {
            mapping_id: m.id,
            device_code: m.device_code.clone(),
            asset: m.asset(),
            version: m.version.clone(),
            description: m.description.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// One observed water level converted to discharge. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatedDischarge {
    pub sensor_code: String,
    pub water_level: f64,
    pub discharge: f64,
    pub plausible: bool,
    pub rating_curve_id: i64,
    pub status: Status,
    pub calculated_at: Timestamp,
}

/// What a forecast model predicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictedQuantity {
    WaterLevel,
    Discharge,
}

/// An unvalidated prediction as delivered by the forecasting service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    pub predicted_for: Timestamp,
    pub value: f64,
    pub quantity: PredictedQuantity,
    pub confidence: Option<f64>,
    pub model_code: String,
}

/// A stored future prediction with discharge and status pre-computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedDischarge {
    pub sensor_code: String,
    pub predicted_for: Timestamp,
    pub predicted_value: f64,
    pub predicted_discharge: f64,
    pub plausible: bool,
    pub confidence: Option<f64>,
    pub model_code: String,
    pub status: Status,
    /// `None` when the model supplied discharge directly.
    pub rating_curve_id: Option<i64>,
    pub run_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures of the backing store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Injected or transient write failure.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// A stored row could not be decoded into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Errors from rating-curve resolution and evaluation.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("no rating curve for sensor {sensor_code} effective at {at}")]
    NoCurve { sensor_code: String, at: Timestamp },
    #[error("breakpoint table for station {0} is empty")]
    EmptyBreakpointTable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from map selection.
#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no map mapping for device {device_code} at value {value}")]
    NoMapping { device_code: String, value: f64 },
    /// No calculated or predicted record to take the value from.
    #[error("no discharge record for sensor {0}")]
    NoRecord(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One batch item rejected during a prediction replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub predicted_for: Timestamp,
    pub reason: String,
}

/// Errors from the composed operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{} of {} predictions rejected", .failures.len(), .failures.len() + .inserted)]
    PartialBatchFailure {
        inserted: usize,
        failures: Vec<ItemFailure>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_columns_apply_backend_defaults() {
        assert_eq!(
            FormulaKind::from_columns("power", 2.0, None, None).unwrap(),
            FormulaKind::Power { a: 2.0, b: 1.0 }
        );
        assert_eq!(
            FormulaKind::from_columns("polynomial", 1.0, None, Some(3.0)).unwrap(),
            FormulaKind::Polynomial { a: 1.0, b: 0.0, c: 3.0 }
        );
        assert_eq!(
            FormulaKind::from_columns("custom", 4.0, Some(9.0), None).unwrap(),
            FormulaKind::Linear { a: 4.0 }
        );
        assert!(FormulaKind::from_columns("spline", 1.0, None, None).is_err());
    }

    #[test]
    fn test_formula_label_round_trips_through_columns() {
        let kind = FormulaKind::Exponential { a: 0.5, b: 0.2 };
        assert_eq!(FormulaKind::from_columns(kind.label(), 0.5, Some(0.2), None).unwrap(), kind);
        let table = FormulaKind::BreakpointTable;
        assert_eq!(FormulaKind::from_columns(table.label(), 0.0, None, None).unwrap(), table);
    }

    #[test]
    fn test_formula_display_shows_coefficients() {
        assert_eq!(FormulaKind::Power { a: 2.0, b: 1.5 }.to_string(), "Q = 2 × H^1.5");
        assert_eq!(
            FormulaKind::Polynomial { a: 1.0, b: -4.0, c: 0.5 }.to_string(),
            "Q = 1 + -4×H + 0.5×H²"
        );
        assert_eq!(FormulaKind::Exponential { a: 0.8, b: 0.3 }.to_string(), "Q = 0.8 × e^(0.3×H)");
        assert_eq!(FormulaKind::Linear { a: 3.7 }.to_string(), "Q = 3.7 × H");
    }

    #[test]
    fn test_tier_rejects_inverted_bounds() {
        assert!(TierRange::new(Some(5.0), Some(5.0)).is_err());
        assert!(TierRange::new(Some(6.0), Some(5.0)).is_err());
        assert!(TierRange::new(Some(f64::NAN), None).is_err());
        assert!(TierRange::new(None, Some(5.0)).is_ok());
    }

    #[test]
    fn test_tier_is_half_open() {
        let tier = TierRange::new(Some(8.0), Some(12.0)).unwrap();
        assert!(tier.contains(8.0));
        assert!(tier.contains(11.999));
        assert!(!tier.contains(12.0));
        assert!(!tier.contains(7.999));
        assert!(TierRange::at_least(12.0).contains(1.0e9));
    }

    #[test]
    fn test_mapping_prefers_file_path_over_stored_code() {
        let mut m = GeoMapping {
            id: 1,
            geojson_code: "GJ-1".to_string(),
            device_code: "DEV-A".to_string(),
            value_min: 0.0,
            value_max: 10.0,
            file_path: Some("maps/dev-a/low.geojson".to_string()),
            version: None,
            description: None,
        };
        assert_eq!(m.asset(), MapAsset::FilePath("maps/dev-a/low.geojson".to_string()));
        m.file_path = Some("  ".to_string());
        assert_eq!(m.asset(), MapAsset::Stored("GJ-1".to_string()));
    }

    #[test]
    fn test_status_labels_round_trip() {
        for s in [Status::Unknown, Status::Normal, Status::Warning, Status::Critical] {
            assert_eq!(Status::from_label(s.as_str()), s);
        }
        assert_eq!(Status::from_label("danger"), Status::Unknown);
    }
}
