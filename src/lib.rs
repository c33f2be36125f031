//! Flood forecasting discharge pipeline.
//!
//! Converts observed and forecast water levels into river discharge through
//! versioned rating curves, classifies the result against per-sensor
//! threshold tiers, picks the inundation map for a discharge, and keeps each
//! sensor's future predictions replaced atomically per forecast run.

pub mod alert;
pub mod config;
pub mod geomap;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod predictions;
pub mod rating;
pub mod store;
pub mod verify;

pub use alert::ThresholdClassifier;
pub use geomap::GeoMapSelector;
pub use model::{
    CalculatedDischarge, EvalError, FormulaKind, MapRef, PipelineError, PredictedDischarge,
    RawPrediction, SelectError, Status, StorageError,
};
pub use pipeline::{DischargePipeline, DischargeStore};
pub use predictions::{BatchReport, PredictionLifecycleManager};
pub use rating::RatingCurveEvaluator;
