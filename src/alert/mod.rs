/// Alert-facing classification.
///
/// Submodules:
/// - `thresholds`: normal / warning / critical tiering of discharges.

pub mod thresholds;

pub use thresholds::{ThresholdClassifier, classify_value};
