//! Threshold classification of levels and discharges.
//!
//! Tiers are checked from most to least severe, so a value sitting in both
//! the warning and the critical band (overlapping operator-entered bounds)
//! always reports `Critical`. Alert severity depends on that order.

use crate::logging::{self, Component};
use crate::model::{Status, StorageError, ThresholdDefinition};
use crate::store::ThresholdRepository;

/// Classifies `value` against a sensor's definition.
///
/// Returns `Unknown` when there is no definition, when the value is not a
/// finite number, or when the value falls outside every configured tier.
pub fn classify_value(definition: Option<&ThresholdDefinition>, value: f64) -> Status {
    let Some(def) = definition else {
        return Status::Unknown;
    };
    if !value.is_finite() {
        return Status::Unknown;
    }

    let tiers = [
        (Status::Critical, def.critical),
        (Status::Warning, def.warning),
        (Status::Normal, def.normal),
    ];
    tiers
        .iter()
        .find(|(_, range)| range.is_some_and(|r| r.contains(value)))
        .map(|(status, _)| *status)
        .unwrap_or(Status::Unknown)
}

pub struct ThresholdClassifier<'a, R: ?Sized> {
    thresholds: &'a R,
}

impl<'a, R: ThresholdRepository + ?Sized> ThresholdClassifier<'a, R> {
    pub fn new(thresholds: &'a R) -> Self {
        ThresholdClassifier { thresholds }
    }

    /// Looks up the sensor's active definition and classifies `value`.
    ///
    /// A missing definition is `Ok(Status::Unknown)`; only a failed read
    /// is an error.
    pub fn classify(&self, sensor_code: &str, value: f64) -> Result<Status, StorageError> {
        let definition = self.thresholds.active_threshold(sensor_code).inspect_err(|e| {
            logging::log_storage_failure(Component::Threshold, sensor_code, "read threshold", e);
        })?;
        Ok(classify_value(definition.as_ref(), value))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TierRange;
    use crate::store::MemoryStore;

    fn tier(min: Option<f64>, max: Option<f64>) -> Option<TierRange> {
        Some(TierRange::new(min, max).unwrap())
    }

    fn definition() -> ThresholdDefinition {
        ThresholdDefinition {
            sensor_code: "AWLR-01".to_string(),
            normal: tier(Some(0.0), Some(8.0)),
            warning: tier(Some(8.0), Some(12.0)),
            critical: tier(Some(12.0), None),
        }
    }

    #[test]
    fn test_value_in_each_band() {
        let def = definition();
        assert_eq!(classify_value(Some(&def), 3.0), Status::Normal);
        assert_eq!(classify_value(Some(&def), 10.392), Status::Warning);
        assert_eq!(classify_value(Some(&def), 250.0), Status::Critical);
    }

    #[test]
    fn test_band_edges_belong_to_upper_tier() {
        let def = definition();
        assert_eq!(classify_value(Some(&def), 8.0), Status::Warning);
        assert_eq!(classify_value(Some(&def), 12.0), Status::Critical);
        assert_eq!(classify_value(Some(&def), 0.0), Status::Normal);
    }

    #[test]
    fn test_overlapping_warning_and_critical_reports_critical() {
        // Sloppy bounds: warning [8, 20) overlaps critical [15, ..).
        let def = ThresholdDefinition {
            warning: tier(Some(8.0), Some(20.0)),
            critical: tier(Some(15.0), None),
            ..definition()
        };
        for v in [15.0, 17.5, 19.999] {
            assert_eq!(classify_value(Some(&def), v), Status::Critical, "value {}", v);
        }
        assert_eq!(classify_value(Some(&def), 14.0), Status::Warning);
    }

    #[test]
    fn test_open_ended_tiers() {
        let def = ThresholdDefinition {
            sensor_code: "AWLR-01".to_string(),
            normal: tier(None, Some(5.0)),
            warning: None,
            critical: tier(Some(5.0), None),
        };
        assert_eq!(classify_value(Some(&def), -3.0), Status::Normal);
        assert_eq!(classify_value(Some(&def), 5.0), Status::Critical);
    }

    #[test]
    fn test_value_outside_every_tier_is_unknown() {
        let def = ThresholdDefinition {
            critical: None,
            ..definition()
        };
        assert_eq!(classify_value(Some(&def), 40.0), Status::Unknown);
        assert_eq!(classify_value(Some(&def), -1.0), Status::Unknown);
    }

    #[test]
    fn test_no_definition_is_unknown() {
        assert_eq!(classify_value(None, 3.0), Status::Unknown);
    }

    #[test]
    fn test_nan_is_unknown() {
        assert_eq!(classify_value(Some(&definition()), f64::NAN), Status::Unknown);
    }

    #[test]
    fn test_classifier_reads_active_definition() {
        let store = MemoryStore::new();
        let classifier = ThresholdClassifier::new(&store);
        assert_eq!(classifier.classify("AWLR-01", 10.0).unwrap(), Status::Unknown);

        store.set_threshold(definition()).unwrap();
        assert_eq!(classifier.classify("AWLR-01", 10.0).unwrap(), Status::Warning);
    }
}
