//! Rating-curve resolution and evaluation.
//!
//! Converts a water level (stage, metres) into a discharge (m³/s). A sensor
//! may carry several curve versions; the one in force at the observation
//! time is the latest `effective_date` on or before that day, and among
//! curves sharing that date the most recently inserted (highest id) wins.
//!
//! Everything here except `RatingCurveEvaluator::evaluate` is pure and
//! takes the curve data as arguments.

use serde::Serialize;

use crate::model::{
    Breakpoint, Discharge, EvalError, EvalMethod, FormulaKind, RatingCurve, Timestamp,
};
use crate::store::CurveRepository;

/// Allowed number of sample points for `sample_curve`.
pub const SAMPLE_STEPS: std::ops::RangeInclusive<usize> = 5..=100;

// ---------------------------------------------------------------------------
// Curve resolution
// ---------------------------------------------------------------------------

/// Picks the curve in force at `at`, or `None` if every version starts later.
pub fn active_curve(curves: &[RatingCurve], at: Timestamp) -> Option<&RatingCurve> {
    let day = at.date_naive();
    curves
        .iter()
        .filter(|c| c.effective_date <= day)
        .max_by_key(|c| (c.effective_date, c.id))
}

fn check_level(water_level: f64) -> Result<(), EvalError> {
    if !water_level.is_finite() {
        return Err(EvalError::InvalidInput(format!(
            "water level {} is not a finite number",
            water_level
        )));
    }
    if water_level < 0.0 {
        return Err(EvalError::InvalidInput(format!(
            "water level {} is negative",
            water_level
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Closed-form formulas
// ---------------------------------------------------------------------------

impl FormulaKind {
    /// Evaluates a closed-form formula at `h`. Returns `None` for
    /// `BreakpointTable`, which needs the station's breakpoint set.
    pub fn evaluate(&self, h: f64) -> Option<f64> {
        match *self {
            FormulaKind::Power { a, b } => Some(a * h.powf(b)),
            FormulaKind::Polynomial { a, b, c } => Some(a + b * h + c * h * h),
            FormulaKind::Exponential { a, b } => Some(a * (b * h).exp()),
            FormulaKind::Linear { a } => Some(a * h),
            FormulaKind::BreakpointTable => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Breakpoint tables
// ---------------------------------------------------------------------------

/// Looks up `h` in a breakpoint set.
///
/// An exact level returns its stored discharge. Between two levels the
/// discharge is interpolated linearly. Outside the table the nearest
/// endpoint's discharge is returned unchanged; the table is never
/// extrapolated. Points may arrive in any order; on duplicate levels the
/// first supplied point wins.
pub fn interpolate(points: &[Breakpoint], h: f64) -> Option<(f64, EvalMethod)> {
    let mut sorted: Vec<Breakpoint> = points.to_vec();
    sorted.sort_by(|x, y| x.water_level.total_cmp(&y.water_level));

    let first = sorted.first()?;
    let last = sorted.last()?;

    if let Some(exact) = sorted.iter().find(|p| p.water_level == h) {
        return Some((exact.discharge, EvalMethod::ExactBreakpoint));
    }
    if h < first.water_level {
        return Some((first.discharge, EvalMethod::ClampedLow));
    }
    if h > last.water_level {
        return Some((last.discharge, EvalMethod::ClampedHigh));
    }

    // h lies strictly inside the table and matches no level, so a pair
    // bracketing it always exists.
    let upper_idx = sorted.iter().position(|p| p.water_level > h)?;
    let lower = sorted[upper_idx - 1];
    let upper = sorted[upper_idx];
    let q = lower.discharge
        + (h - lower.water_level) * (upper.discharge - lower.discharge)
            / (upper.water_level - lower.water_level);
    Some((q, EvalMethod::Interpolated))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluates an already-resolved curve. `breakpoints` is consulted only for
/// `BreakpointTable` curves.
pub fn evaluate_curve(
    curve: &RatingCurve,
    breakpoints: &[Breakpoint],
    water_level: f64,
) -> Result<Discharge, EvalError> {
    check_level(water_level)?;

    let (value, method) = match curve.formula.evaluate(water_level) {
        Some(q) => (q, EvalMethod::Formula),
        None => interpolate(breakpoints, water_level)
            .ok_or_else(|| EvalError::EmptyBreakpointTable(curve.sensor_code.clone()))?,
    };

    if !value.is_finite() {
        return Err(EvalError::InvalidInput(format!(
            "curve {} produced a non-finite discharge at level {}",
            curve.id, water_level
        )));
    }

    Ok(Discharge {
        value,
        plausible: value >= 0.0,
        curve_id: curve.id,
        method,
    })
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Evaluates `curve` at `steps` evenly spaced levels from `min` to `max`
/// inclusive, returning `(water_level, discharge)` pairs.
pub fn sample_curve(
    curve: &RatingCurve,
    breakpoints: &[Breakpoint],
    min: f64,
    max: f64,
    steps: usize,
) -> Result<Vec<(f64, f64)>, EvalError> {
    if !SAMPLE_STEPS.contains(&steps) {
        return Err(EvalError::InvalidInput(format!(
            "sample steps {} outside [{}, {}]",
            steps,
            SAMPLE_STEPS.start(),
            SAMPLE_STEPS.end()
        )));
    }
    if !(min.is_finite() && max.is_finite() && min < max) {
        return Err(EvalError::InvalidInput(format!(
            "sample range [{}, {}] is empty or not finite",
            min, max
        )));
    }

    let step = (max - min) / (steps - 1) as f64;
    (0..steps)
        .map(|i| {
            // Pin the last point so rounding never leaves it short of `max`.
            let h = if i == steps - 1 { max } else { min + i as f64 * step };
            evaluate_curve(curve, breakpoints, h).map(|q| (h, q.value))
        })
        .collect()
}

/// Sampled table for the curve in force at a given time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurveSample {
    pub sensor_code: String,
    pub curve_id: i64,
    pub formula: String,
    pub points: Vec<(f64, f64)>,
}

/// Resolves and evaluates rating curves read through a `CurveRepository`.
pub struct RatingCurveEvaluator<'a, R: ?Sized> {
    curves: &'a R,
}

impl<'a, R: CurveRepository + ?Sized> RatingCurveEvaluator<'a, R> {
    pub fn new(curves: &'a R) -> Self {
        RatingCurveEvaluator { curves }
    }

    /// Converts `water_level` observed at `at` into discharge.
    ///
    /// Fails with `NoCurve` when the sensor has no curve in force at `at`;
    /// no fallback value is ever substituted.
    pub fn evaluate(
        &self,
        sensor_code: &str,
        water_level: f64,
        at: Timestamp,
    ) -> Result<Discharge, EvalError> {
        check_level(water_level)?;

        let curves = self.curves.list_curves(sensor_code)?;
        let curve = active_curve(&curves, at).ok_or_else(|| EvalError::NoCurve {
            sensor_code: sensor_code.to_string(),
            at,
        })?;

        let breakpoints = self.breakpoints_for(curve)?;
        evaluate_curve(curve, &breakpoints, water_level)
    }

    /// Samples the curve in force at `at` over `[min, max]`.
    pub fn sample(
        &self,
        sensor_code: &str,
        at: Timestamp,
        min: f64,
        max: f64,
        steps: usize,
    ) -> Result<CurveSample, EvalError> {
        let curves = self.curves.list_curves(sensor_code)?;
        let curve = active_curve(&curves, at).ok_or_else(|| EvalError::NoCurve {
            sensor_code: sensor_code.to_string(),
            at,
        })?;
        let breakpoints = self.breakpoints_for(curve)?;

        Ok(CurveSample {
            sensor_code: sensor_code.to_string(),
            curve_id: curve.id,
            formula: curve.formula.to_string(),
            points: sample_curve(curve, &breakpoints, min, max, steps)?,
        })
    }

    fn breakpoints_for(&self, curve: &RatingCurve) -> Result<Vec<Breakpoint>, EvalError> {
        match curve.formula {
            FormulaKind::BreakpointTable => Ok(self.curves.list_breakpoints(&curve.sensor_code)?),
            _ => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn curve(id: i64, formula: FormulaKind, effective: NaiveDate) -> RatingCurve {
        RatingCurve {
            id,
            sensor_code: "AWLR-01".to_string(),
            formula,
            effective_date: effective,
        }
    }

    fn table() -> Vec<Breakpoint> {
        // Deliberately unsorted.
        [(2.0, 20.0), (0.5, 1.0), (1.0, 5.0), (3.0, 45.0)]
            .into_iter()
            .map(Breakpoint::from)
            .collect()
    }

    // --- Formulas at zero ---------------------------------------------------

    #[test]
    fn test_formulas_at_zero_level() {
        assert_eq!(FormulaKind::Linear { a: 3.7 }.evaluate(0.0), Some(0.0));
        assert_eq!(FormulaKind::Power { a: 2.0, b: 1.5 }.evaluate(0.0), Some(0.0));
        assert_eq!(
            FormulaKind::Polynomial { a: 1.25, b: 4.0, c: 9.0 }.evaluate(0.0),
            Some(1.25)
        );
        assert_eq!(FormulaKind::Exponential { a: 0.8, b: 0.3 }.evaluate(0.0), Some(0.8));
        assert_eq!(FormulaKind::BreakpointTable.evaluate(0.0), None);
    }

    #[test]
    fn test_formula_values_away_from_zero() {
        let q = FormulaKind::Power { a: 2.0, b: 1.5 }.evaluate(3.0).unwrap();
        assert!((q - 10.392_304_845).abs() < 1e-6);

        let q = FormulaKind::Polynomial { a: 1.0, b: 2.0, c: 0.5 }.evaluate(2.0).unwrap();
        assert!((q - 7.0).abs() < 1e-12);

        let q = FormulaKind::Exponential { a: 1.0, b: 1.0 }.evaluate(1.0).unwrap();
        assert!((q - std::f64::consts::E).abs() < 1e-12);
    }

    // --- Breakpoint tables --------------------------------------------------

    #[test]
    fn test_exact_breakpoint_returns_stored_discharge() {
        for p in table() {
            let (q, method) = interpolate(&table(), p.water_level).unwrap();
            assert_eq!(q, p.discharge);
            assert_eq!(method, EvalMethod::ExactBreakpoint);
        }
    }

    #[test]
    fn test_interpolates_between_neighbours() {
        let (q, method) = interpolate(&table(), 1.5).unwrap();
        assert_eq!(method, EvalMethod::Interpolated);
        assert!((q - 12.5).abs() < 1e-12, "midpoint of 5 and 20, got {}", q);

        let (q, _) = interpolate(&table(), 2.25).unwrap();
        assert!((q - 26.25).abs() < 1e-12);
    }

    #[test]
    fn test_below_lowest_breakpoint_clamps() {
        let (q, method) = interpolate(&table(), 0.1).unwrap();
        assert_eq!(q, 1.0);
        assert_eq!(method, EvalMethod::ClampedLow);
    }

    #[test]
    fn test_above_highest_breakpoint_clamps() {
        let (q, method) = interpolate(&table(), 10.0).unwrap();
        assert_eq!(q, 45.0);
        assert_eq!(method, EvalMethod::ClampedHigh);
    }

    #[test]
    fn test_single_point_table_clamps_both_ways() {
        let one = [Breakpoint { water_level: 1.0, discharge: 3.0 }];
        assert_eq!(interpolate(&one, 0.0), Some((3.0, EvalMethod::ClampedLow)));
        assert_eq!(interpolate(&one, 1.0), Some((3.0, EvalMethod::ExactBreakpoint)));
        assert_eq!(interpolate(&one, 9.0), Some((3.0, EvalMethod::ClampedHigh)));
    }

    #[test]
    fn test_empty_table_yields_nothing() {
        assert_eq!(interpolate(&[], 1.0), None);
    }

    // --- Curve resolution ---------------------------------------------------

    #[test]
    fn test_active_curve_is_latest_not_after_observation() {
        let curves = vec![
            curve(1, FormulaKind::Linear { a: 1.0 }, date(2023, 1, 1)),
            curve(2, FormulaKind::Linear { a: 2.0 }, date(2024, 1, 1)),
            curve(3, FormulaKind::Linear { a: 3.0 }, date(2025, 1, 1)),
        ];
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(active_curve(&curves, at).map(|c| c.id), Some(2));
    }

    #[test]
    fn test_curve_effective_on_observation_day_applies() {
        let curves = vec![curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 6, 1))];
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(active_curve(&curves, at).map(|c| c.id), Some(1));
    }

    #[test]
    fn test_same_effective_date_prefers_higher_id() {
        let curves = vec![
            curve(7, FormulaKind::Linear { a: 7.0 }, date(2024, 1, 1)),
            curve(4, FormulaKind::Linear { a: 4.0 }, date(2024, 1, 1)),
        ];
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(active_curve(&curves, at).map(|c| c.id), Some(7));
    }

    #[test]
    fn test_no_curve_before_first_effective_date() {
        let curves = vec![curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 1, 1))];
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert!(active_curve(&curves, at).is_none());
    }

    // --- Input validation ---------------------------------------------------

    #[test]
    fn test_rejects_negative_and_nan_levels() {
        let c = curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 1, 1));
        assert!(matches!(evaluate_curve(&c, &[], -0.01), Err(EvalError::InvalidInput(_))));
        assert!(matches!(evaluate_curve(&c, &[], f64::NAN), Err(EvalError::InvalidInput(_))));
        assert!(matches!(
            evaluate_curve(&c, &[], f64::INFINITY),
            Err(EvalError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_negative_discharge_is_flagged_not_rejected() {
        let c = curve(1, FormulaKind::Polynomial { a: -5.0, b: 1.0, c: 0.0 }, date(2024, 1, 1));
        let q = evaluate_curve(&c, &[], 1.0).unwrap();
        assert_eq!(q.value, -4.0);
        assert!(!q.plausible);
    }

    // --- Sampling -----------------------------------------------------------

    #[test]
    fn test_sample_hits_both_endpoints() {
        let c = curve(1, FormulaKind::Power { a: 2.0, b: 1.5 }, date(2024, 1, 1));
        let points = sample_curve(&c, &[], 0.0, 4.0, 5).unwrap();
        let levels: Vec<f64> = points.iter().map(|p| p.0).collect();
        assert_eq!(levels, [0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(points[0].1, 0.0);
        assert!((points[4].1 - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_pins_last_level_to_max() {
        let c = curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 1, 1));
        let points = sample_curve(&c, &[], 0.1, 0.7, 7).unwrap();
        assert_eq!(points.len(), 7);
        assert_eq!(points[6], (0.7, 0.7));
    }

    #[test]
    fn test_sample_step_bounds() {
        let c = curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 1, 1));
        assert!(sample_curve(&c, &[], 0.0, 1.0, 4).is_err());
        assert_eq!(sample_curve(&c, &[], 0.0, 1.0, 5).unwrap().len(), 5);
        assert_eq!(sample_curve(&c, &[], 0.0, 1.0, 100).unwrap().len(), 100);
        assert!(sample_curve(&c, &[], 0.0, 1.0, 101).is_err());
    }

    #[test]
    fn test_sample_rejects_inverted_or_empty_range() {
        let c = curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 1, 1));
        assert!(matches!(sample_curve(&c, &[], 2.0, 1.0, 10), Err(EvalError::InvalidInput(_))));
        assert!(matches!(sample_curve(&c, &[], 1.0, 1.0, 10), Err(EvalError::InvalidInput(_))));
        assert!(matches!(
            sample_curve(&c, &[], 0.0, f64::NAN, 10),
            Err(EvalError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sample_below_zero_fails_on_level() {
        let c = curve(1, FormulaKind::Linear { a: 1.0 }, date(2024, 1, 1));
        assert!(matches!(sample_curve(&c, &[], -1.0, 1.0, 5), Err(EvalError::InvalidInput(_))));
    }

    // --- Repository-backed evaluator ----------------------------------------

    #[test]
    fn test_evaluator_reports_no_curve() {
        let store = MemoryStore::new();
        let evaluator = RatingCurveEvaluator::new(&store);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let err = evaluator.evaluate("AWLR-01", 1.0, at).unwrap_err();
        assert!(matches!(err, EvalError::NoCurve { .. }));
    }

    #[test]
    fn test_evaluator_uses_station_breakpoints() {
        let store = MemoryStore::new();
        let id = store
            .add_curve("AWLR-02", FormulaKind::BreakpointTable, date(2024, 1, 1))
            .unwrap();
        store
            .set_breakpoints("AWLR-02", &[(0.0, 0.0), (1.0, 10.0), (2.0, 30.0)])
            .unwrap();
        let evaluator = RatingCurveEvaluator::new(&store);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let q = evaluator.evaluate("AWLR-02", 1.5, at).unwrap();
        assert_eq!(q.curve_id, id);
        assert_eq!(q.method, EvalMethod::Interpolated);
        assert!((q.value - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_evaluator_fails_on_empty_breakpoint_set() {
        let store = MemoryStore::new();
        store
            .add_curve("AWLR-03", FormulaKind::BreakpointTable, date(2024, 1, 1))
            .unwrap();
        let evaluator = RatingCurveEvaluator::new(&store);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            evaluator.evaluate("AWLR-03", 1.0, at),
            Err(EvalError::EmptyBreakpointTable(_))
        ));
    }

    #[test]
    fn test_evaluator_samples_active_curve() {
        let store = MemoryStore::new();
        store
            .add_curve("AWLR-02", FormulaKind::BreakpointTable, date(2024, 1, 1))
            .unwrap();
        let id = store
            .add_curve("AWLR-02", FormulaKind::Linear { a: 3.0 }, date(2024, 3, 1))
            .unwrap();
        let evaluator = RatingCurveEvaluator::new(&store);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

        let sample = evaluator.sample("AWLR-02", at, 0.0, 2.0, 5).unwrap();
        assert_eq!(sample.curve_id, id);
        assert_eq!(sample.formula, "Q = 3 × H");
        assert_eq!(sample.points[2], (1.0, 3.0));

        let before = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            evaluator.sample("AWLR-02", before, 0.0, 2.0, 5),
            Err(EvalError::NoCurve { .. })
        ));
    }
}
