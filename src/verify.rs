//! Reference Data Verification Module
//!
//! Audits the configuration the pipeline depends on: rating curves,
//! breakpoint tables, threshold tiers and map mappings. Nothing here
//! changes stored data; the report says which sensors and devices would
//! fail or behave surprisingly at run time.
//!
//! Run this after loading new curves or mappings.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::model::{
    FormulaKind, GeoMapping, StorageError, ThresholdDefinition, TierRange, Timestamp,
};
use crate::rating::active_curve;
use crate::store::{CurveRepository, MappingRepository, SensorDirectory, ThresholdRepository};

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub sensor_results: Vec<SensorVerification>,
    pub device_results: Vec<DeviceVerification>,
    pub summary: VerificationSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub sensors_total: usize,
    pub sensors_working: usize,
    pub sensors_failed: usize,
    pub devices_total: usize,
    pub devices_working: usize,
    pub devices_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorVerification {
    pub sensor_code: String,
    pub device_code: String,
    pub status: VerificationStatus,
    pub curve_versions: usize,
    pub active_curve_id: Option<i64>,
    pub active_formula: Option<String>,
    /// Only set when the active curve is a breakpoint table.
    pub breakpoint_count: Option<usize>,
    pub threshold_defined: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceVerification {
    pub device_code: String,
    pub status: VerificationStatus,
    pub mapping_count: usize,
    pub overlapping_pairs: Vec<(i64, i64)>,
    pub degenerate_mappings: Vec<i64>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum VerificationStatus {
    Success,
    PartialSuccess,
    Failed,
}

fn status_from(fatal: bool, issues: &[String]) -> VerificationStatus {
    if fatal {
        VerificationStatus::Failed
    } else if issues.is_empty() {
        VerificationStatus::Success
    } else {
        VerificationStatus::PartialSuccess
    }
}

// ============================================================================
// Sensor Verification
// ============================================================================

/// Two half-open bands overlap. `None` bounds are infinite.
fn tiers_overlap(a: &TierRange, b: &TierRange) -> bool {
    let below = |lo: Option<f64>, hi: Option<f64>| match (lo, hi) {
        (Some(lo), Some(hi)) => lo < hi,
        _ => true,
    };
    below(a.min, b.max) && below(b.min, a.max)
}

fn threshold_issues(def: &ThresholdDefinition) -> Vec<String> {
    let tiers = [
        ("normal", def.normal),
        ("warning", def.warning),
        ("critical", def.critical),
    ];
    let mut issues = Vec::new();

    if tiers.iter().all(|(_, t)| t.is_none()) {
        issues.push("threshold definition has no tiers".to_string());
        return issues;
    }
    for (i, (name_a, a)) in tiers.iter().enumerate() {
        for (name_b, b) in &tiers[i + 1..] {
            if let (Some(a), Some(b)) = (a, b) {
                if tiers_overlap(a, b) {
                    issues.push(format!("{} tier overlaps {} tier", name_a, name_b));
                }
            }
        }
    }
    issues
}

pub fn verify_sensor<R>(
    repo: &R,
    sensor_code: &str,
    device_code: &str,
    at: Timestamp,
) -> Result<SensorVerification, StorageError>
where
    R: CurveRepository + ThresholdRepository + ?Sized,
{
    let mut result = SensorVerification {
        sensor_code: sensor_code.to_string(),
        device_code: device_code.to_string(),
        status: VerificationStatus::Failed,
        curve_versions: 0,
        active_curve_id: None,
        active_formula: None,
        breakpoint_count: None,
        threshold_defined: false,
        issues: Vec::new(),
    };
    let mut fatal = false;

    // Test 1: a curve is in force now
    let curves = repo.list_curves(sensor_code)?;
    result.curve_versions = curves.len();
    match active_curve(&curves, at) {
        Some(curve) => {
            result.active_curve_id = Some(curve.id);
            result.active_formula = Some(curve.formula.label().to_string());

            // Test 2: its breakpoint table is usable
            if curve.formula == FormulaKind::BreakpointTable {
                let mut points = repo.list_breakpoints(&curve.sensor_code)?;
                result.breakpoint_count = Some(points.len());
                points.sort_by(|a, b| a.water_level.total_cmp(&b.water_level));

                if points.is_empty() {
                    result
                        .issues
                        .push(format!("breakpoint table for {} is empty", curve.sensor_code));
                    fatal = true;
                }
                if points.windows(2).any(|w| w[0].water_level == w[1].water_level) {
                    result.issues.push("breakpoint table has duplicate water levels".to_string());
                }
                if points.windows(2).any(|w| w[1].discharge < w[0].discharge) {
                    result.issues.push("discharge decreases as water level rises".to_string());
                }
            }
        }
        None if curves.is_empty() => {
            result.issues.push("no rating curve recorded".to_string());
            fatal = true;
        }
        None => {
            result.issues.push(format!("no rating curve effective on {}", at.date_naive()));
            fatal = true;
        }
    }

    // Test 3: thresholds
    match repo.active_threshold(sensor_code)? {
        Some(def) => {
            result.threshold_defined = true;
            result.issues.extend(threshold_issues(&def));
        }
        None => result.issues.push("no active threshold; status will be unknown".to_string()),
    }

    result.status = status_from(fatal, &result.issues);
    Ok(result)
}

// ============================================================================
// Device Verification
// ============================================================================

fn mappings_overlap(a: &GeoMapping, b: &GeoMapping) -> bool {
    a.value_min < b.value_max && b.value_min < a.value_max
}

pub fn verify_device<R>(repo: &R, device_code: &str) -> Result<DeviceVerification, StorageError>
where
    R: MappingRepository + ?Sized,
{
    let mut mappings = repo.mappings_for_device(device_code)?;
    mappings.sort_by_key(|m| m.id);

    let mut result = DeviceVerification {
        device_code: device_code.to_string(),
        status: VerificationStatus::Failed,
        mapping_count: mappings.len(),
        overlapping_pairs: Vec::new(),
        degenerate_mappings: Vec::new(),
        issues: Vec::new(),
    };

    if mappings.is_empty() {
        result.issues.push("no map mappings declared".to_string());
        result.status = status_from(true, &result.issues);
        return Ok(result);
    }

    let (valid, degenerate): (Vec<_>, Vec<_>) = mappings.iter().partition(|m| {
        m.value_min.is_finite() && !m.value_max.is_nan() && m.value_min < m.value_max
    });
    for m in &degenerate {
        result.degenerate_mappings.push(m.id);
        result.issues.push(format!(
            "mapping {} range [{}, {}) can never match",
            m.id, m.value_min, m.value_max
        ));
    }

    for (i, a) in valid.iter().enumerate() {
        for b in &valid[i + 1..] {
            if mappings_overlap(a, b) {
                result.overlapping_pairs.push((a.id, b.id));
                result.issues.push(format!(
                    "mappings {} and {} overlap; {} wins",
                    a.id, b.id, a.id
                ));
            }
        }
    }

    result.status = status_from(valid.is_empty(), &result.issues);
    Ok(result)
}

// ============================================================================
// Full Verification Runner
// ============================================================================

pub fn run_full_verification<R>(repo: &R, at: Timestamp) -> Result<VerificationReport, StorageError>
where
    R: CurveRepository + ThresholdRepository + MappingRepository + SensorDirectory + ?Sized,
{
    let mut report = VerificationReport {
        timestamp: Utc::now().to_rfc3339(),
        sensor_results: Vec::new(),
        device_results: Vec::new(),
        summary: VerificationSummary::default(),
    };

    let mut sensors = repo.list_sensors()?;
    sensors.sort();

    let mut devices: Vec<String> = sensors.iter().map(|(_, d)| d.clone()).collect();
    devices.sort();
    devices.dedup();

    for (sensor_code, device_code) in &sensors {
        let result = verify_sensor(repo, sensor_code, device_code, at)?;
        match result.status {
            VerificationStatus::Failed => report.summary.sensors_failed += 1,
            _ => report.summary.sensors_working += 1,
        }
        report.sensor_results.push(result);
    }
    report.summary.sensors_total = report.sensor_results.len();

    for device_code in &devices {
        let result = verify_device(repo, device_code)?;
        match result.status {
            VerificationStatus::Failed => report.summary.devices_failed += 1,
            _ => report.summary.devices_working += 1,
        }
        report.device_results.push(result);
    }
    report.summary.devices_total = report.device_results.len();

    Ok(report)
}

pub fn print_summary(report: &VerificationReport) {
    println!("\n═══════════════════════════════════════════════════════════");
    println!("VERIFICATION SUMMARY ({})", report.timestamp);
    println!("═══════════════════════════════════════════════════════════");
    println!();
    for s in &report.sensor_results {
        let mark = match s.status {
            VerificationStatus::Success => "✓",
            VerificationStatus::PartialSuccess => "⚠",
            VerificationStatus::Failed => "✗",
        };
        println!("  {} {:<12} {}", mark, s.sensor_code, s.issues.join("; "));
    }
    for d in &report.device_results {
        let mark = match d.status {
            VerificationStatus::Success => "✓",
            VerificationStatus::PartialSuccess => "⚠",
            VerificationStatus::Failed => "✗",
        };
        println!("  {} {:<12} {}", mark, d.device_code, d.issues.join("; "));
    }
    println!();
    println!(
        "Sensors:  {}/{} working  ({} failed)",
        report.summary.sensors_working, report.summary.sensors_total, report.summary.sensors_failed
    );
    println!(
        "Devices:  {}/{} working  ({} failed)",
        report.summary.devices_working, report.summary.devices_total, report.summary.devices_failed
    );
    println!("═══════════════════════════════════════════════════════════");
}
