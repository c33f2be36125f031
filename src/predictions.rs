//! Forecast prediction lifecycle.
//!
//! Every completed forecast run for a sensor fully replaces that sensor's
//! future predictions: rows predicted for after the run time are deleted
//! and the new batch is inserted in the same transaction, under the
//! sensor's exclusive lock. Either the new set is visible afterwards or
//! the old one is, never a mix and never nothing because a write failed.
//!
//! Items are evaluated with the same rating-curve and threshold logic as
//! observed readings. A bad item is dropped and reported; it does not stop
//! the rest of the batch.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;

use crate::alert::classify_value;
use crate::ingest::forecast::{BasinSensorFailure, ForecastError, ForecastSource};
use crate::logging::{self, Component};
use crate::model::{
    EvalError, ItemFailure, PipelineError, PredictedDischarge, PredictedQuantity, RawPrediction,
    Timestamp,
};
use crate::rating::RatingCurveEvaluator;
use crate::store::{CurveRepository, RecordStore, ThresholdRepository};

/// Outcome of one `replace_future_predictions` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub sensor_code: String,
    pub run_at: Timestamp,
    pub inserted: usize,
    /// Previously stored future predictions removed by the replace.
    pub deleted: u64,
    pub replaced: bool,
    pub failures: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Inserted count, or `PartialBatchFailure` if any item was rejected.
    pub fn ensure_complete(self) -> Result<usize, PipelineError> {
        if self.failures.is_empty() {
            Ok(self.inserted)
        } else {
            Err(PipelineError::PartialBatchFailure {
                inserted: self.inserted,
                failures: self.failures,
            })
        }
    }
}

pub struct PredictionLifecycleManager<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> PredictionLifecycleManager<'a, S>
where
    S: CurveRepository + ThresholdRepository + RecordStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        PredictionLifecycleManager { store }
    }

    /// Validates and evaluates a raw batch without touching stored rows.
    ///
    /// Storage failures abort with `Err`; every other problem becomes an
    /// `ItemFailure` for that item.
    pub fn prepare(
        &self,
        sensor_code: &str,
        run_at: Timestamp,
        batch: &[RawPrediction],
    ) -> Result<(Vec<PredictedDischarge>, Vec<ItemFailure>), PipelineError> {
        let evaluator = RatingCurveEvaluator::new(self.store);
        let threshold = self.store.active_threshold(sensor_code)?;

        let mut rows = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();
        let mut seen = HashSet::new();

        for (index, raw) in batch.iter().enumerate() {
            let reject = |reason: String| ItemFailure {
                index,
                predicted_for: raw.predicted_for,
                reason,
            };

            if raw.predicted_for <= run_at {
                failures.push(reject(format!(
                    "predicted time {} is not after run time {}",
                    raw.predicted_for, run_at
                )));
                continue;
            }
            if !raw.value.is_finite() {
                failures.push(reject(format!("value {} is not a finite number", raw.value)));
                continue;
            }
            if let Some(c) = raw.confidence {
                if !(0.0..=1.0).contains(&c) {
                    failures.push(reject(format!("confidence {} is outside [0, 1]", c)));
                    continue;
                }
            }
            if !seen.insert((raw.predicted_for, raw.model_code.clone())) {
                failures.push(reject(format!(
                    "duplicate prediction for {} from model {}",
                    raw.predicted_for, raw.model_code
                )));
                continue;
            }

            let (discharge, plausible, curve_id) = match raw.quantity {
                PredictedQuantity::Discharge => (raw.value, raw.value >= 0.0, None),
                PredictedQuantity::WaterLevel => {
                    match evaluator.evaluate(sensor_code, raw.value, raw.predicted_for) {
                        Ok(q) => (q.value, q.plausible, Some(q.curve_id)),
                        Err(EvalError::Storage(e)) => return Err(PipelineError::Storage(e)),
                        Err(e) => {
                            failures.push(reject(e.to_string()));
                            continue;
                        }
                    }
                }
            };

            rows.push(PredictedDischarge {
                sensor_code: sensor_code.to_string(),
                predicted_for: raw.predicted_for,
                predicted_value: raw.value,
                predicted_discharge: discharge,
                plausible,
                confidence: raw.confidence,
                model_code: raw.model_code.clone(),
                status: classify_value(threshold.as_ref(), discharge),
                rating_curve_id: curve_id,
                run_at,
            });
        }

        Ok((rows, failures))
    }

    /// Replaces the sensor's future predictions with `batch`.
    ///
    /// The stored future set is always removed, even when no item survives
    /// validation. A storage failure rolls the whole replace back and is
    /// returned as `PipelineError::Storage`.
    pub fn replace_future_predictions(
        &self,
        sensor_code: &str,
        run_at: Timestamp,
        batch: Vec<RawPrediction>,
    ) -> Result<BatchReport, PipelineError> {
        let (rows, failures) = self.prepare(sensor_code, run_at, &batch)?;

        for f in &failures {
            logging::debug(
                Component::Forecast,
                Some(sensor_code),
                &format!("dropped prediction #{} ({}): {}", f.index, f.predicted_for, f.reason),
            );
        }

        if rows.is_empty() && !batch.is_empty() {
            logging::warn(
                Component::Forecast,
                Some(sensor_code),
                &format!("no usable predictions in a batch of {}", batch.len()),
            );
        }

        let mut deleted = 0;
        let mut inserted = 0;
        let result = self.store.with_prediction_tx(sensor_code, &mut |tx| {
            deleted = tx.delete_future_predictions(sensor_code, run_at)?;
            inserted = tx.insert_predictions(&rows)?;
            Ok(())
        });

        if let Err(e) = result {
            let err = PipelineError::Storage(e);
            logging::log_pipeline_failure(sensor_code, "replace predictions", &err);
            return Err(err);
        }

        logging::log_batch_summary(
            Component::Forecast,
            sensor_code,
            batch.len(),
            inserted as usize,
            failures.len(),
        );

        Ok(BatchReport {
            sensor_code: sensor_code.to_string(),
            run_at,
            inserted: inserted as usize,
            deleted,
            replaced: true,
            failures,
        })
    }
}

// ---------------------------------------------------------------------------
// Forecast runs
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ForecastRunError {
    #[error(transparent)]
    Source(#[from] ForecastError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Fetches a fresh forecast for one sensor and stores it.
pub fn run_sensor_forecast<F, S>(
    source: &F,
    manager: &PredictionLifecycleManager<'_, S>,
    sensor_code: &str,
    run_at: Timestamp,
) -> Result<BatchReport, ForecastRunError>
where
    F: ForecastSource + ?Sized,
    S: CurveRepository + ThresholdRepository + RecordStore + ?Sized,
{
    let run = source.fetch_sensor(sensor_code).inspect_err(|e| {
        logging::log_forecast_failure(sensor_code, "fetch forecast", e);
    })?;
    Ok(manager.replace_future_predictions(sensor_code, run_at, run.predictions)?)
}

/// Per-sensor result of a basin run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SensorOutcome {
    Ok {
        sensor_code: String,
        inserted: usize,
        rejected: usize,
    },
    Failed {
        sensor_code: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasinSummary {
    pub river_basin_code: String,
    pub total_sensors: usize,
    pub ok: usize,
    pub failed: usize,
    pub details: Vec<SensorOutcome>,
}

/// Runs a basin forecast and replaces predictions sensor by sensor.
///
/// A failure for one sensor, whether reported by the service or raised
/// while storing, is recorded and the run moves on to the next sensor.
pub fn run_basin_forecast<F, S>(
    source: &F,
    manager: &PredictionLifecycleManager<'_, S>,
    river_basin_code: &str,
    run_at: Timestamp,
) -> Result<BasinSummary, ForecastError>
where
    F: ForecastSource + ?Sized,
    S: CurveRepository + ThresholdRepository + RecordStore + ?Sized,
{
    let basin = source.fetch_basin(river_basin_code)?;
    let mut details = Vec::with_capacity(basin.runs.len() + basin.failed.len());

    for run in basin.runs {
        let outcome = match manager.replace_future_predictions(
            &run.sensor_code,
            run_at,
            run.predictions,
        ) {
            Ok(report) => SensorOutcome::Ok {
                sensor_code: run.sensor_code,
                inserted: report.inserted,
                rejected: report.failures.len(),
            },
            Err(e) => SensorOutcome::Failed {
                sensor_code: run.sensor_code,
                error: e.to_string(),
            },
        };
        details.push(outcome);
    }
    for BasinSensorFailure { sensor_code, error } in basin.failed {
        logging::warn(
            Component::Forecast,
            Some(&sensor_code),
            &format!("service could not forecast: {}", error),
        );
        details.push(SensorOutcome::Failed { sensor_code, error });
    }

    let ok = details
        .iter()
        .filter(|d| matches!(d, SensorOutcome::Ok { .. }))
        .count();
    let summary = BasinSummary {
        river_basin_code: basin.river_basin_code,
        total_sensors: details.len(),
        ok,
        failed: details.len() - ok,
        details,
    };
    logging::log_batch_summary(
        Component::Forecast,
        river_basin_code,
        summary.total_sensors,
        summary.ok,
        summary.failed,
    );
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
