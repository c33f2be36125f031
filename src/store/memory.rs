/// In-process store implementing every repository trait.
///
/// Mirrors the constraints of the PostgreSQL schema closely enough to test
/// against: surrogate ids in insertion order, `(sensor, calculated_at)`
/// uniqueness for observations, `(sensor, predicted_for, model)`
/// uniqueness for predictions, and staged, sensor-locked prediction
/// transactions that are discarded on error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;

use super::{
    CurveRepository, MappingRepository, PredictionWriter, RecordStore, SensorDirectory,
    ThresholdRepository,
};
use crate::model::{
    Breakpoint, CalculatedDischarge, FormulaKind, GeoMapping, PredictedDischarge, RatingCurve,
    StorageError, ThresholdDefinition, Timestamp,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    curves: Vec<RatingCurve>,
    breakpoints: HashMap<String, Vec<Breakpoint>>,
    thresholds: HashMap<String, ThresholdDefinition>,
    mappings: Vec<GeoMapping>,
    sensors: Vec<(String, String)>,
    calculated: Vec<CalculatedDischarge>,
    predictions: Vec<PredictedDischarge>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    sensor_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// 1-based index of the prediction row the next transaction fails on.
    insert_fault: Mutex<Option<usize>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    m.lock().map_err(|_| StorageError::Poisoned)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Seeding ------------------------------------------------------------

    pub fn add_sensor(&self, sensor_code: &str, device_code: &str) -> Result<(), StorageError> {
        let mut t = lock(&self.tables)?;
        t.sensors.retain(|(s, _)| s != sensor_code);
        t.sensors.push((sensor_code.to_string(), device_code.to_string()));
        Ok(())
    }

    /// Records a curve version and returns its id.
    pub fn add_curve(
        &self,
        sensor_code: &str,
        formula: FormulaKind,
        effective_date: NaiveDate,
    ) -> Result<i64, StorageError> {
        let mut t = lock(&self.tables)?;
        let id = t.next_id();
        t.curves.push(RatingCurve {
            id,
            sensor_code: sensor_code.to_string(),
            formula,
            effective_date,
        });
        Ok(id)
    }

    pub fn set_breakpoints(
        &self,
        station_code: &str,
        points: &[(f64, f64)],
    ) -> Result<(), StorageError> {
        let mut t = lock(&self.tables)?;
        t.breakpoints.insert(
            station_code.to_string(),
            points.iter().copied().map(Breakpoint::from).collect(),
        );
        Ok(())
    }

    /// Replaces the sensor's active definition.
    pub fn set_threshold(&self, definition: ThresholdDefinition) -> Result<(), StorageError> {
        let mut t = lock(&self.tables)?;
        t.thresholds.insert(definition.sensor_code.clone(), definition);
        Ok(())
    }

    /// Declares a mapping and returns its id. Declaration order is match order.
    pub fn add_mapping(
        &self,
        device_code: &str,
        geojson_code: &str,
        value_min: f64,
        value_max: f64,
        file_path: Option<&str>,
    ) -> Result<i64, StorageError> {
        let mut t = lock(&self.tables)?;
        if t.mappings.iter().any(|m| m.geojson_code == geojson_code) {
            return Err(StorageError::Conflict(format!(
                "geojson code {} already mapped",
                geojson_code
            )));
        }
        let id = t.next_id();
        t.mappings.push(GeoMapping {
            id,
            geojson_code: geojson_code.to_string(),
            device_code: device_code.to_string(),
            value_min,
            value_max,
            file_path: file_path.map(String::from),
            version: None,
            description: None,
        });
        Ok(id)
    }

    /// Makes the next prediction transaction fail when it inserts its
    /// `nth` row (1-based). The fault fires once.
    pub fn fail_prediction_insert_at(&self, nth: usize) -> Result<(), StorageError> {
        *lock(&self.insert_fault)? = Some(nth);
        Ok(())
    }

    // --- Inspection ---------------------------------------------------------

    pub fn calculated_records(
        &self,
        sensor_code: &str,
    ) -> Result<Vec<CalculatedDischarge>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.calculated
            .iter()
            .filter(|r| r.sensor_code == sensor_code)
            .cloned()
            .collect())
    }

    pub fn all_predictions(
        &self,
        sensor_code: &str,
    ) -> Result<Vec<PredictedDischarge>, StorageError> {
        let t = lock(&self.tables)?;
        let mut rows: Vec<_> = t
            .predictions
            .iter()
            .filter(|p| p.sensor_code == sensor_code)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.predicted_for);
        Ok(rows)
    }

    fn sensor_lock(&self, sensor_code: &str) -> Result<Arc<Mutex<()>>, StorageError> {
        let mut locks = lock(&self.sensor_locks)?;
        Ok(locks
            .entry(sensor_code.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

// ---------------------------------------------------------------------------
// Read repositories
// ---------------------------------------------------------------------------

impl CurveRepository for MemoryStore {
    fn list_curves(&self, sensor_code: &str) -> Result<Vec<RatingCurve>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.curves
            .iter()
            .filter(|c| c.sensor_code == sensor_code)
            .cloned()
            .collect())
    }

    fn list_breakpoints(&self, station_code: &str) -> Result<Vec<Breakpoint>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.breakpoints.get(station_code).cloned().unwrap_or_default())
    }
}

impl ThresholdRepository for MemoryStore {
    fn active_threshold(
        &self,
        sensor_code: &str,
    ) -> Result<Option<ThresholdDefinition>, StorageError> {
        Ok(lock(&self.tables)?.thresholds.get(sensor_code).cloned())
    }
}

impl MappingRepository for MemoryStore {
    fn mappings_for_device(&self, device_code: &str) -> Result<Vec<GeoMapping>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.mappings
            .iter()
            .filter(|m| m.device_code == device_code)
            .cloned()
            .collect())
    }
}

impl SensorDirectory for MemoryStore {
    fn device_for_sensor(&self, sensor_code: &str) -> Result<Option<String>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.sensors
            .iter()
            .find(|(s, _)| s == sensor_code)
            .map(|(_, d)| d.clone()))
    }

    fn list_sensors(&self) -> Result<Vec<(String, String)>, StorageError> {
        Ok(lock(&self.tables)?.sensors.clone())
    }
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

/// Staged copy of one sensor's prediction rows.
struct MemoryTx {
    sensor_code: String,
    rows: Vec<PredictedDischarge>,
    inserted: usize,
    fail_at: Option<usize>,
}

impl PredictionWriter for MemoryTx {
    fn delete_future_predictions(
        &mut self,
        sensor_code: &str,
        after: Timestamp,
    ) -> Result<u64, StorageError> {
        if sensor_code != self.sensor_code {
            return Err(StorageError::WriteFailed(format!(
                "sensor {} is outside the transaction for {}",
                sensor_code, self.sensor_code
            )));
        }
        let before = self.rows.len();
        self.rows.retain(|p| p.predicted_for <= after);
        Ok((before - self.rows.len()) as u64)
    }

    fn insert_predictions(&mut self, batch: &[PredictedDischarge]) -> Result<u64, StorageError> {
        for row in batch {
            if row.sensor_code != self.sensor_code {
                return Err(StorageError::WriteFailed(format!(
                    "sensor {} is outside the transaction for {}",
                    row.sensor_code, self.sensor_code
                )));
            }
            self.inserted += 1;
            if self.fail_at == Some(self.inserted) {
                return Err(StorageError::WriteFailed(format!(
                    "injected fault on prediction row {}",
                    self.inserted
                )));
            }
            let duplicate = self.rows.iter().any(|p| {
                p.predicted_for == row.predicted_for && p.model_code == row.model_code
            });
            if duplicate {
                return Err(StorageError::Conflict(format!(
                    "prediction for {} at {} by {} already exists",
                    row.sensor_code, row.predicted_for, row.model_code
                )));
            }
            self.rows.push(row.clone());
        }
        Ok(batch.len() as u64)
    }
}

impl RecordStore for MemoryStore {
    fn insert_calculated(&self, record: &CalculatedDischarge) -> Result<(), StorageError> {
        let mut t = lock(&self.tables)?;
        let duplicate = t.calculated.iter().any(|r| {
            r.sensor_code == record.sensor_code && r.calculated_at == record.calculated_at
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "discharge for {} at {} already recorded",
                record.sensor_code, record.calculated_at
            )));
        }
        t.calculated.push(record.clone());
        Ok(())
    }

    fn with_prediction_tx(
        &self,
        sensor_code: &str,
        work: &mut dyn FnMut(&mut dyn PredictionWriter) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let sensor_lock = self.sensor_lock(sensor_code)?;
        let _held = lock(&sensor_lock)?;

        let mut tx = MemoryTx {
            sensor_code: sensor_code.to_string(),
            rows: self.all_predictions(sensor_code)?,
            inserted: 0,
            fail_at: lock(&self.insert_fault)?.take(),
        };
        work(&mut tx)?;

        let mut t = lock(&self.tables)?;
        t.predictions.retain(|p| p.sensor_code != sensor_code);
        t.predictions.extend(tx.rows);
        Ok(())
    }

    fn latest_calculated(
        &self,
        sensor_code: &str,
    ) -> Result<Option<CalculatedDischarge>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.calculated
            .iter()
            .filter(|r| r.sensor_code == sensor_code)
            .max_by_key(|r| r.calculated_at)
            .cloned())
    }

    fn latest_prediction(
        &self,
        sensor_code: &str,
    ) -> Result<Option<PredictedDischarge>, StorageError> {
        let t = lock(&self.tables)?;
        Ok(t.predictions
            .iter()
            .filter(|p| p.sensor_code == sensor_code)
            .max_by_key(|p| p.predicted_for)
            .cloned())
    }

    fn future_predictions(
        &self,
        sensor_code: &str,
        after: Timestamp,
    ) -> Result<Vec<PredictedDischarge>, StorageError> {
        Ok(self
            .all_predictions(sensor_code)?
            .into_iter()
            .filter(|p| p.predicted_for > after)
            .collect())
    }
}
