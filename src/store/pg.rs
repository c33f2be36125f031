/// PostgreSQL store for the discharge pipeline.
///
/// Tables live in the `ffws` schema created by `sql/001_discharge_schema.sql`.
/// The blocking `postgres::Client` needs `&mut` access, so it sits behind a
/// mutex; every repository call takes the lock for one statement, and a
/// prediction replace holds it for the whole transaction.

use std::sync::{Mutex, MutexGuard};

use postgres::{Client, NoTls, Row, Transaction};

use super::{
    CurveRepository, MappingRepository, PredictionWriter, RecordStore, SensorDirectory,
    ThresholdRepository,
};
use crate::logging::{self, Component};
use crate::model::{
    Breakpoint, CalculatedDischarge, FormulaKind, GeoMapping, PredictedDischarge, RatingCurve,
    Status, StorageError, ThresholdDefinition, TierRange, Timestamp,
};

/// Schemas the pipeline expects to exist before it starts.
pub const REQUIRED_SCHEMAS: &[&str] = &["ffws"];

pub struct PgStore {
    client: Mutex<Client>,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, StorageError> {
        let client = Client::connect(database_url, NoTls)?;
        Ok(PgStore { client: Mutex::new(client) })
    }

    /// Connects and checks that every schema in `schemas` exists, so a
    /// missing migration fails at startup rather than on the first write.
    pub fn connect_and_verify(database_url: &str, schemas: &[&str]) -> Result<Self, StorageError> {
        Self::open_verified(database_url, schemas).inspect_err(|e| {
            logging::log_storage_failure(Component::Database, "-", "connect", e);
        })
    }

    fn open_verified(database_url: &str, schemas: &[&str]) -> Result<Self, StorageError> {
        let store = Self::connect(database_url)?;
        {
            let mut client = store.client()?;
            for schema in schemas {
                let row = client.query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
                    &[schema],
                )?;
                let exists: bool = row.get(0);
                if !exists {
                    return Err(StorageError::Corrupt(format!(
                        "schema '{}' is missing; apply sql/001_discharge_schema.sql",
                        schema
                    )));
                }
            }
        }
        Ok(store)
    }

    fn client(&self) -> Result<MutexGuard<'_, Client>, StorageError> {
        self.client.lock().map_err(|_| StorageError::Poisoned)
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn curve_from_row(row: &Row) -> Result<RatingCurve, StorageError> {
    let formula_type: String = row.get("formula_type");
    let formula = FormulaKind::from_columns(&formula_type, row.get("a"), row.get("b"), row.get("c"))
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
    Ok(RatingCurve {
        id: row.get("id"),
        sensor_code: row.get("sensor_code"),
        formula,
        effective_date: row.get("effective_date"),
    })
}

fn tier_from_row(
    row: &Row,
    min_col: &str,
    max_col: &str,
) -> Result<Option<TierRange>, StorageError> {
    let min: Option<f64> = row.get(min_col);
    let max: Option<f64> = row.get(max_col);
    if min.is_none() && max.is_none() {
        return Ok(None);
    }
    TierRange::new(min, max)
        .map(Some)
        .map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn mapping_from_row(row: &Row) -> GeoMapping {
    GeoMapping {
        id: row.get("id"),
        geojson_code: row.get("geojson_code"),
        device_code: row.get("device_code"),
        value_min: row.get("value_min"),
        value_max: row.get("value_max"),
        file_path: row.get("file_path"),
        version: row.get("version"),
        description: row.get("description"),
    }
}

fn calculated_from_row(row: &Row) -> CalculatedDischarge {
    let status: String = row.get("threshold_status");
    CalculatedDischarge {
        sensor_code: row.get("sensor_code"),
        water_level: row.get("water_level"),
        discharge: row.get("discharge"),
        plausible: row.get("plausible"),
        rating_curve_id: row.get("rating_curve_id"),
        status: Status::from_label(&status),
        calculated_at: row.get("calculated_at"),
    }
}

fn prediction_from_row(row: &Row) -> PredictedDischarge {
    let status: String = row.get("threshold_status");
    PredictedDischarge {
        sensor_code: row.get("sensor_code"),
        predicted_for: row.get("predicted_for"),
        predicted_value: row.get("predicted_value"),
        predicted_discharge: row.get("predicted_discharge"),
        plausible: row.get("plausible"),
        confidence: row.get("confidence_score"),
        model_code: row.get("model_code"),
        status: Status::from_label(&status),
        rating_curve_id: row.get("rating_curve_id"),
        run_at: row.get("run_at"),
    }
}

const PREDICTION_COLUMNS: &str = "sensor_code, predicted_for, predicted_value, \
     predicted_discharge, plausible, confidence_score, model_code, threshold_status, \
     rating_curve_id, run_at";

// ---------------------------------------------------------------------------
// Read repositories
// ---------------------------------------------------------------------------

impl CurveRepository for PgStore {
    fn list_curves(&self, sensor_code: &str) -> Result<Vec<RatingCurve>, StorageError> {
        let rows = self.client()?.query(
            "SELECT id, sensor_code, formula_type, a, b, c, effective_date
             FROM ffws.rating_curves
             WHERE sensor_code = $1
             ORDER BY effective_date, id",
            &[&sensor_code],
        )?;
        rows.iter().map(curve_from_row).collect()
    }

    fn list_breakpoints(&self, station_code: &str) -> Result<Vec<Breakpoint>, StorageError> {
        let rows = self.client()?.query(
            "SELECT water_level, discharge
             FROM ffws.rating_breakpoints
             WHERE station_code = $1
             ORDER BY water_level, id",
            &[&station_code],
        )?;
        Ok(rows
            .iter()
            .map(|r| Breakpoint { water_level: r.get(0), discharge: r.get(1) })
            .collect())
    }
}

impl ThresholdRepository for PgStore {
    fn active_threshold(
        &self,
        sensor_code: &str,
    ) -> Result<Option<ThresholdDefinition>, StorageError> {
        let row = self.client()?.query_opt(
            "SELECT sensor_code, normal_min, normal_max, warning_min, warning_max,
                    critical_min, critical_max
             FROM ffws.sensor_thresholds
             WHERE sensor_code = $1 AND is_active",
            &[&sensor_code],
        )?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ThresholdDefinition {
            sensor_code: row.get("sensor_code"),
            normal: tier_from_row(&row, "normal_min", "normal_max")?,
            warning: tier_from_row(&row, "warning_min", "warning_max")?,
            critical: tier_from_row(&row, "critical_min", "critical_max")?,
        }))
    }
}

impl MappingRepository for PgStore {
    fn mappings_for_device(&self, device_code: &str) -> Result<Vec<GeoMapping>, StorageError> {
        let rows = self.client()?.query(
            "SELECT id, geojson_code, device_code, value_min, value_max, file_path,
                    version, description
             FROM ffws.geojson_mappings
             WHERE device_code = $1
             ORDER BY id",
            &[&device_code],
        )?;
        Ok(rows.iter().map(mapping_from_row).collect())
    }
}

impl SensorDirectory for PgStore {
    fn device_for_sensor(&self, sensor_code: &str) -> Result<Option<String>, StorageError> {
        let row = self.client()?.query_opt(
            "SELECT device_code FROM ffws.sensors WHERE sensor_code = $1",
            &[&sensor_code],
        )?;
        Ok(row.map(|r| r.get(0)))
    }

    fn list_sensors(&self) -> Result<Vec<(String, String)>, StorageError> {
        let rows = self.client()?.query(
            "SELECT sensor_code, device_code FROM ffws.sensors ORDER BY sensor_code",
            &[],
        )?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

struct PgTx<'a> {
    tx: Transaction<'a>,
}

impl PredictionWriter for PgTx<'_> {
    fn delete_future_predictions(
        &mut self,
        sensor_code: &str,
        after: Timestamp,
    ) -> Result<u64, StorageError> {
        Ok(self.tx.execute(
            "DELETE FROM ffws.predicted_discharges
             WHERE sensor_code = $1 AND predicted_for > $2",
            &[&sensor_code, &after],
        )?)
    }

    fn insert_predictions(&mut self, batch: &[PredictedDischarge]) -> Result<u64, StorageError> {
        let stmt = self.tx.prepare(&format!(
            "INSERT INTO ffws.predicted_discharges ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            PREDICTION_COLUMNS
        ))?;
        let mut inserted = 0;
        for p in batch {
            inserted += self.tx.execute(
                &stmt,
                &[
                    &p.sensor_code,
                    &p.predicted_for,
                    &p.predicted_value,
                    &p.predicted_discharge,
                    &p.plausible,
                    &p.confidence,
                    &p.model_code,
                    &p.status.as_str(),
                    &p.rating_curve_id,
                    &p.run_at,
                ],
            )?;
        }
        Ok(inserted)
    }
}

impl RecordStore for PgStore {
    fn insert_calculated(&self, record: &CalculatedDischarge) -> Result<(), StorageError> {
        self.client()?.execute(
            "INSERT INTO ffws.calculated_discharges
                (sensor_code, water_level, discharge, plausible, rating_curve_id,
                 threshold_status, calculated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &record.sensor_code,
                &record.water_level,
                &record.discharge,
                &record.plausible,
                &record.rating_curve_id,
                &record.status.as_str(),
                &record.calculated_at,
            ],
        )?;
        Ok(())
    }

    fn with_prediction_tx(
        &self,
        sensor_code: &str,
        work: &mut dyn FnMut(&mut dyn PredictionWriter) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut client = self.client()?;
        let mut tx = client.transaction()?;
        // Serializes concurrent forecast runs for the same sensor across
        // processes; released at commit or rollback.
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&sensor_code])?;

        let mut writer = PgTx { tx };
        work(&mut writer)?;
        writer.tx.commit()?;
        Ok(())
    }

    fn latest_calculated(
        &self,
        sensor_code: &str,
    ) -> Result<Option<CalculatedDischarge>, StorageError> {
        let row = self.client()?.query_opt(
            "SELECT sensor_code, water_level, discharge, plausible, rating_curve_id,
                    threshold_status, calculated_at
             FROM ffws.calculated_discharges
             WHERE sensor_code = $1
             ORDER BY calculated_at DESC
             LIMIT 1",
            &[&sensor_code],
        )?;
        Ok(row.as_ref().map(calculated_from_row))
    }

    fn latest_prediction(
        &self,
        sensor_code: &str,
    ) -> Result<Option<PredictedDischarge>, StorageError> {
        let row = self.client()?.query_opt(
            &format!(
                "SELECT {} FROM ffws.predicted_discharges
                 WHERE sensor_code = $1
                 ORDER BY predicted_for DESC, id DESC
                 LIMIT 1",
                PREDICTION_COLUMNS
            ),
            &[&sensor_code],
        )?;
        Ok(row.as_ref().map(prediction_from_row))
    }

    fn future_predictions(
        &self,
        sensor_code: &str,
        after: Timestamp,
    ) -> Result<Vec<PredictedDischarge>, StorageError> {
        let rows = self.client()?.query(
            &format!(
                "SELECT {} FROM ffws.predicted_discharges
                 WHERE sensor_code = $1 AND predicted_for > $2
                 ORDER BY predicted_for, id",
                PREDICTION_COLUMNS
            ),
            &[&sensor_code, &after],
        )?;
        Ok(rows.iter().map(prediction_from_row).collect())
    }
}
