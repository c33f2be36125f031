/// Repository seams between the pipeline and its backing store.
///
/// The evaluator, classifier and selector only ever read through these
/// traits; the record store is the single writer. Two implementations ship
/// with the crate:
/// - `memory`: in-process tables, used by tests.
/// - `pg`: the PostgreSQL production store.

use crate::model::{
    Breakpoint, CalculatedDischarge, GeoMapping, PredictedDischarge, RatingCurve, StorageError,
    ThresholdDefinition, Timestamp,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub trait CurveRepository {
    /// Every curve version recorded for the sensor, in any order.
    fn list_curves(&self, sensor_code: &str) -> Result<Vec<RatingCurve>, StorageError>;

    /// The station's breakpoint set, in any order.
    fn list_breakpoints(&self, station_code: &str) -> Result<Vec<Breakpoint>, StorageError>;
}

pub trait ThresholdRepository {
    fn active_threshold(
        &self,
        sensor_code: &str,
    ) -> Result<Option<ThresholdDefinition>, StorageError>;
}

pub trait MappingRepository {
    /// Mappings for a device in declaration (primary key) order.
    fn mappings_for_device(&self, device_code: &str) -> Result<Vec<GeoMapping>, StorageError>;
}

pub trait SensorDirectory {
    /// Parent device of a sensor, or `None` if the code is not a sensor.
    fn device_for_sensor(&self, sensor_code: &str) -> Result<Option<String>, StorageError>;

    /// Every registered `(sensor_code, device_code)` pair.
    fn list_sensors(&self) -> Result<Vec<(String, String)>, StorageError>;
}

/// Write half of a prediction replace. Only reachable inside
/// `RecordStore::with_prediction_tx`.
pub trait PredictionWriter {
    /// Deletes the sensor's predictions with `predicted_for > after`.
    fn delete_future_predictions(
        &mut self,
        sensor_code: &str,
        after: Timestamp,
    ) -> Result<u64, StorageError>;

    fn insert_predictions(&mut self, batch: &[PredictedDischarge]) -> Result<u64, StorageError>;
}

pub trait RecordStore {
    fn insert_calculated(&self, record: &CalculatedDischarge) -> Result<(), StorageError>;

    /// Runs `work` in one transaction holding the sensor's exclusive lock.
    ///
    /// If `work` returns `Err` nothing it wrote is visible afterwards.
    fn with_prediction_tx(
        &self,
        sensor_code: &str,
        work: &mut dyn FnMut(&mut dyn PredictionWriter) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;

    fn latest_calculated(
        &self,
        sensor_code: &str,
    ) -> Result<Option<CalculatedDischarge>, StorageError>;

    /// The prediction with the latest `predicted_for` for the sensor.
    fn latest_prediction(
        &self,
        sensor_code: &str,
    ) -> Result<Option<PredictedDischarge>, StorageError>;

    /// Stored predictions with `predicted_for > after`, ascending.
    fn future_predictions(
        &self,
        sensor_code: &str,
        after: Timestamp,
    ) -> Result<Vec<PredictedDischarge>, StorageError>;
}
