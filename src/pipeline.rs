//! Composed discharge operations.
//!
//! `process` is the write path for an observed reading: evaluate the rating
//! curve, classify the discharge, then append one calculated record. Any
//! failure before the append leaves the store untouched.

use crate::alert::ThresholdClassifier;
use crate::geomap::GeoMapSelector;
use crate::logging::{self, Component};
use crate::model::{
    CalculatedDischarge, MapRef, PipelineError, RawPrediction, SelectError, Status, StorageError,
    Timestamp,
};
use crate::predictions::{BatchReport, PredictionLifecycleManager};
use crate::rating::RatingCurveEvaluator;
use crate::store::{
    CurveRepository, MappingRepository, RecordStore, SensorDirectory, ThresholdRepository,
};

/// Every repository the pipeline reads or writes, as one bound.
pub trait DischargeStore:
    CurveRepository + ThresholdRepository + MappingRepository + SensorDirectory + RecordStore
{
}

impl<T> DischargeStore for T where
    T: CurveRepository
        + ThresholdRepository
        + MappingRepository
        + SensorDirectory
        + RecordStore
        + ?Sized
{
}

pub struct DischargePipeline<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: DischargeStore + ?Sized> DischargePipeline<'a, S> {
    pub fn new(store: &'a S) -> Self {
        DischargePipeline { store }
    }

    /// Converts, classifies and stores one observed water level.
    pub fn process(
        &self,
        sensor_code: &str,
        water_level: f64,
        calculated_at: Timestamp,
    ) -> Result<CalculatedDischarge, PipelineError> {
        let result = self.process_inner(sensor_code, water_level, calculated_at);
        match &result {
            Ok(record) => logging::debug(
                Component::Pipeline,
                Some(sensor_code),
                &format!(
                    "H={} -> Q={:.3} ({}) curve {}",
                    record.water_level, record.discharge, record.status, record.rating_curve_id
                ),
            ),
            Err(e) => logging::log_pipeline_failure(sensor_code, "process reading", e),
        }
        result
    }

    fn process_inner(
        &self,
        sensor_code: &str,
        water_level: f64,
        calculated_at: Timestamp,
    ) -> Result<CalculatedDischarge, PipelineError> {
        let discharge = RatingCurveEvaluator::new(self.store).evaluate(
            sensor_code,
            water_level,
            calculated_at,
        )?;
        if !discharge.plausible {
            logging::warn(
                Component::Curve,
                Some(sensor_code),
                &format!(
                    "curve {} gives negative discharge {:.3} at H={}",
                    discharge.curve_id, discharge.value, water_level
                ),
            );
        }

        let status = ThresholdClassifier::new(self.store).classify(sensor_code, discharge.value)?;

        let record = CalculatedDischarge {
            sensor_code: sensor_code.to_string(),
            water_level,
            discharge: discharge.value,
            plausible: discharge.plausible,
            rating_curve_id: discharge.curve_id,
            status,
            calculated_at,
        };
        self.store.insert_calculated(&record)?;
        Ok(record)
    }

    pub fn classify(&self, sensor_code: &str, value: f64) -> Result<Status, StorageError> {
        ThresholdClassifier::new(self.store).classify(sensor_code, value)
    }

    pub fn select_map(
        &self,
        device_or_sensor_code: &str,
        value: f64,
    ) -> Result<MapRef, SelectError> {
        GeoMapSelector::new(self.store)
            .select(device_or_sensor_code, value)
            .inspect_err(|e| logging::log_select_failure(device_or_sensor_code, "select map", e))
    }

    pub fn select_map_for_latest_discharge(
        &self,
        sensor_code: &str,
    ) -> Result<MapRef, SelectError> {
        GeoMapSelector::new(self.store)
            .select_for_latest_discharge(sensor_code)
            .inspect_err(|e| logging::log_select_failure(sensor_code, "select map", e))
    }

    pub fn select_map_for_latest_prediction(
        &self,
        sensor_code: &str,
    ) -> Result<MapRef, SelectError> {
        GeoMapSelector::new(self.store)
            .select_for_latest_prediction(sensor_code)
            .inspect_err(|e| logging::log_select_failure(sensor_code, "select map", e))
    }

    pub fn mappings_for_sensor(
        &self,
        device_or_sensor_code: &str,
    ) -> Result<Vec<crate::model::GeoMapping>, SelectError> {
        GeoMapSelector::new(self.store).mappings_for(device_or_sensor_code)
    }

    pub fn replace_future_predictions(
        &self,
        sensor_code: &str,
        run_at: Timestamp,
        batch: Vec<RawPrediction>,
    ) -> Result<BatchReport, PipelineError> {
        self.predictions().replace_future_predictions(sensor_code, run_at, batch)
    }

    pub fn predictions(&self) -> PredictionLifecycleManager<'a, S> {
        PredictionLifecycleManager::new(self.store)
    }
}
