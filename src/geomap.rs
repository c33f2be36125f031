//! Inundation map selection.
//!
//! Each device declares discharge ranges `[value_min, value_max)` with a
//! map asset per range. Lookup is a first-match scan in declaration order:
//! overlapping ranges are allowed, and the earliest declared one wins.

use crate::model::{GeoMapping, MapRef, SelectError};
use crate::store::{MappingRepository, RecordStore, SensorDirectory};

/// First mapping (in slice order) whose range contains `value`.
pub fn first_match(mappings: &[GeoMapping], value: f64) -> Option<&GeoMapping> {
    mappings.iter().find(|m| m.contains(value))
}

pub struct GeoMapSelector<'a, R: ?Sized> {
    repo: &'a R,
}

impl<'a, R> GeoMapSelector<'a, R>
where
    R: MappingRepository + SensorDirectory + ?Sized,
{
    pub fn new(repo: &'a R) -> Self {
        GeoMapSelector { repo }
    }

    /// Sensor codes resolve to their parent device; anything else is taken
    /// to be a device code already.
    pub fn resolve_device(&self, device_or_sensor_code: &str) -> Result<String, SelectError> {
        Ok(self
            .repo
            .device_for_sensor(device_or_sensor_code)?
            .unwrap_or_else(|| device_or_sensor_code.to_string()))
    }

    pub fn select(&self, device_or_sensor_code: &str, value: f64) -> Result<MapRef, SelectError> {
        if !value.is_finite() {
            return Err(SelectError::InvalidInput(format!(
                "discharge {} is not a finite number",
                value
            )));
        }
        let device_code = self.resolve_device(device_or_sensor_code)?;

        // Match order is primary-key order whatever order the store returns.
        let mut mappings = self.repo.mappings_for_device(&device_code)?;
        mappings.sort_by_key(|m| m.id);

        first_match(&mappings, value)
            .map(MapRef::from)
            .ok_or(SelectError::NoMapping { device_code, value })
    }

    /// A device's mappings ordered by `value_min`, for display. This is not
    /// the match order.
    pub fn mappings_for(
        &self,
        device_or_sensor_code: &str,
    ) -> Result<Vec<GeoMapping>, SelectError> {
        let device_code = self.resolve_device(device_or_sensor_code)?;
        let mut mappings = self.repo.mappings_for_device(&device_code)?;
        mappings.sort_by(|a, b| a.value_min.total_cmp(&b.value_min).then(a.id.cmp(&b.id)));
        Ok(mappings)
    }
}

impl<'a, R> GeoMapSelector<'a, R>
where
    R: MappingRepository + SensorDirectory + RecordStore + ?Sized,
{
    /// Selects the map for the sensor's most recent observed discharge.
    pub fn select_for_latest_discharge(&self, sensor_code: &str) -> Result<MapRef, SelectError> {
        let latest = self
            .repo
            .latest_calculated(sensor_code)?
            .ok_or_else(|| SelectError::NoRecord(sensor_code.to_string()))?;
        self.select(sensor_code, latest.discharge)
    }

    /// Selects the map for the sensor's furthest-ahead predicted discharge.
    pub fn select_for_latest_prediction(&self, sensor_code: &str) -> Result<MapRef, SelectError> {
        let latest = self
            .repo
            .latest_prediction(sensor_code)?
            .ok_or_else(|| SelectError::NoRecord(sensor_code.to_string()))?;
        self.select(sensor_code, latest.predicted_discharge)
    }
}
