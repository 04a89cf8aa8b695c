use crate::core::amr_data::{half_hourly_from_slice, HalfHourlyKwh, HALF_HOURS_PER_DAY};
use crate::errors::MeterError;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Calendar of 48 half hourly values per day: temperatures, irradiance, unit PV yield
/// (kWh per kWp) or grid carbon intensity.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(
    try_from = "BTreeMap<NaiveDate, Vec<f64>>",
    into = "BTreeMap<NaiveDate, Vec<f64>>"
)]
pub struct HalfHourlySchedule {
    days: BTreeMap<NaiveDate, HalfHourlyKwh>,
}

impl HalfHourlySchedule {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, date: NaiveDate, values: HalfHourlyKwh) {
        self.days.insert(date, values);
    }

    pub fn get(&self, date: NaiveDate) -> Option<&HalfHourlyKwh> {
        self.days.get(&date)
    }

    pub fn has_date(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.days.keys().next().copied()
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.days.keys().next_back().copied()
    }

    /// Mean over the day, e.g. a day's average temperature.
    pub fn average_for_date(&self, date: NaiveDate) -> Option<f64> {
        self.get(date)
            .map(|values| values.iter().sum::<f64>() / HALF_HOURS_PER_DAY as f64)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

impl FromIterator<(NaiveDate, HalfHourlyKwh)> for HalfHourlySchedule {
    fn from_iter<T: IntoIterator<Item = (NaiveDate, HalfHourlyKwh)>>(iter: T) -> Self {
        Self {
            days: iter.into_iter().collect(),
        }
    }
}

impl TryFrom<BTreeMap<NaiveDate, Vec<f64>>> for HalfHourlySchedule {
    type Error = MeterError;

    fn try_from(days: BTreeMap<NaiveDate, Vec<f64>>) -> Result<Self, Self::Error> {
        days.into_iter()
            .map(|(date, values)| half_hourly_from_slice(&values).map(|values| (date, values)))
            .collect()
    }
}

impl From<HalfHourlySchedule> for BTreeMap<NaiveDate, Vec<f64>> {
    fn from(schedule: HalfHourlySchedule) -> Self {
        schedule
            .days
            .into_iter()
            .map(|(date, values)| (date, values.to_vec()))
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Holiday {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Holidays {
    holidays: Vec<Holiday>,
}

impl Holidays {
    pub fn new(holidays: Vec<Holiday>) -> Self {
        Self { holidays }
    }

    pub fn holiday(&self, date: NaiveDate) -> Option<&Holiday> {
        self.holidays
            .iter()
            .find(|holiday| holiday.start_date <= date && date <= holiday.end_date)
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holiday(date).is_some()
    }
}

/// Read only schedules for a geographical area, looked up by area name.
pub trait ScheduleProvider: Send + Sync {
    fn holidays(&self, area_name: &str) -> Result<&Holidays, MeterError>;
    fn temperatures(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError>;
    fn solar_irradiation(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError>;
    fn solar_pv(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError>;
    fn grid_carbon_intensity(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError>;
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AreaSchedules {
    pub holidays: Holidays,
    pub temperatures: HalfHourlySchedule,
    pub solar_irradiation: HalfHourlySchedule,
    pub solar_pv: HalfHourlySchedule,
    pub grid_carbon_intensity: HalfHourlySchedule,
}

/// In-memory schedules for every known area.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ScheduleDataManager {
    areas: IndexMap<String, AreaSchedules>,
}

impl ScheduleDataManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_area(mut self, area_name: impl Into<String>, schedules: AreaSchedules) -> Self {
        self.areas.insert(area_name.into(), schedules);
        self
    }

    fn area(&self, area_name: &str) -> Result<&AreaSchedules, MeterError> {
        self.areas.get(area_name).ok_or_else(|| {
            MeterError::unexpected_state(format!("No schedules are loaded for area {area_name}"))
        })
    }
}

impl ScheduleProvider for ScheduleDataManager {
    fn holidays(&self, area_name: &str) -> Result<&Holidays, MeterError> {
        Ok(&self.area(area_name)?.holidays)
    }

    fn temperatures(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError> {
        Ok(&self.area(area_name)?.temperatures)
    }

    fn solar_irradiation(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError> {
        Ok(&self.area(area_name)?.solar_irradiation)
    }

    fn solar_pv(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError> {
        Ok(&self.area(area_name)?.solar_pv)
    }

    fn grid_carbon_intensity(&self, area_name: &str) -> Result<&HalfHourlySchedule, MeterError> {
        Ok(&self.area(area_name)?.grid_carbon_intensity)
    }
}
