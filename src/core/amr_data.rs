use crate::core::fuel_type::FuelType;
use crate::errors::MeterError;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

pub const HALF_HOURS_PER_DAY: usize = 48;

/// Reading type given to days synthesized by aggregation or PV synthesis.
pub const ORIGINAL_READING_TYPE: &str = "ORIG";

pub type HalfHourlyKwh = [f64; HALF_HOURS_PER_DAY];

/// Checked conversion from an arbitrary length list of readings to one day's worth.
pub fn half_hourly_from_slice(values: &[f64]) -> Result<HalfHourlyKwh, MeterError> {
    HalfHourlyKwh::try_from(values).map_err(|_| {
        MeterError::unexpected_state(format!(
            "Expected {HALF_HOURS_PER_DAY} half hourly values but got {}",
            values.len()
        ))
    })
}

/// One day of half hourly kWh readings for a single meter, together with the
/// provenance needed when data from several meters is merged.
#[derive(Clone, Debug, PartialEq)]
pub struct OneDayAmrReading {
    mpan_mprn: u64,
    date: NaiveDate,
    reading_type: String,
    substitute_date: Option<NaiveDate>,
    upload_datetime: DateTime<Utc>,
    kwh_data_x48: HalfHourlyKwh,
    one_day_kwh: f64,
}

impl OneDayAmrReading {
    /// Arguments:
    /// * `mpan_mprn` - identifier of the meter (or synthetic meter) owning the reading
    /// * `date` - the day the readings cover
    /// * `reading_type` - data quality tag, e.g. "ORIG" for original readings
    /// * `substitute_date` - the day data was borrowed from, if the readings are a substitute
    /// * `upload_datetime` - when the readings were captured or synthesized
    /// * `kwh_data_x48` - the 48 half hourly kWh values, negative values representing export
    pub fn new(
        mpan_mprn: u64,
        date: NaiveDate,
        reading_type: impl Into<String>,
        substitute_date: Option<NaiveDate>,
        upload_datetime: DateTime<Utc>,
        kwh_data_x48: HalfHourlyKwh,
    ) -> Self {
        Self {
            mpan_mprn,
            date,
            reading_type: reading_type.into(),
            substitute_date,
            upload_datetime,
            one_day_kwh: kwh_data_x48.iter().sum(),
            kwh_data_x48,
        }
    }

    pub fn mpan_mprn(&self) -> u64 {
        self.mpan_mprn
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn reading_type(&self) -> &str {
        &self.reading_type
    }

    pub fn substitute_date(&self) -> Option<NaiveDate> {
        self.substitute_date
    }

    pub fn upload_datetime(&self) -> DateTime<Utc> {
        self.upload_datetime
    }

    pub fn kwh_data_x48(&self) -> &HalfHourlyKwh {
        &self.kwh_data_x48
    }

    pub fn one_day_kwh(&self) -> f64 {
        self.one_day_kwh
    }

    /// A copy of this day with different readings but the same provenance.
    pub fn with_kwh_data(&self, kwh_data_x48: HalfHourlyKwh) -> Self {
        Self::new(
            self.mpan_mprn,
            self.date,
            self.reading_type.clone(),
            self.substitute_date,
            self.upload_datetime,
            kwh_data_x48,
        )
    }

    /// A copy of this day attributed to another (typically synthetic) meter.
    pub fn with_owner(&self, mpan_mprn: u64, kwh_data_x48: HalfHourlyKwh) -> Self {
        Self {
            mpan_mprn,
            ..self.with_kwh_data(kwh_data_x48)
        }
    }
}

/// Date indexed store of one day, 48 slot readings for one meter.
#[derive(Clone, Debug, PartialEq)]
pub struct AmrData {
    fuel_type: FuelType,
    readings: BTreeMap<NaiveDate, OneDayAmrReading>,
}

impl AmrData {
    pub fn new(fuel_type: FuelType) -> Self {
        Self {
            fuel_type,
            readings: Default::default(),
        }
    }

    pub fn fuel_type(&self) -> FuelType {
        self.fuel_type
    }

    /// Insert the readings for a date, replacing whatever was stored for it.
    pub fn add(&mut self, date: NaiveDate, reading: OneDayAmrReading) {
        self.readings.insert(date, reading);
    }

    pub fn delete_date(&mut self, date: NaiveDate) -> Option<OneDayAmrReading> {
        self.readings.remove(&date)
    }

    pub fn has_date(&self, date: NaiveDate) -> bool {
        self.readings.contains_key(&date)
    }

    pub fn one_day_reading(&self, date: NaiveDate) -> Option<&OneDayAmrReading> {
        self.readings.get(&date)
    }

    pub fn days_kwh_x48(&self, date: NaiveDate) -> Result<&HalfHourlyKwh, MeterError> {
        self.readings
            .get(&date)
            .map(OneDayAmrReading::kwh_data_x48)
            .ok_or(MeterError::DataUnavailable { date })
    }

    pub fn kwh(&self, date: NaiveDate, half_hour_index: usize) -> Result<f64, MeterError> {
        if half_hour_index >= HALF_HOURS_PER_DAY {
            return Err(MeterError::unexpected_state(format!(
                "Half hour index {half_hour_index} is outside of a day"
            )));
        }
        Ok(self.days_kwh_x48(date)?[half_hour_index])
    }

    pub fn one_day_kwh(&self, date: NaiveDate) -> Result<f64, MeterError> {
        self.readings
            .get(&date)
            .map(OneDayAmrReading::one_day_kwh)
            .ok_or(MeterError::DataUnavailable { date })
    }

    /// Sum of the daily totals of every stored day between two dates inclusive.
    pub fn total_kwh(&self, start_date: NaiveDate, end_date: NaiveDate) -> f64 {
        if start_date > end_date {
            return 0.;
        }
        self.readings
            .range(start_date..=end_date)
            .map(|(_, reading)| reading.one_day_kwh())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn start_date(&self) -> Result<NaiveDate, MeterError> {
        self.readings
            .keys()
            .next()
            .copied()
            .ok_or(MeterError::NoReadings {
                fuel_type: self.fuel_type,
            })
    }

    pub fn end_date(&self) -> Result<NaiveDate, MeterError> {
        self.readings
            .keys()
            .next_back()
            .copied()
            .ok_or(MeterError::NoReadings {
                fuel_type: self.fuel_type,
            })
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.readings.keys().copied()
    }

    pub fn readings(&self) -> impl Iterator<Item = &OneDayAmrReading> {
        self.readings.values()
    }

    pub(crate) fn readings_mut(&mut self) -> impl Iterator<Item = &mut OneDayAmrReading> {
        self.readings.values_mut()
    }

    /// Build a new store holding, for every date between `start_date` and `end_date`
    /// inclusive, the half hourly sum of the given stores. A store without data for a
    /// date contributes zero for that date.
    pub fn combine(
        stores: &[&AmrData],
        start_date: NaiveDate,
        end_date: NaiveDate,
        fuel_type: FuelType,
        mpan_mprn: u64,
    ) -> AmrData {
        let upload_datetime = Utc::now();
        let mut combined = AmrData::new(fuel_type);

        for date in start_date.iter_days().take_while(|date| *date <= end_date) {
            let mut combined_data = [0.; HALF_HOURS_PER_DAY];
            for reading in stores.iter().filter_map(|store| store.readings.get(&date)) {
                for (total, kwh) in combined_data.iter_mut().zip(reading.kwh_data_x48()) {
                    *total += kwh;
                }
            }
            combined.add(
                date,
                OneDayAmrReading::new(
                    mpan_mprn,
                    date,
                    ORIGINAL_READING_TYPE,
                    None,
                    upload_datetime,
                    combined_data,
                ),
            );
        }

        combined
    }
}
