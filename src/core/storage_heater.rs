use crate::core::amr_data::{AmrData, HalfHourlyKwh, HALF_HOURS_PER_DAY};
use crate::core::fuel_type::FuelType;
use crate::core::meter_attributes::StorageHeaterAttributes;
use crate::errors::MeterError;
use chrono::{NaiveTime, Timelike};

/// Tolerance used when checking that a split day still adds up to the original readings.
const CONSERVATION_TOLERANCE_KWH: f64 = 1e-9;

/// Splits one day of electricity readings into the storage heater share and the remainder.
///
/// Implementations must conserve energy: for every half hour,
/// `remainder + storage_heater == original`.
pub trait StorageHeaterDisaggregator {
    /// Returns `(remainder, storage_heater)` for one day of readings.
    fn disaggregate(&self, kwh_data_x48: &HalfHourlyKwh) -> (HalfHourlyKwh, HalfHourlyKwh);

    /// Split a whole store, returning `(electricity minus storage heater, storage heater only)`.
    fn disaggregate_amr_data(
        &self,
        amr_data: &AmrData,
        remainder_mpan_mprn: u64,
        storage_heater_mpan_mprn: u64,
    ) -> Result<(AmrData, AmrData), MeterError> {
        let mut remainder_amr = AmrData::new(FuelType::Electricity);
        let mut storage_heater_amr = AmrData::new(FuelType::StorageHeater);

        for reading in amr_data.readings() {
            let kwh_data_x48 = reading.kwh_data_x48();
            let (remainder, storage_heater) = self.disaggregate(kwh_data_x48);

            for half_hour_index in 0..HALF_HOURS_PER_DAY {
                if !is_close!(
                    remainder[half_hour_index] + storage_heater[half_hour_index],
                    kwh_data_x48[half_hour_index],
                    abs_tol = CONSERVATION_TOLERANCE_KWH
                ) {
                    return Err(MeterError::unexpected_state(format!(
                        "Storage heater disaggregation on {} half hour {half_hour_index} does not add up to the original reading",
                        reading.date()
                    )));
                }
            }

            remainder_amr.add(reading.date(), reading.with_owner(remainder_mpan_mprn, remainder));
            storage_heater_amr.add(
                reading.date(),
                reading.with_owner(storage_heater_mpan_mprn, storage_heater),
            );
        }

        Ok((remainder_amr, storage_heater_amr))
    }
}

/// Storage heater configuration for an electricity meter.
///
/// During the charging window the heaters' share of each half hour is whatever the
/// meter records above the day's mean out-of-window consumption, capped by the rated
/// power of the heaters. Outside the window the heaters draw nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageHeater {
    charge_start_half_hour: usize,
    charge_end_half_hour: usize,
    max_kwh_per_half_hour: Option<f64>,
}

impl StorageHeater {
    pub fn new(attributes: &StorageHeaterAttributes) -> Self {
        Self {
            charge_start_half_hour: half_hour_index(attributes.charge_start_time),
            charge_end_half_hour: half_hour_index(attributes.charge_end_time),
            max_kwh_per_half_hour: attributes.power_kw.map(|power_kw| power_kw * 0.5),
        }
    }

    pub fn charging(&self, half_hour_index: usize) -> bool {
        let (start, end) = (self.charge_start_half_hour, self.charge_end_half_hour);
        if start <= end {
            (start..end).contains(&half_hour_index)
        } else {
            // window wraps around midnight
            half_hour_index >= start || half_hour_index < end
        }
    }

    fn baseload_kwh(&self, kwh_data_x48: &HalfHourlyKwh) -> f64 {
        let (total, count) = kwh_data_x48
            .iter()
            .enumerate()
            .filter(|(half_hour_index, _)| !self.charging(*half_hour_index))
            .fold((0., 0), |(total, count), (_, kwh)| (total + kwh, count + 1));
        if count == 0 {
            0.
        } else {
            (total / count as f64).max(0.)
        }
    }
}

impl StorageHeaterDisaggregator for StorageHeater {
    fn disaggregate(&self, kwh_data_x48: &HalfHourlyKwh) -> (HalfHourlyKwh, HalfHourlyKwh) {
        let baseload = self.baseload_kwh(kwh_data_x48);
        let mut remainder = [0.; HALF_HOURS_PER_DAY];
        let mut storage_heater = [0.; HALF_HOURS_PER_DAY];

        for (half_hour_index, &kwh) in kwh_data_x48.iter().enumerate() {
            if self.charging(half_hour_index) {
                let excess = (kwh - baseload).max(0.);
                storage_heater[half_hour_index] = self
                    .max_kwh_per_half_hour
                    .map_or(excess, |max_kwh| excess.min(max_kwh));
            }
            remainder[half_hour_index] = kwh - storage_heater[half_hour_index];
        }

        (remainder, storage_heater)
    }
}

fn half_hour_index(time: NaiveTime) -> usize {
    (time.hour() * 2 + time.minute() / 30) as usize
}
