//! Validates a school's meters and populates its collection with synthesized sub-meters
//! and whole-school aggregate meters.
//!
//! The stages run in a fixed order: validation, storage heater disaggregation, solar PV
//! synthesis, then electricity and heat aggregation. The storage heater and solar PV
//! stages have to run before electricity aggregation so that it combines the rewritten
//! top level readings and picks up the new sub-meters.

use crate::core::amr_data::{AmrData, OneDayAmrReading, ORIGINAL_READING_TYPE};
use crate::core::fuel_type::FuelType;
use crate::core::meter::Meter;
use crate::core::meter_attributes::{AggregationRule, MeterAttributes};
use crate::core::meter_collection::{
    AggregateFuel, AggregateMeter, MeterCollection, MeterCollectionHandle, MeterGroup,
};
use crate::core::schedule::HalfHourlySchedule;
use crate::core::solar_pv::SolarPvPanels;
use crate::core::storage_heater::StorageHeaterDisaggregator;
use crate::core::synthetic_mpan::{self, SyntheticRole};
use crate::errors::MeterError;
use crate::validation::AmrValidator;
use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{info, instrument, warn};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationConfig {
    /// meters with fewer days of readings than this are reported by validation
    pub min_days_data: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { min_days_data: 50 }
    }
}

pub struct AggregateDataService<'a> {
    meter_collection: &'a mut MeterCollection,
    validator: &'a dyn AmrValidator,
    config: AggregationConfig,
}

impl<'a> AggregateDataService<'a> {
    pub fn new(
        meter_collection: &'a mut MeterCollection,
        validator: &'a dyn AmrValidator,
        config: AggregationConfig,
    ) -> Self {
        Self {
            meter_collection,
            validator,
            config,
        }
    }

    /// Run every stage once. A failure leaves the collection part way through and it
    /// should be discarded.
    #[instrument(skip_all, fields(urn = self.meter_collection.urn()))]
    pub fn validate_and_aggregate_meter_data(&mut self) -> Result<(), MeterError> {
        info!("Validating and Aggregating Meters");
        self.validate_meter_data()?;
        self.create_storage_heater_sub_meters()?;
        self.create_solar_pv_sub_meters()?;
        self.aggregate_heat_and_electricity_meters()
    }

    pub fn validate_meter_data(&mut self) -> Result<(), MeterError> {
        info!("Validating Meters");
        self.validate_meter_list(MeterGroup::Heat)?;
        self.validate_meter_list(MeterGroup::Electricity)
    }

    pub fn aggregate_heat_and_electricity_meters(&mut self) -> Result<(), MeterError> {
        self.aggregate_main_meters(AggregateFuel::Electricity)?;
        self.aggregate_main_meters(AggregateFuel::Heat)
    }

    /// Split every active electricity meter with storage heaters into a storage heater
    /// only sub-meter and a remainder sub-meter. The parent's readings are untouched.
    pub fn create_storage_heater_sub_meters(&mut self) -> Result<(), MeterError> {
        for index in self.active_indices(MeterGroup::Electricity) {
            let electricity_meter = &self.meter_collection.electricity_meters()[index];
            let Some(storage_heater) = electricity_meter.storage_heater_config() else {
                continue;
            };
            info!(
                "Disaggregating electricity meter {} into 1 x storage heater only and 1 x remainder",
                electricity_meter.id()
            );

            let remainder_mpan_mprn = synthetic_mpan::encode(
                electricity_meter.mpan_mprn(),
                SyntheticRole::ElectricityMinusStorageHeater,
                0,
            )?;
            let storage_heater_mpan_mprn = synthetic_mpan::encode(
                electricity_meter.mpan_mprn(),
                SyntheticRole::StorageHeaterOnly,
                0,
            )?;
            let (remainder_amr, storage_heater_amr) = storage_heater.disaggregate_amr_data(
                electricity_meter.required_amr_data()?,
                remainder_mpan_mprn,
                storage_heater_mpan_mprn,
            )?;

            let sub_meters = [
                electricity_meter
                    .create_modified_copy(
                        remainder_amr,
                        FuelType::Electricity,
                        format!("{} minus storage heater", electricity_meter.id()),
                        format!("{} minus storage heater", electricity_meter.name()),
                    )
                    .with_mpan_mprn(remainder_mpan_mprn),
                electricity_meter
                    .create_modified_copy(
                        storage_heater_amr,
                        FuelType::StorageHeater,
                        format!("{} storage heater only", electricity_meter.id()),
                        format!("{} storage heater only", electricity_meter.name()),
                    )
                    .with_mpan_mprn(storage_heater_mpan_mprn),
            ];

            let electricity_meter =
                &mut self.meter_collection.meters_mut(MeterGroup::Electricity)[index];
            for sub_meter in sub_meters {
                electricity_meter.add_sub_meter(sub_meter);
            }
        }
        Ok(())
    }

    /// For every active electricity meter with a PV installation, synthesize the PV
    /// output from the area's unit yield, keep the original mains readings as a
    /// sub-meter and replace the meter's own readings with mains plus PV.
    pub fn create_solar_pv_sub_meters(&mut self) -> Result<(), MeterError> {
        for index in self.active_indices(MeterGroup::Electricity) {
            let electricity_meter = &self.meter_collection.electricity_meters()[index];
            let Some(installation) = electricity_meter.solar_pv_installation() else {
                continue;
            };
            let mains_amr = electricity_meter.required_amr_data()?;
            if mains_amr.is_empty() {
                warn!(
                    "Electricity meter {} has no readings, so no solar pv data can be synthesized",
                    electricity_meter.id()
                );
                continue;
            }
            info!("Creating an artificial solar pv meter and associated amr data");

            let solar_pv_mpan_mprn =
                synthetic_mpan::encode(electricity_meter.mpan_mprn(), SyntheticRole::SolarPv, 0)?;
            let solar_amr = create_solar_pv_amr_data(
                mains_amr,
                installation,
                self.meter_collection.solar_pv()?,
                solar_pv_mpan_mprn,
            );
            if solar_amr.is_empty() {
                warn!(
                    "No solar pv yield covers the readings of meter {}, leaving it as is",
                    electricity_meter.id()
                );
                continue;
            }
            let mains_plus_pv_amr = add_solar_pv_to_mains(mains_amr, &solar_amr);

            let solar_pv_meter = electricity_meter
                .create_modified_copy(
                    solar_amr,
                    FuelType::SolarPv,
                    solar_pv_mpan_mprn.to_string(),
                    installation.to_string(),
                )
                .with_mpan_mprn(solar_pv_mpan_mprn);
            let mains_meter = electricity_meter.create_modified_copy(
                mains_amr.clone(),
                FuelType::Electricity,
                electricity_meter.id(),
                electricity_meter.name(),
            );

            let electricity_meter =
                &mut self.meter_collection.meters_mut(MeterGroup::Electricity)[index];
            electricity_meter.add_sub_meter(solar_pv_meter);
            electricity_meter.add_sub_meter(mains_meter);
            electricity_meter.set_amr_data(mains_plus_pv_amr);
            electricity_meter.append_to_identity(" plus pv");
        }
        Ok(())
    }

    fn validate_meter_list(&mut self, group: MeterGroup) -> Result<(), MeterError> {
        let active = self.active_indices(group);
        info!("Validating {} meters", active.len());
        if active.is_empty() {
            return Ok(());
        }

        let schedules = self.meter_collection.schedules();
        let area_name = self.meter_collection.area_name().to_string();
        let holidays = schedules.holidays(&area_name)?;
        let temperatures = schedules.temperatures(&area_name)?;

        let meters = self.meter_collection.meters_mut(group);
        for index in active {
            let meter = &mut meters[index];
            self.validator
                .validate(meter, self.config.min_days_data, holidays, temperatures)
                .map_err(|source| MeterError::ValidationFailed {
                    meter_id: meter.id().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn aggregate_main_meters(&mut self, fuel: AggregateFuel) -> Result<(), MeterError> {
        let (fuel_type, role) = match fuel {
            AggregateFuel::Heat => (FuelType::Gas, SyntheticRole::AggregateGas),
            AggregateFuel::Electricity => {
                (FuelType::Electricity, SyntheticRole::AggregateElectricity)
            }
        };
        let urn = self.meter_collection.urn();

        let aggregate = {
            let members = self
                .meter_collection
                .meters(fuel.group())
                .iter()
                .enumerate()
                .filter(|(_, meter)| meter.active())
                .collect::<Vec<_>>();
            info!("Aggregating {} {fuel} meters", members.len());
            let meters = members.iter().map(|(_, meter)| *meter).collect::<Vec<_>>();

            match aggregate_meters(&meters, fuel_type, role, urn)? {
                None => None,
                Some(Cow::Borrowed(meter)) => {
                    let index = members
                        .iter()
                        .find(|(_, member)| std::ptr::eq(*member, meter))
                        .map(|(index, _)| *index)
                        .ok_or_else(|| {
                            MeterError::unexpected_state(format!(
                                "Aggregate {fuel} meter {} is not one of the collection's meters",
                                meter.id()
                            ))
                        })?;
                    Some(AggregateMeter::Member(index))
                }
                Some(Cow::Owned(meter)) => Some(AggregateMeter::Combined(Box::new(meter))),
            }
        };

        match aggregate {
            Some(AggregateMeter::Combined(combined))
                if matches!(
                    self.meter_collection.aggregate_slot(fuel),
                    Some(AggregateMeter::Combined(_))
                ) =>
            {
                if let Some(existing) = self.meter_collection.aggregate_mut(fuel) {
                    existing.absorb_reaggregation(*combined);
                }
                Ok(())
            }
            aggregate => self.meter_collection.set_aggregate(fuel, aggregate),
        }
    }

    fn active_indices(&self, group: MeterGroup) -> Vec<usize> {
        self.meter_collection
            .meters(group)
            .iter()
            .enumerate()
            .filter(|(_, meter)| meter.active())
            .map(|(index, _)| index)
            .collect()
    }
}

/// Validate and aggregate independent collections (one per school) in parallel,
/// returning one result per collection in the same order.
pub fn aggregate_meter_collections(
    meter_collections: &mut [MeterCollection],
    validator: &dyn AmrValidator,
    config: &AggregationConfig,
) -> Vec<Result<(), MeterError>> {
    meter_collections
        .par_iter_mut()
        .map(|meter_collection| {
            AggregateDataService::new(meter_collection, validator, config.clone())
                .validate_and_aggregate_meter_data()
        })
        .collect()
}

/// Scale the area's unit PV yield by the installation's capacity for each day of the
/// mains readings for which a yield is known. The output is stored as positive kWh even
/// though the panels produce rather than consume.
pub fn create_solar_pv_amr_data(
    electricity_amr: &AmrData,
    installation: &SolarPvPanels,
    solar_pv_yield: &HalfHourlySchedule,
    mpan_mprn: u64,
) -> AmrData {
    let mut solar_amr = AmrData::new(FuelType::SolarPv);
    let upload_datetime = Utc::now();

    for date in electricity_amr.dates() {
        let Some(days_pv_yield) = solar_pv_yield.get(date) else {
            continue;
        };
        let kwp = installation.capacity_kwp_on_date(date);
        solar_amr.add(
            date,
            OneDayAmrReading::new(
                mpan_mprn,
                date,
                ORIGINAL_READING_TYPE,
                None,
                upload_datetime,
                days_pv_yield.map(|unit_yield| unit_yield * kwp),
            ),
        );
    }

    info!("Created new solar pv meter with {} days of data", solar_amr.len());
    solar_amr
}

/// The mains readings with the PV output added to each day that has both. Days without
/// PV output keep their readings and provenance untouched.
pub fn add_solar_pv_to_mains(mains_amr: &AmrData, solar_amr: &AmrData) -> AmrData {
    let mut mains_plus_pv_amr = mains_amr.clone();
    for reading in mains_plus_pv_amr.readings_mut() {
        let Some(solar_reading) = solar_amr.one_day_reading(reading.date()) else {
            continue;
        };
        let kwh_data_x48 = std::array::from_fn(|half_hour_index| {
            reading.kwh_data_x48()[half_hour_index]
                + solar_reading.kwh_data_x48()[half_hour_index]
        });
        *reading = reading.with_kwh_data(kwh_data_x48);
    }
    mains_plus_pv_amr
}

/// Combine meters of one fuel into one. No meters gives no aggregate; a single meter
/// is its own aggregate and is returned as is. Anything else produces a new meter
/// whose readings, metadata and sub-meters are combined from the members.
pub fn aggregate_meters<'a>(
    meters: &[&'a Meter],
    fuel_type: FuelType,
    role: SyntheticRole,
    urn: u64,
) -> Result<Option<Cow<'a, Meter>>, MeterError> {
    match meters {
        [] => Ok(None),
        [meter] => {
            info!(
                "Single meter of type {fuel_type} - using as combined meter rather than creating new one"
            );
            Ok(Some(Cow::Borrowed(*meter)))
        }
        _ => combine_meters(meters, fuel_type, role, urn)
            .map(|meter| Some(Cow::Owned(meter)))
            .map_err(|error| {
                MeterError::aggregation(
                    fuel_type,
                    meters.iter().map(|meter| meter.id().to_string()).collect(),
                    error,
                )
            }),
    }
}

fn combine_meters(
    meters: &[&Meter],
    fuel_type: FuelType,
    role: SyntheticRole,
    urn: u64,
) -> Result<Meter, MeterError> {
    log_meter_dates(meters);

    let (start_date, end_date) = combined_amr_data_date_range(meters)?;
    info!("Aggregating data between {start_date} {end_date}");

    let mpan_mprn = synthetic_mpan::encode(urn, role, 0)?;
    let stores = meters
        .iter()
        .map(|meter| meter.required_amr_data())
        .collect::<Result<Vec<_>, _>>()?;
    let combined_amr_data = AmrData::combine(&stores, start_date, end_date, fuel_type, mpan_mprn);

    let metadata = combine_meter_meta_data(meters);
    info!("Creating combined meter data {start_date} to {end_date}");
    info!(
        "with floor area {:?} and {:?} pupils",
        metadata.floor_area, metadata.number_of_pupils
    );

    let mut combined_meter = Meter::new(
        MeterCollectionHandle::new(urn),
        Some(combined_amr_data),
        fuel_type,
        metadata.id,
        metadata.name,
        metadata.floor_area,
        metadata.number_of_pupils,
        MeterAttributes::default(),
    )
    .with_mpan_mprn(mpan_mprn);

    for sub_meter in combine_sub_meters(meters, urn)? {
        combined_meter.add_sub_meter(sub_meter);
    }
    Ok(combined_meter)
}

/// Aggregate the members' sub-meters separately for each sub-meter fuel type, in the
/// order the fuel types are first seen.
pub fn combine_sub_meters(meters: &[&Meter], urn: u64) -> Result<Vec<Meter>, MeterError> {
    let mut sub_meters_by_fuel_type: IndexMap<FuelType, Vec<&Meter>> = IndexMap::new();
    // a derived meter can end up with no readings, e.g. PV with no yield data for its dates
    for sub_meter in meters
        .iter()
        .flat_map(|meter| meter.sub_meters())
        .filter(|sub_meter| sub_meter.amr_data().is_some_and(|amr_data| !amr_data.is_empty()))
    {
        sub_meters_by_fuel_type
            .entry(sub_meter.fuel_type())
            .or_default()
            .push(sub_meter);
    }

    let mut combined_sub_meters = vec![];
    for (fuel_type, sub_meters) in sub_meters_by_fuel_type {
        if let Some(combined) =
            aggregate_meters(&sub_meters, fuel_type, sub_meter_role(fuel_type), urn)?
        {
            combined_sub_meters.push(combined.into_owned());
        }
    }
    Ok(combined_sub_meters)
}

// electricity sub-meters are what is left after storage heaters and PV, so they must
// not share the whole-school electricity identifier
fn sub_meter_role(fuel_type: FuelType) -> SyntheticRole {
    match fuel_type {
        FuelType::Electricity => SyntheticRole::ElectricityMinusStorageHeater,
        fuel_type => SyntheticRole::for_fuel_type(fuel_type),
    }
}

/// The intersection of the members' date ranges. A meter whose aggregation rules say
/// to ignore its start (or end) date does not constrain that bound.
pub fn combined_amr_data_date_range(
    meters: &[&Meter],
) -> Result<(NaiveDate, NaiveDate), MeterError> {
    let mut start_dates = vec![];
    let mut end_dates = vec![];
    for meter in meters {
        let amr_data = meter.required_amr_data()?;
        let aggregation_rules = meter.all_attributes().aggregation_rules();
        if !aggregation_rules
            .iter()
            .any(AggregationRule::ignores_start_date)
        {
            start_dates.push(amr_data.start_date()?);
        }
        if !aggregation_rules
            .iter()
            .any(AggregationRule::ignores_end_date)
        {
            end_dates.push(amr_data.end_date()?);
        }
    }

    let start_date = start_dates.into_iter().max().ok_or_else(|| {
        MeterError::unexpected_state("Every meter ignores its start date when aggregating")
    })?;
    let end_date = end_dates.into_iter().min().ok_or_else(|| {
        MeterError::unexpected_state("Every meter ignores its end date when aggregating")
    })?;
    if start_date > end_date {
        return Err(MeterError::unexpected_state(format!(
            "Meter readings do not overlap: the combined range would start on {start_date} after ending on {end_date}"
        )));
    }
    Ok((start_date, end_date))
}

#[derive(Clone, Debug, PartialEq)]
pub struct CombinedMeterMetaData {
    pub name: String,
    pub id: String,
    pub floor_area: Option<f64>,
    pub number_of_pupils: Option<u32>,
}

/// Names and identifiers are joined with " + ". Floor area and pupils are summed, but
/// are unknown as soon as any member's value is unknown.
pub fn combine_meter_meta_data(meters: &[&Meter]) -> CombinedMeterMetaData {
    CombinedMeterMetaData {
        name: meters.iter().map(|meter| meter.name()).join(" + "),
        id: meters.iter().map(|meter| meter.id()).join(" + "),
        floor_area: meters.iter().map(|meter| meter.floor_area()).sum(),
        number_of_pupils: meters.iter().map(|meter| meter.number_of_pupils()).sum(),
    }
}

fn log_meter_dates(meters: &[&Meter]) {
    info!("Combining the following meters");
    for meter in meters {
        match meter
            .amr_data()
            .map(|amr_data| (amr_data.start_date(), amr_data.end_date()))
        {
            Some((Ok(start_date), Ok(end_date))) => info!(
                "{:<24.24} {:<18.18} {start_date} to {end_date}",
                meter.display_name(),
                meter.id()
            ),
            _ => info!(
                "{:<24.24} {:<18.18} no readings",
                meter.display_name(),
                meter.id()
            ),
        }
        let aggregation_rules = meter.all_attributes().aggregation_rules();
        if !aggregation_rules.is_empty() {
            info!("                Meter has aggregation rules {aggregation_rules:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amr_data::HALF_HOURS_PER_DAY;
    use crate::core::schedule::{AreaSchedules, Holidays, ScheduleDataManager};
    use crate::validation::BasicAmrValidator;
    use anyhow::bail;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;
    use std::ops::RangeInclusive;
    use std::sync::Arc;

    const URN: u64 = 123456;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap()
    }

    fn amr_data_with(
        fuel_type: FuelType,
        mpan_mprn: u64,
        days: RangeInclusive<u32>,
        kwh: impl Fn(usize) -> f64,
    ) -> AmrData {
        let mut amr_data = AmrData::new(fuel_type);
        let kwh_data_x48: [f64; HALF_HOURS_PER_DAY] = std::array::from_fn(kwh);
        for day in days {
            amr_data.add(
                date(day),
                OneDayAmrReading::new(
                    mpan_mprn,
                    date(day),
                    ORIGINAL_READING_TYPE,
                    None,
                    Utc::now(),
                    kwh_data_x48,
                ),
            );
        }
        amr_data
    }

    fn meter_with(
        fuel_type: FuelType,
        id: u64,
        name: &str,
        days: RangeInclusive<u32>,
        kwh: impl Fn(usize) -> f64,
        attributes: serde_json::Value,
    ) -> Meter {
        Meter::new(
            MeterCollectionHandle::new(URN),
            Some(amr_data_with(fuel_type, id, days, kwh)),
            fuel_type,
            id.to_string(),
            name,
            None,
            None,
            serde_json::from_value(attributes).unwrap(),
        )
    }

    fn electricity_meter(id: u64, name: &str, days: RangeInclusive<u32>, kwh: f64) -> Meter {
        meter_with(FuelType::Electricity, id, name, days, |_| kwh, json!({}))
    }

    fn gas_meter(id: u64, name: &str, days: RangeInclusive<u32>, kwh: f64) -> Meter {
        meter_with(FuelType::Gas, id, name, days, |_| kwh, json!({}))
    }

    // overnight storage heater charging on top of a 1kWh baseload
    fn storage_heater_meter(id: u64, name: &str) -> Meter {
        meter_with(
            FuelType::Electricity,
            id,
            name,
            1..=3,
            |half_hour_index| if half_hour_index < 14 { 6. } else { 1. },
            json!({
                "storage_heaters": {"charge_start_time": "00:00:00", "charge_end_time": "07:00:00", "power_kw": null}
            }),
        )
    }

    fn solar_pv_meter(id: u64, name: &str) -> Meter {
        meter_with(
            FuelType::Electricity,
            id,
            name,
            1..=3,
            |_| 1.,
            json!({"solar_pv": [{"start_date": "2020-06-01", "end_date": null, "kwp": 10.0}]}),
        )
    }

    // unit yield of 0.1kWh/kWp every half hour from 2 January
    #[fixture]
    fn schedules() -> Arc<ScheduleDataManager> {
        let solar_pv = (2..=10)
            .map(|day| (date(day), [0.1; HALF_HOURS_PER_DAY]))
            .collect();
        Arc::new(ScheduleDataManager::new().with_area(
            "Bath",
            AreaSchedules {
                solar_pv,
                ..Default::default()
            },
        ))
    }

    fn collection(
        schedules: Arc<ScheduleDataManager>,
        electricity: Vec<Meter>,
        heat: Vec<Meter>,
    ) -> MeterCollection {
        let mut collection = MeterCollection::new("Primary", URN, "Bath", schedules);
        for meter in electricity {
            collection.add_electricity_meter(meter);
        }
        for meter in heat {
            collection.add_heat_meter(meter);
        }
        collection
    }

    fn run(collection: &mut MeterCollection) -> Result<(), MeterError> {
        AggregateDataService::new(collection, &BasicAmrValidator, AggregationConfig::default())
            .validate_and_aggregate_meter_data()
    }

    fn range(meter: &Meter) -> (NaiveDate, NaiveDate) {
        let amr_data = meter.amr_data().unwrap();
        (amr_data.start_date().unwrap(), amr_data.end_date().unwrap())
    }

    #[rstest]
    fn test_two_electricity_meters_are_combined(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(
            schedules,
            vec![
                electricity_meter(111, "M1", 1..=3, 1.),
                electricity_meter(222, "M2", 1..=3, 2.),
            ],
            vec![],
        );

        run(&mut collection).unwrap();

        let aggregate = collection.aggregated_electricity_meter().unwrap();
        assert_eq!(aggregate.id(), "111 + 222");
        assert_eq!(aggregate.name(), "M1 + M2");
        assert_eq!(range(aggregate), (date(1), date(3)));
        let amr_data = aggregate.amr_data().unwrap();
        for date in amr_data.dates() {
            for half_hour_index in 0..HALF_HOURS_PER_DAY {
                assert_eq!(amr_data.kwh(date, half_hour_index).unwrap(), 3.);
            }
            assert_eq!(
                amr_data.one_day_reading(date).unwrap().reading_type(),
                ORIGINAL_READING_TYPE
            );
        }
        assert!(aggregate.aggregate_meter());
        assert_eq!(
            synthetic_mpan::decode(aggregate.mpan_mprn()),
            Some(SyntheticRole::AggregateElectricity)
        );
        assert!(collection.aggregated_heat_meter().is_none());
        assert_eq!(collection.meter("111 + 222").unwrap().name(), "M1 + M2");
        assert_eq!(collection.all_meters().len(), 3);
    }

    #[rstest]
    fn test_single_meter_is_its_own_aggregate(schedules: Arc<ScheduleDataManager>) {
        let mut collection =
            collection(schedules, vec![], vec![gas_meter(333, "Boiler", 1..=3, 4.)]);

        run(&mut collection).unwrap();

        assert!(matches!(
            collection.aggregate_slot(AggregateFuel::Heat),
            Some(AggregateMeter::Member(0))
        ));
        assert!(std::ptr::eq(
            collection.aggregated_heat_meter().unwrap(),
            &collection.heat_meters()[0]
        ));
        assert_eq!(collection.all_meters().len(), 1);
    }

    #[rstest]
    fn test_aggregate_meters_identity_and_empty() {
        let meter = storage_heater_meter(111, "M1");
        let aggregate = aggregate_meters(
            &[&meter],
            FuelType::Electricity,
            SyntheticRole::AggregateElectricity,
            URN,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(aggregate, Cow::Borrowed(same) if std::ptr::eq(same, &meter)));

        let nothing =
            aggregate_meters(&[], FuelType::Gas, SyntheticRole::AggregateGas, URN).unwrap();
        assert!(nothing.is_none());
        assert!(combine_sub_meters(&[&meter], URN).unwrap().is_empty());
    }

    #[rstest]
    fn test_date_range_is_the_intersection() {
        let meters = [
            electricity_meter(1, "A", 1..=5, 1.),
            electricity_meter(2, "B", 2..=6, 1.),
            electricity_meter(3, "C", 3..=7, 1.),
        ];
        let meters = meters.iter().collect::<Vec<_>>();

        assert_eq!(combined_amr_data_date_range(&meters).unwrap(), (date(3), date(5)));
    }

    #[rstest]
    fn test_ignored_start_date_does_not_constrain_range() {
        let late_starter = meter_with(
            FuelType::Electricity,
            3,
            "Late",
            6..=9,
            |_| 5.,
            json!({"aggregation": ["ignore_start_date"]}),
        );
        let early_finisher = meter_with(
            FuelType::Electricity,
            4,
            "Early",
            1..=4,
            |_| 5.,
            json!({"aggregation": ["deprecated_include_but_ignore_end_date"]}),
        );
        let others = [
            electricity_meter(1, "A", 1..=9, 1.),
            electricity_meter(2, "B", 2..=9, 1.),
        ];
        let meters = [&others[0], &others[1], &late_starter, &early_finisher];

        assert_eq!(combined_amr_data_date_range(&meters).unwrap(), (date(2), date(9)));

        let aggregate = aggregate_meters(
            &meters,
            FuelType::Electricity,
            SyntheticRole::AggregateElectricity,
            URN,
        )
        .unwrap()
        .unwrap();
        let amr_data = aggregate.amr_data().unwrap();
        assert_eq!(amr_data.kwh(date(2), 0).unwrap(), 7.); // A + B + early finisher
        assert_eq!(amr_data.kwh(date(5), 0).unwrap(), 2.); // only A and B
        assert_eq!(amr_data.kwh(date(7), 0).unwrap(), 7.); // A + B + late starter
    }

    #[rstest]
    fn test_every_meter_ignoring_its_start_date_is_unexpected() {
        let meter = |id| {
            meter_with(
                FuelType::Gas,
                id,
                "Ignored",
                1..=3,
                |_| 1.,
                json!({"aggregation": ["ignore_start_date"]}),
            )
        };
        let (first, second) = (meter(1), meter(2));

        assert!(matches!(
            combined_amr_data_date_range(&[&first, &second]),
            Err(MeterError::UnexpectedState(_))
        ));
    }

    #[rstest]
    fn test_missing_day_contributes_zero() {
        let first = electricity_meter(1, "A", 1..=3, 1.);
        let mut second = electricity_meter(2, "B", 1..=3, 2.);
        second.amr_data_mut().unwrap().delete_date(date(2));
        let meters = [&first, &second];

        let aggregate = aggregate_meters(
            &meters,
            FuelType::Electricity,
            SyntheticRole::AggregateElectricity,
            URN,
        )
        .unwrap()
        .unwrap();

        let amr_data = aggregate.amr_data().unwrap();
        assert_eq!(amr_data.len(), 3);
        assert_eq!(amr_data.kwh(date(2), 17).unwrap(), 1.);
        assert_eq!(amr_data.kwh(date(3), 17).unwrap(), 3.);
    }

    #[rstest]
    fn test_metadata_sums_are_all_or_nothing() {
        let mut first = gas_meter(1, "A", 1..=2, 1.);
        let mut second = gas_meter(2, "B", 1..=2, 1.);
        first.set_floor_area(Some(100.));
        first.set_number_of_pupils(Some(30));
        second.set_number_of_pupils(Some(20));

        let metadata = combine_meter_meta_data(&[&first, &second]);
        assert_eq!(
            metadata,
            CombinedMeterMetaData {
                name: "A + B".to_string(),
                id: "1 + 2".to_string(),
                floor_area: None,
                number_of_pupils: Some(50),
            }
        );

        second.set_floor_area(Some(50.));
        assert_eq!(combine_meter_meta_data(&[&first, &second]).floor_area, Some(150.));
    }

    #[rstest]
    fn test_storage_heater_split_conserves_energy(schedules: Arc<ScheduleDataManager>) {
        let original = storage_heater_meter(111, "M1");
        let mut collection = collection(schedules, vec![original.clone()], vec![]);

        run(&mut collection).unwrap();

        let meter = &collection.electricity_meters()[0];
        assert_eq!(meter.amr_data(), original.amr_data());
        let [remainder, storage_heater] = meter.sub_meters() else {
            panic!("expected two sub-meters, got {}", meter.sub_meters().len());
        };
        assert_eq!(remainder.id(), "111 minus storage heater");
        assert_eq!(remainder.fuel_type(), FuelType::Electricity);
        assert_eq!(storage_heater.name(), "M1 storage heater only");
        assert_eq!(storage_heater.fuel_type(), FuelType::StorageHeater);
        assert_eq!(
            synthetic_mpan::decode(storage_heater.mpan_mprn()),
            Some(SyntheticRole::StorageHeaterOnly)
        );

        let original_amr = original.amr_data().unwrap();
        for date in original_amr.dates() {
            for half_hour_index in 0..HALF_HOURS_PER_DAY {
                assert_relative_eq!(
                    remainder.amr_data().unwrap().kwh(date, half_hour_index).unwrap()
                        + storage_heater.amr_data().unwrap().kwh(date, half_hour_index).unwrap(),
                    original_amr.kwh(date, half_hour_index).unwrap(),
                    epsilon = 1e-9
                );
            }
            assert_relative_eq!(storage_heater.amr_data().unwrap().one_day_kwh(date).unwrap(), 70.);
        }
    }

    #[rstest]
    fn test_solar_pv_replaces_parent_readings(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(schedules, vec![solar_pv_meter(111, "M1")], vec![]);

        run(&mut collection).unwrap();

        let meter = &collection.electricity_meters()[0];
        assert_eq!(meter.id(), "111 plus pv");
        assert_eq!(meter.name(), "M1 plus pv");
        assert_eq!(meter.mpan_mprn(), 111);
        let amr_data = meter.amr_data().unwrap();
        // before the yield data starts the readings are unchanged
        assert_eq!(amr_data.kwh(date(1), 20).unwrap(), 1.);
        assert_relative_eq!(amr_data.kwh(date(2), 20).unwrap(), 2.);
        assert_relative_eq!(amr_data.kwh(date(3), 47).unwrap(), 2.);
        assert_eq!(range(meter), (date(1), date(3)));

        let [solar_pv, mains] = meter.sub_meters() else {
            panic!("expected two sub-meters, got {}", meter.sub_meters().len());
        };
        assert_eq!(solar_pv.fuel_type(), FuelType::SolarPv);
        assert_eq!(solar_pv.name(), "Solar PV 10kWp");
        assert_eq!(range(solar_pv), (date(2), date(3)));
        assert_relative_eq!(solar_pv.amr_data().unwrap().kwh(date(2), 0).unwrap(), 1.);
        assert_eq!(mains.id(), "111");
        assert_eq!(mains.amr_data().unwrap().kwh(date(2), 0).unwrap(), 1.);

        // a lone meter is still its own aggregate after being rewritten
        assert_eq!(collection.aggregated_electricity_meter().unwrap().id(), "111 plus pv");
        assert_eq!(collection.meter("111 plus pv").unwrap().mpan_mprn(), 111);
    }

    #[rstest]
    fn test_sub_meters_are_aggregated_by_fuel_type(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(
            schedules,
            vec![storage_heater_meter(111, "M1"), storage_heater_meter(222, "M2")],
            vec![],
        );

        run(&mut collection).unwrap();

        let aggregate = collection.aggregated_electricity_meter().unwrap();
        let [remainder, storage_heater] = aggregate.sub_meters() else {
            panic!("expected two sub-meters, got {}", aggregate.sub_meters().len());
        };
        assert_eq!(remainder.fuel_type(), FuelType::Electricity);
        assert_eq!(
            remainder.id(),
            "111 minus storage heater + 222 minus storage heater"
        );
        assert_eq!(storage_heater.fuel_type(), FuelType::StorageHeater);
        assert_eq!(storage_heater.name(), "M1 storage heater only + M2 storage heater only");
        assert_eq!(
            synthetic_mpan::decode(storage_heater.mpan_mprn()),
            Some(SyntheticRole::StorageHeaterOnly)
        );
        assert_ne!(remainder.mpan_mprn(), aggregate.mpan_mprn());
        assert_relative_eq!(
            storage_heater.amr_data().unwrap().one_day_kwh(date(2)).unwrap(),
            140.
        );
        for half_hour_index in 0..HALF_HOURS_PER_DAY {
            assert_relative_eq!(
                remainder.amr_data().unwrap().kwh(date(1), half_hour_index).unwrap()
                    + storage_heater.amr_data().unwrap().kwh(date(1), half_hour_index).unwrap(),
                aggregate.amr_data().unwrap().kwh(date(1), half_hour_index).unwrap(),
                epsilon = 1e-9
            );
        }
    }

    #[rstest]
    fn test_single_sub_meters_are_attached_to_the_aggregate(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(
            schedules,
            vec![solar_pv_meter(111, "M1"), electricity_meter(222, "M2", 1..=3, 2.)],
            vec![],
        );

        run(&mut collection).unwrap();

        let aggregate = collection.aggregated_electricity_meter().unwrap();
        assert_eq!(aggregate.id(), "111 plus pv + 222");
        assert_relative_eq!(aggregate.amr_data().unwrap().kwh(date(2), 0).unwrap(), 4.);
        let fuel_types = aggregate
            .sub_meters()
            .iter()
            .map(Meter::fuel_type)
            .collect::<Vec<_>>();
        assert_eq!(fuel_types, vec![FuelType::SolarPv, FuelType::Electricity]);
        assert_eq!(aggregate.sub_meters()[1].id(), "111");
    }

    #[rstest]
    fn test_inactive_meters_are_ignored(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(
            schedules,
            vec![
                electricity_meter(111, "M1", 1..=3, 1.).with_active(false),
                electricity_meter(222, "M2", 1..=3, 2.),
            ],
            vec![],
        );

        run(&mut collection).unwrap();

        assert!(matches!(
            collection.aggregate_slot(AggregateFuel::Electricity),
            Some(AggregateMeter::Member(1))
        ));
    }

    #[rstest]
    fn test_empty_groups_have_no_aggregate(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(schedules, vec![], vec![]);
        run(&mut collection).unwrap();
        assert!(collection.aggregated_electricity_meter().is_none());
        assert!(collection.aggregated_heat_meter().is_none());
        assert!(collection.all_meters().is_empty());
    }

    #[rstest]
    fn test_disjoint_ranges_fail_with_meter_ids(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(
            schedules,
            vec![],
            vec![gas_meter(111, "M1", 1..=3, 1.), gas_meter(222, "M2", 5..=7, 1.)],
        );

        let error = run(&mut collection).unwrap_err();

        match error {
            MeterError::Aggregation {
                fuel_type,
                meter_ids,
                source,
            } => {
                assert_eq!(fuel_type, FuelType::Gas);
                assert_eq!(meter_ids, vec!["111".to_string(), "222".to_string()]);
                assert!(matches!(*source, MeterError::UnexpectedState(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[rstest]
    fn test_reaggregation_replaces_readings_but_keeps_metadata(
        schedules: Arc<ScheduleDataManager>,
    ) {
        let mut first = gas_meter(111, "M1", 1..=3, 1.);
        let mut second = gas_meter(222, "M2", 1..=3, 1.);
        first.set_floor_area(Some(100.));
        second.set_floor_area(Some(200.));
        let mut collection = collection(schedules, vec![], vec![first, second]);
        let mut service = AggregateDataService::new(
            &mut collection,
            &BasicAmrValidator,
            AggregationConfig::default(),
        );
        service.aggregate_heat_and_electricity_meters().unwrap();
        drop(service);
        assert_eq!(collection.aggregated_heat_meter().unwrap().floor_area(), Some(300.));

        collection
            .aggregate_mut(AggregateFuel::Heat)
            .unwrap()
            .set_floor_area(Some(250.));
        for meter in collection.meters_mut(MeterGroup::Heat) {
            let extra_day = amr_data_with(FuelType::Gas, meter.mpan_mprn(), 4..=4, |_| 1.);
            for reading in extra_day.readings() {
                meter.amr_data_mut().unwrap().add(reading.date(), reading.clone());
            }
        }
        AggregateDataService::new(&mut collection, &BasicAmrValidator, AggregationConfig::default())
            .aggregate_heat_and_electricity_meters()
            .unwrap();

        let aggregate = collection.aggregated_heat_meter().unwrap();
        assert_eq!(aggregate.floor_area(), Some(250.));
        assert_eq!(range(aggregate), (date(1), date(4)));
        assert_eq!(collection.meter("111 + 222").unwrap().floor_area(), Some(250.));
    }

    struct RejectingValidator;

    impl AmrValidator for RejectingValidator {
        fn validate(
            &self,
            _meter: &mut Meter,
            _min_days_data: usize,
            _holidays: &Holidays,
            _temperatures: &HalfHourlySchedule,
        ) -> anyhow::Result<()> {
            bail!("readings look wrong")
        }
    }

    #[rstest]
    fn test_validation_failure_names_the_meter(schedules: Arc<ScheduleDataManager>) {
        let mut collection = collection(
            schedules,
            vec![electricity_meter(111, "M1", 1..=3, 1.)],
            vec![],
        );

        let result = AggregateDataService::new(
            &mut collection,
            &RejectingValidator,
            AggregationConfig::default(),
        )
        .validate_and_aggregate_meter_data();

        assert!(matches!(
            result,
            Err(MeterError::ValidationFailed { meter_id, .. }) if meter_id == "111"
        ));
    }

    #[rstest]
    fn test_collections_are_processed_independently(schedules: Arc<ScheduleDataManager>) {
        let mut collections = vec![
            collection(
                schedules.clone(),
                vec![
                    electricity_meter(111, "M1", 1..=3, 1.),
                    electricity_meter(222, "M2", 1..=3, 2.),
                ],
                vec![],
            ),
            collection(
                schedules,
                vec![],
                vec![gas_meter(111, "M1", 1..=3, 1.), gas_meter(222, "M2", 5..=7, 1.)],
            ),
        ];

        let results = aggregate_meter_collections(
            &mut collections,
            &BasicAmrValidator,
            &AggregationConfig { min_days_data: 1 },
        );

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(MeterError::Aggregation { .. })));
        assert_eq!(
            collections[0].aggregated_electricity_meter().unwrap().id(),
            "111 + 222"
        );
    }

    #[rstest]
    fn test_config_defaults() {
        assert_eq!(AggregationConfig::default().min_days_data, 50);
        let config: AggregationConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, AggregationConfig::default());
    }

    fn late_yield_schedules() -> Arc<ScheduleDataManager> {
        let solar_pv = (10..=20)
            .map(|day| (date(day), [0.1; HALF_HOURS_PER_DAY]))
            .collect();
        Arc::new(ScheduleDataManager::new().with_area(
            "Bath",
            AreaSchedules {
                solar_pv,
                ..Default::default()
            },
        ))
    }

    #[rstest]
    fn test_solar_pv_without_yield_for_the_readings_is_skipped() {
        let mut collection = collection(
            late_yield_schedules(),
            vec![solar_pv_meter(111, "M1"), solar_pv_meter(222, "M2")],
            vec![],
        );

        run(&mut collection).unwrap();

        for meter in collection.electricity_meters() {
            assert!(meter.sub_meters().is_empty());
            assert_eq!(meter.amr_data().unwrap().kwh(date(2), 0).unwrap(), 1.);
        }
        let aggregate = collection.aggregated_electricity_meter().unwrap();
        assert_eq!(aggregate.id(), "111 + 222");
        assert!(aggregate.sub_meters().is_empty());
    }

    #[rstest]
    fn test_sub_meters_without_readings_are_not_combined() {
        let with_empty_sub_meter = |id| {
            let mut meter = electricity_meter(id, "M", 1..=3, 1.);
            let empty = meter.create_modified_copy(
                AmrData::new(FuelType::SolarPv),
                FuelType::SolarPv,
                format!("{id} pv"),
                "PV",
            );
            meter.add_sub_meter(empty);
            meter
        };
        let (first, second) = (with_empty_sub_meter(111), with_empty_sub_meter(222));

        assert!(combine_sub_meters(&[&first, &second], URN).unwrap().is_empty());
    }

    #[rstest]
    fn test_solar_pv_only_changes_days_with_readings(schedules: Arc<ScheduleDataManager>) {
        let mut amr_data = AmrData::new(FuelType::Electricity);
        for day in [1, 3, 6] {
            amr_data.add(
                date(day),
                OneDayAmrReading::new(
                    111,
                    date(day),
                    "ESTM",
                    None,
                    Utc::now(),
                    [1.; HALF_HOURS_PER_DAY],
                ),
            );
        }
        let meter = Meter::new(
            MeterCollectionHandle::new(URN),
            Some(amr_data),
            FuelType::Electricity,
            "111",
            "M1",
            None,
            None,
            serde_json::from_value(json!({
                "solar_pv": [{"start_date": null, "end_date": null, "kwp": 10.0}]
            }))
            .unwrap(),
        );
        // yield is only known from 2 January, so day 1 predates it
        let mut collection = collection(schedules, vec![meter], vec![]);

        run(&mut collection).unwrap();

        let meter = &collection.electricity_meters()[0];
        let amr_data = meter.amr_data().unwrap();
        assert_eq!(amr_data.dates().collect::<Vec<_>>(), vec![date(1), date(3), date(6)]);
        let first_day = amr_data.one_day_reading(date(1)).unwrap();
        assert_eq!(first_day.reading_type(), "ESTM");
        assert_eq!(first_day.one_day_kwh(), 48.);
        let sixth_day = amr_data.one_day_reading(date(6)).unwrap();
        assert_eq!(sixth_day.reading_type(), "ESTM");
        assert_relative_eq!(sixth_day.one_day_kwh(), 96.);

        let solar_pv = &meter.sub_meters()[0];
        assert_eq!(
            solar_pv.amr_data().unwrap().dates().collect::<Vec<_>>(),
            vec![date(3), date(6)]
        );
    }

    #[rstest]
    fn test_sub_meters_follow_the_parents_aggregation_rules(
        schedules: Arc<ScheduleDataManager>,
    ) {
        let storage_heaters = json!({
            "charge_start_time": "00:00:00", "charge_end_time": "07:00:00", "power_kw": null
        });
        let overnight = |half_hour_index| if half_hour_index < 14 { 6. } else { 1. };
        let early = meter_with(
            FuelType::Electricity,
            111,
            "Early",
            1..=6,
            overnight,
            json!({"storage_heaters": storage_heaters.clone()}),
        );
        let late = meter_with(
            FuelType::Electricity,
            222,
            "Late",
            4..=6,
            overnight,
            json!({"storage_heaters": storage_heaters, "aggregation": ["ignore_start_date"]}),
        );
        let mut collection = collection(schedules, vec![early, late], vec![]);

        run(&mut collection).unwrap();

        let aggregate = collection.aggregated_electricity_meter().unwrap();
        assert_eq!(range(aggregate), (date(1), date(6)));
        let [remainder, storage_heater] = aggregate.sub_meters() else {
            panic!("expected two sub-meters, got {}", aggregate.sub_meters().len());
        };
        assert_eq!(range(remainder), (date(1), date(6)));
        assert_eq!(range(storage_heater), (date(1), date(6)));
        for day in [2, 5] {
            for half_hour_index in 0..HALF_HOURS_PER_DAY {
                let kwh = |meter: &Meter| {
                    meter
                        .amr_data()
                        .unwrap()
                        .kwh(date(day), half_hour_index)
                        .unwrap()
                };
                assert_relative_eq!(
                    kwh(remainder) + kwh(storage_heater),
                    kwh(aggregate),
                    epsilon = 1e-9
                );
            }
        }
    }
}
