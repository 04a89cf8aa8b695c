use crate::aggregate_data_service::AggregationConfig;
use crate::core::amr_data::{half_hourly_from_slice, AmrData, OneDayAmrReading};
use crate::core::fuel_type::FuelType;
use crate::core::meter::Meter;
use crate::core::meter_attributes::MeterAttributes;
use crate::core::meter_collection::{MeterCollection, MeterGroup};
use crate::core::schedule::ScheduleProvider;
use crate::errors::MeterError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::sync::Arc;

pub fn ingest_for_processing(json: impl Read) -> Result<SchoolInput, anyhow::Error> {
    let reader = BufReader::new(json);

    let input: SchoolInput = serde_json::from_reader(reader)?;

    Ok(input)
}

/// A school and its raw meters as delivered by the loader.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchoolInput {
    pub name: String,
    pub urn: u64,
    pub area_name: String,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub floor_area: Option<f64>,
    #[serde(default)]
    pub number_of_pupils: Option<u32>,
    #[serde(default)]
    pub config: Option<AggregationConfig>,
    #[serde(default)]
    pub meters: Vec<MeterInput>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MeterInput {
    /// mpan or mprn, possibly with a textual suffix
    pub identifier: String,
    pub name: String,
    /// kept as text so that an unknown fuel type is reported against the meter rather
    /// than failing the whole document
    pub fuel_type: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub external_meter_id: Option<String>,
    #[serde(default)]
    pub floor_area: Option<f64>,
    #[serde(default)]
    pub number_of_pupils: Option<u32>,
    #[serde(default)]
    pub attributes: MeterAttributes,
    #[serde(default)]
    pub readings: Vec<ReadingInput>,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReadingInput {
    pub date: NaiveDate,
    pub reading_type: String,
    #[serde(default)]
    pub substitute_date: Option<NaiveDate>,
    #[serde(default)]
    pub upload_datetime: Option<DateTime<Utc>>,
    pub kwh_data_x48: Vec<f64>,
}

impl SchoolInput {
    pub fn aggregation_config(&self) -> AggregationConfig {
        self.config.clone().unwrap_or_default()
    }

    /// Build the school's meter collection, routing each meter to the group for its fuel type.
    pub fn into_meter_collection(
        self,
        schedules: Arc<dyn ScheduleProvider>,
    ) -> Result<MeterCollection, MeterError> {
        let mut collection = MeterCollection::new(self.name, self.urn, self.area_name, schedules)
            .with_postcode(self.postcode)
            .with_floor_area(self.floor_area)
            .with_number_of_pupils(self.number_of_pupils);
        let handle = collection.handle();

        for meter_input in self.meters {
            let fuel_type = FuelType::parse(&meter_input.fuel_type)?;
            let group = match fuel_type {
                FuelType::Gas => MeterGroup::Heat,
                FuelType::Electricity => MeterGroup::Electricity,
                FuelType::SolarPv => MeterGroup::SolarPv,
                FuelType::StorageHeater => MeterGroup::StorageHeater,
                FuelType::AggregatedElectricity
                | FuelType::AggregatedHeat
                | FuelType::ExportedSolarPv => {
                    return Err(MeterError::unexpected_state(format!(
                        "Meter {} cannot be loaded with derived fuel type {fuel_type}",
                        meter_input.identifier
                    )))
                }
            };

            let mut meter = Meter::new(
                handle,
                None,
                fuel_type,
                meter_input.identifier,
                meter_input.name,
                meter_input.floor_area,
                meter_input.number_of_pupils,
                meter_input.attributes,
            )
            .with_active(meter_input.active);
            if let Some(external_meter_id) = meter_input.external_meter_id {
                meter = meter.with_external_meter_id(external_meter_id);
            }
            let amr_data =
                amr_data_from_readings(meter_input.readings, fuel_type, meter.mpan_mprn())?;
            meter.set_amr_data(amr_data);

            collection.add_meter(group, meter);
        }

        Ok(collection)
    }
}

fn amr_data_from_readings(
    readings: Vec<ReadingInput>,
    fuel_type: FuelType,
    mpan_mprn: u64,
) -> Result<AmrData, MeterError> {
    let loaded_at = Utc::now();
    let mut amr_data = AmrData::new(fuel_type);
    for reading in readings {
        let kwh_data_x48 = half_hourly_from_slice(&reading.kwh_data_x48)?;
        amr_data.add(
            reading.date,
            OneDayAmrReading::new(
                mpan_mprn,
                reading.date,
                reading.reading_type,
                reading.substitute_date,
                reading.upload_datetime.unwrap_or(loaded_at),
                kwh_data_x48,
            ),
        );
    }
    Ok(amr_data)
}
