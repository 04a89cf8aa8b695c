use crate::errors::MeterError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// The closed set of fuel types (and derived roles) a meter can carry.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    IntoStaticStr,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FuelType {
    Electricity,
    Gas,
    SolarPv,
    StorageHeater,
    AggregatedElectricity,
    AggregatedHeat,
    ExportedSolarPv,
}

impl FuelType {
    /// Parse a fuel type from its snake case name, failing for anything outside the closed set.
    pub fn parse(fuel_type: &str) -> Result<Self, MeterError> {
        Self::from_str(fuel_type)
            .map_err(|_| MeterError::unexpected_state(format!("Unexpected fuel type {fuel_type}")))
    }

    pub fn is_heat(&self) -> bool {
        matches!(
            self,
            FuelType::Gas | FuelType::StorageHeater | FuelType::AggregatedHeat
        )
    }

    pub fn is_electricity(&self) -> bool {
        matches!(
            self,
            FuelType::Electricity | FuelType::SolarPv | FuelType::AggregatedElectricity
        )
    }
}
