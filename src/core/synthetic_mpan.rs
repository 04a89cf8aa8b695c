//! Deterministic identifiers for virtual and derived meters.
//!
//! Every role owns a band of identifiers `[band * BAND_WIDTH, (band + 1) * BAND_WIDTH)`.
//! Within a band the identifier is `band_start + group_number * MAX_BASE_MPAN_MPRN + base`,
//! so as long as the base identifier and group number are within their limits two
//! different roles can never produce the same identifier.

use crate::core::fuel_type::FuelType;
use crate::errors::MeterError;
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString};

/// Exclusive upper bound on a base identifier (any 13 digit mpan or mprn fits).
pub const MAX_BASE_MPAN_MPRN: u64 = 10_000_000_000_000;
/// Exclusive upper bound on the group number used to separate multiple PV arrays.
pub const MAX_GROUP_NUMBER: u64 = 100;
pub const BAND_WIDTH: u64 = MAX_BASE_MPAN_MPRN * MAX_GROUP_NUMBER;

#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum SyntheticRole {
    AggregateElectricity,
    AggregateGas,
    StorageHeaterOnly,
    ElectricityMinusStorageHeater,
    SolarPv,
    ExportedSolarPv,
    AggregateGeneration,
}

impl SyntheticRole {
    pub fn parse(role: &str) -> Result<Self, MeterError> {
        Self::from_str(role).map_err(|_| {
            MeterError::unexpected_state(format!("Unexpected synthetic meter role {role}"))
        })
    }

    /// The role used for the synthetic identifier of an aggregate of meters of this fuel type.
    pub fn for_fuel_type(fuel_type: FuelType) -> Self {
        match fuel_type {
            FuelType::Electricity | FuelType::AggregatedElectricity => Self::AggregateElectricity,
            FuelType::Gas | FuelType::AggregatedHeat => Self::AggregateGas,
            FuelType::StorageHeater => Self::StorageHeaterOnly,
            FuelType::SolarPv => Self::SolarPv,
            FuelType::ExportedSolarPv => Self::ExportedSolarPv,
        }
    }

    fn band(&self) -> u64 {
        match self {
            Self::AggregateElectricity => 9,
            Self::AggregateGas => 8,
            Self::StorageHeaterOnly => 7,
            Self::ElectricityMinusStorageHeater => 6,
            Self::SolarPv => 5,
            Self::ExportedSolarPv => 4,
            Self::AggregateGeneration => 2,
        }
    }

    fn from_band(band: u64) -> Option<Self> {
        Some(match band {
            9 => Self::AggregateElectricity,
            8 => Self::AggregateGas,
            7 => Self::StorageHeaterOnly,
            6 => Self::ElectricityMinusStorageHeater,
            5 => Self::SolarPv,
            4 => Self::ExportedSolarPv,
            2 => Self::AggregateGeneration,
            _ => return None,
        })
    }

    fn supports_groups(&self) -> bool {
        matches!(self, Self::SolarPv | Self::ExportedSolarPv)
    }
}

pub fn encode(
    base_mpan_mprn: u64,
    role: SyntheticRole,
    group_number: u64,
) -> Result<u64, MeterError> {
    if base_mpan_mprn >= MAX_BASE_MPAN_MPRN {
        return Err(MeterError::unexpected_state(format!(
            "Identifier {base_mpan_mprn} is too large to derive a synthetic {role} identifier from"
        )));
    }
    if group_number >= MAX_GROUP_NUMBER || (group_number != 0 && !role.supports_groups()) {
        return Err(MeterError::unexpected_state(format!(
            "Group number {group_number} is not valid for a synthetic {role} identifier"
        )));
    }
    Ok(role.band() * BAND_WIDTH + group_number * MAX_BASE_MPAN_MPRN + base_mpan_mprn)
}

pub fn decode(mpan_mprn: u64) -> Option<SyntheticRole> {
    SyntheticRole::from_band(mpan_mprn / BAND_WIDTH)
}

pub fn is_synthetic(mpan_mprn: u64) -> bool {
    decode(mpan_mprn).is_some()
}

pub fn is_aggregate(mpan_mprn: u64) -> bool {
    matches!(
        decode(mpan_mprn),
        Some(SyntheticRole::AggregateElectricity | SyntheticRole::AggregateGas)
    )
}

/// Identifier of the combined meter for a school's meters of one fuel type.
pub fn combined_meter_mpan_mprn_from_urn(
    urn: u64,
    fuel_type: FuelType,
    group_number: u64,
) -> Result<u64, MeterError> {
    encode(urn, SyntheticRole::for_fuel_type(fuel_type), group_number)
}

/// Move an identifier (synthetic or not) into the generation band, keeping its group and base.
pub fn synthetic_aggregate_generation_meter(mpan_mprn: u64) -> u64 {
    SyntheticRole::AggregateGeneration.band() * BAND_WIDTH + mpan_mprn % BAND_WIDTH
}
