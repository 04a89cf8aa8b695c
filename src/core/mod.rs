pub mod amr_data;
pub mod fuel_type;
pub mod heating_model;
pub mod meter;
pub mod meter_attributes;
pub mod meter_collection;
pub mod schedule;
pub mod solar_pv;
pub mod storage_heater;
pub mod synthetic_mpan;
