#![allow(clippy::too_many_arguments)]

pub mod aggregate_data_service;
pub mod core;
pub mod errors;
pub mod input;
pub mod validation;


#[macro_use]
extern crate is_close;

pub use crate::aggregate_data_service::{
    aggregate_meter_collections, AggregateDataService, AggregationConfig,
};
pub use crate::core::meter::Meter;
pub use crate::core::meter_collection::MeterCollection;
pub use crate::errors::MeterError;
use crate::core::schedule::ScheduleProvider;
use crate::input::ingest_for_processing;
use crate::validation::AmrValidator;
use std::io::Read;
use std::sync::Arc;
use tracing::info;

/// Load a school from JSON, then validate and aggregate its meters.
pub fn run_project(
    input: impl Read,
    schedules: Arc<dyn ScheduleProvider>,
    validator: &dyn AmrValidator,
) -> Result<MeterCollection, anyhow::Error> {
    let input = ingest_for_processing(input)?;
    let config = input.aggregation_config();
    info!("Loading {} meters for school {}", input.meters.len(), input.name);

    let mut meter_collection = input.into_meter_collection(schedules)?;
    AggregateDataService::new(&mut meter_collection, validator, config)
        .validate_and_aggregate_meter_data()?;

    Ok(meter_collection)
}
