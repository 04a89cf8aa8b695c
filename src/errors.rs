use crate::core::fuel_type::FuelType;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeterError {
    /// Caller bug or configuration that cannot be reconciled (unknown fuel type, unknown
    /// synthetic role, impossible date intersection and similar).
    #[error("Unexpected state: {0}")]
    UnexpectedState(String),
    #[error("No meter readings are available for {date}")]
    DataUnavailable { date: NaiveDate },
    #[error("No meter readings have been loaded for this {fuel_type} data")]
    NoReadings { fuel_type: FuelType },
    #[error("Meter history starts on {available_start} but data from {required_start} is required")]
    InsufficientHistory {
        required_start: NaiveDate,
        available_start: NaiveDate,
    },
    #[error("Validation of meter {meter_id} failed: {source}")]
    ValidationFailed {
        meter_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Fitting a heating model for meter {meter_id} failed: {source}")]
    ModelFitting {
        meter_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to aggregate {fuel_type} meters [{}]: {source}", .meter_ids.join(", "))]
    Aggregation {
        fuel_type: FuelType,
        meter_ids: Vec<String>,
        #[source]
        source: Box<MeterError>,
    },
}

impl MeterError {
    pub(crate) fn unexpected_state(message: impl Into<String>) -> Self {
        MeterError::UnexpectedState(message.into())
    }

    pub(crate) fn aggregation(fuel_type: FuelType, meter_ids: Vec<String>, source: Self) -> Self {
        MeterError::Aggregation {
            fuel_type,
            meter_ids,
            source: Box::new(source),
        }
    }
}
