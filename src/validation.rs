use crate::core::amr_data::{AmrData, OneDayAmrReading, HALF_HOURS_PER_DAY};
use crate::core::meter::Meter;
use crate::core::meter_attributes::CorrectionRule;
use crate::core::schedule::{HalfHourlySchedule, Holidays};
use anyhow::{anyhow, ensure};
use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

/// Reading type given to days filled in with zeros by a correction rule.
pub const ZERO_MISSING_READING_TYPE: &str = "ZMDR";

/// Screens and corrects one meter's readings before aggregation. Implementations may
/// rewrite the meter's readings in place.
pub trait AmrValidator: Send + Sync {
    fn validate(
        &self,
        meter: &mut Meter,
        min_days_data: usize,
        holidays: &Holidays,
        temperatures: &HalfHourlySchedule,
    ) -> anyhow::Result<()>;
}

/// Applies the meter's correction rules in order, then drops days with non-finite readings.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicAmrValidator;

impl AmrValidator for BasicAmrValidator {
    fn validate(
        &self,
        meter: &mut Meter,
        min_days_data: usize,
        _holidays: &Holidays,
        _temperatures: &HalfHourlySchedule,
    ) -> anyhow::Result<()> {
        let rules = meter.correction_rules().to_vec();
        let meter_id = meter.id().to_string();
        let mpan_mprn = meter.mpan_mprn();
        let amr_data = meter
            .amr_data_mut()
            .ok_or_else(|| anyhow!("Meter {meter_id} has no readings to validate"))?;

        for rule in &rules {
            apply_correction(amr_data, rule, mpan_mprn)?;
        }

        let bad_dates = amr_data
            .readings()
            .filter(|reading| reading.kwh_data_x48().iter().any(|kwh| !kwh.is_finite()))
            .map(OneDayAmrReading::date)
            .collect::<Vec<_>>();
        for date in &bad_dates {
            amr_data.delete_date(*date);
        }
        if !bad_dates.is_empty() {
            warn!(
                "Removed {} days with invalid readings from meter {meter_id}",
                bad_dates.len()
            );
        }

        if amr_data.len() < min_days_data {
            warn!(
                "Meter {meter_id} has only {} days of data, fewer than the {min_days_data} expected",
                amr_data.len()
            );
        }
        Ok(())
    }
}

fn apply_correction(
    amr_data: &mut AmrData,
    rule: &CorrectionRule,
    mpan_mprn: u64,
) -> anyhow::Result<()> {
    debug!("Applying correction {rule:?}");
    match *rule {
        CorrectionRule::RescaleAmrData {
            start_date,
            end_date,
            scale,
        } => {
            check_range(start_date, end_date)?;
            for reading in amr_data
                .readings_mut()
                .filter(|reading| (start_date..=end_date).contains(&reading.date()))
            {
                let scaled = reading.kwh_data_x48().map(|kwh| kwh * scale);
                *reading = reading.with_kwh_data(scaled);
            }
        }
        CorrectionRule::SetMissingDataToZero {
            start_date,
            end_date,
        } => {
            check_range(start_date, end_date)?;
            let upload_datetime = Utc::now();
            for date in days(start_date, end_date) {
                if !amr_data.has_date(date) {
                    amr_data.add(
                        date,
                        OneDayAmrReading::new(
                            mpan_mprn,
                            date,
                            ZERO_MISSING_READING_TYPE,
                            None,
                            upload_datetime,
                            [0.; HALF_HOURS_PER_DAY],
                        ),
                    );
                }
            }
        }
        CorrectionRule::DeleteDateRange {
            start_date,
            end_date,
        } => {
            check_range(start_date, end_date)?;
            for date in days(start_date, end_date) {
                amr_data.delete_date(date);
            }
        }
    }
    Ok(())
}

fn check_range(start_date: NaiveDate, end_date: NaiveDate) -> anyhow::Result<()> {
    ensure!(
        start_date <= end_date,
        "Correction starts on {start_date} after it ends on {end_date}"
    );
    Ok(())
}

fn days(start_date: NaiveDate, end_date: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start_date
        .iter_days()
        .take_while(move |date| *date <= end_date)
}
