use crate::core::meter_attributes::SolarPvPeriod;
use chrono::NaiveDate;
use std::fmt::{Display, Formatter};

/// A school's solar PV installation(s), possibly changing capacity over time.
#[derive(Clone, Debug, PartialEq)]
pub struct SolarPvPanels {
    periods: Vec<SolarPvPeriod>,
}

impl SolarPvPanels {
    pub fn new(periods: &[SolarPvPeriod]) -> Self {
        Self {
            periods: periods.to_vec(),
        }
    }

    /// Total installed kWp on the date; overlapping periods are separate arrays and add up.
    pub fn capacity_kwp_on_date(&self, date: NaiveDate) -> f64 {
        self.periods
            .iter()
            .filter(|period| {
                period.start_date.map_or(true, |start| start <= date)
                    && period.end_date.map_or(true, |end| date <= end)
            })
            .map(|period| period.kwp)
            .sum()
    }

    pub fn periods(&self) -> &[SolarPvPeriod] {
        &self.periods
    }
}

impl Display for SolarPvPanels {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let max_kwp = self
            .periods
            .iter()
            .map(|period| period.kwp)
            .fold(0., f64::max);
        write!(f, "Solar PV {max_kwp}kWp")
    }
}
