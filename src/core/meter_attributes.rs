use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// Typed configuration attached to a meter, one optional entry per concern.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MeterAttributes {
    pub storage_heaters: Option<StorageHeaterAttributes>,
    pub solar_pv: Option<Vec<SolarPvPeriod>>,
    pub solar_pv_override: Option<Vec<SolarPvPeriod>>,
    pub solar_pv_mpan_meter_mapping: Option<Vec<SolarPvMpanMeterMapping>>,
    pub partial_meter_coverage: Option<Vec<PartialMeterCoveragePeriod>>,
    pub aggregation: Option<Vec<AggregationRule>>,
    pub function: Option<Vec<MeterFunction>>,
    pub meter_corrections: Option<Vec<CorrectionRule>>,
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum AttributeCategory {
    StorageHeaters,
    SolarPv,
    SolarPvOverride,
    SolarPvMpanMeterMapping,
    PartialMeterCoverage,
    Aggregation,
    Function,
    MeterCorrections,
}

/// Borrowed view of one category of a meter's attributes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeterAttribute<'a> {
    StorageHeaters(&'a StorageHeaterAttributes),
    SolarPv(&'a [SolarPvPeriod]),
    SolarPvOverride(&'a [SolarPvPeriod]),
    SolarPvMpanMeterMapping(&'a [SolarPvMpanMeterMapping]),
    PartialMeterCoverage(&'a [PartialMeterCoveragePeriod]),
    Aggregation(&'a [AggregationRule]),
    Function(&'a [MeterFunction]),
    MeterCorrections(&'a [CorrectionRule]),
}

impl MeterAttributes {
    pub fn get(&self, category: AttributeCategory) -> Option<MeterAttribute<'_>> {
        match category {
            AttributeCategory::StorageHeaters => self
                .storage_heaters
                .as_ref()
                .map(MeterAttribute::StorageHeaters),
            AttributeCategory::SolarPv => self.solar_pv.as_deref().map(MeterAttribute::SolarPv),
            AttributeCategory::SolarPvOverride => self
                .solar_pv_override
                .as_deref()
                .map(MeterAttribute::SolarPvOverride),
            AttributeCategory::SolarPvMpanMeterMapping => self
                .solar_pv_mpan_meter_mapping
                .as_deref()
                .map(MeterAttribute::SolarPvMpanMeterMapping),
            AttributeCategory::PartialMeterCoverage => self
                .partial_meter_coverage
                .as_deref()
                .map(MeterAttribute::PartialMeterCoverage),
            AttributeCategory::Aggregation => {
                self.aggregation.as_deref().map(MeterAttribute::Aggregation)
            }
            AttributeCategory::Function => self.function.as_deref().map(MeterAttribute::Function),
            AttributeCategory::MeterCorrections => self
                .meter_corrections
                .as_deref()
                .map(MeterAttribute::MeterCorrections),
        }
    }

    pub(crate) fn aggregation_rules(&self) -> &[AggregationRule] {
        self.aggregation.as_deref().unwrap_or_default()
    }

    pub(crate) fn function_includes(&self, functions: &[MeterFunction]) -> bool {
        self.function
            .as_deref()
            .is_some_and(|function| function.iter().any(|f| functions.contains(f)))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageHeaterAttributes {
    /// start of the overnight charging window, e.g. "00:30:00"
    pub charge_start_time: NaiveTime,
    /// end (exclusive) of the overnight charging window
    pub charge_end_time: NaiveTime,
    /// total rated input power of the heaters, in kW
    pub power_kw: Option<f64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SolarPvPeriod {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// installed peak capacity in kWp
    pub kwp: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SolarPvMpanMeterMapping {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub production_mpan: String,
    pub export_mpan: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PartialMeterCoveragePeriod {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// fraction (0 to 1) of the school's floor area supplied through the meter
    pub percent_floor_area: f64,
    /// fraction (0 to 1) of the school's pupils served by the meter
    pub percent_pupils: f64,
}

impl PartialMeterCoveragePeriod {
    fn covers(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |start| start <= date)
            && self.end_date.map_or(true, |end| date <= end)
    }

    fn overlapping_days(&self, start_date: NaiveDate, end_date: NaiveDate) -> i64 {
        let start = self.start_date.map_or(start_date, |s| s.max(start_date));
        let end = self.end_date.map_or(end_date, |e| e.min(end_date));
        ((end - start).num_days() + 1).max(0)
    }

    fn overlaps(&self, start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> bool {
        let starts_before_end = match (self.start_date, end_date) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        };
        let ends_after_start = match (self.end_date, start_date) {
            (Some(end), Some(start)) => start <= end,
            _ => true,
        };
        starts_before_end && ends_after_start
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationRule {
    IgnoreStartDate,
    IgnoreEndDate,
    DeprecatedIncludeButIgnoreStartDate,
    DeprecatedIncludeButIgnoreEndDate,
}

impl AggregationRule {
    pub fn ignores_start_date(&self) -> bool {
        matches!(
            self,
            AggregationRule::IgnoreStartDate | AggregationRule::DeprecatedIncludeButIgnoreStartDate
        )
    }

    pub fn ignores_end_date(&self) -> bool {
        matches!(
            self,
            AggregationRule::IgnoreEndDate | AggregationRule::DeprecatedIncludeButIgnoreEndDate
        )
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterFunction {
    HeatingOnly,
    KitchenOnly,
    HotwaterOnly,
}

/// A correction applied to a meter's readings before any modelling.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionRule {
    RescaleAmrData {
        start_date: NaiveDate,
        end_date: NaiveDate,
        scale: f64,
    },
    SetMissingDataToZero {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    DeleteDateRange {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
}

/// The share of a school's floor area and pupils that a meter covers over time.
/// A meter without any coverage periods covers the whole school.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartialMeterCoverage {
    periods: Vec<PartialMeterCoveragePeriod>,
}

impl PartialMeterCoverage {
    pub fn new(periods: Option<&[PartialMeterCoveragePeriod]>) -> Self {
        Self {
            periods: periods.map(<[_]>::to_vec).unwrap_or_default(),
        }
    }

    pub fn is_full_coverage(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn floor_area_fraction_on_date(&self, date: NaiveDate) -> f64 {
        self.fraction_on_date(date, |period| period.percent_floor_area)
    }

    pub fn floor_area_fraction(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> f64 {
        self.fraction(start_date, end_date, |period| period.percent_floor_area)
    }

    pub fn pupils_fraction(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> f64 {
        self.fraction(start_date, end_date, |period| period.percent_pupils)
    }

    fn fraction_on_date(
        &self,
        date: NaiveDate,
        value: impl Fn(&PartialMeterCoveragePeriod) -> f64,
    ) -> f64 {
        self.periods
            .iter()
            .find(|period| period.covers(date))
            .map_or(1., value)
    }

    // weighted by days of overlap when the query range is bounded, otherwise a plain mean
    // of the overlapping periods
    fn fraction(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        value: impl Fn(&PartialMeterCoveragePeriod) -> f64,
    ) -> f64 {
        let overlapping = self
            .periods
            .iter()
            .filter(|period| period.overlaps(start_date, end_date))
            .collect::<Vec<_>>();
        if overlapping.is_empty() {
            return 1.;
        }

        match (start_date, end_date) {
            (Some(start), Some(end)) => {
                let (weighted, days) =
                    overlapping
                        .iter()
                        .copied()
                        .fold((0., 0), |(weighted, days), period| {
                            let overlap = period.overlapping_days(start, end);
                            (weighted + value(period) * overlap as f64, days + overlap)
                        });
                if days == 0 {
                    1.
                } else {
                    weighted / days as f64
                }
            }
            _ => {
                overlapping.iter().copied().map(&value).sum::<f64>() / overlapping.len() as f64
            }
        }
    }
}
