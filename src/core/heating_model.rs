use crate::core::amr_data::AmrData;
use chrono::NaiveDate;
use indexmap::IndexMap;
use std::fmt::Debug;
use std::sync::Arc;
use strum_macros::{Display, EnumString};

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum HeatingModelType {
    Best,
    Simple,
    Thermally,
    NoHeatingModel,
}

/// A named span of school dates, e.g. an academic year, over which a model is fitted.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SchoolDatePeriod {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl SchoolDatePeriod {
    pub fn new(name: impl Into<String>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            name: name.into(),
            start_date,
            end_date,
        }
    }
}

/// A fitted heating/hot water regression model. Opaque to the aggregation core.
pub trait HeatingModel: Debug + Send + Sync {
    fn model_type(&self) -> HeatingModelType;
}

/// Fits heating models against a meter's readings.
pub trait HeatingModelFitter: Send + Sync {
    fn create_and_fit_model(
        &self,
        amr_data: &AmrData,
        model_type: HeatingModelType,
        period: &SchoolDatePeriod,
        allow_more_than_one: bool,
        non_heating_model_type: Option<HeatingModelType>,
    ) -> anyhow::Result<Arc<dyn HeatingModel>>;
}

/// Previously fitted models for one meter, reused for the same (model type, period).
#[derive(Debug, Default)]
pub struct ModelCache {
    models: IndexMap<(HeatingModelType, SchoolDatePeriod), Arc<dyn HeatingModel>>,
}

impl ModelCache {
    pub(crate) fn get_or_fit(
        &mut self,
        fitter: &dyn HeatingModelFitter,
        amr_data: &AmrData,
        model_type: HeatingModelType,
        period: &SchoolDatePeriod,
        non_heating_model_type: Option<HeatingModelType>,
    ) -> anyhow::Result<Arc<dyn HeatingModel>> {
        let key = (model_type, period.clone());
        if let Some(model) = self.models.get(&key) {
            return Ok(model.clone());
        }
        let model = fitter.create_and_fit_model(
            amr_data,
            model_type,
            period,
            false,
            non_heating_model_type,
        )?;
        self.models.insert(key, model.clone());
        Ok(model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.models.clear();
    }
}

impl Clone for ModelCache {
    // fitted models belong to the readings they were fitted against
    fn clone(&self) -> Self {
        Self::default()
    }
}
