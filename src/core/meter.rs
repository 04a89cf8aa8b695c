use crate::core::amr_data::AmrData;
use crate::core::fuel_type::FuelType;
use crate::core::heating_model::{
    HeatingModel, HeatingModelFitter, HeatingModelType, ModelCache, SchoolDatePeriod,
};
use crate::core::meter_attributes::{
    AttributeCategory, CorrectionRule, MeterAttribute, MeterAttributes, MeterFunction,
    PartialMeterCoverage,
};
use crate::core::meter_collection::MeterCollectionHandle;
use crate::core::solar_pv::SolarPvPanels;
use crate::core::storage_heater::StorageHeater;
use crate::core::synthetic_mpan;
use crate::errors::MeterError;
use chrono::NaiveDate;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::debug;

/// A physical, synthesized or virtual meter: identity and metadata wrapping one store
/// of half hourly readings, plus any sub-meters derived from it.
#[derive(Clone, Debug)]
pub struct Meter {
    collection: MeterCollectionHandle,
    amr_data: Option<AmrData>,
    fuel_type: FuelType,
    id: String,
    mpan_mprn: u64,
    name: String,
    external_meter_id: Option<String>,
    active: bool,
    floor_area: Option<f64>,
    number_of_pupils: Option<u32>,
    attributes: MeterAttributes,
    storage_heater_setup: Option<StorageHeater>,
    solar_pv_setup: Option<SolarPvPanels>,
    solar_pv_overrides: Option<SolarPvPanels>,
    solar_pv_real_metering: bool,
    partial_meter_coverage: PartialMeterCoverage,
    correction_rules: Vec<CorrectionRule>,
    sub_meters: Vec<Meter>,
    model_cache: ModelCache,
}

impl Meter {
    /// Arguments:
    /// * `collection` - handle of the collection the meter belongs to
    /// * `amr_data` - the meter's readings; `None` only for metadata-only clones
    /// * `fuel_type` - what the meter measures
    /// * `identifier` - raw meter identifier, whose leading digits give the mpan/mprn
    /// * `name` - human readable name
    /// * `floor_area` - floor area served by the meter, if known
    /// * `number_of_pupils` - pupils served by the meter, if known
    /// * `attributes` - typed configuration bag
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collection: MeterCollectionHandle,
        amr_data: Option<AmrData>,
        fuel_type: FuelType,
        identifier: impl Into<String>,
        name: impl Into<String>,
        floor_area: Option<f64>,
        number_of_pupils: Option<u32>,
        attributes: MeterAttributes,
    ) -> Self {
        let id = identifier.into();
        let name = name.into();
        debug!(
            "Creating new meter: type {fuel_type} id: {id} name: {name} floor area: {floor_area:?} pupils: {number_of_pupils:?}"
        );

        Self {
            collection,
            amr_data,
            fuel_type,
            mpan_mprn: mpan_mprn_from_identifier(&id),
            id,
            name,
            external_meter_id: None,
            active: true,
            floor_area,
            number_of_pupils,
            storage_heater_setup: attributes.storage_heaters.as_ref().map(StorageHeater::new),
            solar_pv_setup: attributes.solar_pv.as_deref().map(SolarPvPanels::new),
            solar_pv_overrides: attributes.solar_pv_override.as_deref().map(SolarPvPanels::new),
            solar_pv_real_metering: attributes.solar_pv_mpan_meter_mapping.is_some(),
            partial_meter_coverage: PartialMeterCoverage::new(
                attributes.partial_meter_coverage.as_deref(),
            ),
            correction_rules: attributes.meter_corrections.clone().unwrap_or_default(),
            attributes,
            sub_meters: vec![],
            model_cache: Default::default(),
        }
    }

    pub fn with_external_meter_id(mut self, external_meter_id: impl Into<String>) -> Self {
        self.external_meter_id = Some(external_meter_id.into());
        self
    }

    /// Use a synthetic identifier rather than the one derived from the textual identifier.
    pub fn with_mpan_mprn(mut self, mpan_mprn: u64) -> Self {
        self.mpan_mprn = mpan_mprn;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// A derived meter (sub-meter or split) sharing this meter's collection, floor
    /// area/pupils and aggregation rules but carrying its own readings and no other
    /// attributes.
    pub fn create_modified_copy(
        &self,
        amr_data: AmrData,
        fuel_type: FuelType,
        identifier: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(
            self.collection,
            Some(amr_data),
            fuel_type,
            identifier,
            name,
            self.floor_area,
            self.number_of_pupils,
            MeterAttributes {
                aggregation: self.attributes.aggregation.clone(),
                ..Default::default()
            },
        )
    }

    pub fn clone_meter_without_amr_data(&self) -> Self {
        Self::new(
            self.collection,
            None,
            self.fuel_type,
            self.id.clone(),
            self.name.clone(),
            self.floor_area,
            self.number_of_pupils,
            self.attributes.clone(),
        )
    }

    pub fn collection(&self) -> MeterCollectionHandle {
        self.collection
    }

    pub fn amr_data(&self) -> Option<&AmrData> {
        self.amr_data.as_ref()
    }

    pub fn required_amr_data(&self) -> Result<&AmrData, MeterError> {
        self.amr_data.as_ref().ok_or_else(|| {
            MeterError::unexpected_state(format!("Meter {} has no readings", self.id))
        })
    }

    /// Mutable access for in-place corrections; any fitted models are discarded.
    pub fn amr_data_mut(&mut self) -> Option<&mut AmrData> {
        self.model_cache.clear();
        self.amr_data.as_mut()
    }

    /// Replace the meter's readings; any fitted models are discarded.
    pub fn set_amr_data(&mut self, amr_data: AmrData) {
        self.model_cache.clear();
        self.amr_data = Some(amr_data);
    }

    pub fn fuel_type(&self) -> FuelType {
        self.fuel_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mpan_mprn(&self) -> u64 {
        self.mpan_mprn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn external_meter_id(&self) -> Option<&str> {
        self.external_meter_id.as_deref()
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn floor_area(&self) -> Option<f64> {
        self.floor_area
    }

    pub fn set_floor_area(&mut self, floor_area: Option<f64>) {
        self.floor_area = floor_area;
    }

    pub fn number_of_pupils(&self) -> Option<u32> {
        self.number_of_pupils
    }

    pub fn set_number_of_pupils(&mut self, number_of_pupils: Option<u32>) {
        self.number_of_pupils = number_of_pupils;
    }

    /// Suffix both the identifier and the name, e.g. when the meter's readings now
    /// include self-generation. The numeric mpan/mprn is unchanged.
    pub fn append_to_identity(&mut self, suffix: &str) {
        self.id.push_str(suffix);
        self.name.push_str(suffix);
    }

    pub fn attributes(&self, category: AttributeCategory) -> Option<MeterAttribute<'_>> {
        self.attributes.get(category)
    }

    pub fn all_attributes(&self) -> &MeterAttributes {
        &self.attributes
    }

    pub fn storage_heater_config(&self) -> Option<&StorageHeater> {
        self.storage_heater_setup.as_ref()
    }

    /// The installation used for PV synthesis; overrides take precedence.
    pub fn solar_pv_installation(&self) -> Option<&SolarPvPanels> {
        self.solar_pv_overrides
            .as_ref()
            .or(self.solar_pv_setup.as_ref())
    }

    pub fn solar_pv_panels(&self) -> bool {
        self.sheffield_simulated_solar_pv_panels()
            || self.solar_pv_real_metering()
            || self.solar_pv_sub_meters_to_be_aggregated() > 0
    }

    pub fn sheffield_simulated_solar_pv_panels(&self) -> bool {
        self.solar_pv_setup.is_some()
    }

    pub fn solar_pv_real_metering(&self) -> bool {
        self.solar_pv_real_metering
    }

    /// Number of incoming PV meters mapped onto this one. Only meaningful before aggregation.
    pub fn solar_pv_sub_meters_to_be_aggregated(&self) -> usize {
        self.attributes
            .solar_pv_mpan_meter_mapping
            .as_ref()
            .map_or(0, Vec::len)
    }

    pub fn non_heating_only(&self) -> bool {
        self.attributes
            .function_includes(&[MeterFunction::HotwaterOnly, MeterFunction::KitchenOnly])
    }

    pub fn kitchen_only(&self) -> bool {
        self.attributes.function_includes(&[MeterFunction::KitchenOnly])
    }

    pub fn hot_water_only(&self) -> bool {
        self.attributes.function_includes(&[MeterFunction::HotwaterOnly])
    }

    pub fn heating_only(&self) -> bool {
        self.attributes.function_includes(&[MeterFunction::HeatingOnly])
    }

    pub fn heat_meter(&self) -> bool {
        self.fuel_type.is_heat()
    }

    pub fn electricity_meter(&self) -> bool {
        self.fuel_type.is_electricity()
    }

    pub fn storage_heater(&self) -> bool {
        self.storage_heater_setup.is_some() || self.fuel_type == FuelType::StorageHeater
    }

    pub fn synthetic_mpan_mprn(&self) -> bool {
        synthetic_mpan::is_synthetic(self.mpan_mprn)
    }

    pub fn aggregate_meter(&self) -> bool {
        synthetic_mpan::is_aggregate(self.mpan_mprn)
    }

    /// Fit (or reuse a previously fitted) heating model for the period.
    pub fn heating_model(
        &mut self,
        fitter: &dyn HeatingModelFitter,
        period: &SchoolDatePeriod,
        model_type: HeatingModelType,
        non_heating_model_type: Option<HeatingModelType>,
    ) -> Result<Arc<dyn HeatingModel>, MeterError> {
        let amr_data = self.amr_data.as_ref().ok_or_else(|| {
            MeterError::unexpected_state(format!("Meter {} has no readings", self.id))
        })?;
        self.model_cache
            .get_or_fit(fitter, amr_data, model_type, period, non_heating_model_type)
            .map_err(|source| MeterError::ModelFitting {
                meter_id: self.id.clone(),
                source,
            })
    }

    pub fn model_cache(&self) -> &ModelCache {
        &self.model_cache
    }

    pub fn correction_rules(&self) -> &[CorrectionRule] {
        &self.correction_rules
    }

    /// Inserted rules are evaluated before the existing ones.
    pub fn insert_correction_rules_first(&mut self, rules: Vec<CorrectionRule>) {
        self.correction_rules = rules
            .into_iter()
            .chain(self.correction_rules.drain(..))
            .collect();
    }

    pub fn partial_meter_coverage(&self) -> &PartialMeterCoverage {
        &self.partial_meter_coverage
    }

    pub fn partial_floor_area(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> f64 {
        self.partial_meter_coverage
            .floor_area_fraction(start_date, end_date)
    }

    pub fn partial_number_of_pupils(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> f64 {
        self.partial_meter_coverage.pupils_fraction(start_date, end_date)
    }

    /// The school's floor area scaled by the share this meter covers, rounded to the nearest m².
    pub fn meter_floor_area(
        &self,
        school_floor_area: f64,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> f64 {
        (school_floor_area * self.partial_floor_area(start_date, end_date)).round()
    }

    pub fn meter_number_of_pupils(
        &self,
        school_number_of_pupils: u32,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> u32 {
        (school_number_of_pupils as f64 * self.partial_number_of_pupils(start_date, end_date))
            as u32
    }

    pub fn check_history_covers(&self, required_start: NaiveDate) -> Result<(), MeterError> {
        let available_start = self.required_amr_data()?.start_date()?;
        if available_start > required_start {
            return Err(MeterError::InsufficientHistory {
                required_start,
                available_start,
            });
        }
        Ok(())
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.mpan_mprn.to_string()
        } else {
            format!("{} ({})", self.mpan_mprn, self.name)
        }
    }

    pub fn sub_meters(&self) -> &[Meter] {
        &self.sub_meters
    }

    pub fn sub_meters_mut(&mut self) -> &mut Vec<Meter> {
        &mut self.sub_meters
    }

    pub fn add_sub_meter(&mut self, meter: Meter) {
        self.sub_meters.push(meter);
    }

    /// Fold a freshly computed aggregate into this existing one: the readings and
    /// sub-meters are always replaced, floor area and pupils only fill in values that
    /// are missing or zero.
    pub fn absorb_reaggregation(&mut self, fresh: Meter) {
        debug!("Combined meter {} already created", self.mpan_mprn);
        if self.floor_area.map_or(true, |floor_area| floor_area == 0.) {
            self.floor_area = fresh.floor_area;
        }
        if self.number_of_pupils.map_or(true, |pupils| pupils == 0) {
            self.number_of_pupils = fresh.number_of_pupils;
        }
        if let Some(amr_data) = fresh.amr_data {
            self.set_amr_data(amr_data);
        }
        self.sub_meters = fresh.sub_meters;
    }
}

impl Display for Meter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}x", self.mpan_mprn, self.fuel_type)?;
        match &self.amr_data {
            Some(amr_data) => match (amr_data.start_date(), amr_data.end_date()) {
                (Ok(start_date), Ok(end_date)) => {
                    write!(f, "{}:{start_date} to {end_date}", amr_data.len())
                }
                _ => write!(f, "0:no amr data"),
            },
            None => write!(f, "0:no amr data"),
        }
    }
}

// leading digits of the identifier, so "1234 plus pv" keeps 1234
fn mpan_mprn_from_identifier(identifier: &str) -> u64 {
    let digits = identifier
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.parse().unwrap_or(0)
}
