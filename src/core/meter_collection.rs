use crate::core::meter::Meter;
use crate::core::schedule::{HalfHourlySchedule, Holidays, ScheduleProvider};
use crate::errors::MeterError;
use chrono::NaiveTime;
use derivative::Derivative;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

/// Non-owning reference from a meter back to the collection that owns it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MeterCollectionHandle {
    urn: u64,
}

impl MeterCollectionHandle {
    pub fn new(urn: u64) -> Self {
        Self { urn }
    }

    pub fn urn(&self) -> u64 {
        self.urn
    }
}

#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum MeterGroup {
    Heat,
    Electricity,
    SolarPv,
    StorageHeater,
}

/// The two fuels that get a whole-school aggregate meter.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum AggregateFuel {
    Heat,
    Electricity,
}

impl AggregateFuel {
    pub fn group(&self) -> MeterGroup {
        match self {
            AggregateFuel::Heat => MeterGroup::Heat,
            AggregateFuel::Electricity => MeterGroup::Electricity,
        }
    }
}

/// An aggregate slot either refers to the only meter of its group or owns a combined meter.
#[derive(Clone, Debug)]
pub enum AggregateMeter {
    Member(usize),
    Combined(Box<Meter>),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MeterLocation {
    Physical(MeterGroup, usize),
    Aggregate(AggregateFuel),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchoolIdentifierType {
    Name,
    Urn,
    Postcode,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct MeterCollection {
    name: String,
    urn: u64,
    area_name: String,
    postcode: Option<String>,
    floor_area: Option<f64>,
    number_of_pupils: Option<u32>,
    heat_meters: Vec<Meter>,
    electricity_meters: Vec<Meter>,
    solar_pv_meters: Vec<Meter>,
    storage_heater_meters: Vec<Meter>,
    aggregated_heat_meter: Option<AggregateMeter>,
    aggregated_electricity_meter: Option<AggregateMeter>,
    meter_identifier_lookup: RefCell<IndexMap<String, Option<MeterLocation>>>,
    #[derivative(Debug = "ignore")]
    schedules: Arc<dyn ScheduleProvider>,
}

impl MeterCollection {
    const OPEN_TIME: (u32, u32) = (7, 0);
    const CLOSE_TIME: (u32, u32) = (16, 30);

    pub fn new(
        name: impl Into<String>,
        urn: u64,
        area_name: impl Into<String>,
        schedules: Arc<dyn ScheduleProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            urn,
            area_name: area_name.into(),
            postcode: None,
            floor_area: None,
            number_of_pupils: None,
            heat_meters: vec![],
            electricity_meters: vec![],
            solar_pv_meters: vec![],
            storage_heater_meters: vec![],
            aggregated_heat_meter: None,
            aggregated_electricity_meter: None,
            meter_identifier_lookup: Default::default(),
            schedules,
        }
    }

    pub fn with_floor_area(mut self, floor_area: Option<f64>) -> Self {
        self.floor_area = floor_area;
        self
    }

    pub fn with_number_of_pupils(mut self, number_of_pupils: Option<u32>) -> Self {
        self.number_of_pupils = number_of_pupils;
        self
    }

    pub fn with_postcode(mut self, postcode: Option<String>) -> Self {
        self.postcode = postcode;
        self
    }

    pub fn handle(&self) -> MeterCollectionHandle {
        MeterCollectionHandle::new(self.urn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn urn(&self) -> u64 {
        self.urn
    }

    pub fn area_name(&self) -> &str {
        &self.area_name
    }

    pub fn postcode(&self) -> Option<&str> {
        self.postcode.as_deref()
    }

    pub fn floor_area(&self) -> Option<f64> {
        self.floor_area
    }

    pub fn number_of_pupils(&self) -> Option<u32> {
        self.number_of_pupils
    }

    pub fn matches_identifier(
        &self,
        identifier: &str,
        identifier_type: SchoolIdentifierType,
    ) -> bool {
        match identifier_type {
            SchoolIdentifierType::Name => identifier == self.name,
            SchoolIdentifierType::Urn => identifier.parse::<u64>().is_ok_and(|urn| urn == self.urn),
            SchoolIdentifierType::Postcode => self.postcode.as_deref() == Some(identifier),
        }
    }

    pub fn is_school_usually_open(&self, time_of_day: NaiveTime) -> bool {
        let at = |(hour, minute)| NaiveTime::from_hms_opt(hour, minute, 0);
        match (at(Self::OPEN_TIME), at(Self::CLOSE_TIME)) {
            (Some(open), Some(close)) => open <= time_of_day && time_of_day < close,
            _ => false,
        }
    }

    pub fn meters(&self, group: MeterGroup) -> &[Meter] {
        match group {
            MeterGroup::Heat => &self.heat_meters,
            MeterGroup::Electricity => &self.electricity_meters,
            MeterGroup::SolarPv => &self.solar_pv_meters,
            MeterGroup::StorageHeater => &self.storage_heater_meters,
        }
    }

    /// Mutable access to a group. Identifiers may change, so the lookup table is reset.
    pub fn meters_mut(&mut self, group: MeterGroup) -> &mut [Meter] {
        self.meter_identifier_lookup.get_mut().clear();
        self.group_mut(group)
    }

    pub fn heat_meters(&self) -> &[Meter] {
        self.meters(MeterGroup::Heat)
    }

    pub fn electricity_meters(&self) -> &[Meter] {
        self.meters(MeterGroup::Electricity)
    }

    pub fn solar_pv_meters(&self) -> &[Meter] {
        self.meters(MeterGroup::SolarPv)
    }

    pub fn storage_heater_meters(&self) -> &[Meter] {
        self.meters(MeterGroup::StorageHeater)
    }

    pub fn add_heat_meter(&mut self, meter: Meter) {
        self.add_meter(MeterGroup::Heat, meter);
    }

    pub fn add_electricity_meter(&mut self, meter: Meter) {
        self.add_meter(MeterGroup::Electricity, meter);
    }

    pub fn add_solar_pv_meter(&mut self, meter: Meter) {
        self.add_meter(MeterGroup::SolarPv, meter);
    }

    pub fn add_storage_heater_meter(&mut self, meter: Meter) {
        self.add_meter(MeterGroup::StorageHeater, meter);
    }

    pub fn add_meter(&mut self, group: MeterGroup, meter: Meter) {
        let id = meter.id().to_string();
        let meters = self.group_mut(group);
        meters.push(meter);
        let location = MeterLocation::Physical(group, meters.len() - 1);
        self.meter_identifier_lookup
            .get_mut()
            .insert(id, Some(location));
    }

    pub fn add_aggregate_heat_meter(&mut self, meter: AggregateMeter) -> Result<(), MeterError> {
        self.set_aggregate(AggregateFuel::Heat, Some(meter))
    }

    pub fn add_aggregate_electricity_meter(
        &mut self,
        meter: AggregateMeter,
    ) -> Result<(), MeterError> {
        self.set_aggregate(AggregateFuel::Electricity, Some(meter))
    }

    /// Set (or with `None` unset) the aggregate slot for a fuel, registering the
    /// aggregate under its identifier in place of any earlier entry.
    pub fn set_aggregate(
        &mut self,
        fuel: AggregateFuel,
        meter: Option<AggregateMeter>,
    ) -> Result<(), MeterError> {
        if let Some(AggregateMeter::Member(index)) = &meter {
            let index = *index;
            if index >= self.meters(fuel.group()).len() {
                return Err(MeterError::unexpected_state(format!(
                    "Aggregate {fuel} meter refers to meter {index} of a group of {}",
                    self.meters(fuel.group()).len()
                )));
            }
        }

        *self.aggregate_slot_mut(fuel) = meter;
        let id = self.aggregate(fuel).map(|meter| meter.id().to_string());
        let lookup = self.meter_identifier_lookup.get_mut();
        // an unset slot may leave stale aggregate entries behind
        lookup.retain(|_, location| *location != Some(MeterLocation::Aggregate(fuel)));
        if let Some(id) = id {
            lookup.insert(id, Some(MeterLocation::Aggregate(fuel)));
        }
        Ok(())
    }

    pub fn aggregate_slot(&self, fuel: AggregateFuel) -> Option<&AggregateMeter> {
        match fuel {
            AggregateFuel::Heat => self.aggregated_heat_meter.as_ref(),
            AggregateFuel::Electricity => self.aggregated_electricity_meter.as_ref(),
        }
    }

    pub fn aggregate(&self, fuel: AggregateFuel) -> Option<&Meter> {
        match self.aggregate_slot(fuel)? {
            AggregateMeter::Member(index) => self.meters(fuel.group()).get(*index),
            AggregateMeter::Combined(meter) => Some(meter.as_ref()),
        }
    }

    pub fn aggregate_mut(&mut self, fuel: AggregateFuel) -> Option<&mut Meter> {
        self.meter_identifier_lookup.get_mut().clear();
        let member_index = match self.aggregate_slot(fuel)? {
            AggregateMeter::Member(index) => Some(*index),
            AggregateMeter::Combined(_) => None,
        };
        match member_index {
            Some(index) => self.group_mut(fuel.group()).get_mut(index),
            None => match self.aggregate_slot_mut(fuel) {
                Some(AggregateMeter::Combined(meter)) => Some(meter.as_mut()),
                _ => None,
            },
        }
    }

    pub fn aggregated_heat_meter(&self) -> Option<&Meter> {
        self.aggregate(AggregateFuel::Heat)
    }

    pub fn aggregated_electricity_meter(&self) -> Option<&Meter> {
        self.aggregate(AggregateFuel::Electricity)
    }

    /// The meter with this identifier across all groups and aggregates. Misses are
    /// remembered too.
    pub fn meter(&self, identifier: &str) -> Option<&Meter> {
        let cached = self.meter_identifier_lookup.borrow().get(identifier).copied();
        let location = match cached {
            Some(location) => location,
            None => {
                let location = self.locate(identifier);
                self.meter_identifier_lookup
                    .borrow_mut()
                    .insert(identifier.to_string(), location);
                location
            }
        };
        location.and_then(|location| self.resolve(location))
    }

    /// Every physical meter followed by any combined aggregates. An aggregate that is
    /// just a reference to a group's only meter is not listed twice.
    pub fn all_meters(&self) -> Vec<&Meter> {
        MeterGroup::iter()
            .flat_map(|group| self.meters(group))
            .chain(self.combined_aggregates())
            .collect()
    }

    pub fn schedules(&self) -> Arc<dyn ScheduleProvider> {
        self.schedules.clone()
    }

    pub fn holidays(&self) -> Result<&Holidays, MeterError> {
        self.schedules.holidays(&self.area_name)
    }

    pub fn temperatures(&self) -> Result<&HalfHourlySchedule, MeterError> {
        self.schedules.temperatures(&self.area_name)
    }

    pub fn solar_irradiation(&self) -> Result<&HalfHourlySchedule, MeterError> {
        self.schedules.solar_irradiation(&self.area_name)
    }

    pub fn solar_pv(&self) -> Result<&HalfHourlySchedule, MeterError> {
        self.schedules.solar_pv(&self.area_name)
    }

    pub fn grid_carbon_intensity(&self) -> Result<&HalfHourlySchedule, MeterError> {
        self.schedules.grid_carbon_intensity(&self.area_name)
    }

    fn combined_aggregates(&self) -> impl Iterator<Item = &Meter> {
        [&self.aggregated_heat_meter, &self.aggregated_electricity_meter]
            .into_iter()
            .filter_map(|slot| match slot {
                Some(AggregateMeter::Combined(meter)) => Some(meter.as_ref()),
                _ => None,
            })
    }

    fn group_mut(&mut self, group: MeterGroup) -> &mut Vec<Meter> {
        match group {
            MeterGroup::Heat => &mut self.heat_meters,
            MeterGroup::Electricity => &mut self.electricity_meters,
            MeterGroup::SolarPv => &mut self.solar_pv_meters,
            MeterGroup::StorageHeater => &mut self.storage_heater_meters,
        }
    }

    fn aggregate_slot_mut(&mut self, fuel: AggregateFuel) -> &mut Option<AggregateMeter> {
        match fuel {
            AggregateFuel::Heat => &mut self.aggregated_heat_meter,
            AggregateFuel::Electricity => &mut self.aggregated_electricity_meter,
        }
    }

    fn locate(&self, identifier: &str) -> Option<MeterLocation> {
        MeterGroup::iter()
            .find_map(|group| {
                self.meters(group)
                    .iter()
                    .position(|meter| meter.id() == identifier)
                    .map(|index| MeterLocation::Physical(group, index))
            })
            .or_else(|| {
                AggregateFuel::iter()
                    .find(|fuel| {
                        self.aggregate(*fuel)
                            .is_some_and(|meter| meter.id() == identifier)
                    })
                    .map(MeterLocation::Aggregate)
            })
    }

    fn resolve(&self, location: MeterLocation) -> Option<&Meter> {
        match location {
            MeterLocation::Physical(group, index) => self.meters(group).get(index),
            MeterLocation::Aggregate(fuel) => self.aggregate(fuel),
        }
    }
}

impl Display for MeterCollection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Meter Collection:{}:", self.name)?;
        let meters = self.all_meters();
        for (index, meter) in meters.iter().enumerate() {
            if index > 0 {
                write!(f, ";")?;
            }
            write!(f, "{meter}")?;
        }
        Ok(())
    }
}
