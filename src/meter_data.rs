use chrono::{DateTime, Utc};
use serde_derive::Deserialize;

use crate::error::ConfigError;

/// Number of electrical phases the meter reports. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum PhaseCount {
    #[default]
    Single,
    Three,
}

impl PhaseCount {
    pub fn count(self) -> usize {
        match self {
            PhaseCount::Single => 1,
            PhaseCount::Three => 3,
        }
    }
}

impl TryFrom<u8> for PhaseCount {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PhaseCount::Single),
            3 => Ok(PhaseCount::Three),
            other => Err(ConfigError::InvalidPhaseCount(other)),
        }
    }
}

/// Electrical readings for one phase, in canonical units.
///
/// Active power is positive when importing from the grid and negative when
/// exporting. Energy counters are in kWh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    pub act_power: f64,
    pub aprt_power: f64,
    pub power_factor: f64,
    pub frequency: f64,
    pub energy_imported_kwh: f64,
    pub energy_exported_kwh: f64,
}

/// One normalized meter reading, as published by the poller.
///
/// Totals are derived from the phases in [`MeterSnapshot::new`] and nowhere
/// else.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSnapshot {
    phases: Vec<PhaseReading>,
    total_act_power: f64,
    total_aprt_power: f64,
    total_current: f64,
    energy_imported_kwh: f64,
    energy_exported_kwh: f64,
    captured_at: DateTime<Utc>,
}

impl MeterSnapshot {
    pub fn new(phases: Vec<PhaseReading>, captured_at: DateTime<Utc>) -> Self {
        let total_act_power = phases.iter().map(|p| p.act_power).sum();
        let total_aprt_power = phases.iter().map(|p| p.aprt_power).sum();
        let total_current = phases.iter().map(|p| p.current).sum();
        let energy_imported_kwh = phases.iter().map(|p| p.energy_imported_kwh).sum();
        let energy_exported_kwh = phases.iter().map(|p| p.energy_exported_kwh).sum();
        Self {
            phases,
            total_act_power,
            total_aprt_power,
            total_current,
            energy_imported_kwh,
            energy_exported_kwh,
            captured_at,
        }
    }

    pub fn phases(&self) -> &[PhaseReading] {
        &self.phases
    }

    pub fn phase(&self, index: usize) -> Option<&PhaseReading> {
        self.phases.get(index)
    }

    pub fn total_act_power(&self) -> f64 {
        self.total_act_power
    }

    pub fn total_aprt_power(&self) -> f64 {
        self.total_aprt_power
    }

    pub fn total_current(&self) -> f64 {
        self.total_current
    }

    pub fn energy_imported_kwh(&self) -> f64 {
        self.energy_imported_kwh
    }

    pub fn energy_exported_kwh(&self) -> f64 {
        self.energy_exported_kwh
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Raises every energy counter to at least the value in `previous`.
    ///
    /// Vendor counters occasionally step backwards after a gateway reboot;
    /// published totals never do.
    pub fn with_energy_floor(mut self, previous: &MeterSnapshot) -> Self {
        for (phase, prev) in self.phases.iter_mut().zip(previous.phases()) {
            phase.energy_imported_kwh = phase.energy_imported_kwh.max(prev.energy_imported_kwh);
            phase.energy_exported_kwh = phase.energy_exported_kwh.max(prev.energy_exported_kwh);
        }
        Self::new(self.phases, self.captured_at)
    }
}
