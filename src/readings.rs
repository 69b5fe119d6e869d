//! Live three phase power readings served by the emulated meter.

use crate::config::InputConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseReading {
    pub voltage: f64,
    pub current: f64,
    pub act_power: f64,
    pub aprt_power: f64,
    pub power_factor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReadings {
    pub phases: [PhaseReading; 3],
    pub frequency: f64,
}

impl Default for PowerReadings {
    fn default() -> Self {
        Self {
            phases: [PhaseReading {
                voltage: 230.0,
                power_factor: 1.0,
                ..Default::default()
            }; 3],
            frequency: 50.0,
        }
    }
}

impl PowerReadings {
    /// The same static reading on every phase.
    pub fn from_input_config(input: &InputConfig) -> Self {
        let phase = &input.static_phase;
        Self {
            phases: [PhaseReading {
                voltage: phase.voltage,
                current: phase.current,
                act_power: phase.act_power,
                aprt_power: phase.aprt_power,
                power_factor: phase.power_factor,
            }; 3],
            frequency: input.frequency,
        }
    }

    pub fn total_current(&self) -> f64 {
        self.phases.iter().map(|p| p.current).sum()
    }

    pub fn total_act_power(&self) -> f64 {
        self.phases.iter().map(|p| p.act_power).sum()
    }

    pub fn total_aprt_power(&self) -> f64 {
        self.phases.iter().map(|p| p.aprt_power).sum()
    }

    /// Adds `watts` spread evenly over the three phases. Current follows the
    /// phase voltage; phases without voltage keep their current.
    pub fn with_offset(mut self, watts: f64) -> Self {
        let per_phase = watts / self.phases.len() as f64;
        for phase in &mut self.phases {
            phase.act_power += per_phase;
            phase.aprt_power += per_phase.abs();
            if phase.voltage > 0.0 {
                phase.current += per_phase.abs() / phase.voltage;
            }
        }
        self
    }

    /// Scales current and power by a per client calibration factor.
    pub fn scaled(mut self, factor: f64) -> Self {
        for phase in &mut self.phases {
            phase.current *= factor;
            phase.act_power *= factor;
            phase.aprt_power *= factor;
        }
        self
    }
}
