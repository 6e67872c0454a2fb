use std::time::Duration;

use serde::Serialize;
use strum::Display;

use crate::clock::{ClockKey, ClockSource};
use crate::compensation::{SampleHistory, TableRow, ThermalTable};
use crate::config::{
    AmpConfig, AmpMode, DEFAULT_COMPENSATION_PERIOD, DEFAULT_FAULT_POLL_PERIOD, InterfaceFormat,
};
use crate::sensor::SensorOption;

/// Amplifier power sequencing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum PowerState {
    Off,
    Starting,
    On,
    /// Muted and waiting for the deferred power-off.
    ShuttingDown,
}

/// Settings that can be changed while the device runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunables {
    pub compensation_enabled: bool,
    pub compensation_period: Duration,
    pub fault_poll_enabled: bool,
    pub fault_poll_period: Duration,
    pub delayed_shutdown_enabled: bool,
    pub delayed_shutdown: Duration,
    pub ocp_aging_enabled: bool,
    pub sensor_option: SensorOption,
}

impl Tunables {
    /// Period to re-arm the sampler with. Zero means the default.
    pub fn compensation_rearm(&self) -> Duration {
        non_zero_or(self.compensation_period, DEFAULT_COMPENSATION_PERIOD)
    }

    pub fn fault_poll_rearm(&self) -> Duration {
        non_zero_or(self.fault_poll_period, DEFAULT_FAULT_POLL_PERIOD)
    }
}

fn non_zero_or(period: Duration, default: Duration) -> Duration {
    if period.is_zero() { default } else { period }
}

impl From<&AmpConfig> for Tunables {
    fn from(config: &AmpConfig) -> Self {
        Self {
            compensation_enabled: config.compensation_enabled,
            compensation_period: config.compensation_period,
            fault_poll_enabled: config.fault_poll_enabled,
            fault_poll_period: config.fault_poll_period,
            delayed_shutdown_enabled: config.delayed_shutdown_enabled,
            delayed_shutdown: config.delayed_shutdown,
            ocp_aging_enabled: config.ocp_aging_enabled,
            sensor_option: config.sensor_option,
        }
    }
}

/// Everything the runtime knows about one amplifier.
///
/// Lives behind the controller's lock. Never hold the guard across a
/// register access or a sleep.
#[derive(Debug)]
pub struct DeviceState {
    pub power: PowerState,
    pub force_power_down: bool,
    /// Stream parameters the PLL was last programmed for.
    pub last_clock_key: Option<ClockKey>,
    pub clock_source: ClockSource,
    pub mclk_hz: u32,
    pub ext_clock_active: bool,
    pub interface_format: InterfaceFormat,
    pub mode: AmpMode,
    pub stereo_two_chip: bool,
    pub revision: u8,
    /// Speaker volume without compensation.
    pub init_volume: u8,
    /// Last value written to the speaker volume register, if known.
    pub volume: Option<u8>,
    /// Row the last compensation tick matched.
    pub threshold: TableRow,
    /// Row addressed by the per-row tuning accessors.
    pub selected_row: TableRow,
    pub battery_level: Option<u8>,
    pub tunables: Tunables,
    pub table: ThermalTable,
    pub history: SampleHistory,
}

impl DeviceState {
    pub fn new(config: &AmpConfig) -> Self {
        Self {
            power: PowerState::Off,
            force_power_down: false,
            last_clock_key: None,
            clock_source: config.clock_source,
            mclk_hz: config.mclk_hz,
            ext_clock_active: false,
            interface_format: config.interface_format,
            mode: config.mode,
            stereo_two_chip: config.stereo_two_chip,
            revision: 0,
            init_volume: config.init_volume,
            volume: None,
            threshold: TableRow::default(),
            selected_row: TableRow::default(),
            battery_level: None,
            tunables: Tunables::from(config),
            table: ThermalTable::new(config.table),
            history: SampleHistory::default(),
        }
    }

    /// Claim the speaker volume register for `target`.
    ///
    /// Returns the value to write, or `None` when the register already
    /// holds it.
    pub fn claim_volume(&mut self, target: u8) -> Option<u8> {
        if self.volume == Some(target) {
            return None;
        }
        self.volume = Some(target);
        Some(target)
    }

    /// Whether periodic compensation applies in the current configuration.
    pub fn compensation_applies(&self) -> bool {
        self.tunables.compensation_enabled
            && self.mode == AmpMode::Music
            && !self.tunables.compensation_period.is_zero()
    }
}
