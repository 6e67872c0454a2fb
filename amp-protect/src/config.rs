use std::time::Duration;

use serde::Serialize;
use strum::{Display, EnumString};

use crate::clock::ClockSource;
use crate::compensation::TableVariant;
use crate::sensor::SensorOption;

pub const DEFAULT_COMPENSATION_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_FAULT_POLL_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_DELAYED_SHUTDOWN: Duration = Duration::from_secs(3);

/// Speaker volume register value for 0 dB.
pub const DEFAULT_INIT_VOLUME: u8 = 0x30;

/// Amplifier operating profile. Tone setup and compensation depend on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum AmpMode {
    Voice,
    #[default]
    Music,
    Off,
}

/// Serial audio framing on the input port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "kebab-case")]
pub enum InterfaceFormat {
    #[default]
    I2s,
    LeftJustified,
    RightJustified,
}

/// Board-level configuration, supplied once at probe time.
#[derive(Debug, Clone)]
pub struct AmpConfig {
    /// Uncompensated speaker volume register value. Each step above 0x30
    /// attenuates by 0.5 dB.
    pub init_volume: u8,

    /// Two amplifiers in a stereo pair rather than one mono amplifier.
    pub stereo_two_chip: bool,

    pub clock_source: ClockSource,

    /// MCLK frequency (Hz), used when the PLL runs from MCLK.
    pub mclk_hz: u32,

    pub interface_format: InterfaceFormat,

    pub mode: AmpMode,

    pub table: TableVariant,

    /// Periodic temperature/battery compensation (music mode only).
    pub compensation_enabled: bool,
    pub compensation_period: Duration,

    /// Periodic status-register watchdog.
    pub fault_poll_enabled: bool,
    pub fault_poll_period: Duration,

    /// Defer power-off after a stream stops, so short gaps between streams
    /// do not cycle the amplifier.
    pub delayed_shutdown_enabled: bool,
    pub delayed_shutdown: Duration,

    /// Add one unit of attenuation to the current bracket on every speaker
    /// over-current.
    pub ocp_aging_enabled: bool,

    pub sensor_option: SensorOption,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            init_volume: DEFAULT_INIT_VOLUME,
            stereo_two_chip: false,
            clock_source: ClockSource::PllFromBclk,
            mclk_hz: 19_200_000,
            interface_format: InterfaceFormat::I2s,
            mode: AmpMode::Music,
            table: TableVariant::Default,
            compensation_enabled: false,
            compensation_period: DEFAULT_COMPENSATION_PERIOD,
            fault_poll_enabled: false,
            fault_poll_period: DEFAULT_FAULT_POLL_PERIOD,
            delayed_shutdown_enabled: false,
            delayed_shutdown: DEFAULT_DELAYED_SHUTDOWN,
            ocp_aging_enabled: false,
            sensor_option: SensorOption::Default,
        }
    }
}
