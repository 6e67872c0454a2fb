//! Temperature and battery inputs to the compensator.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use strum::{Display, EnumString};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Battery voltage assumed when the gauge cannot be read.
pub const FALLBACK_BATTERY_MV: u32 = 4450;

#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    /// Current temperature in tenths of a degree Celsius.
    async fn read_temperature(&self) -> Result<i32>;
}

#[async_trait]
pub trait BatterySensor: Send + Sync {
    async fn read_battery_voltage(&self) -> Result<u32>;
}

/// Which thermistor feeds the compensator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum SensorOption {
    /// Nothing chosen yet; reads the skin thermistor.
    #[default]
    Default,
    Skin,
    Piezo,
}

impl SensorOption {
    /// Decode the numeric selector used by the tuning interface
    /// (1 = skin, 2 = piezo).
    pub fn from_raw(raw: i64) -> Result<Self> {
        match raw {
            1 => Ok(SensorOption::Skin),
            2 => Ok(SensorOption::Piezo),
            other => Err(Error::InvalidSensorOption(other)),
        }
    }
}

/// The sensor collaborators available on a board.
#[derive(Clone)]
pub struct Sensors {
    skin: Arc<dyn TemperatureSensor>,
    piezo: Option<Arc<dyn TemperatureSensor>>,
    battery: Option<Arc<dyn BatterySensor>>,
}

impl Sensors {
    pub fn new(skin: Arc<dyn TemperatureSensor>) -> Self {
        Self {
            skin,
            piezo: None,
            battery: None,
        }
    }

    pub fn with_piezo(mut self, piezo: Arc<dyn TemperatureSensor>) -> Self {
        self.piezo = Some(piezo);
        self
    }

    pub fn with_battery(mut self, battery: Arc<dyn BatterySensor>) -> Self {
        self.battery = Some(battery);
        self
    }

    fn thermistor(&self, option: SensorOption) -> &Arc<dyn TemperatureSensor> {
        match (option, &self.piezo) {
            (SensorOption::Piezo, Some(piezo)) => piezo,
            (SensorOption::Piezo, None) => {
                debug!("No piezo thermistor fitted, reading skin thermistor");
                &self.skin
            }
            _ => &self.skin,
        }
    }

    /// Take one reading of temperature and, if fitted, battery voltage.
    ///
    /// A failed temperature read is an error; a failed battery read falls
    /// back to [`FALLBACK_BATTERY_MV`].
    pub async fn sample(&self, option: SensorOption) -> Result<(i32, Option<u32>)> {
        let temperature = self.thermistor(option).read_temperature().await?;

        let battery_mv = match &self.battery {
            Some(battery) => match battery.read_battery_voltage().await {
                Ok(mv) => Some(mv),
                Err(e) => {
                    warn!(error = %e, fallback_mv = FALLBACK_BATTERY_MV, "Battery voltage read failed");
                    Some(FALLBACK_BATTERY_MV)
                }
            },
            None => None,
        };

        Ok((temperature, battery_mv))
    }
}

/// Scripted thermistor. Replays queued readings, then repeats the last
/// one. A `None` reading simulates an unavailable sensor.
pub struct SimTemperature {
    readings: Mutex<VecDeque<Option<i32>>>,
    last: Mutex<Option<i32>>,
}

impl SimTemperature {
    pub fn new(initial: i32) -> Self {
        Self {
            readings: Mutex::new(VecDeque::new()),
            last: Mutex::new(Some(initial)),
        }
    }

    pub fn push(&self, reading: Option<i32>) {
        self.readings.lock().push_back(reading);
    }

    pub fn set(&self, reading: Option<i32>) {
        self.readings.lock().clear();
        *self.last.lock() = reading;
    }
}

#[async_trait]
impl TemperatureSensor for SimTemperature {
    async fn read_temperature(&self) -> Result<i32> {
        let reading = match self.readings.lock().pop_front() {
            Some(next) => {
                *self.last.lock() = next;
                next
            }
            None => *self.last.lock(),
        };
        reading.ok_or_else(|| Error::SensorUnavailable("thermal zone not ready".into()))
    }
}

/// Battery gauge reporting a settable voltage. Zero simulates a gauge
/// that fails to respond.
pub struct SimBattery {
    millivolts: AtomicU32,
}

impl SimBattery {
    pub fn new(millivolts: u32) -> Self {
        Self {
            millivolts: AtomicU32::new(millivolts),
        }
    }

    pub fn set(&self, millivolts: u32) {
        self.millivolts.store(millivolts, Ordering::Relaxed);
    }
}

#[async_trait]
impl BatterySensor for SimBattery {
    async fn read_battery_voltage(&self) -> Result<u32> {
        match self.millivolts.load(Ordering::Relaxed) {
            0 => Err(Error::SensorUnavailable("battery gauge not responding".into())),
            mv => Ok(mv),
        }
    }
}
