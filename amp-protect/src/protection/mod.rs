//! Shared device state and the gain compensation paths.
//!
//! [`ProtectionController`] is a cheap handle; clones share one
//! [`DeviceState`] behind one lock. Lock discipline:
//!
//! - The state lock (`parking_lot`) is only held for bookkeeping and is
//!   released before any register access or sleep.
//! - Speaker volume updates additionally hold an async I/O lock from the
//!   decision through the register write, so the recorded volume always
//!   matches the last value written.
//! - The over-current counter and the interrupt-enable flag are atomics,
//!   so the interrupt path never touches either lock.

mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::compensation::{self, GainAction, battery_entry};
use crate::config::AmpConfig;
use crate::error::{Error, Result};
use crate::regmap::{Registers, registers};
use crate::sensor::Sensors;
use crate::tracing::prelude::*;

pub use state::{DeviceState, PowerState, Tunables};

/// Delay between power-up and the first compensation tick.
pub const FIRST_SAMPLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct ProtectionController {
    inner: Arc<Inner>,
}

struct Inner {
    regs: Registers,
    state: Mutex<DeviceState>,
    volume_io: tokio::sync::Mutex<()>,
    ocp_count: AtomicU32,
    irq_enabled: AtomicBool,
}

impl ProtectionController {
    pub fn new(regs: Registers, config: &AmpConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                regs,
                state: Mutex::new(DeviceState::new(config)),
                volume_io: tokio::sync::Mutex::new(()),
                ocp_count: AtomicU32::new(0),
                irq_enabled: AtomicBool::new(false),
            }),
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.inner.regs
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.inner.state.lock()
    }

    /// Over-current events (speaker and boost) since probe.
    pub fn ocp_count(&self) -> u32 {
        self.inner.ocp_count.load(Ordering::Relaxed)
    }

    /// Count one over-current event and return the new total.
    pub fn record_overcurrent(&self) -> u32 {
        self.inner.ocp_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn irq_enabled(&self) -> bool {
        self.inner.irq_enabled.load(Ordering::Acquire)
    }

    pub fn set_irq_enabled(&self, enabled: bool) {
        self.inner.irq_enabled.store(enabled, Ordering::Release);
    }

    /// Run one periodic compensation step.
    ///
    /// Takes a reading, queues it, evaluates the oldest queued sample and
    /// writes the resulting volume if it differs from the register.
    pub async fn compensate(&self, sensors: &Sensors) -> Result<()> {
        let option = self.lock().tunables.sensor_option;
        let (temperature, battery_mv) = sensors.sample(option).await?;

        let _io = self.inner.volume_io.lock().await;
        let write = {
            let mut guard = self.lock();
            let state = &mut *guard;

            match state.history.push(temperature, battery_mv) {
                Some(sample) => trace!(
                    id = sample.id,
                    temperature = sample.temperature,
                    battery_mv = ?sample.battery_mv,
                    "Queued sample"
                ),
                None => debug!(
                    sequence = state.history.sequence(),
                    dropped = state.history.dropped(),
                    "Sample history full, dropping reading"
                ),
            }

            let Some(sample) = state.history.pop() else {
                return Ok(());
            };

            let battery = sample.battery_mv.map(battery_entry);
            state.battery_level = battery.map(|b| b.level);
            let battery_gain = battery.map_or(0, |b| b.gain);

            let previous = state.threshold;
            let (row, action) =
                compensation::arbitrate(&mut state.table, previous, sample.temperature, battery_gain);
            state.threshold = row;

            if row != previous {
                let entry = state.table.entry(row);
                info!(
                    id = sample.id,
                    temperature = sample.temperature,
                    previous_row = previous.index(),
                    row = row.index(),
                    limit = entry.limit,
                    thermal_gain = entry.gain,
                    battery_gain,
                    "Thermal bracket changed"
                );
            }

            match action {
                GainAction::Hold => None,
                GainAction::Apply(gain) => {
                    let target = state.init_volume.saturating_add(gain);
                    state.claim_volume(target)
                }
            }
        };

        match write {
            Some(volume) => self.write_volume(volume).await,
            None => Ok(()),
        }
    }

    /// Apply aging compensation after a speaker over-current.
    ///
    /// Does nothing unless aging is enabled. Counts the event against the
    /// current bracket and, for elevated brackets, bumps that bracket's
    /// gain and writes the new volume.
    pub async fn age_on_overcurrent(&self) -> Result<()> {
        let _io = self.inner.volume_io.lock().await;
        let write = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.tunables.ocp_aging_enabled {
                return Ok(());
            }

            let row = state.threshold;
            let aged = compensation::age_on_overcurrent(&mut state.table, row);
            let entry = state.table.entry(row);
            warn!(
                limit = entry.limit,
                gain = entry.gain,
                ocp_count = entry.ocp_count,
                hit_count = entry.hit_count,
                active = entry.active,
                "Speaker over-current in thermal bracket"
            );

            aged.and_then(|gain| {
                let target = state.init_volume.saturating_add(gain);
                state.claim_volume(target)
            })
        };

        match write {
            Some(volume) => self.write_volume(volume).await,
            None => Ok(()),
        }
    }

    /// Drop any compensation: back to the normal bracket and the initial
    /// volume.
    pub async fn restore_initial_volume(&self) -> Result<()> {
        let _io = self.inner.volume_io.lock().await;
        let write = {
            let mut state = self.lock();
            state.threshold = Default::default();
            let target = state.init_volume;
            if state.volume.is_some_and(|v| v > target) {
                info!(volume = ?state.volume, init_volume = target, "Restoring uncompensated volume");
            }
            state.claim_volume(target)
        };

        match write {
            Some(volume) => self.write_volume(volume).await,
            None => Ok(()),
        }
    }

    /// Change the uncompensated volume, as a user volume control does.
    pub async fn set_initial_volume(&self, volume: u8) -> Result<()> {
        let _io = self.inner.volume_io.lock().await;
        let write = {
            let mut state = self.lock();
            state.init_volume = volume;
            state.claim_volume(volume)
        };

        match write {
            Some(volume) => self.write_volume(volume).await,
            None => Ok(()),
        }
    }

    /// Record a register value written outside the claim path, such as the
    /// reset defaults.
    pub(crate) fn note_volume_written(&self, volume: u8) {
        self.lock().volume = Some(volume);
    }

    async fn write_volume(&self, volume: u8) -> Result<()> {
        debug!(volume = format_args!("0x{volume:02X}"), "Writing speaker volume");
        let result = self.registers().write(registers::SPK_VOL, volume).await;
        if result.is_err() {
            self.lock().volume = None;
        }
        result
    }

    /// Periodic compensation loop.
    ///
    /// The first tick runs after [`FIRST_SAMPLE_DELAY`]. The loop re-arms
    /// with the current period after every tick and ends when cancelled or
    /// when compensation is disabled. A tick in progress always completes.
    pub async fn run_sampler(self, sensors: Sensors, cancellation: CancellationToken) {
        let mut delay = FIRST_SAMPLE_DELAY;

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.compensate(&sensors).await {
                Ok(()) => {}
                Err(Error::SensorUnavailable(reason)) => {
                    debug!(reason = %reason, "Skipping compensation tick, sensor unavailable");
                }
                Err(e) => warn!(error = %e, "Compensation tick failed"),
            }

            let (enabled, period) = {
                let state = self.lock();
                (
                    state.tunables.compensation_enabled,
                    state.tunables.compensation_rearm(),
                )
            };
            if !enabled {
                debug!("Compensation disabled, sampler stopping");
                break;
            }
            delay = period;
        }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::sync::Arc;

    use crate::config::AmpConfig;
    use crate::regmap::{Registers, SimRegisters};
    use crate::sensor::{SimBattery, SimTemperature, Sensors};

    use super::ProtectionController;

    pub(crate) struct Fixture {
        pub sim: Arc<SimRegisters>,
        pub controller: ProtectionController,
        pub temperature: Arc<SimTemperature>,
        pub battery: Arc<SimBattery>,
        pub sensors: Sensors,
    }

    pub(crate) fn fixture(config: AmpConfig) -> Fixture {
        let sim = Arc::new(SimRegisters::new());
        let controller = ProtectionController::new(Registers::new(sim.clone()), &config);
        let temperature = Arc::new(SimTemperature::new(250));
        let battery = Arc::new(SimBattery::new(4200));
        let sensors = Sensors::new(temperature.clone()).with_battery(battery.clone());
        Fixture {
            sim,
            controller,
            temperature,
            battery,
            sensors,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::fixture::fixture;
    use super::*;
    use crate::config::DEFAULT_INIT_VOLUME;

    const SPK_VOL: u8 = registers::SPK_VOL;

    #[tokio::test]
    async fn should_write_at_most_once_for_unchanged_bracket() {
        let f = fixture(AmpConfig::default());
        f.temperature.set(Some(620));
        f.battery.set(3400);

        f.controller.compensate(&f.sensors).await.unwrap();
        f.controller.compensate(&f.sensors).await.unwrap();

        assert_eq!(f.sim.writes_to(SPK_VOL), vec![DEFAULT_INIT_VOLUME + 6]);
    }

    #[tokio::test]
    async fn should_not_rewrite_battery_gain_in_normal_bracket() {
        let f = fixture(AmpConfig::default());
        f.temperature.set(Some(250));
        f.battery.set(3200);

        f.controller.compensate(&f.sensors).await.unwrap();
        f.controller.compensate(&f.sensors).await.unwrap();

        assert_eq!(f.sim.writes_to(SPK_VOL), vec![DEFAULT_INIT_VOLUME + 6]);
        assert_eq!(f.controller.lock().battery_level, Some(0));
    }

    #[tokio::test]
    async fn should_raise_to_battery_gain_when_bracket_unchanged() {
        let f = fixture(AmpConfig::default());
        // 41.0 °C: row 2, thermal gain 2
        f.temperature.set(Some(410));

        f.controller.compensate(&f.sensors).await.unwrap();
        f.battery.set(3200);
        f.controller.compensate(&f.sensors).await.unwrap();

        assert_eq!(
            f.sim.writes_to(SPK_VOL),
            vec![DEFAULT_INIT_VOLUME + 2, DEFAULT_INIT_VOLUME + 6]
        );
        assert_eq!(f.controller.lock().threshold.index(), 2);
    }

    #[tokio::test]
    async fn should_restore_initial_volume_on_return_to_normal() {
        let f = fixture(AmpConfig::default());
        f.temperature.push(Some(720));
        f.temperature.push(Some(300));

        f.controller.compensate(&f.sensors).await.unwrap();
        f.controller.compensate(&f.sensors).await.unwrap();

        assert_eq!(
            f.sim.writes_to(SPK_VOL),
            vec![DEFAULT_INIT_VOLUME + 8, DEFAULT_INIT_VOLUME]
        );
    }

    #[tokio::test]
    async fn should_age_current_bracket_on_overcurrent() {
        let config = AmpConfig {
            ocp_aging_enabled: true,
            ..Default::default()
        };
        let f = fixture(config);
        // 46.0 °C: row 3, thermal gain 3
        f.temperature.set(Some(460));
        f.controller.compensate(&f.sensors).await.unwrap();
        assert_eq!(f.controller.lock().threshold.index(), 3);

        f.controller.age_on_overcurrent().await.unwrap();

        let state = f.controller.lock();
        let row = state.table.row(3).unwrap();
        assert_eq!(state.table.entry(row).gain, 4);
        assert_eq!(state.table.entry(row).ocp_count, 1);
        assert_eq!(f.sim.get(SPK_VOL), DEFAULT_INIT_VOLUME + 4);
    }

    #[tokio::test]
    async fn should_ignore_overcurrent_aging_when_disabled() {
        let f = fixture(AmpConfig::default());
        f.temperature.set(Some(460));
        f.controller.compensate(&f.sensors).await.unwrap();
        f.sim.clear_writes();

        f.controller.age_on_overcurrent().await.unwrap();

        let state = f.controller.lock();
        let row = state.table.row(3).unwrap();
        assert_eq!(state.table.entry(row).gain, 3);
        assert_eq!(state.table.entry(row).ocp_count, 0);
        assert!(f.sim.writes().is_empty());
    }

    #[tokio::test]
    async fn should_skip_tick_when_sensor_unavailable() {
        let f = fixture(AmpConfig::default());
        f.temperature.set(None);

        let err = f.controller.compensate(&f.sensors).await.unwrap_err();

        assert!(matches!(err, Error::SensorUnavailable(_)));
        assert!(f.controller.lock().history.is_empty());
        assert!(f.sim.writes().is_empty());
    }

    #[tokio::test]
    async fn should_forget_volume_after_failed_write() {
        let f = fixture(AmpConfig::default());
        f.temperature.set(Some(620));
        f.sim.fail_writes(SPK_VOL);

        assert!(f.controller.compensate(&f.sensors).await.is_err());
        assert_eq!(f.controller.lock().volume, None);

        f.sim.heal();
        f.controller.set_initial_volume(DEFAULT_INIT_VOLUME).await.unwrap();
        assert_eq!(f.sim.writes_to(SPK_VOL), vec![DEFAULT_INIT_VOLUME]);
    }

    #[tokio::test]
    async fn should_reset_threshold_when_restoring() {
        let f = fixture(AmpConfig::default());
        f.temperature.set(Some(880));
        f.controller.compensate(&f.sensors).await.unwrap();

        f.controller.restore_initial_volume().await.unwrap();

        assert_eq!(f.controller.lock().threshold.index(), 0);
        assert_eq!(f.sim.get(SPK_VOL), DEFAULT_INIT_VOLUME);
    }

    #[tokio::test]
    async fn should_count_overcurrent_events() {
        let f = fixture(AmpConfig::default());

        assert_eq!(f.controller.record_overcurrent(), 1);
        assert_eq!(f.controller.record_overcurrent(), 2);
        assert_eq!(f.controller.ocp_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn should_sample_after_first_delay_then_every_period() {
        let config = AmpConfig {
            compensation_enabled: true,
            ..Default::default()
        };
        let f = fixture(config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            f.controller
                .clone()
                .run_sampler(f.sensors.clone(), cancel.clone()),
        );

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.controller.lock().history.sequence(), 1);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.controller.lock().history.sequence(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_sampling_while_sensor_unavailable() {
        let config = AmpConfig {
            compensation_enabled: true,
            compensation_period: Duration::from_secs(1),
            ..Default::default()
        };
        let f = fixture(config);
        f.temperature.set(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            f.controller
                .clone()
                .run_sampler(f.sensors.clone(), cancel.clone()),
        );

        time::sleep(Duration::from_millis(2500)).await;
        f.temperature.set(Some(620));
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(f.controller.lock().threshold.index(), 6);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_sampling_when_disabled() {
        let config = AmpConfig {
            compensation_enabled: true,
            ..Default::default()
        };
        let f = fixture(config);
        let task = tokio::spawn(
            f.controller
                .clone()
                .run_sampler(f.sensors.clone(), CancellationToken::new()),
        );

        f.controller.lock().tunables.compensation_enabled = false;
        time::sleep(Duration::from_millis(150)).await;

        task.await.unwrap();
        assert_eq!(f.controller.lock().history.sequence(), 1);
    }
}
