//! Amplifier power sequencing.
//!
//! ```text
//!  Off ──start()──▶ Starting ──▶ On ──stop()──▶ ShuttingDown ──delay──▶ Off
//!   ▲                                 │              │
//!   └──────── stop_immediately() ─────┘      start() cancels, back to On
//! ```
//!
//! Transitions are serialised by one async lock, so the stream lifecycle,
//! bias-level changes and clock negotiation may all call in concurrently.
//! The deferred power-off runs on its own task and never takes that lock:
//! `start()` holds it while cancelling and joining the task.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::AmpMode;
use crate::error::Result;
use crate::fault::FaultPoller;
use crate::protection::{PowerState, ProtectionController};
use crate::regmap::registers::{
    self, input1_ctrl3, mute_vol_ctrl, pll_ctrl, system_ctrl, system_ctrl1, tone_fine_vol,
    tone_generator, top_man4,
};
use crate::sensor::Sensors;
use crate::tracing::prelude::*;

/// Settle time after power-on before the speaker path is configured.
pub const POWER_ON_SETTLE: Duration = Duration::from_millis(21);

/// Mute slope time.
pub const MUTE_SETTLE: Duration = Duration::from_millis(15);

/// Keeps the system awake while a deferred power-off is pending.
///
/// Clones share one holder count.
#[derive(Debug, Clone, Default)]
pub struct WakeSource {
    holders: Arc<AtomicUsize>,
}

impl WakeSource {
    pub fn acquire(&self) -> WakeGuard {
        self.holders.fetch_add(1, Ordering::AcqRel);
        WakeGuard {
            holders: self.holders.clone(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.holders.load(Ordering::Acquire) > 0
    }
}

/// Releases its hold on the [`WakeSource`] when dropped.
#[derive(Debug)]
pub struct WakeGuard {
    holders: Arc<AtomicUsize>,
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A spawned task with its own cancellation token.
struct Worker<T> {
    cancellation: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Worker<T> {
    fn spawn<F>(task: impl FnOnce(CancellationToken) -> F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let cancellation = CancellationToken::new();
        let handle = tokio::spawn(task(cancellation.clone()));
        Self {
            cancellation,
            handle,
        }
    }

    /// Cancel the task and wait for it. `None` if it panicked.
    async fn cancel_and_join(self) -> Option<T> {
        self.cancellation.cancel();
        match self.handle.await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(error = %e, "Worker task failed");
                None
            }
        }
    }
}

#[derive(Default)]
struct Workers {
    sampler: Option<Worker<()>>,
    poller: Option<Worker<()>>,
    /// Resolves to whether the power-off actually ran.
    power_off: Option<Worker<bool>>,
}

#[derive(Clone)]
pub struct PowerSequencer {
    inner: Arc<Inner>,
}

struct Inner {
    controller: ProtectionController,
    sensors: Sensors,
    transition: tokio::sync::Mutex<Workers>,
    wake: WakeSource,
    cancelled_shutdowns: AtomicU32,
}

impl PowerSequencer {
    pub fn new(controller: ProtectionController, sensors: Sensors) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller,
                sensors,
                transition: tokio::sync::Mutex::new(Workers::default()),
                wake: WakeSource::default(),
                cancelled_shutdowns: AtomicU32::new(0),
            }),
        }
    }

    pub fn power_state(&self) -> PowerState {
        self.inner.controller.lock().power
    }

    pub fn wake_source(&self) -> &WakeSource {
        &self.inner.wake
    }

    /// Deferred power-offs cancelled before they ran.
    pub fn cancelled_shutdowns(&self) -> u32 {
        self.inner.cancelled_shutdowns.load(Ordering::Relaxed)
    }

    /// Power the amplifier up and unmute it.
    ///
    /// Does nothing when already on. A pending deferred power-off is
    /// cancelled first.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.inner.transition.lock().await;

        if let Some(pending) = workers.power_off.take() {
            match pending.cancel_and_join().await {
                Some(false) => {
                    self.inner.cancelled_shutdowns.fetch_add(1, Ordering::Relaxed);
                    info!("Cancelled pending power-off");
                }
                Some(true) => debug!("Deferred power-off already ran"),
                None => {}
            }
        }

        let (source, mode, stereo) = {
            let mut state = self.inner.controller.lock();
            if state.power == PowerState::On {
                debug!("Amplifier already on");
                return Ok(());
            }
            state.power = PowerState::Starting;
            if state.clock_source.is_external() && !state.ext_clock_active {
                info!(source = %state.clock_source, "Applying external clock");
                state.ext_clock_active = true;
            }
            (state.clock_source, state.mode, state.stereo_two_chip)
        };

        info!(source = %source, mode = %mode, stereo, "Starting amplifier");

        match self.power_up(mode, stereo).await {
            Ok(()) => {}
            Err(e) => {
                error!(error = %e, "Amplifier start failed");
                self.inner.controller.lock().power = PowerState::Off;
                return Err(e);
            }
        }

        let (sample, poll) = {
            let state = self.inner.controller.lock();
            (state.compensation_applies(), state.tunables.fault_poll_enabled)
        };
        if sample {
            let controller = self.inner.controller.clone();
            let sensors = self.inner.sensors.clone();
            workers.sampler = Some(Worker::spawn(|token| controller.run_sampler(sensors, token)));
        }
        if poll {
            let poller = FaultPoller::new(self.inner.controller.clone());
            workers.poller = Some(Worker::spawn(|token| poller.run(token)));
        }

        self.inner.controller.lock().power = PowerState::On;

        let regs = self.inner.controller.registers();
        regs.update_bits(registers::MUTE_VOL_CTRL, mute_vol_ctrl::SPK_MUTE, 0)
            .await?;

        info!(sampler = sample, poller = poll, "Amplifier on");
        Ok(())
    }

    async fn power_up(&self, mode: AmpMode, stereo: bool) -> Result<()> {
        let controller = &self.inner.controller;
        let regs = controller.registers();

        regs.update_bits(
            registers::PLL_CTRL,
            pll_ctrl::LDO_BYP_MASK,
            pll_ctrl::LDO_BYP_ENABLE,
        )
        .await?;
        regs.update_bits(registers::SYSTEM_CTRL, system_ctrl::POWER, system_ctrl::POWER)
            .await?;
        regs.update_bits(registers::TOP_MAN4, top_man4::DIS_IRQ, 0)
            .await?;
        controller.set_irq_enabled(true);

        // Boost over-current trips if the speaker path comes up too early.
        time::sleep(POWER_ON_SETTLE).await;

        if mode == AmpMode::Voice {
            regs.update_bits(
                registers::TONE_GENERATOR,
                tone_generator::TONE_FREQ_MASK,
                tone_generator::TONE_FREQ_50,
            )
            .await?;
            regs.update_bits(
                registers::INPUT1_CTRL3,
                input1_ctrl3::ADD_TONE_VOL_DECREASE,
                input1_ctrl3::ADD_TONE_VOL_DECREASE,
            )
            .await?;
            regs.update_bits(
                registers::TONE_FINE_VOL,
                tone_fine_vol::TONE_VOL_MASK,
                tone_fine_vol::TONE_VOL_M_36,
            )
            .await?;
        }

        let speaker_mode = if stereo {
            system_ctrl1::SPK_STEREO
        } else {
            system_ctrl1::SPK_MONO
        };
        regs.update_bits(
            registers::SYSTEM_CTRL1,
            system_ctrl1::SPK_MODE_MASK,
            speaker_mode,
        )
        .await?;
        regs.update_bits(
            registers::TONE_GENERATOR,
            tone_generator::TONE_ON,
            tone_generator::TONE_ON,
        )
        .await?;

        Ok(())
    }

    /// Mute the amplifier and power it down, after the delayed-shutdown
    /// interval when one is configured.
    pub async fn stop(&self) -> Result<()> {
        self.shut_down(false).await
    }

    /// Mute and power down now, whatever the delayed-shutdown setting.
    pub async fn stop_immediately(&self) -> Result<()> {
        self.shut_down(true).await
    }

    async fn shut_down(&self, immediate: bool) -> Result<()> {
        let mut workers = self.inner.transition.lock().await;

        match self.power_state() {
            PowerState::Off => {
                debug!("Amplifier already off");
                return Ok(());
            }
            PowerState::ShuttingDown if !immediate => {
                debug!("Amplifier power-off already pending");
                return Ok(());
            }
            PowerState::ShuttingDown => {
                // Bring the pending power-off forward.
                let ran = match workers.power_off.take() {
                    Some(pending) => pending.cancel_and_join().await,
                    None => None,
                };
                if ran != Some(true) {
                    self.power_off().await?;
                }
                self.mark_off();
                return Ok(());
            }
            PowerState::Starting | PowerState::On => {}
        }

        info!(immediate, "Stopping amplifier");

        let controller = &self.inner.controller;
        let regs = controller.registers();
        regs.update_bits(registers::TOP_MAN4, top_man4::DIS_IRQ, top_man4::DIS_IRQ)
            .await?;
        regs.update_bits(
            registers::MUTE_VOL_CTRL,
            mute_vol_ctrl::SPK_MUTE,
            mute_vol_ctrl::SPK_MUTE,
        )
        .await?;

        let running: Vec<_> = [workers.sampler.take(), workers.poller.take()]
            .into_iter()
            .flatten()
            .map(Worker::cancel_and_join)
            .collect();
        futures::future::join_all(running).await;

        time::sleep(MUTE_SETTLE).await;

        let delay = {
            let state = controller.lock();
            let tunables = &state.tunables;
            (tunables.delayed_shutdown_enabled && !tunables.delayed_shutdown.is_zero() && !immediate)
                .then_some(tunables.delayed_shutdown)
        };

        match delay {
            Some(delay) => {
                let guard = self.inner.wake.acquire();
                let sequencer = self.clone();
                workers.power_off = Some(Worker::spawn(move |token| {
                    sequencer.deferred_power_off(delay, guard, token)
                }));
                controller.lock().power = PowerState::ShuttingDown;
                info!(delay = ?delay, "Power-off deferred");
            }
            None => {
                self.power_off().await?;
                self.mark_off();
            }
        }

        Ok(())
    }

    async fn deferred_power_off(
        self,
        delay: Duration,
        guard: WakeGuard,
        cancellation: CancellationToken,
    ) -> bool {
        tokio::select! {
            _ = cancellation.cancelled() => {
                return false;
            }
            _ = time::sleep(delay) => {}
        }

        info!(delay = ?delay, "Delayed shutdown elapsed");
        if let Err(e) = self.power_off().await {
            error!(error = %e, "Deferred power-off failed");
        }

        let mut state = self.inner.controller.lock();
        if state.power == PowerState::ShuttingDown {
            state.power = PowerState::Off;
            info!("Amplifier off");
        }
        drop(state);
        drop(guard);
        true
    }

    fn mark_off(&self) {
        self.inner.controller.lock().power = PowerState::Off;
        info!("Amplifier off");
    }

    /// Power the hardware down. Safe to repeat on an already-off device.
    async fn power_off(&self) -> Result<()> {
        let controller = &self.inner.controller;
        let regs = controller.registers();

        regs.update_bits(
            registers::SYSTEM_CTRL1,
            system_ctrl1::SPK_MODE_MASK,
            system_ctrl1::SPK_OFF,
        )
        .await?;
        regs.update_bits(registers::SYSTEM_CTRL, system_ctrl::POWER, 0)
            .await?;
        regs.update_bits(
            registers::TONE_FINE_VOL,
            tone_fine_vol::TONE_VOL_MASK,
            tone_fine_vol::TONE_VOL_OFF,
        )
        .await?;
        regs.update_bits(registers::TONE_GENERATOR, tone_generator::TONE_ON, 0)
            .await?;

        if controller.irq_enabled() {
            controller.set_irq_enabled(false);
            debug!("Fault interrupt disabled");
        }

        let (source, restore) = {
            let mut state = controller.lock();
            if state.clock_source.is_external() && state.ext_clock_active {
                info!(source = %state.clock_source, "Removing external clock");
                state.ext_clock_active = false;
            }
            (state.clock_source, state.compensation_applies())
        };

        if source.uses_pll() {
            regs.update_bits(
                registers::PLL_CTRL,
                pll_ctrl::LDO_BYP_MASK,
                pll_ctrl::LDO_BYP_DISABLE,
            )
            .await?;
        }

        if restore {
            controller.restore_initial_volume().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AmpConfig, DEFAULT_INIT_VOLUME};
    use crate::protection::fixture::{Fixture, fixture};
    use crate::regmap::registers::{SPK_VOL, STATUS1};

    fn sequencer(config: AmpConfig) -> (Fixture, PowerSequencer) {
        let f = fixture(config);
        let sequencer = PowerSequencer::new(f.controller.clone(), f.sensors.clone());
        (f, sequencer)
    }

    fn delayed() -> AmpConfig {
        AmpConfig {
            delayed_shutdown_enabled: true,
            delayed_shutdown: Duration::from_secs(3),
            ..Default::default()
        }
    }

    fn muted(f: &Fixture) -> bool {
        f.sim.get(registers::MUTE_VOL_CTRL) & mute_vol_ctrl::SPK_MUTE != 0
    }

    fn powered(f: &Fixture) -> bool {
        f.sim.get(registers::SYSTEM_CTRL) & system_ctrl::POWER != 0
    }

    #[tokio::test(start_paused = true)]
    async fn should_power_up_and_unmute() {
        let (f, seq) = sequencer(AmpConfig::default());
        f.sim.set(registers::MUTE_VOL_CTRL, mute_vol_ctrl::DEFAULT);

        seq.start().await.unwrap();

        assert_eq!(seq.power_state(), PowerState::On);
        assert!(powered(&f));
        assert!(!muted(&f));
        assert!(f.controller.irq_enabled());
        assert_eq!(
            f.sim.get(registers::SYSTEM_CTRL1) & system_ctrl1::SPK_MODE_MASK,
            system_ctrl1::SPK_MONO
        );
        assert_eq!(
            f.sim.get(registers::TONE_GENERATOR) & tone_generator::TONE_ON,
            tone_generator::TONE_ON
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_unmute_last() {
        let (f, seq) = sequencer(AmpConfig::default());
        f.sim.set(registers::MUTE_VOL_CTRL, mute_vol_ctrl::DEFAULT);

        seq.start().await.unwrap();

        let writes = f.sim.writes();
        assert_eq!(writes.last().map(|(a, _)| *a), Some(registers::MUTE_VOL_CTRL));
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_start_when_on() {
        let (f, seq) = sequencer(AmpConfig::default());
        seq.start().await.unwrap();
        f.sim.clear_writes();

        seq.start().await.unwrap();

        assert!(f.sim.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_program_voice_tone_and_stereo_mode() {
        let config = AmpConfig {
            mode: AmpMode::Voice,
            stereo_two_chip: true,
            ..Default::default()
        };
        let (f, seq) = sequencer(config);

        seq.start().await.unwrap();

        assert_eq!(
            f.sim.get(registers::TONE_FINE_VOL) & tone_fine_vol::TONE_VOL_MASK,
            tone_fine_vol::TONE_VOL_M_36
        );
        assert_ne!(
            f.sim.get(registers::INPUT1_CTRL3) & input1_ctrl3::ADD_TONE_VOL_DECREASE,
            0
        );
        assert_eq!(
            f.sim.get(registers::SYSTEM_CTRL1) & system_ctrl1::SPK_MODE_MASK,
            system_ctrl1::SPK_STEREO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_power_off_at_once_without_delay() {
        let (f, seq) = sequencer(AmpConfig::default());
        seq.start().await.unwrap();

        seq.stop().await.unwrap();

        assert_eq!(seq.power_state(), PowerState::Off);
        assert!(muted(&f));
        assert!(!powered(&f));
        assert!(!f.controller.irq_enabled());
        assert_eq!(
            f.sim.get(registers::PLL_CTRL) & pll_ctrl::LDO_BYP_MASK,
            pll_ctrl::LDO_BYP_DISABLE
        );
        assert_eq!(
            f.sim.get(registers::TOP_MAN4) & top_man4::DIS_IRQ,
            top_man4::DIS_IRQ
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_hold_power_through_mute_settle() {
        let (f, seq) = sequencer(AmpConfig::default());
        seq.start().await.unwrap();
        let began = time::Instant::now();

        let stopping = tokio::spawn({
            let seq = seq.clone();
            async move { seq.stop().await }
        });
        time::sleep(MUTE_SETTLE - Duration::from_millis(1)).await;

        assert!(muted(&f));
        assert!(powered(&f));

        stopping.await.unwrap().unwrap();

        assert!(!powered(&f));
        assert!(began.elapsed() >= MUTE_SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_stop_when_off() {
        let (f, seq) = sequencer(AmpConfig::default());

        seq.stop().await.unwrap();

        assert!(f.sim.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_defer_power_off_holding_wake_source() {
        let (f, seq) = sequencer(delayed());
        seq.start().await.unwrap();

        seq.stop().await.unwrap();

        assert_eq!(seq.power_state(), PowerState::ShuttingDown);
        assert!(muted(&f));
        assert!(powered(&f));
        assert!(seq.wake_source().is_held());

        time::sleep(Duration::from_millis(3100)).await;

        assert_eq!(seq.power_state(), PowerState::Off);
        assert!(!powered(&f));
        assert!(!seq.wake_source().is_held());
        assert_eq!(seq.cancelled_shutdowns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_cancel_deferred_power_off_exactly_once_on_restart() {
        let (f, seq) = sequencer(delayed());
        seq.start().await.unwrap();
        seq.stop().await.unwrap();

        seq.start().await.unwrap();
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(seq.power_state(), PowerState::On);
        assert_eq!(seq.cancelled_shutdowns(), 1);
        assert!(powered(&f));
        assert!(!muted(&f));
        assert!(!seq.wake_source().is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_count_power_off_that_already_ran() {
        let (_f, seq) = sequencer(delayed());
        seq.start().await.unwrap();
        seq.stop().await.unwrap();
        time::sleep(Duration::from_secs(4)).await;

        seq.start().await.unwrap();

        assert_eq!(seq.power_state(), PowerState::On);
        assert_eq!(seq.cancelled_shutdowns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_bring_pending_power_off_forward_when_immediate() {
        let (f, seq) = sequencer(delayed());
        seq.start().await.unwrap();
        seq.stop().await.unwrap();

        seq.stop_immediately().await.unwrap();

        assert_eq!(seq.power_state(), PowerState::Off);
        assert!(!powered(&f));
        assert!(!seq.wake_source().is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn should_power_off_immediately_despite_delay_setting() {
        let (f, seq) = sequencer(delayed());
        seq.start().await.unwrap();

        seq.stop_immediately().await.unwrap();

        assert_eq!(seq.power_state(), PowerState::Off);
        assert!(!powered(&f));
        assert!(f.controller.lock().tunables.delayed_shutdown_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn should_restore_initial_volume_on_power_off_in_music_mode() {
        let config = AmpConfig {
            compensation_enabled: true,
            ..Default::default()
        };
        let (f, seq) = sequencer(config);
        f.temperature.set(Some(720));
        seq.start().await.unwrap();
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.sim.get(SPK_VOL), DEFAULT_INIT_VOLUME + 8);

        seq.stop().await.unwrap();

        assert_eq!(f.sim.get(SPK_VOL), DEFAULT_INIT_VOLUME);
        assert_eq!(f.controller.lock().threshold.index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_background_workers() {
        let config = AmpConfig {
            compensation_enabled: true,
            fault_poll_enabled: true,
            ..Default::default()
        };
        let (f, seq) = sequencer(config);
        seq.start().await.unwrap();
        time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(f.controller.lock().history.sequence(), 1);
        assert_eq!(f.sim.read_count(STATUS1), 1);

        seq.stop().await.unwrap();
        time::sleep(Duration::from_secs(60)).await;

        assert_eq!(f.controller.lock().history.sequence(), 1);
        assert_eq!(f.sim.read_count(STATUS1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_sample_in_voice_mode() {
        let config = AmpConfig {
            compensation_enabled: true,
            mode: AmpMode::Voice,
            ..Default::default()
        };
        let (f, seq) = sequencer(config);

        seq.start().await.unwrap();
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(f.controller.lock().history.sequence(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_fall_back_to_off_when_start_fails() {
        let (f, seq) = sequencer(AmpConfig::default());
        f.sim.fail_writes(registers::SYSTEM_CTRL);

        assert!(seq.start().await.is_err());
        assert_eq!(seq.power_state(), PowerState::Off);

        f.sim.heal();
        seq.start().await.unwrap();
        assert_eq!(seq.power_state(), PowerState::On);
    }

    #[test]
    fn should_release_wake_source_when_all_guards_drop() {
        let wake = WakeSource::default();
        let first = wake.acquire();
        let second = wake.clone().acquire();

        drop(first);
        assert!(wake.is_held());
        drop(second);
        assert!(!wake.is_held());
    }
}
