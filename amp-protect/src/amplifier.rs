//! One probed amplifier and the operations the audio framework drives.

use std::sync::Arc;

use strum::Display;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{ClockNegotiator, StreamFormat};
use crate::config::AmpConfig;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::fault::{FaultInterruptHandler, FaultReport, run_fault_worker};
use crate::protection::{PowerState, ProtectionController};
use crate::regmap::registers::{self, modulator, mute_vol_ctrl, system_ctrl, system_ctrl2, version};
use crate::regmap::{RegisterPort, Registers};
use crate::sensor::Sensors;
use crate::sequencer::PowerSequencer;
use crate::tracing::prelude::*;

/// Bias levels requested by the audio framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BiasLevel {
    On,
    Prepare,
    Standby,
    Off,
}

pub struct Amplifier {
    controller: ProtectionController,
    sequencer: PowerSequencer,
    clock: ClockNegotiator,
    interrupts: FaultInterruptHandler,
    shutdown: CancellationToken,
    fault_worker: JoinHandle<()>,
}

impl Amplifier {
    /// Identify the device, load register defaults and start the fault
    /// worker. The amplifier is left powered down and muted.
    pub async fn probe(
        port: Arc<dyn RegisterPort>,
        sensors: Sensors,
        config: AmpConfig,
    ) -> Result<Self> {
        let regs = Registers::new(port);

        let id = regs.read(registers::VERSION).await?;
        if id & version::DEVICE_ID_MASK != version::DEVICE_ID {
            error!(version = format_args!("0x{id:02X}"), "Unexpected device id");
            return Err(Error::DeviceIdMismatch(id));
        }
        let revision = id & version::REV_NUM_MASK;
        info!(revision, "Amplifier found");

        let controller = ProtectionController::new(regs, &config);
        controller.lock().revision = revision;
        load_defaults(&controller, &config, revision).await?;

        let sequencer = PowerSequencer::new(controller.clone(), sensors);
        let clock = ClockNegotiator::new(controller.clone(), sequencer.clone());
        let (interrupts, work_rx) = FaultInterruptHandler::new(controller.clone());
        let shutdown = CancellationToken::new();
        let fault_worker = tokio::spawn(run_fault_worker(
            controller.clone(),
            work_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            controller,
            sequencer,
            clock,
            interrupts,
            shutdown,
            fault_worker,
        })
    }

    pub fn controller(&self) -> &ProtectionController {
        &self.controller
    }

    pub fn sequencer(&self) -> &PowerSequencer {
        &self.sequencer
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.controller.clone())
    }

    pub fn power_state(&self) -> PowerState {
        self.sequencer.power_state()
    }

    pub async fn set_sysclk(&self, id: i32, freq_hz: u32) -> Result<()> {
        self.clock.set_sysclk(id, freq_hz).await
    }

    pub async fn hw_params(&self, format: StreamFormat) -> Result<()> {
        self.clock.negotiate(format).await
    }

    /// Power up for a starting stream, unless forced down.
    pub async fn start_stream(&self) -> Result<()> {
        if self.controller.lock().force_power_down {
            info!("Forced power-down, ignoring start");
            return Ok(());
        }
        self.sequencer.start().await
    }

    pub async fn stop_stream(&self) -> Result<()> {
        self.sequencer.stop().await
    }

    pub async fn set_bias_level(&self, level: BiasLevel) -> Result<()> {
        info!(level = %level, "Bias level");
        match level {
            BiasLevel::On => self.start_stream().await,
            BiasLevel::Off => self.sequencer.stop().await,
            BiasLevel::Prepare | BiasLevel::Standby => Ok(()),
        }
    }

    /// Mute or unmute the speaker. Ignored while the amplifier is not on.
    pub async fn digital_mute(&self, mute: bool) -> Result<()> {
        if self.power_state() != PowerState::On {
            debug!(mute, "Amplifier not on, ignoring mute");
            return Ok(());
        }
        info!(mute, "Digital mute");
        let value = if mute { mute_vol_ctrl::SPK_MUTE } else { 0 };
        self.controller
            .registers()
            .update_bits(registers::MUTE_VOL_CTRL, mute_vol_ctrl::SPK_MUTE, value)
            .await
    }

    /// Hold the amplifier down regardless of stream activity.
    pub async fn set_force_power_down(&self, forced: bool) -> Result<()> {
        self.controller.lock().force_power_down = forced;
        if forced {
            info!("Forced power-down");
            self.sequencer.stop_immediately().await
        } else {
            info!("Forced power-down released");
            Ok(())
        }
    }

    pub fn force_power_down(&self) -> bool {
        self.controller.lock().force_power_down
    }

    /// Change the uncompensated speaker volume.
    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        info!(volume = format_args!("0x{volume:02X}"), "Speaker volume");
        self.controller.set_initial_volume(volume).await
    }

    /// Service one edge on the fault line.
    pub async fn on_interrupt(&self) -> Result<Option<FaultReport>> {
        self.interrupts.handle().await
    }

    /// Power down and stop the fault worker.
    pub async fn shutdown(self) -> Result<()> {
        let result = self.sequencer.stop_immediately().await;
        self.shutdown.cancel();
        if let Err(e) = self.fault_worker.await {
            warn!(error = %e, "Fault worker failed");
        }
        info!("Amplifier released");
        result
    }
}

async fn load_defaults(
    controller: &ProtectionController,
    config: &AmpConfig,
    revision: u8,
) -> Result<()> {
    let regs = controller.registers();

    regs.write(registers::SYSTEM_CTRL, system_ctrl::DEFAULT).await?;
    regs.write(registers::SPK_VOL, config.init_volume).await?;
    controller.note_volume_written(config.init_volume);
    regs.write(registers::MUTE_VOL_CTRL, mute_vol_ctrl::DEFAULT)
        .await?;

    regs.write(registers::SYSTEM_CTRL2, system_ctrl2::DEFAULT)
        .await?;
    let monomix = if config.stereo_two_chip {
        0
    } else {
        system_ctrl2::MONOMIX
    };
    regs.update_bits(registers::SYSTEM_CTRL2, system_ctrl2::MONOMIX, monomix)
        .await?;

    let modulation = if revision == 0 {
        modulator::REV0
    } else {
        modulator::REV1_PLUS
    };
    regs.write(registers::MODULATOR, modulation).await?;

    debug!(
        stereo = config.stereo_two_chip,
        init_volume = config.init_volume,
        "Register defaults loaded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;
    use crate::config::DEFAULT_INIT_VOLUME;
    use crate::regmap::SimRegisters;
    use crate::regmap::registers::Status2;
    use crate::sensor::{SimBattery, SimTemperature};

    struct Bench {
        sim: Arc<SimRegisters>,
        temperature: Arc<SimTemperature>,
        amp: Amplifier,
    }

    async fn bench(config: AmpConfig) -> Bench {
        let sim = Arc::new(SimRegisters::new());
        let temperature = Arc::new(SimTemperature::new(250));
        let sensors = Sensors::new(temperature.clone()).with_battery(Arc::new(SimBattery::new(4200)));
        let amp = Amplifier::probe(sim.clone(), sensors, config).await.unwrap();
        Bench {
            sim,
            temperature,
            amp,
        }
    }

    fn muted(sim: &SimRegisters) -> bool {
        sim.get(registers::MUTE_VOL_CTRL) & mute_vol_ctrl::SPK_MUTE != 0
    }

    #[tokio::test]
    async fn should_load_defaults_on_probe() {
        let b = bench(AmpConfig::default()).await;

        assert_eq!(
            b.sim.writes(),
            vec![
                (registers::SYSTEM_CTRL, 0x80),
                (registers::SPK_VOL, DEFAULT_INIT_VOLUME),
                (registers::MUTE_VOL_CTRL, 0xFF),
                (registers::SYSTEM_CTRL2, 0xA0),
                (registers::SYSTEM_CTRL2, 0xA1),
                (registers::MODULATOR, modulator::REV1_PLUS),
            ]
        );
        assert_eq!(b.amp.controller().lock().revision, 1);
        assert_eq!(b.amp.controller().lock().volume, Some(DEFAULT_INIT_VOLUME));
        assert_eq!(b.amp.power_state(), PowerState::Off);
    }

    #[tokio::test]
    async fn should_use_revision_zero_modulator_and_stereo_mix() {
        let sim = Arc::new(SimRegisters::new());
        sim.set(registers::VERSION, version::DEVICE_ID);
        let config = AmpConfig {
            stereo_two_chip: true,
            ..Default::default()
        };

        Amplifier::probe(sim.clone(), Sensors::new(Arc::new(SimTemperature::new(250))), config)
            .await
            .unwrap();

        assert_eq!(sim.get(registers::MODULATOR), modulator::REV0);
        assert_eq!(sim.get(registers::SYSTEM_CTRL2), system_ctrl2::DEFAULT);
    }

    #[tokio::test]
    async fn should_reject_foreign_device() {
        let sim = Arc::new(SimRegisters::new());
        sim.set(registers::VERSION, 0x41);

        let result = Amplifier::probe(
            sim.clone(),
            Sensors::new(Arc::new(SimTemperature::new(250))),
            AmpConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::DeviceIdMismatch(0x41))));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_start_while_forced_down() {
        let b = bench(AmpConfig::default()).await;
        b.amp.start_stream().await.unwrap();

        b.amp.set_force_power_down(true).await.unwrap();
        b.amp.set_bias_level(BiasLevel::On).await.unwrap();
        b.amp.start_stream().await.unwrap();

        assert_eq!(b.amp.power_state(), PowerState::Off);

        b.amp.set_force_power_down(false).await.unwrap();
        b.amp.start_stream().await.unwrap();
        assert_eq!(b.amp.power_state(), PowerState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn should_follow_bias_level() {
        let b = bench(AmpConfig::default()).await;

        b.amp.set_bias_level(BiasLevel::On).await.unwrap();
        assert_eq!(b.amp.power_state(), PowerState::On);

        b.amp.set_bias_level(BiasLevel::Standby).await.unwrap();
        assert_eq!(b.amp.power_state(), PowerState::On);

        b.amp.set_bias_level(BiasLevel::Off).await.unwrap();
        assert_eq!(b.amp.power_state(), PowerState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn should_mute_only_while_on() {
        let b = bench(AmpConfig::default()).await;
        b.sim.clear_writes();

        b.amp.digital_mute(false).await.unwrap();
        assert!(b.sim.writes().is_empty());

        b.amp.start_stream().await.unwrap();
        assert!(!muted(&b.sim));
        b.amp.digital_mute(true).await.unwrap();
        assert!(muted(&b.sim));
    }

    #[tokio::test]
    async fn should_write_user_volume_as_new_baseline() {
        let b = bench(AmpConfig::default()).await;

        b.amp.set_volume(0x40).await.unwrap();

        assert_eq!(b.sim.get(registers::SPK_VOL), 0x40);
        assert_eq!(b.amp.controller().lock().init_volume, 0x40);
    }

    #[tokio::test(start_paused = true)]
    async fn should_age_bracket_from_interrupt() {
        let config = AmpConfig {
            compensation_enabled: true,
            ocp_aging_enabled: true,
            ..Default::default()
        };
        let b = bench(config).await;
        b.temperature.set(Some(460));
        b.amp
            .hw_params(StreamFormat::new(48000, 24, 32, 2))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(b.sim.get(registers::SPK_VOL), DEFAULT_INIT_VOLUME + 3);

        b.sim.set(registers::STATUS2, Status2::OCP_SPK.bits());
        let report = b.amp.on_interrupt().await.unwrap();
        time::sleep(Duration::from_millis(1)).await;

        assert!(report.is_some_and(|r| r.is_overcurrent()));
        assert_eq!(b.sim.get(registers::SPK_VOL), DEFAULT_INIT_VOLUME + 4);
        assert_eq!(b.amp.diagnostics().snapshot().ocp_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_power_down_on_shutdown() {
        let config = AmpConfig {
            delayed_shutdown_enabled: true,
            ..Default::default()
        };
        let b = bench(config).await;
        b.amp.start_stream().await.unwrap();
        let sim = b.sim.clone();

        b.amp.shutdown().await.unwrap();

        assert_eq!(sim.get(registers::SYSTEM_CTRL) & system_ctrl::POWER, 0);
    }
}
