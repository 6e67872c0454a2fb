//! Protection loop daemon.
//!
//! Probes an amplifier on a simulated register file, plays one stream
//! through a heat-up and cool-down cycle and prints the diagnostic snapshot
//! as JSON when the stream ends or on Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use amp_protect::amplifier::Amplifier;
use amp_protect::clock::StreamFormat;
use amp_protect::config::AmpConfig;
use amp_protect::regmap::SimRegisters;
use amp_protect::regmap::registers::{self, Status2};
use amp_protect::sensor::{Sensors, SimBattery, SimTemperature};
use amp_protect::tracing::{init_journald_or_stdout, prelude::*};

/// Skin temperature readings, one per compensation tick (0.1 °C).
const HEAT_CYCLE: [i32; 10] = [300, 380, 460, 540, 620, 700, 620, 500, 400, 320];

const TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    init_journald_or_stdout();

    let config = AmpConfig {
        compensation_enabled: true,
        compensation_period: TICK,
        fault_poll_enabled: true,
        delayed_shutdown_enabled: true,
        ocp_aging_enabled: true,
        ..Default::default()
    };

    let sim = Arc::new(SimRegisters::new());
    let temperature = Arc::new(SimTemperature::new(HEAT_CYCLE[0]));
    for reading in HEAT_CYCLE {
        temperature.push(Some(reading));
    }
    let battery = Arc::new(SimBattery::new(3900));
    let sensors = Sensors::new(temperature).with_battery(battery.clone());

    let amp = Amplifier::probe(sim.clone(), sensors, config)
        .await
        .context("failed to probe amplifier")?;

    amp.set_sysclk(3, 0).await?;
    amp.hw_params(StreamFormat::new(48000, 24, 32, 2))
        .await
        .context("failed to negotiate stream format")?;
    info!("Stream running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for Ctrl-C")?;
            info!("Interrupted");
        }
        result = play(&amp, &sim, &battery) => result?,
    }

    amp.stop_stream().await?;
    println!("{}", amp.diagnostics().snapshot().to_json()?);
    amp.shutdown().await?;
    Ok(())
}

/// Ride out the heat cycle, with a sagging battery and one speaker
/// over-current at the peak.
async fn play(amp: &Amplifier, sim: &SimRegisters, battery: &SimBattery) -> Result<()> {
    for tick in 0..HEAT_CYCLE.len() {
        tokio::time::sleep(TICK).await;

        match tick {
            3 => battery.set(3450),
            5 => {
                sim.set(registers::STATUS2, Status2::OCP_SPK.bits());
                amp.on_interrupt().await?;
            }
            7 => battery.set(3800),
            _ => {}
        }
    }

    tokio::time::sleep(TICK).await;
    Ok(())
}
