use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::sustained::{ConditionEdge, SustainedCondition};
use crate::error::Result;
use crate::protection::ProtectionController;
use crate::regmap::registers::{self, Status1};
use crate::tracing::prelude::*;

/// SAR ADC reading at or below which the supply is treated as browning out.
pub const BROWN_OUT_SAR_THRESHOLD: u8 = 143;

/// How long a condition must persist before it is escalated to a warning.
pub const SUSTAINED_AFTER: Duration = Duration::from_secs(30);

/// What one poll saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub status1: Status1,
    pub sar_adc: Option<u8>,
    pub bop_state: Option<u8>,
    /// `None` when the brown-out registers could not be read.
    pub brown_out: Option<bool>,
    pub over_temperature: bool,
}

/// Slow over-temperature and brown-out watchdog.
///
/// Reads the status block on a timer and logs what it finds. It never
/// changes compensation state.
pub struct FaultPoller {
    controller: ProtectionController,
    brown_out: SustainedCondition,
    over_temperature: SustainedCondition,
}

impl FaultPoller {
    pub fn new(controller: ProtectionController) -> Self {
        Self {
            controller,
            brown_out: SustainedCondition::new(SUSTAINED_AFTER),
            over_temperature: SustainedCondition::new(SUSTAINED_AFTER),
        }
    }

    /// Poll every fault-poll period until cancelled or disabled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        loop {
            let delay = self.controller.lock().tunables.fault_poll_rearm();

            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.poll().await {
                debug!(error = %e, "Fault poll aborted");
            }

            if !self.controller.lock().tunables.fault_poll_enabled {
                debug!("Fault poll disabled, poller stopping");
                break;
            }
        }
    }

    pub async fn poll(&mut self) -> Result<PollReport> {
        let regs = self.controller.registers();

        let status1 = Status1::from_bits_truncate(regs.read(registers::STATUS1).await?);
        let sar_adc = regs.read(registers::STATUS3).await.ok();
        let bop_state = regs.read(registers::STATUS5).await.ok();

        let brown_out = match (sar_adc, bop_state) {
            (Some(sar), Some(bop)) => Some(bop != 0 || sar <= BROWN_OUT_SAR_THRESHOLD),
            _ => None,
        };
        let over_temperature = !status1.contains(Status1::OT1_OK);

        if let Some(present) = brown_out {
            match self.brown_out.update(present) {
                ConditionEdge::Onset | ConditionEdge::Present => {
                    info!(sar_adc = ?sar_adc, bop_state = ?bop_state, "Brown-out protection active");
                }
                ConditionEdge::Sustained => {
                    warn!(
                        sar_adc = ?sar_adc,
                        bop_state = ?bop_state,
                        sustained_s = SUSTAINED_AFTER.as_secs(),
                        "Brown-out protection sustained"
                    );
                }
                ConditionEdge::Cleared => info!("Brown-out protection cleared"),
                ConditionEdge::Absent => {}
            }
        }

        match self.over_temperature.update(over_temperature) {
            ConditionEdge::Onset | ConditionEdge::Present => {
                info!("Over-temperature level 1");
            }
            ConditionEdge::Sustained => {
                warn!(
                    sustained_s = SUSTAINED_AFTER.as_secs(),
                    "Over-temperature level 1 sustained"
                );
            }
            ConditionEdge::Cleared => info!("Over-temperature level 1 cleared"),
            ConditionEdge::Absent => {}
        }

        Ok(PollReport {
            status1,
            sar_adc,
            bop_state,
            brown_out,
            over_temperature,
        })
    }
}
