//! Reaction to the amplifier's protection interrupt, plus the slow status
//! watchdog.
//!
//! The interrupt path does as little as possible: it reads the status
//! block (which acknowledges the interrupt), bumps the over-current counter
//! atomically and hands aging compensation to a worker task over a channel.
//! Only the worker takes the controller's locks, so an interrupt can never
//! wait behind a compensation tick.

mod poller;
mod sustained;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protection::ProtectionController;
use crate::regmap::registers::{self, Status1, Status2};
use crate::tracing::prelude::*;

pub use poller::{BROWN_OUT_SAR_THRESHOLD, FaultPoller, PollReport, SUSTAINED_AFTER};
pub use sustained::{ConditionEdge, SustainedCondition};

/// Work deferred from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultWork {
    SpeakerOvercurrent,
}

/// Status block as read by one interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    pub status1: Status1,
    pub status2: Status2,
    pub sar_adc: u8,
    pub bop_state: u8,
}

impl FaultReport {
    pub fn is_overcurrent(&self) -> bool {
        self.status2.intersects(Status2::OCP_SPK | Status2::OCP_BST)
    }
}

pub struct FaultInterruptHandler {
    controller: ProtectionController,
    work_tx: mpsc::UnboundedSender<FaultWork>,
}

impl FaultInterruptHandler {
    /// Create the handler and the receiving end for [`run_fault_worker`].
    pub fn new(controller: ProtectionController) -> (Self, mpsc::UnboundedReceiver<FaultWork>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        (
            Self {
                controller,
                work_tx,
            },
            work_rx,
        )
    }

    /// Service one edge on the fault line.
    ///
    /// Returns `None` when the line is disabled, otherwise what the status
    /// block reported.
    pub async fn handle(&self) -> Result<Option<FaultReport>> {
        if !self.controller.irq_enabled() {
            debug!("Fault interrupt while line disabled, ignoring");
            return Ok(None);
        }

        let regs = self.controller.registers();
        let report = FaultReport {
            status1: Status1::from_bits_truncate(regs.read(registers::STATUS1).await?),
            status2: Status2::from_bits_truncate(regs.read(registers::STATUS2).await?),
            sar_adc: regs.read(registers::STATUS3).await?,
            bop_state: regs.read(registers::STATUS5).await?,
        };

        warn!(
            sar_adc = format_args!("0x{:02X}", report.sar_adc),
            bop_state = report.bop_state,
            "Fault interrupt"
        );

        if !report.status1.contains(Status1::OT2_OK) {
            error!("Over-temperature level 2");
        }

        if report.status2.contains(Status2::OCP_SPK) {
            warn!("Speaker over-current");
            self.controller.record_overcurrent();
            if self.work_tx.send(FaultWork::SpeakerOvercurrent).is_err() {
                debug!("Fault worker gone, dropping aging request");
            }
        }

        if report.status2.contains(Status2::OCP_BST) {
            warn!("Boost over-current");
            self.controller.record_overcurrent();
        }

        if report.status2.contains(Status2::UVLO_BST) {
            warn!("Boost under-voltage lockout");
        }

        if report.status2.contains(Status2::CLOCK_MON) {
            warn!("Clock fault, no clock input");
        }

        if report.is_overcurrent() {
            warn!(total = self.controller.ocp_count(), "Over-current events so far");
        }

        Ok(Some(report))
    }
}

/// Carry out work deferred by the interrupt handler.
pub async fn run_fault_worker(
    controller: ProtectionController,
    mut work_rx: mpsc::UnboundedReceiver<FaultWork>,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                break;
            }
            work = work_rx.recv() => match work {
                Some(FaultWork::SpeakerOvercurrent) => {
                    if let Err(e) = controller.age_on_overcurrent().await {
                        warn!(error = %e, "Aging compensation failed");
                    }
                }
                None => break,
            }
        }
    }
}
