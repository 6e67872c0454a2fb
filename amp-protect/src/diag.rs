//! Diagnostic and tuning surface.
//!
//! Every setter takes effect on the next tick of the worker it affects;
//! periods are re-read each time a worker re-arms. Per-row accessors act on
//! the row chosen with [`Diagnostics::select_row`].

use std::time::Duration;

use serde::Serialize;

use crate::compensation::ThermalEntry;
use crate::error::Result;
use crate::protection::{PowerState, ProtectionController, Tunables};
use crate::sensor::SensorOption;
use crate::tracing::prelude::*;

#[derive(Clone)]
pub struct Diagnostics {
    controller: ProtectionController,
}

impl Diagnostics {
    pub fn new(controller: ProtectionController) -> Self {
        Self { controller }
    }

    pub fn compensation_enabled(&self) -> bool {
        self.controller.lock().tunables.compensation_enabled
    }

    pub fn set_compensation_enabled(&self, enabled: bool) {
        self.controller.lock().tunables.compensation_enabled = enabled;
        info!(enabled, "Compensation toggled");
    }

    pub fn compensation_period(&self) -> Duration {
        self.controller.lock().tunables.compensation_period
    }

    pub fn set_compensation_period(&self, period: Duration) {
        self.controller.lock().tunables.compensation_period = period;
    }

    pub fn fault_poll_enabled(&self) -> bool {
        self.controller.lock().tunables.fault_poll_enabled
    }

    pub fn set_fault_poll_enabled(&self, enabled: bool) {
        self.controller.lock().tunables.fault_poll_enabled = enabled;
        info!(enabled, "Fault poll toggled");
    }

    pub fn fault_poll_period(&self) -> Duration {
        self.controller.lock().tunables.fault_poll_period
    }

    pub fn set_fault_poll_period(&self, period: Duration) {
        self.controller.lock().tunables.fault_poll_period = period;
    }

    pub fn delayed_shutdown_enabled(&self) -> bool {
        self.controller.lock().tunables.delayed_shutdown_enabled
    }

    pub fn set_delayed_shutdown_enabled(&self, enabled: bool) {
        self.controller.lock().tunables.delayed_shutdown_enabled = enabled;
    }

    pub fn delayed_shutdown_secs(&self) -> u64 {
        self.controller.lock().tunables.delayed_shutdown.as_secs()
    }

    pub fn set_delayed_shutdown_secs(&self, secs: u64) {
        self.controller.lock().tunables.delayed_shutdown = Duration::from_secs(secs);
    }

    pub fn ocp_aging_enabled(&self) -> bool {
        self.controller.lock().tunables.ocp_aging_enabled
    }

    pub fn set_ocp_aging_enabled(&self, enabled: bool) {
        self.controller.lock().tunables.ocp_aging_enabled = enabled;
    }

    pub fn sensor_option(&self) -> SensorOption {
        self.controller.lock().tunables.sensor_option
    }

    /// Select the thermistor by its numeric selector.
    pub fn set_sensor_option(&self, raw: i64) -> Result<()> {
        let option = SensorOption::from_raw(raw)?;
        self.controller.lock().tunables.sensor_option = option;
        info!(option = %option, "Thermal sensor selected");
        Ok(())
    }

    pub fn selected_row(&self) -> usize {
        self.controller.lock().selected_row.index()
    }

    /// Choose the row the per-row accessors act on.
    ///
    /// An out-of-range row is rejected and the selection falls back to
    /// row 0.
    pub fn select_row(&self, raw: usize) -> Result<()> {
        let mut state = self.controller.lock();
        match state.table.row(raw) {
            Ok(row) => {
                state.selected_row = row;
                Ok(())
            }
            Err(e) => {
                state.selected_row = Default::default();
                warn!(row = raw, len = state.table.len(), "Rejected table row");
                Err(e)
            }
        }
    }

    fn with_selected<T>(&self, f: impl FnOnce(&mut ThermalEntry) -> T) -> T {
        let mut guard = self.controller.lock();
        let state = &mut *guard;
        f(state.table.entry_mut(state.selected_row))
    }

    pub fn row_limit(&self) -> i32 {
        self.with_selected(|e| e.limit)
    }

    pub fn set_row_limit(&self, limit: i32) {
        self.with_selected(|e| e.limit = limit)
    }

    pub fn row_gain(&self) -> u8 {
        self.with_selected(|e| e.gain)
    }

    pub fn set_row_gain(&self, gain: u8) {
        self.with_selected(|e| e.gain = gain)
    }

    pub fn row_active(&self) -> bool {
        self.with_selected(|e| e.active)
    }

    pub fn set_row_active(&self, active: bool) {
        self.with_selected(|e| e.active = active)
    }

    pub fn row_ocp_count(&self) -> u32 {
        self.with_selected(|e| e.ocp_count)
    }

    pub fn row_hit_count(&self) -> u32 {
        self.with_selected(|e| e.hit_count)
    }

    /// Temperatures still queued for evaluation, oldest first. Does not
    /// consume them.
    pub fn peek_temperatures(&self) -> Vec<i32> {
        self.controller.lock().history.temperatures()
    }

    pub fn table_summary(&self) -> String {
        self.controller.lock().table.summary()
    }

    pub fn snapshot(&self) -> DiagnosticSnapshot {
        let state = self.controller.lock();
        DiagnosticSnapshot {
            power: state.power,
            tunables: state.tunables.clone(),
            threshold_row: state.threshold.index(),
            selected_row: state.selected_row.index(),
            init_volume: state.init_volume,
            volume: state.volume,
            battery_level: state.battery_level,
            ocp_count: self.controller.ocp_count(),
            irq_enabled: self.controller.irq_enabled(),
            queued_temperatures: state.history.temperatures(),
            sample_sequence: state.history.sequence(),
            samples_dropped: state.history.dropped(),
            table: state.table.entries().to_vec(),
        }
    }
}

/// Point-in-time view of everything the tuning surface exposes.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSnapshot {
    pub power: PowerState,
    pub tunables: Tunables,
    pub threshold_row: usize,
    pub selected_row: usize,
    pub init_volume: u8,
    pub volume: Option<u8>,
    pub battery_level: Option<u8>,
    pub ocp_count: u32,
    pub irq_enabled: bool,
    pub queued_temperatures: Vec<i32>,
    pub sample_sequence: u32,
    pub samples_dropped: u32,
    pub table: Vec<ThermalEntry>,
}

impl DiagnosticSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
