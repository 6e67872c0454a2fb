//! Threshold tables consulted by the compensator.
//!
//! Temperatures are in tenths of a degree Celsius. Gains are in speaker
//! volume register units, where each unit attenuates by 0.5 dB.

use serde::Serialize;
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// One temperature bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThermalEntry {
    pub label: &'static str,
    /// Upper bound of the bracket, exclusive.
    pub limit: i32,
    pub gain: u8,
    /// Speaker over-current events seen while this bracket was current.
    pub ocp_count: u32,
    /// Compensation ticks that landed in this bracket while active.
    pub hit_count: u32,
    pub active: bool,
}

const fn entry(label: &'static str, limit: i32, gain: u8, active: bool) -> ThermalEntry {
    ThermalEntry {
        label,
        limit,
        gain,
        ocp_count: 0,
        hit_count: 0,
        active,
    }
}

/// Compiled-in table layouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum TableVariant {
    /// 5 °C brackets from 35 °C, all active.
    #[default]
    Default,
    /// Piezo speaker layout. The two coolest brackets are inactive.
    Piezo,
}

const DEFAULT_TABLE: [ThermalEntry; 14] = [
    entry("35", 350, 0x00, true),
    entry("40", 400, 0x01, true),
    entry("45", 450, 0x02, true),
    entry("50", 500, 0x03, true),
    entry("55", 550, 0x04, true),
    entry("60", 600, 0x05, true),
    entry("65", 650, 0x06, true),
    entry("70", 700, 0x07, true),
    entry("75", 750, 0x08, true),
    entry("80", 800, 0x09, true),
    entry("85", 850, 0x0A, true),
    entry("90", 900, 0x0B, true),
    entry("95", 950, 0x0C, true),
    entry("100", 1000, 0x0D, true),
];

const PIEZO_TABLE: [ThermalEntry; 11] = [
    entry("42.5", 425, 0x00, false),
    entry("48.8", 488, 0x01, false),
    entry("55.0", 550, 0x02, true),
    entry("61.3", 613, 0x03, true),
    entry("67.5", 675, 0x04, true),
    entry("73.8", 738, 0x05, true),
    entry("80.0", 800, 0x06, true),
    entry("86.3", 863, 0x07, true),
    entry("92.5", 925, 0x08, true),
    entry("98.8", 988, 0x09, true),
    entry("100.0", 1000, 0x0D, true),
];

/// Index of a row known to exist in a particular [`ThermalTable`].
///
/// Only [`ThermalTable::row`] hands these out, and tables never change
/// length, so indexing with one cannot go out of bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TableRow(usize);

impl TableRow {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered temperature brackets with their runtime counters.
///
/// Row 0 is the normal bracket. The last row is the ceiling: any
/// temperature at or above every limit maps to it.
#[derive(Debug, Clone)]
pub struct ThermalTable {
    entries: Box<[ThermalEntry]>,
}

impl ThermalTable {
    pub fn new(variant: TableVariant) -> Self {
        let entries = match variant {
            TableVariant::Default => DEFAULT_TABLE.to_vec(),
            TableVariant::Piezo => PIEZO_TABLE.to_vec(),
        };
        Self {
            entries: entries.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate a raw row number from outside the crate.
    pub fn row(&self, raw: usize) -> Result<TableRow> {
        if raw < self.entries.len() {
            Ok(TableRow(raw))
        } else {
            Err(Error::InvalidTableRow {
                row: raw,
                len: self.entries.len(),
            })
        }
    }

    /// Smallest row whose limit is strictly above `temperature`, or the
    /// ceiling row when none is.
    pub fn match_row(&self, temperature: i32) -> TableRow {
        let index = self
            .entries
            .iter()
            .position(|e| temperature < e.limit)
            .unwrap_or(self.entries.len() - 1);
        TableRow(index)
    }

    pub fn entry(&self, row: TableRow) -> &ThermalEntry {
        &self.entries[row.0]
    }

    pub fn entry_mut(&mut self, row: TableRow) -> &mut ThermalEntry {
        &mut self.entries[row.0]
    }

    pub fn entries(&self) -> &[ThermalEntry] {
        &self.entries
    }

    /// One line per row in the form
    /// `TEMP[limit] GAIN_C[gain] OCP_N[ocp] HIT_N[hit] ACT[0|1]`.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "TEMP[{}] GAIN_C[{}] OCP_N[{}] HIT_N[{}] ACT[{}]\n",
                    e.limit,
                    e.gain,
                    e.ocp_count,
                    e.hit_count,
                    u8::from(e.active)
                )
            })
            .collect()
    }
}

/// Battery charge bracket, 3 being a healthy battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryEntry {
    pub label: &'static str,
    pub level: u8,
    /// Lower voltage bound of the bracket, inclusive.
    pub min_mv: u32,
    pub gain: u8,
}

pub const BATTERY_TABLE: [BatteryEntry; 4] = [
    BatteryEntry {
        label: "Normal LVL",
        level: 3,
        min_mv: 3700,
        gain: 0x00,
    },
    BatteryEntry {
        label: "LVL 2",
        level: 2,
        min_mv: 3500,
        gain: 0x02,
    },
    BatteryEntry {
        label: "LVL 1",
        level: 1,
        min_mv: 3300,
        gain: 0x04,
    },
    BatteryEntry {
        label: "LVL 0",
        level: 0,
        min_mv: 0,
        gain: 0x06,
    },
];

/// Bracket for a measured battery voltage.
pub fn battery_entry(millivolts: u32) -> &'static BatteryEntry {
    BATTERY_TABLE
        .iter()
        .find(|e| millivolts >= e.min_mv)
        .unwrap_or(&BATTERY_TABLE[BATTERY_TABLE.len() - 1])
}
