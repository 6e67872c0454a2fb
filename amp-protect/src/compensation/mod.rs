//! Level-based speaker gain compensation.
//!
//! Each tick the newest bracket is looked up in the thermal table and the
//! battery table, and the larger of the two attenuations is chosen. There is
//! no smoothing or hysteresis: the compensator reacts to whatever bracket the
//! current sample lands in.
//!
//! ```text
//!   row == 0 or inactive        row active, elevated
//!  ┌────────────────────────┐  ┌─────────────────────────────────────┐
//!  │ battery > 0 → battery  │  │ hit_count += 1                      │
//!  │ row changed → restore  │  │ row changed → max(battery, thermal) │
//!  │ otherwise   → hold     │  │ battery > thermal → battery         │
//!  └────────────────────────┘  │ otherwise   → hold                  │
//!                              └─────────────────────────────────────┘
//! ```

mod history;
mod tables;

pub use history::{HISTORY_CAPACITY, Sample, SampleHistory};
pub use tables::{
    BATTERY_TABLE, BatteryEntry, TableRow, TableVariant, ThermalEntry, ThermalTable,
    battery_entry,
};

/// What to do with the speaker volume register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainAction {
    /// Leave the register as it is.
    Hold,
    /// Write the initial volume plus this much attenuation. Zero restores
    /// the uncompensated volume.
    Apply(u8),
}

/// Evaluate one sample against the tables.
///
/// Returns the matched row, which the caller records as the new previous
/// row whatever the action.
pub fn arbitrate(
    table: &mut ThermalTable,
    previous: TableRow,
    temperature: i32,
    battery_gain: u8,
) -> (TableRow, GainAction) {
    let row = table.match_row(temperature);
    let entry = table.entry_mut(row);
    let changed = row != previous;

    let action = if row.index() == 0 || !entry.active {
        if battery_gain > 0 {
            GainAction::Apply(battery_gain)
        } else if changed {
            GainAction::Apply(0)
        } else {
            GainAction::Hold
        }
    } else {
        entry.hit_count = entry.hit_count.saturating_add(1);
        if changed {
            GainAction::Apply(battery_gain.max(entry.gain))
        } else if battery_gain > entry.gain {
            GainAction::Apply(battery_gain)
        } else {
            GainAction::Hold
        }
    };

    (row, action)
}

/// Record a speaker over-current against the current row and age its gain.
///
/// The normal row only counts the event. Elevated rows gain one more unit of
/// attenuation, which is returned for writing.
pub fn age_on_overcurrent(table: &mut ThermalTable, current: TableRow) -> Option<u8> {
    let entry = table.entry_mut(current);
    entry.ocp_count = entry.ocp_count.saturating_add(1);

    if current.index() == 0 {
        return None;
    }

    entry.gain = entry.gain.saturating_add(1);
    Some(entry.gain)
}
