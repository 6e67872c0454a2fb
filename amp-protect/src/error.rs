//! Crate-wide error type.

use crate::regmap::RegisterError;

/// Errors returned by the amplifier runtime.
///
/// None of these is fatal to the process. The worst outcome of any of them
/// is the amplifier staying muted or powered down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("register 0x{addr:02X} access failed: {source}")]
    RegisterIo {
        addr: u8,
        #[source]
        source: RegisterError,
    },

    #[error("unsupported sample rate: {0} Hz")]
    UnsupportedRate(u32),

    #[error("unsupported sample width: {0} bits")]
    UnsupportedWidth(u32),

    #[error("invalid clock source id: {0}")]
    InvalidClockSource(i32),

    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("thermal table row {row} out of range (table has {len} rows)")]
    InvalidTableRow { row: usize, len: usize },

    #[error("invalid thermal sensor option: {0}")]
    InvalidSensorOption(i64),

    #[error("device id mismatch: version register reads 0x{0:02X}")]
    DeviceIdMismatch(u8),
}

impl Error {
    /// True for the format-rejection family, which never touches hardware.
    pub fn is_unsupported_format(&self) -> bool {
        matches!(self, Error::UnsupportedRate(_) | Error::UnsupportedWidth(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
