//! Register access for the amplifier.
//!
//! Hardware is reached through the [`RegisterPort`] trait, which a bus
//! driver (I2C in production, [`SimRegisters`] in tests and the demo daemon)
//! implements. [`Registers`] wraps a shared port, enforces the documented
//! readable/writable address set and maps failures into the crate error.

pub mod registers;
mod sim;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub use sim::SimRegisters;

/// Register-level failures reported by a [`RegisterPort`].
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address 0x{0:02X} is not readable")]
    NotReadable(u8),

    #[error("address 0x{0:02X} is not writable")]
    NotWritable(u8),

    #[error("bus error: {0}")]
    Bus(String),
}

/// 8-bit register access to the amplifier.
#[async_trait]
pub trait RegisterPort: Send + Sync {
    async fn read(&self, addr: u8) -> std::result::Result<u8, RegisterError>;

    async fn write(&self, addr: u8, value: u8) -> std::result::Result<(), RegisterError>;

    /// Read-modify-write of the bits selected by `mask`.
    ///
    /// The write is skipped when the masked bits already hold `value`.
    async fn update_bits(
        &self,
        addr: u8,
        mask: u8,
        value: u8,
    ) -> std::result::Result<(), RegisterError> {
        let current = self.read(addr).await?;
        let next = (current & !mask) | (value & mask);
        if next != current {
            self.write(addr, next).await?;
        }
        Ok(())
    }
}

/// Ranges of addresses the device decodes for both reads and writes.
const ACCESSIBLE: &[(u8, u8)] = &[
    (0x00, 0x30),
    (0x33, 0x33),
    (0x36, 0x98),
    (0x9A, 0x9A),
    (0x9C, 0xA0),
    (0xA2, 0xBF),
    (0xFA, 0xFF),
];

fn in_ranges(ranges: &[(u8, u8)], addr: u8) -> bool {
    ranges.iter().any(|&(lo, hi)| (lo..=hi).contains(&addr))
}

pub fn is_readable(addr: u8) -> bool {
    in_ranges(ACCESSIBLE, addr)
}

pub fn is_writeable(addr: u8) -> bool {
    in_ranges(ACCESSIBLE, addr)
}

/// Status and version registers change underneath the driver and must never
/// be served from a cache.
pub fn is_volatile(addr: u8) -> bool {
    (registers::STATUS1..=registers::VERSION).contains(&addr)
}

/// Shared, validated handle to the register port.
#[derive(Clone)]
pub struct Registers {
    port: Arc<dyn RegisterPort>,
}

impl Registers {
    pub fn new(port: Arc<dyn RegisterPort>) -> Self {
        Self { port }
    }

    pub async fn read(&self, addr: u8) -> Result<u8> {
        if !is_readable(addr) {
            return Err(Error::RegisterIo {
                addr,
                source: RegisterError::NotReadable(addr),
            });
        }

        let value = self
            .port
            .read(addr)
            .await
            .map_err(|source| io_failed(addr, source))?;
        trace!(addr = format_args!("0x{addr:02X}"), value = format_args!("0x{value:02X}"), "read");
        Ok(value)
    }

    pub async fn write(&self, addr: u8, value: u8) -> Result<()> {
        if !is_writeable(addr) {
            return Err(Error::RegisterIo {
                addr,
                source: RegisterError::NotWritable(addr),
            });
        }

        trace!(addr = format_args!("0x{addr:02X}"), value = format_args!("0x{value:02X}"), "write");
        self.port
            .write(addr, value)
            .await
            .map_err(|source| io_failed(addr, source))
    }

    pub async fn update_bits(&self, addr: u8, mask: u8, value: u8) -> Result<()> {
        if !is_writeable(addr) {
            return Err(Error::RegisterIo {
                addr,
                source: RegisterError::NotWritable(addr),
            });
        }

        self.port
            .update_bits(addr, mask, value)
            .await
            .map_err(|source| io_failed(addr, source))
    }
}

fn io_failed(addr: u8, source: RegisterError) -> Error {
    error!(addr = format_args!("0x{addr:02X}"), error = %source, "Register access failed");
    Error::RegisterIo { addr, source }
}
