//! In-memory register file.

use std::collections::{HashMap, HashSet};
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::registers::{self, Status1};
use super::{RegisterError, RegisterPort};

/// A register file that lives in memory.
///
/// Holds power-on values for the status block and a version register that
/// identifies as revision 1. Every successful write is recorded in order so
/// callers can assert on the exact traffic. Individual addresses can be made
/// to fail on read or write. STATUS2 latches clear when read, like the
/// hardware's read-to-clear acknowledge.
pub struct SimRegisters {
    inner: Mutex<SimInner>,
}

struct SimInner {
    regs: [u8; 256],
    writes: Vec<(u8, u8)>,
    reads: HashMap<u8, usize>,
    failing_reads: HashSet<u8>,
    failing_writes: HashSet<u8>,
}

impl SimRegisters {
    pub fn new() -> Self {
        let mut regs = [0u8; 256];
        regs[registers::STATUS1 as usize] = (Status1::OT1_OK | Status1::OT2_OK).bits();
        regs[registers::STATUS3 as usize] = 0xFF;
        regs[registers::VERSION as usize] = registers::version::DEVICE_ID | 1;

        Self {
            inner: Mutex::new(SimInner {
                regs,
                writes: Vec::new(),
                reads: HashMap::new(),
                failing_reads: HashSet::new(),
                failing_writes: HashSet::new(),
            }),
        }
    }

    /// Current value, without recording traffic.
    pub fn get(&self, addr: u8) -> u8 {
        self.inner.lock().regs[addr as usize]
    }

    /// Set a value as the hardware would, without recording a write.
    pub fn set(&self, addr: u8, value: u8) {
        self.inner.lock().regs[addr as usize] = value;
    }

    /// All writes so far, oldest first.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.inner.lock().writes.clone()
    }

    /// Writes so far to one address, oldest first.
    pub fn writes_to(&self, addr: u8) -> Vec<u8> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Successful reads of one address so far.
    pub fn read_count(&self, addr: u8) -> usize {
        self.inner.lock().reads.get(&addr).copied().unwrap_or(0)
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    pub fn fail_reads(&self, addr: u8) {
        self.inner.lock().failing_reads.insert(addr);
    }

    pub fn fail_writes(&self, addr: u8) {
        self.inner.lock().failing_writes.insert(addr);
    }

    pub fn heal(&self) {
        let mut inner = self.inner.lock();
        inner.failing_reads.clear();
        inner.failing_writes.clear();
    }
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(addr: u8) -> RegisterError {
    RegisterError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("injected failure at 0x{addr:02X}"),
    ))
}

#[async_trait]
impl RegisterPort for SimRegisters {
    async fn read(&self, addr: u8) -> Result<u8, RegisterError> {
        let mut inner = self.inner.lock();
        if inner.failing_reads.contains(&addr) {
            return Err(injected(addr));
        }

        let value = inner.regs[addr as usize];
        *inner.reads.entry(addr).or_default() += 1;
        if addr == registers::STATUS2 {
            inner.regs[addr as usize] = 0;
        }
        Ok(value)
    }

    async fn write(&self, addr: u8, value: u8) -> Result<(), RegisterError> {
        let mut inner = self.inner.lock();
        if inner.failing_writes.contains(&addr) {
            return Err(injected(addr));
        }

        inner.regs[addr as usize] = value;
        inner.writes.push((addr, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regmap::registers::Status2;

    #[tokio::test]
    async fn should_clear_fault_latches_on_read() {
        let sim = SimRegisters::new();
        sim.set(registers::STATUS2, Status2::OCP_SPK.bits());

        assert_eq!(sim.read(registers::STATUS2).await.unwrap(), 0x20);
        assert_eq!(sim.read(registers::STATUS2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn should_record_writes_in_order() {
        let sim = SimRegisters::new();

        sim.write(registers::SPK_VOL, 0x30).await.unwrap();
        sim.write(registers::MUTE_VOL_CTRL, 0x01).await.unwrap();
        sim.write(registers::SPK_VOL, 0x32).await.unwrap();

        assert_eq!(
            sim.writes(),
            vec![(0x0A, 0x30), (0x0E, 0x01), (0x0A, 0x32)]
        );
        assert_eq!(sim.writes_to(registers::SPK_VOL), vec![0x30, 0x32]);
    }

    #[tokio::test]
    async fn should_fail_injected_addresses_until_healed() {
        let sim = SimRegisters::new();
        sim.fail_writes(registers::SPK_VOL);

        assert!(sim.write(registers::SPK_VOL, 0x30).await.is_err());

        sim.heal();
        assert!(sim.write(registers::SPK_VOL, 0x30).await.is_ok());
    }
}
