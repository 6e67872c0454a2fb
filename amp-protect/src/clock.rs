//! Clock source bookkeeping and PLL configuration.
//!
//! When the amplifier synthesises its system clock with the PLL, the
//! divider set depends on the reference frequency, which is either the
//! external MCLK or the serial bit clock derived from the stream format.
//! A format change therefore means a power cycle: stop, reprogram, start.

use serde::Serialize;
use strum::{Display, EnumString};

use crate::config::InterfaceFormat;
use crate::error::{Error, Result};
use crate::protection::ProtectionController;
use crate::regmap::registers::{self, input1_ctrl1, system_ctrl, top_man1, top_man3};
use crate::sequencer::PowerSequencer;
use crate::tracing::prelude::*;

/// Where the amplifier's system clock comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[strum(serialize_all = "kebab-case")]
pub enum ClockSource {
    External19_2,
    External24_576,
    PllFromMclk,
    PllFromBclk,
}

impl ClockSource {
    /// Decode the numeric clock id used by the audio framework.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(ClockSource::External19_2),
            1 => Some(ClockSource::External24_576),
            2 => Some(ClockSource::PllFromMclk),
            3 => Some(ClockSource::PllFromBclk),
            _ => None,
        }
    }

    pub fn uses_pll(self) -> bool {
        matches!(self, ClockSource::PllFromMclk | ClockSource::PllFromBclk)
    }

    /// True when the clock is fed in from outside and must be brought up
    /// before the amplifier is powered.
    pub fn is_external(self) -> bool {
        self != ClockSource::PllFromBclk
    }
}

/// Accepted MCLK range for the PLL reference (Hz).
pub const MCLK_RANGE: std::ops::RangeInclusive<u32> = 1_536_000..=24_576_000;

/// PLL divider set for one reference frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PllEntry {
    pub input_name: &'static str,
    pub output_name: &'static str,
    pub input_hz: u32,
    pub post_n: u8,
    pub n: u8,
    pub f1: u8,
    pub f2: u8,
    pub f3_p_cp: u8,
}

const fn pll(
    input_name: &'static str,
    output_name: &'static str,
    input_hz: u32,
    coefficients: [u8; 5],
) -> PllEntry {
    let [post_n, n, f1, f2, f3_p_cp] = coefficients;
    PllEntry {
        input_name,
        output_name,
        input_hz,
        post_n,
        n,
        f1,
        f2,
        f3_p_cp,
    }
}

pub const PLL_TABLE: [PllEntry; 7] = [
    pll("1.411MHz", "24.595MHz", 1_411_200, [0x07, 0xF4, 0x00, 0x00, 0x03]),
    pll("1.536MHz", "24.576MHz", 1_536_000, [0x07, 0xE0, 0x00, 0x00, 0x03]),
    pll("3.072MHz", "24.576MHz", 3_072_000, [0x07, 0x70, 0x00, 0x00, 0x03]),
    pll("6.144MHz", "24.576MHz", 6_144_000, [0x07, 0x70, 0x00, 0x00, 0x07]),
    pll("12.288MHz", "24.576MHz", 12_288_000, [0x07, 0x70, 0x00, 0x00, 0x0B]),
    pll("19.2MHz", "24.343MHz", 19_200_000, [0x07, 0x47, 0x00, 0x00, 0x0A]),
    pll("24.576MHz", "24.576MHz", 24_576_000, [0x07, 0x70, 0x00, 0x00, 0x0F]),
];

/// Entry used when no row matches the reference frequency.
pub const PLL_DEFAULT_INDEX: usize = 1;

/// Result of a PLL table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PllSelection {
    pub index: usize,
    pub entry: &'static PllEntry,
    /// False when the default entry was substituted.
    pub exact: bool,
}

pub fn select_pll(reference_hz: u32) -> PllSelection {
    match PLL_TABLE.iter().position(|e| e.input_hz == reference_hz) {
        Some(index) => PllSelection {
            index,
            entry: &PLL_TABLE[index],
            exact: true,
        },
        None => PllSelection {
            index: PLL_DEFAULT_INDEX,
            entry: &PLL_TABLE[PLL_DEFAULT_INDEX],
            exact: false,
        },
    }
}

pub const SUPPORTED_RATES: [u32; 9] = [
    8000, 12000, 16000, 24000, 32000, 44100, 48000, 96000, 192000,
];

/// Rate above which the DAC down-converts and channel order flips.
const DOWN_CONVERSION_RATE: u32 = 192000;

/// Negotiated stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub rate: u32,
    /// Significant bits per sample.
    pub sample_bits: u32,
    /// Bits per sample slot on the wire.
    pub physical_bits: u32,
    pub channels: u32,
}

impl StreamFormat {
    pub fn new(rate: u32, sample_bits: u32, physical_bits: u32, channels: u32) -> Self {
        Self {
            rate,
            sample_bits,
            physical_bits,
            channels,
        }
    }

    /// `None` when the product does not fit the bit clock range.
    pub fn bit_clock_hz(&self) -> Option<u32> {
        self.rate
            .checked_mul(self.physical_bits)?
            .checked_mul(self.channels)
    }

    /// The part of the format the PLL depends on.
    pub fn clock_key(&self) -> ClockKey {
        ClockKey {
            rate: self.rate,
            physical_bits: self.physical_bits,
            channels: self.channels,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_RATES.contains(&self.rate) {
            return Err(Error::UnsupportedRate(self.rate));
        }
        if !matches!(self.sample_bits, 16 | 24) {
            return Err(Error::UnsupportedWidth(self.sample_bits));
        }
        Ok(())
    }

    fn input_mode(&self, interface: InterfaceFormat) -> u8 {
        match (interface, self.sample_bits) {
            (InterfaceFormat::I2s, _) => input1_ctrl1::STANDARD_I2S,
            (InterfaceFormat::LeftJustified, _) => input1_ctrl1::LJ,
            (InterfaceFormat::RightJustified, 16) => input1_ctrl1::RJ_16BIT,
            (InterfaceFormat::RightJustified, _) => input1_ctrl1::RJ_24BIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockKey {
    pub rate: u32,
    pub physical_bits: u32,
    pub channels: u32,
}

/// Applies clock configuration when the stream format is negotiated.
#[derive(Clone)]
pub struct ClockNegotiator {
    controller: ProtectionController,
    sequencer: PowerSequencer,
}

impl ClockNegotiator {
    pub fn new(controller: ProtectionController, sequencer: PowerSequencer) -> Self {
        Self {
            controller,
            sequencer,
        }
    }

    /// Select the system clock source.
    ///
    /// The id is validated first. An MCLK outside [`MCLK_RANGE`] falls back
    /// to the bit clock.
    pub async fn set_sysclk(&self, id: i32, freq_hz: u32) -> Result<()> {
        let Some(requested) = ClockSource::from_id(id) else {
            error!(id, "Invalid clock id");
            return Err(Error::InvalidClockSource(id));
        };

        if self.controller.lock().mclk_hz == freq_hz {
            debug!(freq_hz, "Clock frequency already set");
            return Ok(());
        }

        let (source, freq_hz) = match requested {
            ClockSource::PllFromMclk if !MCLK_RANGE.contains(&freq_hz) => {
                warn!(freq_hz, "MCLK out of PLL range, falling back to bit clock");
                (ClockSource::PllFromBclk, 0)
            }
            other => (other, freq_hz),
        };

        let regs = self.controller.registers();
        match source {
            ClockSource::External19_2 => {
                regs.update_bits(
                    registers::SYSTEM_CTRL,
                    system_ctrl::CLKSYSTEM_MASK,
                    system_ctrl::EXT_19_2,
                )
                .await?
            }
            ClockSource::External24_576 => {
                regs.update_bits(
                    registers::SYSTEM_CTRL,
                    system_ctrl::CLKSYSTEM_MASK,
                    system_ctrl::EXT_24_576,
                )
                .await?
            }
            ClockSource::PllFromMclk | ClockSource::PllFromBclk => {}
        }

        let mut state = self.controller.lock();
        state.clock_source = source;
        state.mclk_hz = freq_hz;
        info!(source = %source, freq_hz, "System clock selected");
        Ok(())
    }

    /// Apply a negotiated playback format.
    ///
    /// Unsupported rates and widths are rejected before any register is
    /// touched. When the PLL is in use and its reference changed, the
    /// amplifier is power-cycled around the PLL reprogramming, unless it is
    /// held in forced power-down.
    pub async fn negotiate(&self, format: StreamFormat) -> Result<()> {
        info!(
            rate = format.rate,
            sample_bits = format.sample_bits,
            physical_bits = format.physical_bits,
            channels = format.channels,
            "Negotiating stream format"
        );

        if let Err(e) = format.validate() {
            error!(error = %e, "Rejecting stream format");
            return Err(e);
        }

        let (forced, source, changed, interface) = {
            let state = self.controller.lock();
            (
                state.force_power_down,
                state.clock_source,
                state.last_clock_key != Some(format.clock_key()),
                state.interface_format,
            )
        };

        if !forced && source.uses_pll() && changed {
            self.sequencer.stop_immediately().await?;
            self.program_pll(&format).await?;
            self.sequencer.start().await?;
            self.controller.lock().last_clock_key = Some(format.clock_key());
        }

        if !forced && !self.controller.irq_enabled() {
            self.controller.set_irq_enabled(true);
            info!("Fault interrupt enabled");
        }

        let regs = self.controller.registers();
        let (down_conversion, channel_order) = if format.rate == DOWN_CONVERSION_RATE {
            (top_man1::DAC_DN_CONV, input1_ctrl1::HIGH_FIRST_CH)
        } else {
            (0, input1_ctrl1::LOW_FIRST_CH)
        };
        regs.update_bits(registers::TOP_MAN1, top_man1::DAC_DN_CONV, down_conversion)
            .await?;
        regs.update_bits(registers::INPUT1_CTRL1, input1_ctrl1::LEFTPOL, channel_order)
            .await?;
        regs.update_bits(
            registers::INPUT1_CTRL1,
            input1_ctrl1::I2S_MODE_MASK,
            format.input_mode(interface),
        )
        .await?;

        Ok(())
    }

    async fn program_pll(&self, format: &StreamFormat) -> Result<()> {
        let (source, mclk_hz) = {
            let state = self.controller.lock();
            (state.clock_source, state.mclk_hz)
        };
        let regs = self.controller.registers();

        let reference_hz = match source {
            ClockSource::PllFromMclk => {
                regs.update_bits(
                    registers::TOP_MAN1,
                    top_man1::PLL_SOURCE_MASK,
                    top_man1::PLL_FROM_MCLK,
                )
                .await?;
                Some(mclk_hz)
            }
            ClockSource::PllFromBclk => {
                regs.update_bits(
                    registers::TOP_MAN3,
                    top_man3::CLOCK_MON_SEL,
                    top_man3::CLOCK_MON_SCK,
                )
                .await?;
                regs.update_bits(
                    registers::TOP_MAN1,
                    top_man1::PLL_SOURCE_MASK,
                    top_man1::PLL_FROM_SCK,
                )
                .await?;
                format.bit_clock_hz()
            }
            ClockSource::External19_2 | ClockSource::External24_576 => return Ok(()),
        };

        let Some(reference_hz) = reference_hz else {
            warn!(
                rate = format.rate,
                physical_bits = format.physical_bits,
                channels = format.channels,
                "Bit clock out of range, using default PLL entry"
            );
            return self.write_pll(&PLL_TABLE[PLL_DEFAULT_INDEX]).await;
        };

        let selection = select_pll(reference_hz);
        if selection.exact {
            info!(
                reference_hz,
                input = selection.entry.input_name,
                output = selection.entry.output_name,
                "PLL configured"
            );
        } else {
            warn!(
                reference_hz,
                fallback = selection.entry.input_name,
                "No PLL entry matches reference clock, using default"
            );
        }

        self.write_pll(selection.entry).await
    }

    async fn write_pll(&self, entry: &PllEntry) -> Result<()> {
        let regs = self.controller.registers();
        regs.write(registers::PLL_POST_N, entry.post_n).await?;
        regs.write(registers::PLL_N, entry.n).await?;
        regs.write(registers::PLL_F1, entry.f1).await?;
        regs.write(registers::PLL_F2, entry.f2).await?;
        regs.write(registers::PLL_F3_P_CP, entry.f3_p_cp).await?;
        Ok(())
    }
}
