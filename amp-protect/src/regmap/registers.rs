//! Register addresses and field definitions.
//!
//! Only the registers the protection runtime touches are listed here. Field
//! modules hold masks and encoded values for the register of the same name.

use bitflags::bitflags;

pub const SYSTEM_CTRL: u8 = 0x00;
pub const INPUT1_CTRL1: u8 = 0x01;
pub const INPUT1_CTRL3: u8 = 0x03;
pub const SPK_VOL: u8 = 0x0A;
pub const MUTE_VOL_CTRL: u8 = 0x0E;
pub const SYSTEM_CTRL1: u8 = 0x10;
pub const SYSTEM_CTRL2: u8 = 0x11;
pub const MODULATOR: u8 = 0x14;
pub const PLL_POST_N: u8 = 0x8B;
pub const PLL_N: u8 = 0x8C;
pub const PLL_F1: u8 = 0x8D;
pub const PLL_F2: u8 = 0x8E;
pub const PLL_F3_P_CP: u8 = 0x8F;
pub const TOP_MAN1: u8 = 0xA2;
pub const TOP_MAN3: u8 = 0xA7;
pub const TONE_GENERATOR: u8 = 0xA8;
pub const TONE_FINE_VOL: u8 = 0xA9;
pub const PLL_CTRL: u8 = 0xAC;
pub const TOP_MAN4: u8 = 0xAE;
pub const STATUS1: u8 = 0xFA;
pub const STATUS2: u8 = 0xFB;
pub const STATUS3: u8 = 0xFC;
pub const STATUS4: u8 = 0xFD;
pub const STATUS5: u8 = 0xFE;
pub const VERSION: u8 = 0xFF;

pub mod system_ctrl {
    pub const POWER: u8 = 1 << 0;
    pub const CLKSYSTEM_MASK: u8 = 7 << 5;
    pub const EXT_19_2: u8 = 3 << 5;
    pub const EXT_24_576: u8 = 4 << 5;
    /// Reset value: external 24.576 MHz clock, powered down.
    pub const DEFAULT: u8 = 0x80;
}

pub mod input1_ctrl1 {
    pub const I2S_MODE_MASK: u8 = 7 << 4;
    pub const STANDARD_I2S: u8 = 0 << 4;
    pub const LJ: u8 = 1 << 4;
    pub const RJ_16BIT: u8 = 4 << 4;
    pub const RJ_24BIT: u8 = 7 << 4;
    pub const LEFTPOL: u8 = 1 << 3;
    pub const LOW_FIRST_CH: u8 = 0;
    pub const HIGH_FIRST_CH: u8 = 1 << 3;
}

pub mod input1_ctrl3 {
    pub const ADD_TONE_VOL_DECREASE: u8 = 1 << 5;
}

pub mod mute_vol_ctrl {
    pub const SPK_MUTE: u8 = 1 << 0;
    /// Fast volume and mute slopes, speaker muted.
    pub const DEFAULT: u8 = 0xFF;
}

pub mod system_ctrl1 {
    pub const SPK_MODE_MASK: u8 = 7 << 2;
    pub const SPK_OFF: u8 = 0;
    pub const SPK_MONO: u8 = 1 << 2;
    pub const SPK_STEREO: u8 = 4 << 2;
}

pub mod system_ctrl2 {
    /// Bass off, EQ enabled.
    pub const DEFAULT: u8 = 0xA0;
    pub const MONOMIX: u8 = 1 << 0;
}

pub mod modulator {
    pub const REV0: u8 = 0x61;
    pub const REV1_PLUS: u8 = 0x0D;
}

pub mod top_man1 {
    pub const PLL_PD: u8 = 1 << 6;
    pub const MCLK_SEL: u8 = 1 << 5;
    pub const PLL_REF_CLK1: u8 = 1 << 4;
    pub const PLL_REF_CLK2: u8 = 1 << 3;
    pub const DAC_DN_CONV: u8 = 1 << 2;

    /// Every field that picks the PLL reference path.
    pub const PLL_SOURCE_MASK: u8 = PLL_PD | MCLK_SEL | PLL_REF_CLK1 | PLL_REF_CLK2;
    /// PLL running on the external MCLK reference.
    pub const PLL_FROM_MCLK: u8 = 0;
    /// PLL running on the serial bit clock.
    pub const PLL_FROM_SCK: u8 = PLL_REF_CLK2;
}

pub mod top_man3 {
    pub const CLOCK_MON_SEL: u8 = 1 << 5;
    pub const CLOCK_MON_SCK: u8 = 0;
}

pub mod tone_generator {
    pub const TONE_ON: u8 = 1 << 0;
    pub const TONE_FREQ_MASK: u8 = 15 << 1;
    pub const TONE_FREQ_50: u8 = 0;
}

pub mod tone_fine_vol {
    pub const TONE_VOL_MASK: u8 = 7;
    pub const TONE_VOL_M_36: u8 = 6;
    pub const TONE_VOL_OFF: u8 = 7;
}

pub mod pll_ctrl {
    pub const LDO_BYP_MASK: u8 = 7;
    pub const LDO_BYP_ENABLE: u8 = 0;
    pub const LDO_BYP_DISABLE: u8 = 7;
}

pub mod top_man4 {
    /// IRQ pin mode: normal drive when clear, high impedance when set.
    pub const DIS_IRQ: u8 = 1 << 6;
}

pub mod version {
    pub const DEVICE_ID: u8 = 27 << 3;
    pub const DEVICE_ID_MASK: u8 = 0xF8;
    pub const REV_NUM_MASK: u8 = 0x07;
}

bitflags! {
    /// STATUS1: over-temperature "OK" flags. A clear bit means the stage
    /// has tripped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status1: u8 {
        const OT1_OK = 1 << 7;
        const OT2_OK = 1 << 6;
    }
}

bitflags! {
    /// STATUS2: latched protection events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status2: u8 {
        const OCP_SPK = 1 << 5;
        const OCP_BST = 1 << 4;
        const UVLO_BST = 1 << 3;
        const CLOCK_MON = 1 << 0;
    }
}
