//! Bit-field definitions of the chip and CPLD registers the bring-up manipulates by field.
//!
//! Registers written as plain bytes from the sequence tables have no definition here.

use fmc134_derive::{
    address,
    RegisterByte,
};
use packed_struct::prelude::*;

/// Registers that live at a fixed sub-address of their chip (or of the CPLD window)
pub trait Address {
    const ADDRESS: u16;
}

/// One-byte registers, as carried in a chip transaction
pub trait RegisterByte: Sized {
    /// # Errors
    /// Returns an error if a field doesn't fit its bits
    fn to_byte(&self) -> Result<u8, PackingError>;
    /// # Errors
    /// Returns an error on an invalid enum discriminant
    fn from_byte(byte: u8) -> Result<Self, PackingError>;
}

// ---- FMC CPLD

/// Reset lines and sample clock routing
#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x04)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct CpldControl1 {
    /// Holds ADC0 in reset
    #[packed_field(bits = "0")]
    pub adc0_reset: bool,
    /// Holds ADC1 in reset
    #[packed_field(bits = "1")]
    pub adc1_reset: bool,
    /// Routes the LMX synthesizer to the sample clock
    #[packed_field(bits = "2")]
    pub internal_sample_clock: bool,
    /// Holds the LMK04832 in reset
    #[packed_field(bits = "3")]
    pub clock_chip_reset: bool,
    #[packed_field(bits = "4..=7")]
    pub reserved: Integer<u8, packed_bits::Bits<4>>,
}

// ---- LMK04832

#[derive(PrimitiveEnum_u8, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Disabled = 0,
    SyncPin = 1,
    PulserPin = 2,
    PulserSpi = 3,
}

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x143)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct SyncControl {
    #[packed_field(bits = "0..=1", ty = "enum")]
    pub sync_mode: SyncMode,
    #[packed_field(bits = "2")]
    pub sync_pll1_dld: bool,
    #[packed_field(bits = "3")]
    pub sync_pll2_dld: bool,
    #[packed_field(bits = "4")]
    pub sync_en: bool,
    #[packed_field(bits = "5")]
    pub sync_pol: bool,
    #[packed_field(bits = "6")]
    pub sync_1shot_en: bool,
    /// Holds the SYSREF dividers in reset
    #[packed_field(bits = "7")]
    pub sysref_clr: bool,
}

impl SyncControl {
    /// SYNC armed from the pin, SYSREF held clear
    #[must_use]
    pub fn armed() -> Self {
        Self {
            sync_mode: SyncMode::SyncPin,
            sync_en: true,
            sync_1shot_en: true,
            sysref_clr: true,
            ..Default::default()
        }
    }

    /// Armed with the polarity inverted, which fires the SYNC
    #[must_use]
    pub fn asserted() -> Self {
        Self {
            sync_pol: true,
            ..Self::armed()
        }
    }

    /// SYNC from the pin disabled, SYSREF running
    #[must_use]
    pub fn released() -> Self {
        Self {
            sync_en: true,
            sync_1shot_en: true,
            ..Default::default()
        }
    }
}

#[derive(PrimitiveEnum_u8, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum SysrefSource {
    #[default]
    NormalSync = 0,
    ReClocked = 1,
    Pulser = 2,
    Continuous = 3,
}

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x139)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct SysrefMux {
    #[packed_field(bits = "0..=1", ty = "enum")]
    pub sysref_mux: SysrefSource,
}

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x173)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct Pll2Misc {
    #[packed_field(bits = "5")]
    pub pll2_pd: bool,
    #[packed_field(bits = "6")]
    pub pll2_prescaler_pd: bool,
}

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x183)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct Pll2LockDetect {
    /// Clears the sticky lock-lost flag while set
    #[packed_field(bits = "0")]
    pub clear: bool,
    #[packed_field(bits = "1")]
    pub locked: bool,
}

// ---- ADC12DJ3200

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x2B4)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct SysrefCalStatus {
    #[packed_field(bits = "0")]
    pub busy: bool,
    #[packed_field(bits = "1")]
    pub done: bool,
}

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x6A)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct CalStatus {
    #[packed_field(bits = "0")]
    pub fg_done: bool,
}

#[derive(Debug, PackedStruct, RegisterByte, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x6C)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct CalTrigger {
    /// Foreground calibration starts on the rising edge
    #[packed_field(bits = "0")]
    pub soft_trigger: bool,
}
