//! Bring-up of the FMC134 clock tree.
//!
//! The LMX2581 synthesizes the 3.2 GHz sample clock (or is bypassed by an external clock), the
//! HMC987 fans it out, and the LMK04832 derives the device clocks and SYSREF for the ADCs and
//! the FPGA. The order of the phases below is fixed.

use crate::{
    codec::DeviceTarget,
    config::ParseError,
    cpld::Fmc134Cpld,
    error::{
        Error,
        Result,
    },
    registers::{
        Address,
        Pll2LockDetect,
        Pll2Misc,
        RegisterByte,
        SyncControl,
        SysrefMux,
        SysrefSource,
    },
    sequence::{
        steps,
        Step,
    },
    sleep::Sleep,
    transport::Transport,
};
use std::{
    fmt::Display,
    str::FromStr,
    time::Duration,
};
use tracing::{
    info,
    instrument,
    warn,
};

/// Where the sample clock and the reference come from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ClockMode {
    /// Onboard oscillator feeding the LMX, LMK PLL2 active
    InternalReference,
    /// Sample clock supplied directly on the external clock input
    ExternalClockSource,
    /// External 100 MHz reference feeding the LMX
    #[default]
    ExternalReference,
    /// External reference with the onboard oscillator also running
    ExternalReferenceStacked,
}

impl FromStr for ClockMode {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "internal" | "internal_ref" | "0" => ClockMode::InternalReference,
            "external_clock" | "external_clk" | "1" => ClockMode::ExternalClockSource,
            "external_ref" | "external" | "2" => ClockMode::ExternalReference,
            "stacked" | "external_ref_stacked" | "3" => ClockMode::ExternalReferenceStacked,
            _ => {
                return Err(ParseError::Unknown {
                    kind: "clock mode",
                    value: s.to_owned(),
                })
            }
        })
    }
}

impl Display for ClockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ClockMode::InternalReference => "internal",
                ClockMode::ExternalClockSource => "external_clock",
                ClockMode::ExternalReference => "external_ref",
                ClockMode::ExternalReferenceStacked => "stacked",
            }
        )
    }
}

impl ClockMode {
    /// New value of CPLD control register 2 given its `current` value
    #[must_use]
    pub fn reference_control(self, current: u8) -> u8 {
        match self {
            // Oscillator, reference switch and LMX enable
            ClockMode::InternalReference => current | 0x0B,
            ClockMode::ExternalClockSource => 0xC4,
            ClockMode::ExternalReference => 0xCC,
            ClockMode::ExternalReferenceStacked => 0xCD,
        }
    }

    /// Whether the sample clock comes from the LMX (CPLD control 1, bit 2)
    #[must_use]
    pub fn internal_sample_clock(self) -> bool {
        !matches!(self, ClockMode::ExternalClockSource)
    }

    /// Only the internal reference runs the LMK's PLL2
    #[must_use]
    pub fn uses_pll2(self) -> bool {
        matches!(self, ClockMode::InternalReference)
    }
}

/// Outcome of a clock tree bring-up that didn't fail outright
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClockTreeStatus {
    /// PLL2 reported lock
    Locked,
    /// PLL2 is bypassed in this clock mode
    LockNotChecked,
    /// PLL2 lost lock within the observation window
    Pll2Unlocked { status: u8 },
}

impl ClockTreeStatus {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !matches!(self, ClockTreeStatus::Pll2Unlocked { .. })
    }

    /// Escalate an unlocked PLL2 to an error
    /// # Errors
    /// Returns [`Error::Pll2Unlocked`]
    pub fn require_locked(self) -> Result<Self> {
        match self {
            ClockTreeStatus::Pll2Unlocked { status } => Err(Error::Pll2Unlocked { status }),
            ok => Ok(ok),
        }
    }
}

pub const REFERENCE_SETTLE: Duration = Duration::from_millis(100);
pub const CLOCK_CHIP_RESET_SETTLE: Duration = Duration::from_millis(5);
pub const PLL2_SETTLE: Duration = Duration::from_millis(100);
/// How long PLL2 has to stay locked
pub const LOCK_OBSERVATION: Duration = Duration::from_millis(500);
pub const SYNC_PULSE: Duration = Duration::from_millis(10);

/// R0 for a 3.2 GHz sample clock from a 100 MHz reference
pub const DEFAULT_SAMPLING_RATE_WORD: u32 = 0x602_0000;

pub const LMX_FORCE_RESET: Step = Step::write(5, 0x408_7001);

/// LMX2581 frequency plan, R13 down to R1
pub const LMX_PLAN: &[Step] = steps![
    (13, 0x408_0C10),
    (10, 0x210_050C),
    (9, 0x03C_7C03),
    (8, 0x207_DDBF),
    (7, 0x004_E211),
    (6, 0x000_004C),
    (5, 0x003_0808),
    (4, 0x000_0000),
    (3, 0x200_40BE),
    (2, 0x0FD_0902),
    (1, 0xF80_0001),
];

/// R0 is written twice, the second time after the VCO has settled
pub const LMX_VCO_SETTLE: Duration = Duration::from_millis(300);

/// HMC987: out of reset, chip enable, buffers 1, 5 and 8, input termination, gain, biases
pub const HMC_SETUP: &[Step] = steps![
    (0x0, 0x01),
    (0x1, 0x01),
    (0x2, 0x91),
    (0x3, 0x1A),
    (0x4, 0x00),
    (0x5, 0x3A),
];

/// Soft reset, 4-wire SPI, readback on CLKin_SEL0, powerdown off
pub const LMK_PRELUDE: &[Step] = steps![
    (0x000, 0x80),
    (0x000, 0x00),
    (0x000, 0x10),
    (0x148, 0x33),
    (0x002, 0x00),
];

/// The seven clock output pairs
pub const LMK_OUTPUTS: &[Step] = steps![
    // DCLK0/1, 320 MHz LVDS
    (0x100, 0x0A),
    (0x101, 0x00),
    (0x102, 0x70),
    (0x103, 0x40),
    (0x104, 0x00),
    (0x105, 0x00),
    (0x106, 0x00),
    (0x107, 0x11),
    // DCLK2/3, 160 MHz LVDS
    (0x108, 0x14),
    (0x109, 0x00),
    (0x10A, 0x70),
    (0x10B, 0x40),
    (0x10C, 0x20),
    (0x10D, 0x00),
    (0x10E, 0x00),
    (0x10F, 0x11),
    // SYSREF to ADC1 on CLKout5
    (0x110, 0x20),
    (0x111, 0x00),
    (0x112, 0x70),
    (0x113, 0x40),
    (0x114, 0x20),
    (0x115, 0x00),
    (0x116, 0x00),
    (0x117, 0x60),
    (0x118, 0x02),
    (0x119, 0x00),
    (0x11A, 0x70),
    (0x11B, 0x48),
    (0x11C, 0x30),
    (0x11D, 0x00),
    (0x11E, 0x00),
    (0x11F, 0x00),
    (0x120, 0x02),
    (0x121, 0x00),
    (0x122, 0x70),
    (0x123, 0x48),
    (0x124, 0x30),
    (0x125, 0x00),
    (0x126, 0x00),
    (0x127, 0x00),
    // SYSREF to ADC0 on CLKout11
    (0x128, 0x20),
    (0x129, 0x00),
    (0x12A, 0x70),
    (0x12B, 0x40),
    (0x12C, 0x20),
    (0x12D, 0x00),
    (0x12E, 0x00),
    (0x12F, 0x60),
    (0x130, 0x0A),
    (0x131, 0x00),
    (0x132, 0x70),
    (0x133, 0x40),
    (0x134, 0x00),
    (0x135, 0x00),
    (0x136, 0x00),
    (0x137, 0x11),
];

/// VCO mux, SYSREF divider and delay, PLL2 feedback and sync controls
pub const LMK_SYSREF: &[Step] = steps![
    (0x138, 0x40),
    (0x139, 0x03),
    (0x13A, 0x01),
    (0x13B, 0x40),
    (0x13C, 0x00),
    (0x13D, 0x08),
    (0x13E, 0x00),
    (0x13F, 0x00),
    (0x140, 0xF1),
    (0x141, 0x00),
    (0x142, 0x00),
    (0x143, 0x70),
    (0x144, 0xFF),
    (0x145, 0x00),
    (0x146, 0x00),
];

/// Manual CLKin1 select, internal reference only
pub const LMK_REFERENCE_MUX: Step = Step::write(0x147, 0x10);

/// Holdover, PLL1 and PLL2 dividers, loop filter and LD2 mux
pub const LMK_PLL: &[Step] = steps![
    (0x148, 0x33),
    (0x149, 0x00),
    (0x14A, 0x00),
    (0x14B, 0x02),
    (0x14C, 0x00),
    (0x14D, 0x00),
    (0x14E, 0x00),
    (0x14F, 0x7F),
    (0x150, 0x00),
    (0x151, 0x02),
    (0x152, 0x00),
    (0x153, 0x00),
    (0x154, 0x80),
    (0x155, 0x00),
    (0x156, 0x80),
    (0x157, 0x03),
    (0x158, 0xE8),
    (0x159, 0x00),
    (0x15A, 0x05),
    (0x15B, 0xF4),
    (0x15C, 0x20),
    (0x15D, 0x00),
    (0x15E, 0x00),
    (0x15F, 0x03),
    (0x160, 0x00),
    (0x161, 0x04),
    (0x162, 0xCC),
    (0x163, 0x00),
    (0x164, 0x00),
    (0x165, 0x04),
    // Out of order as required by the LMK04832 programming sequence
    (0x145, 0x00),
    (0x171, 0xAA),
    (0x171, 0x02),
    (0x17C, 0x15),
    (0x17D, 0x33),
    // PLL2 N divider, the write to 0x168 starts the VCO calibration
    (0x166, 0x00),
    (0x167, 0x00),
    (0x168, 0x04),
    (0x169, 0x49),
    (0x16A, 0x00),
    (0x16B, 0x20),
    (0x16C, 0x00),
    (0x16D, 0x00),
    (0x16E, 0x12),
];

/// Writes that disable the DCLK sync
const DCLK_SYNC: u16 = 0x144;

/// Programs the clock tree for one [`ClockMode`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ClockTreeSequencer {
    pub mode: ClockMode,
    /// Value of LMX2581 R0
    pub sampling_rate_word: u32,
}

impl Default for ClockTreeSequencer {
    fn default() -> Self {
        Self::new(ClockMode::default())
    }
}

impl ClockTreeSequencer {
    #[must_use]
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            sampling_rate_word: DEFAULT_SAMPLING_RATE_WORD,
        }
    }

    #[must_use]
    pub fn with_sampling_rate_word(mut self, word: u32) -> Self {
        self.sampling_rate_word = word;
        self
    }

    /// Run every phase in order
    /// # Errors
    /// Stops on the first bus error. An unlocked PLL2 is not an error here, see
    /// [`ClockTreeStatus::require_locked`].
    #[instrument(skip_all, fields(mode = %self.mode))]
    pub fn run<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<ClockTreeStatus>
    where
        T: Transport,
        S: Sleep,
    {
        self.select_reference(cpld)?;
        self.program_synth(cpld)?;
        self.program_buffer(cpld)?;
        self.program_distribution(cpld)?;
        self.power_pll2(cpld)?;
        let status = self.check_lock(cpld)?;
        self.sync_outputs(cpld)?;
        match status {
            ClockTreeStatus::Pll2Unlocked { status } => {
                warn!(status, "Clock tree programmed but LMK PLL2 is not locked");
            }
            _ => info!(?status, "Clock tree programmed"),
        }
        Ok(status)
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn select_reference<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.select_reference(self.mode)?;
        cpld.sleep(REFERENCE_SETTLE);
        info!("Reference selected");
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn program_synth<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.apply(DeviceTarget::Lmx, &[LMX_FORCE_RESET])?;
        cpld.apply(DeviceTarget::Lmx, LMX_PLAN)?;
        let r0 = Step::write(0, self.sampling_rate_word);
        let settled = Step {
            settle: LMX_VCO_SETTLE,
            ..r0
        };
        cpld.apply(DeviceTarget::Lmx, &[settled, r0])?;
        info!("LMX2581 programmed");
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn program_buffer<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.apply(DeviceTarget::Hmc, HMC_SETUP)?;
        info!("HMC987 programmed");
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn program_distribution<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.reset_clock_chip()?;
        cpld.sleep(CLOCK_CHIP_RESET_SETTLE);
        cpld.apply(DeviceTarget::Lmk, LMK_PRELUDE)?;
        cpld.apply(DeviceTarget::Lmk, LMK_OUTPUTS)?;
        cpld.apply(DeviceTarget::Lmk, LMK_SYSREF)?;
        if self.mode.uses_pll2() {
            cpld.apply(DeviceTarget::Lmk, &[LMK_REFERENCE_MUX])?;
        }
        cpld.apply(DeviceTarget::Lmk, LMK_PLL)?;
        info!("LMK04832 programmed");
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn power_pll2<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        let misc = if self.mode.uses_pll2() {
            Pll2Misc::default()
        } else {
            Pll2Misc {
                pll2_pd: true,
                pll2_prescaler_pd: true,
            }
        };
        cpld.write_reg(DeviceTarget::Lmk, &misc)?;
        cpld.sleep(PLL2_SETTLE);
        Ok(())
    }

    /// Clear the sticky lock flags, then watch PLL2 if it is in use
    /// # Errors
    /// Returns an error on bus failure
    pub fn check_lock<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<ClockTreeStatus>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.write_reg(
            DeviceTarget::Lmk,
            &Pll2LockDetect {
                clear: true,
                locked: false,
            },
        )?;
        cpld.write_reg(DeviceTarget::Lmk, &Pll2LockDetect::default())?;
        if !self.mode.uses_pll2() {
            return Ok(ClockTreeStatus::LockNotChecked);
        }
        cpld.sleep(LOCK_OBSERVATION);
        let status = (cpld.read(DeviceTarget::Lmk, Pll2LockDetect::ADDRESS)? & 0xFF) as u8;
        if Pll2LockDetect::from_byte(status)?.locked {
            info!("LMK PLL2 locked");
            Ok(ClockTreeStatus::Locked)
        } else {
            warn!(status, "LMK PLL2 not locked");
            Ok(ClockTreeStatus::Pll2Unlocked { status })
        }
    }

    /// Synchronize the output dividers and leave SYSREF running
    /// # Errors
    /// Returns an error on bus failure
    pub fn sync_outputs<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.write_reg(DeviceTarget::Lmk, &SyncControl::armed())?;
        cpld.write_reg(DeviceTarget::Lmk, &SysrefMux::default())?;
        cpld.write(DeviceTarget::Lmk, DCLK_SYNC, 0x00)?;
        cpld.write_reg(DeviceTarget::Lmk, &SyncControl::asserted())?;
        cpld.sleep(SYNC_PULSE);
        cpld.write_reg(DeviceTarget::Lmk, &SyncControl::armed())?;
        cpld.write(DeviceTarget::Lmk, DCLK_SYNC, 0xFF)?;
        cpld.write_reg(
            DeviceTarget::Lmk,
            &SysrefMux {
                sysref_mux: SysrefSource::Continuous,
            },
        )?;
        cpld.write_reg(DeviceTarget::Lmk, &SyncControl::released())?;
        info!("Output dividers synchronized");
        Ok(())
    }
}
