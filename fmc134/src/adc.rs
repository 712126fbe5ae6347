//! Bring-up of the two ADC12DJ3200 and their JESD204B links.
//!
//! Must run after the clock tree, SYSREF from the LMK04832 has to be running for the SYSREF
//! calibration to finish.

use crate::{
    codec::DeviceTarget,
    config::ParseError,
    cpld::Fmc134Cpld,
    error::{
        AdcInitError,
        Result,
    },
    registers::{
        Address,
        CalStatus,
        CalTrigger,
        RegisterByte,
        SysrefCalStatus,
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
    debug,
    info,
    instrument,
    warn,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CalibrationMode {
    None,
    /// One-shot calibration at startup, polled until done
    #[default]
    Foreground,
    /// Continuous calibration while sampling
    Background,
}

impl FromStr for CalibrationMode {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "NO_CAL" | "NONE" => CalibrationMode::None,
            "FG_CAL" | "FOREGROUND" => CalibrationMode::Foreground,
            "BG_CAL" | "BACKGROUND" => CalibrationMode::Background,
            _ => {
                return Err(ParseError::Unknown {
                    kind: "calibration mode",
                    value: s.to_owned(),
                })
            }
        })
    }
}

impl Display for CalibrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                CalibrationMode::None => "NO_CAL",
                CalibrationMode::Foreground => "FG_CAL",
                CalibrationMode::Background => "BG_CAL",
            }
        )
    }
}

impl CalibrationMode {
    /// Value of the calibration configuration register (0x62), if it is written at all
    #[must_use]
    pub fn config_value(self) -> Option<u32> {
        match self {
            CalibrationMode::None => None,
            CalibrationMode::Foreground => Some(0x01),
            CalibrationMode::Background => Some(0x02),
        }
    }
}

/// Analog input pair digitized by each ADC
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum InputChannel {
    #[default]
    A0_2,
    A1_3,
}

impl FromStr for InputChannel {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "CHAN_A0_2" | "A0_2" => InputChannel::A0_2,
            "CHAN_A1_3" | "A1_3" => InputChannel::A1_3,
            _ => {
                return Err(ParseError::Unknown {
                    kind: "input channel",
                    value: s.to_owned(),
                })
            }
        })
    }
}

impl Display for InputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InputChannel::A0_2 => "CHAN_A0_2",
                InputChannel::A1_3 => "CHAN_A1_3",
            }
        )
    }
}

pub const RESET_SETTLE: Duration = Duration::from_millis(2);
pub const SYSREF_CAL_WAIT: Duration = Duration::from_millis(500);
pub const FG_CAL_POLL: Duration = Duration::from_millis(500);
pub const FG_CAL_ATTEMPTS: u32 = 100;
pub const FINAL_SETTLE: Duration = Duration::from_millis(5);
pub const DEFAULT_FULL_SCALE_RANGE: u8 = 0xFF;

const JMODE: u16 = 0x0060;
const CAL_EN: u16 = 0x0061;
const CAL_CFG0: u16 = 0x0062;
const JESD_EN: u16 = 0x0200;
const JESD_MODE: u16 = 0x0201;
const FS_RANGE: u16 = 0x0030;
const SYSREF_PROCESSOR: u16 = 0x0029;
const SER_PE: u16 = 0x0048;

/// Soft reset, LVPECL clock, SYSREF and timestamp inputs
const INPUTS: &[Step] = steps![(0x0000, 0xB0), (0x002A, 0x06), (0x003B, 0x02)];
/// Inverts the ADC0 sample clock
const ADC0_CLOCK_INVERT: Step = Step::write(0x02B7, 0x01);
const SYSREF_PROCESSOR_ON: &[Step] = steps![(SYSREF_PROCESSOR, 0x20), (SYSREF_PROCESSOR, 0x60)];
/// JESD and calibration held off while the SYSREF calibration runs, 256 averages
const SYSREF_CALIBRATION: &[Step] = &[
    Step::write(JESD_EN, 0x00),
    Step::write(CAL_EN, 0x00),
    Step::write(0x02B1, 0x0F),
    Step {
        settle: SYSREF_CAL_WAIT,
        ..Step::write(0x02B0, 0x01)
    },
];
/// K = 16, offset binary with the scrambler on
const JESD_FORMAT: &[Step] = steps![(0x0202, 0x0F), (0x0204, 0x01)];

/// LMK04832 SYSREF outputs to ADC0 and ADC1
const LMK_SYSREF_OUTPUTS: &[Step] = steps![(0x12F, 0x00), (0x117, 0x00)];

/// Initializes both ADCs the same way
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdcInitSequencer {
    pub calibration: CalibrationMode,
    /// Dual channel (JMODE 2) instead of single channel (JMODE 0)
    pub dual_channel: bool,
    pub input: InputChannel,
    /// Written to all four bytes of FS_RANGE
    pub full_scale_range: u8,
    /// Serializer pre-emphasis, 0 to 0xF
    pub tx_emphasis: u8,
}

impl Default for AdcInitSequencer {
    fn default() -> Self {
        Self {
            calibration: CalibrationMode::default(),
            dual_channel: false,
            input: InputChannel::default(),
            full_scale_range: DEFAULT_FULL_SCALE_RANGE,
            tx_emphasis: 0,
        }
    }
}

impl AdcInitSequencer {
    /// JMODE register value and JESD mode value
    #[must_use]
    pub fn jmode(&self) -> (u32, u32) {
        match (self.dual_channel, self.input) {
            (true, InputChannel::A0_2) => (0x00, 0x02),
            (true, InputChannel::A1_3) => (0x10, 0x02),
            (false, InputChannel::A0_2) => (0x01, 0x00),
            (false, InputChannel::A1_3) => (0x02, 0x00),
        }
    }

    /// Run every phase in order
    /// # Errors
    /// Stops on the first bus error or calibration failure
    #[instrument(skip_all, fields(calibration = %self.calibration, dual = self.dual_channel))]
    pub fn run<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        self.release_resets(cpld)?;
        self.configure_inputs(cpld)?;
        self.sysref_calibration(cpld)?;
        self.configure_jesd(cpld)?;
        self.set_full_scale_range(cpld)?;
        if self.calibration == CalibrationMode::Foreground {
            self.foreground_calibration(cpld)?;
        }
        self.finish(cpld)?;
        info!("ADC initialization done");
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn release_resets<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.release_adc_resets()?;
        cpld.sleep(RESET_SETTLE);
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn configure_inputs<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.apply(DeviceTarget::AdcBoth, INPUTS)?;
        cpld.apply(DeviceTarget::Adc0, &[ADC0_CLOCK_INVERT])?;
        cpld.apply(DeviceTarget::AdcBoth, SYSREF_PROCESSOR_ON)?;
        info!("ADC inputs configured");
        Ok(())
    }

    /// Run the SYSREF calibration and check it finished on both ADCs
    /// # Errors
    /// Returns [`AdcInitError::SysrefCalibration`] for the first ADC that isn't done
    pub fn sysref_calibration<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.apply(DeviceTarget::AdcBoth, SYSREF_CALIBRATION)?;
        for adc in [DeviceTarget::Adc0, DeviceTarget::Adc1] {
            let status = (cpld.read(adc, SysrefCalStatus::ADDRESS)? & 0xFF) as u8;
            if SysrefCalStatus::from_byte(status)?.done {
                info!("{adc} SYSREF calibration done");
            } else {
                warn!(status, "{adc} SYSREF calibration not done");
                return Err(AdcInitError::SysrefCalibration { adc, status }.into());
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn configure_jesd<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        if let Some(value) = self.calibration.config_value() {
            cpld.write(DeviceTarget::AdcBoth, CAL_CFG0, value)?;
        }
        let (jmode, jesd_mode) = self.jmode();
        cpld.write(DeviceTarget::AdcBoth, JMODE, jmode)?;
        cpld.write(DeviceTarget::AdcBoth, JESD_MODE, jesd_mode)?;
        cpld.apply(DeviceTarget::AdcBoth, JESD_FORMAT)?;
        if self.calibration != CalibrationMode::None {
            cpld.write(DeviceTarget::AdcBoth, CAL_EN, 0x01)?;
        }
        cpld.write(DeviceTarget::AdcBoth, JESD_EN, 0x01)?;
        info!(jmode, "JESD configured");
        Ok(())
    }

    /// Program the full-scale range and read it back from both ADCs, which also proves both are
    /// reachable. Returns what each ADC reported.
    /// # Errors
    /// Returns an error on bus failure
    pub fn set_full_scale_range<T, S>(
        &self,
        cpld: &mut Fmc134Cpld<'_, T, S>,
    ) -> Result<[[u8; 4]; 2]>
    where
        T: Transport,
        S: Sleep,
    {
        let fsr = u32::from(self.full_scale_range);
        for offset in 0..4 {
            cpld.write(DeviceTarget::AdcBoth, FS_RANGE + offset, fsr)?;
        }
        let mut readback = [[0u8; 4]; 2];
        for (adc, bytes) in [DeviceTarget::Adc0, DeviceTarget::Adc1]
            .into_iter()
            .zip(readback.iter_mut())
        {
            for (offset, byte) in (0u16..).zip(bytes.iter_mut()) {
                *byte = (cpld.read(adc, FS_RANGE + offset)? & 0xFF) as u8;
            }
            if bytes.iter().all(|b| *b == self.full_scale_range) {
                debug!(?bytes, "{adc} full-scale range");
            } else {
                warn!(?bytes, expected = self.full_scale_range, "{adc} full-scale range mismatch");
            }
        }
        Ok(readback)
    }

    /// Trigger the foreground calibration and wait for both ADCs to finish
    /// # Errors
    /// Returns [`AdcInitError::ForegroundCalibration`] for the first ADC that doesn't finish in
    /// [`FG_CAL_ATTEMPTS`] polls
    pub fn foreground_calibration<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        for soft_trigger in [false, true] {
            cpld.write_reg(DeviceTarget::AdcBoth, &CalTrigger { soft_trigger })?;
            let trigger: CalTrigger = cpld.read_reg(DeviceTarget::Adc0)?;
            debug!(soft_trigger = trigger.soft_trigger, "Calibration trigger readback");
        }
        for adc in [DeviceTarget::Adc0, DeviceTarget::Adc1] {
            let mut status = 0;
            let mut done = false;
            for attempt in 1..=FG_CAL_ATTEMPTS {
                cpld.sleep(FG_CAL_POLL);
                status = (cpld.read(adc, CalStatus::ADDRESS)? & 0xFF) as u8;
                if CalStatus::from_byte(status)?.fg_done {
                    info!(attempt, "{adc} foreground calibration done");
                    done = true;
                    break;
                }
                debug!(attempt, status, "{adc} foreground calibration not done");
            }
            if !done {
                warn!(status, "{adc} foreground calibration timed out");
                return Err(AdcInitError::ForegroundCalibration {
                    adc,
                    attempts: FG_CAL_ATTEMPTS,
                    status,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Set the serializer pre-emphasis and turn SYSREF off now that the links are aligned
    /// # Errors
    /// Returns an error on bus failure
    pub fn finish<T, S>(&self, cpld: &mut Fmc134Cpld<'_, T, S>) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        cpld.sleep(FINAL_SETTLE);
        cpld.write(DeviceTarget::AdcBoth, SER_PE, u32::from(self.tx_emphasis))?;
        cpld.write(DeviceTarget::AdcBoth, SYSREF_PROCESSOR, 0x00)?;
        cpld.apply(DeviceTarget::Lmk, LMK_SYSREF_OUTPUTS)?;
        Ok(())
    }
}
