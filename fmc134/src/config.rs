//! Bring-up configuration.
//!
//! Defaults match the stock FMC134 setup: external 100 MHz reference, 3.2 GS/s, foreground
//! calibration, single channel on inputs A0/A2, full-scale range at its maximum.

use crate::{
    adc::{
        AdcInitSequencer,
        CalibrationMode,
        InputChannel,
        DEFAULT_FULL_SCALE_RANGE,
    },
    bus::{
        IndirectBus,
        PollPolicy,
        DEFAULT_PROXY,
        DEFAULT_TARGET_BASE,
    },
    clocktree::{
        ClockMode,
        ClockTreeSequencer,
        DEFAULT_SAMPLING_RATE_WORD,
    },
    cpld::DEFAULT_CPLD_BASE,
    router::{
        MuxPort,
        DEFAULT_MUX_REGISTER,
    },
    transport::Transport,
};
use kstring::KString;
use std::time::Duration;

/// Errors from parsing configuration names
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown {kind} `{value}`")]
    Unknown { kind: &'static str, value: String },
}

/// How the board-level bring-up retries a failed stage
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per stage, at least one is always made
    pub max_attempts: usize,
    /// Wait between attempts
    pub backoff: Duration,
    /// Return the first failure instead of retrying
    pub abort_on_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_millis(1),
            abort_on_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringupConfig {
    /// Name of the register proxy block
    pub proxy: KString,
    /// Base of the I2C block behind the proxy
    pub target_base: u32,
    pub mux_register: u32,
    pub cpld_base: u32,
    /// Segment the FMC134 sits on
    pub port: MuxPort,
    pub clock_mode: ClockMode,
    /// LMX2581 R0
    pub sampling_rate_word: u32,
    pub full_scale_range: u8,
    pub calibration: CalibrationMode,
    pub dual_channel: bool,
    pub input: InputChannel,
    pub tx_emphasis: u8,
    pub poll: PollPolicy,
    pub retry: RetryPolicy,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            proxy: KString::from_static(DEFAULT_PROXY),
            target_base: DEFAULT_TARGET_BASE,
            mux_register: DEFAULT_MUX_REGISTER,
            cpld_base: DEFAULT_CPLD_BASE,
            port: MuxPort::PrimaryFmc,
            clock_mode: ClockMode::ExternalReference,
            sampling_rate_word: DEFAULT_SAMPLING_RATE_WORD,
            full_scale_range: DEFAULT_FULL_SCALE_RANGE,
            calibration: CalibrationMode::Foreground,
            dual_channel: false,
            input: InputChannel::A0_2,
            tx_emphasis: 0,
            poll: PollPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BringupConfig {
    #[must_use]
    pub fn clock_tree(&self) -> ClockTreeSequencer {
        ClockTreeSequencer::new(self.clock_mode).with_sampling_rate_word(self.sampling_rate_word)
    }

    #[must_use]
    pub fn adc_init(&self) -> AdcInitSequencer {
        AdcInitSequencer {
            calibration: self.calibration,
            dual_channel: self.dual_channel,
            input: self.input,
            full_scale_range: self.full_scale_range,
            tx_emphasis: self.tx_emphasis,
        }
    }

    /// A bus over `transport` with this configuration's proxy, window and polling
    pub fn bus<T: Transport>(&self, transport: T) -> IndirectBus<T> {
        IndirectBus::new(transport, &self.proxy)
            .with_target_base(self.target_base)
            .with_policy(self.poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BringupConfig::default();
        assert_eq!(config.proxy, "i2c_proxy");
        assert_eq!(config.cpld_base, 0x2800);
        let clock_tree = config.clock_tree();
        assert_eq!(clock_tree.mode, ClockMode::ExternalReference);
        assert_eq!(clock_tree.sampling_rate_word, 0x602_0000);
        let adc = config.adc_init();
        assert_eq!(adc, AdcInitSequencer::default());
        assert_eq!(config.poll.max_attempts, Some(10_000));
    }

    #[test]
    fn test_overrides() -> anyhow::Result<()> {
        let config = BringupConfig {
            port: "SFP".parse()?,
            clock_mode: "internal".parse()?,
            calibration: "BG_CAL".parse()?,
            input: "CHAN_A1_3".parse()?,
            dual_channel: true,
            ..Default::default()
        };
        assert_eq!(config.port, MuxPort::Sfp);
        assert_eq!(config.clock_tree().mode, ClockMode::InternalReference);
        let adc = config.adc_init();
        assert_eq!(adc.calibration, CalibrationMode::Background);
        assert_eq!(adc.jmode(), (0x10, 0x02));
        Ok(())
    }

    #[test]
    fn test_parse_error_message() {
        let err = "FG".parse::<CalibrationMode>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown calibration mode `FG`");
    }
}
