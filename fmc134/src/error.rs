//! Errors surfaced by the bus protocol and the bring-up sequences

use crate::{
    bus::{
        Direction,
        Transaction,
    },
    codec::DeviceTarget,
    transport,
};

/// Failures of the ADC initialization sequence. Both stop the sequence where they are detected.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcInitError {
    #[error("{adc} SYSREF calibration not done (status {status:#04x})")]
    SysrefCalibration { adc: DeviceTarget, status: u8 },
    #[error("{adc} foreground calibration not done after {attempts} polls (status {status:#04x})")]
    ForegroundCalibration {
        adc: DeviceTarget,
        attempts: u32,
        status: u8,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error from the register transport")]
    Transport(#[from] transport::Error),
    #[error("Indirect bus transaction did not complete after {attempts} polls: {transaction}")]
    TransactionTimeout {
        transaction: Transaction,
        attempts: u32,
    },
    #[error("Register proxy did not echo the probe pattern (read back {readback:#010x})")]
    ProxyMissing { readback: u32 },
    #[error("{operation} is not supported by the {device}")]
    UnsupportedOperation {
        device: DeviceTarget,
        operation: Direction,
    },
    #[error("ADC initialization failed")]
    AdcInit(#[from] AdcInitError),
    #[error("LMK PLL2 is not locked (lock detect readback {status:#04x})")]
    Pll2Unlocked { status: u8 },
    #[error("Register packing failed")]
    Packing(#[from] packed_struct::PackingError),
    #[error("The bus lock was poisoned by a panicking holder")]
    Poisoned,
    #[error("{stage} did not succeed after {attempts} attempts")]
    Exhausted {
        stage: &'static str,
        attempts: usize,
        #[source]
        last: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
