//! Prelude (helpful reexports) for this package

pub use crate::{
    adc::{
        AdcInitSequencer,
        CalibrationMode,
        InputChannel,
    },
    board::{
        Fmc134,
        Fmc134Guard,
    },
    bus::{
        IndirectBus,
        PollPolicy,
    },
    clocktree::{
        ClockMode,
        ClockTreeSequencer,
        ClockTreeStatus,
    },
    codec::DeviceTarget,
    config::{
        BringupConfig,
        RetryPolicy,
    },
    cpld::Fmc134Cpld,
    router::{
        I2cRouter,
        MuxPort,
    },
    sleep::Sleep,
    transport::Transport,
};
