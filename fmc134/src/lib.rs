//! Monitor and control of the FMC134 digitizer mezzanine.
//!
//! The clock tree (LMX2581 synthesizer, HMC987 buffer, LMK04832 distribution chip) and the two
//! ADC12DJ3200 ADCs sit behind an FMC CPLD on an I2C segment. The FPGA reaches that segment through
//! a four register proxy, so every chip register access here is an [`bus::IndirectBus`]
//! transaction carrying a [`codec::DeviceTarget`] payload.

// The derive macros refer to this crate by name
extern crate self as fmc134;

pub mod adc;
pub mod board;
pub mod bus;
pub mod clocktree;
pub mod codec;
pub mod config;
pub mod core;
pub mod cpld;
#[cfg(any(test, feature = "emulator"))]
pub mod emulator;
pub mod error;
pub mod prelude;
pub mod registers;
pub mod router;
pub mod sequence;
pub mod sleep;
pub mod transport;

pub use error::{
    AdcInitError,
    Error,
    Result,
};
