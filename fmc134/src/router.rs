//! The I2C mux in front of the FMC sites and the SFP cages

use crate::{
    bus::IndirectBus,
    config::ParseError,
    error::Result,
    sleep::Sleep,
    transport::Transport,
};
use std::{
    fmt::Display,
    str::FromStr,
};
use tracing::debug;

/// Mux register in the proxied address space
pub const DEFAULT_MUX_REGISTER: u32 = 0x0000;

/// The downstream segments of the mux
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum MuxPort {
    #[default]
    PrimaryFmc,
    SecondaryFmc,
    Sfp,
    LocalBus,
}

impl MuxPort {
    /// The one-hot bitmask that enables this segment
    #[must_use]
    pub fn mask(self) -> u32 {
        match self {
            MuxPort::PrimaryFmc => 1,
            MuxPort::SecondaryFmc => 2,
            MuxPort::Sfp => 4,
            MuxPort::LocalBus => 8,
        }
    }
}

impl FromStr for MuxPort {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "primaryfmc" => MuxPort::PrimaryFmc,
            "secondaryfmc" => MuxPort::SecondaryFmc,
            "sfp" => MuxPort::Sfp,
            "localbus" => MuxPort::LocalBus,
            _ => {
                return Err(ParseError::Unknown {
                    kind: "mux port",
                    value: s.to_owned(),
                })
            }
        })
    }
}

impl Display for MuxPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MuxPort::PrimaryFmc => "PrimaryFmc",
                MuxPort::SecondaryFmc => "SecondaryFmc",
                MuxPort::Sfp => "SFP",
                MuxPort::LocalBus => "LocalBus",
            }
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct I2cRouter {
    register: u32,
}

impl Default for I2cRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MUX_REGISTER)
    }
}

impl I2cRouter {
    #[must_use]
    pub fn new(register: u32) -> Self {
        Self { register }
    }

    /// Route subsequent transactions to `port`
    /// # Errors
    /// Returns an error on bus failure
    pub fn select<T, S>(&self, bus: &mut IndirectBus<T, S>, port: MuxPort) -> Result<()>
    where
        T: Transport,
        S: Sleep,
    {
        debug!(%port, "Selecting I2C segment");
        bus.write(self.register, port.mask())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{
            Direction,
            Transaction,
            DEFAULT_PROXY,
        },
        emulator::Fmc134Emulator,
    };
    use paste::paste;

    macro_rules! test_port {
        ($port:ident, $mask:literal) => {
            paste! {
                #[test]
                fn [<test_select_ $port:snake>]() {
                    assert_eq!(MuxPort::$port.mask(), $mask);
                    let emulator = Fmc134Emulator::new();
                    let events = emulator.events();
                    let sleeper = emulator.sleeper();
                    let mut bus = IndirectBus::new(emulator, DEFAULT_PROXY).with_sleeper(sleeper);
                    I2cRouter::default().select(&mut bus, MuxPort::$port).unwrap();
                    assert_eq!(
                        events.transactions(),
                        vec![Transaction {
                            address: 0x0000,
                            value: $mask,
                            direction: Direction::Write,
                        }]
                    );
                    assert_eq!(bus.transport().mux(), $mask);
                    let name = MuxPort::$port.to_string();
                    assert_eq!(name.parse::<MuxPort>().unwrap(), MuxPort::$port);
                }
            }
        };
    }

    test_port!(PrimaryFmc, 1);
    test_port!(SecondaryFmc, 2);
    test_port!(Sfp, 4);
    test_port!(LocalBus, 8);

    #[test]
    fn test_unknown_port() {
        assert!(matches!(
            "TertiaryFmc".parse::<MuxPort>(),
            Err(ParseError::Unknown { kind: "mux port", .. })
        ));
    }
}
