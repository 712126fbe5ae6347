//! Wire formats of the chips behind the FMC CPLD.
//!
//! Every chip is reached through the same 32-bit payload register of the CPLD, but each family
//! packs address and value differently. The CPLD picks the chip from the selector code written to
//! its command register.

use crate::{
    bus::Direction,
    error::{
        Error,
        Result,
    },
};
use num_derive::FromPrimitive;
use std::fmt::Display;

/// The chips addressable through the CPLD, discriminants are the selector codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum DeviceTarget {
    /// First ADC12DJ3200
    Adc0 = 1,
    /// Second ADC12DJ3200
    Adc1 = 2,
    /// Both ADCs at once, write only
    AdcBoth = 3,
    /// LMX2581 synthesizer
    Lmx = 4,
    /// LMK04832 clock distribution
    Lmk = 8,
    /// HMC987 clock buffer, write only
    Hmc = 10,
}

impl Display for DeviceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DeviceTarget::Adc0 => "ADC0",
                DeviceTarget::Adc1 => "ADC1",
                DeviceTarget::AdcBoth => "ADC0/ADC1",
                DeviceTarget::Lmx => "LMX2581",
                DeviceTarget::Lmk => "LMK04832",
                DeviceTarget::Hmc => "HMC987",
            }
        )
    }
}

/// A payload ready to be shifted into the CPLD along with the command that launches it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub payload: u32,
    /// Selector code for the command register
    pub command: u8,
}

impl Encoded {
    /// Payload bytes in the order they are written to the payload registers
    #[must_use]
    pub fn bytes(&self) -> [u8; 4] {
        self.payload.to_le_bytes()
    }
}

/// How many times a read command has to be issued before the readback registers are valid
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadPhases {
    Single,
    /// The first issue selects the register, the second shifts it out
    Double,
}

impl ReadPhases {
    #[must_use]
    pub fn count(self) -> usize {
        match self {
            ReadPhases::Single => 1,
            ReadPhases::Double => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EncodedRead {
    pub request: Encoded,
    pub phases: ReadPhases,
}

const READ_FLAG: u32 = 1 << 31;

impl DeviceTarget {
    #[must_use]
    pub fn selector(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn supports_read(self) -> bool {
        !matches!(self, DeviceTarget::Hmc | DeviceTarget::AdcBoth)
    }

    /// Pack a register write. Address and value bits beyond each chip's field widths are dropped.
    #[must_use]
    pub fn encode_write(self, subaddress: u16, value: u32) -> Encoded {
        let addr = u32::from(subaddress);
        let payload = match self {
            DeviceTarget::Lmk => ((addr & 0x1FFF) << 16) | ((value & 0xFF) << 8),
            DeviceTarget::Lmx => (addr & 0xF) | ((value & 0xFFF_FFFF) << 4),
            DeviceTarget::Hmc => (1 << 16) | ((addr & 0xF) << 19) | ((value & 0x1FF) << 23),
            DeviceTarget::Adc0 | DeviceTarget::Adc1 | DeviceTarget::AdcBoth => {
                ((addr & 0x7FFF) << 16) | ((value & 0xFF) << 8)
            }
        };
        Encoded {
            payload,
            command: self.selector(),
        }
    }

    /// Pack a register read
    /// # Errors
    /// Returns [`Error::UnsupportedOperation`] for the write-only targets
    pub fn encode_read(self, subaddress: u16) -> Result<EncodedRead> {
        let addr = u32::from(subaddress);
        let (payload, phases) = match self {
            DeviceTarget::Lmk => (READ_FLAG | ((addr & 0x1FFF) << 16), ReadPhases::Single),
            // A write to R6 that selects `addr` for readback
            DeviceTarget::Lmx => (((addr & 0xF) << 5) | (1 << 10) | 6, ReadPhases::Double),
            DeviceTarget::Adc0 | DeviceTarget::Adc1 => {
                (READ_FLAG | ((addr & 0x7FFF) << 16), ReadPhases::Single)
            }
            DeviceTarget::Hmc | DeviceTarget::AdcBoth => {
                return Err(Error::UnsupportedOperation {
                    device: self,
                    operation: Direction::Read,
                })
            }
        };
        Ok(EncodedRead {
            request: Encoded {
                payload,
                command: self.selector(),
            },
            phases,
        })
    }

    /// Extract the register value from the four CPLD readback bytes
    /// # Errors
    /// Returns [`Error::UnsupportedOperation`] for the write-only targets
    pub fn decode_read_result(self, raw: [u8; 4]) -> Result<u32> {
        match self {
            DeviceTarget::Lmx => Ok(u32::from_le_bytes(raw) >> 4),
            DeviceTarget::Lmk | DeviceTarget::Adc0 | DeviceTarget::Adc1 => Ok(u32::from(raw[1])),
            DeviceTarget::Hmc | DeviceTarget::AdcBoth => Err(Error::UnsupportedOperation {
                device: self,
                operation: Direction::Read,
            }),
        }
    }

    /// Inverse of [`DeviceTarget::encode_write`], yielding `(subaddress, value)`
    #[must_use]
    pub fn decode_write(self, payload: u32) -> (u16, u32) {
        let (addr, value) = match self {
            DeviceTarget::Lmk => ((payload >> 16) & 0x1FFF, (payload >> 8) & 0xFF),
            DeviceTarget::Lmx => (payload & 0xF, (payload >> 4) & 0xFFF_FFFF),
            DeviceTarget::Hmc => ((payload >> 19) & 0xF, (payload >> 23) & 0x1FF),
            DeviceTarget::Adc0 | DeviceTarget::Adc1 | DeviceTarget::AdcBoth => {
                ((payload >> 16) & 0x7FFF, (payload >> 8) & 0xFF)
            }
        };
        // Every address field is at most 15 bits wide
        (addr as u16, value)
    }

    /// Whether an LMK or ADC payload carries the read flag
    #[must_use]
    pub fn is_read_request(self, payload: u32) -> bool {
        match self {
            DeviceTarget::Lmk | DeviceTarget::Adc0 | DeviceTarget::Adc1 => {
                payload & READ_FLAG != 0
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;
    use paste::paste;

    macro_rules! test_write_round_trip {
        ($device:ident, $addr:literal, $value:literal) => {
            paste! {
                #[test]
                fn [<test_round_trip_ $device:lower>]() {
                    let encoded = DeviceTarget::$device.encode_write($addr, $value);
                    assert_eq!(encoded.command, DeviceTarget::$device as u8);
                    assert_eq!(
                        DeviceTarget::$device.decode_write(encoded.payload),
                        ($addr, $value)
                    );
                }
            }
        };
    }

    test_write_round_trip!(Lmk, 0x16E, 0x12);
    test_write_round_trip!(Lmx, 13, 0x408_0C10);
    test_write_round_trip!(Hmc, 5, 0x3A);
    test_write_round_trip!(Adc0, 0x2B7, 0x01);
    test_write_round_trip!(Adc1, 0x6A, 0xFF);
    test_write_round_trip!(AdcBoth, 0x7FFF, 0xB0);

    #[test]
    fn test_lmk_write_payload() {
        let encoded = DeviceTarget::Lmk.encode_write(0x100, 0x0A);
        assert_eq!(encoded.payload, 0x0100_0A00);
        assert_eq!(encoded.bytes(), [0x00, 0x0A, 0x00, 0x01]);
        assert_eq!(encoded.command, 8);
    }

    #[test]
    fn test_hmc_write_payload() {
        // reg2 = 0x91
        let encoded = DeviceTarget::Hmc.encode_write(2, 0x91);
        assert_eq!(encoded.payload, (1 << 16) | (2 << 19) | (0x91 << 23));
        assert_eq!(encoded.command, 10);
    }

    #[test]
    fn test_fields_are_masked() {
        assert_eq!(
            DeviceTarget::Lmk.encode_write(0xE100, 0x10A).payload,
            0x0100_0A00
        );
        assert_eq!(DeviceTarget::Lmx.encode_write(0x1D, 0).payload, 0xD);
        assert_eq!(
            DeviceTarget::Adc0.encode_write(0x8030, 0x1FF).payload,
            0x0030_FF00
        );
    }

    #[test]
    fn test_read_requests() {
        let read = DeviceTarget::Lmk.encode_read(0x183).unwrap();
        assert_eq!(read.request.payload, 0x8183_0000);
        assert_eq!(read.phases, ReadPhases::Single);
        let read = DeviceTarget::Adc1.encode_read(0x2B4).unwrap();
        assert_eq!(read.request.payload, 0x82B4_0000);
        assert_eq!(read.request.command, 2);
        let read = DeviceTarget::Lmx.encode_read(5).unwrap();
        assert_eq!(read.request.payload, (5 << 5) | (1 << 10) | 6);
        assert_eq!(read.phases.count(), 2);
        // As seen by the synth, the read request is itself a write to R6
        assert_eq!(DeviceTarget::Lmx.decode_write(read.request.payload).0, 6);
    }

    #[test]
    fn test_unsupported_reads() {
        for device in [DeviceTarget::Hmc, DeviceTarget::AdcBoth] {
            assert!(!device.supports_read());
            assert!(matches!(
                device.encode_read(0),
                Err(Error::UnsupportedOperation {
                    operation: Direction::Read,
                    ..
                })
            ));
            assert!(device.decode_read_result([0; 4]).is_err());
        }
    }

    #[test]
    fn test_decode_read_results() {
        let raw = [0x35, 0x02, 0x77, 0x10];
        assert_eq!(DeviceTarget::Lmk.decode_read_result(raw).unwrap(), 0x02);
        assert_eq!(DeviceTarget::Adc0.decode_read_result(raw).unwrap(), 0x02);
        assert_eq!(
            DeviceTarget::Lmx.decode_read_result(raw).unwrap(),
            0x1077_0235 >> 4
        );
    }

    #[test]
    fn test_selectors() {
        for device in [
            DeviceTarget::Adc0,
            DeviceTarget::Adc1,
            DeviceTarget::AdcBoth,
            DeviceTarget::Lmx,
            DeviceTarget::Lmk,
            DeviceTarget::Hmc,
        ] {
            assert_eq!(DeviceTarget::from_u8(device.selector()), Some(device));
        }
        assert_eq!(DeviceTarget::from_u8(0), None);
        assert_eq!(DeviceTarget::from_u8(5), None);
    }
}
