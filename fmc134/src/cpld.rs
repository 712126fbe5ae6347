//! The FMC CPLD that bridges the proxied I2C window to the SPI chips of the FMC134.
//!
//! A chip access is four payload byte writes followed by a write of the chip's selector code to
//! the command register. Reads land in the four readback byte registers.

use crate::{
    bus::IndirectBus,
    clocktree::ClockMode,
    codec::{
        DeviceTarget,
        Encoded,
        ReadPhases,
    },
    error::Result,
    registers::{
        Address,
        CpldControl1,
        RegisterByte,
    },
    sequence::Step,
    sleep::Sleep,
    transport::Transport,
};
use std::time::Duration;
use tracing::debug;

/// Offset of the CPLD window in the proxied address space
pub const DEFAULT_CPLD_BASE: u32 = 0x2800;

pub const COMMAND: u32 = 0x00;
pub const CONTROL1: u32 = CpldControl1::ADDRESS as u32;
pub const CONTROL2: u32 = 0x08;
/// First of the four payload byte registers, least significant byte first
pub const PAYLOAD: u32 = 0x18;
/// First of the four readback byte registers
pub const READBACK: u32 = 0x28;

/// Time the CPLD needs to shift a transaction out to its chip
pub const TRANSACTION_SETTLE: Duration = Duration::from_millis(10);

/// The CPLD, borrowed for the duration of a sequence
#[derive(Debug)]
pub struct Fmc134Cpld<'a, T, S> {
    bus: &'a mut IndirectBus<T, S>,
    base: u32,
}

impl<'a, T, S> Fmc134Cpld<'a, T, S>
where
    T: Transport,
    S: Sleep,
{
    pub fn new(bus: &'a mut IndirectBus<T, S>, base: u32) -> Self {
        Self { bus, base }
    }

    pub fn bus(&mut self) -> &mut IndirectBus<T, S> {
        self.bus
    }

    pub fn sleep(&self, duration: Duration) {
        self.bus.sleep(duration);
    }

    /// Write one of the CPLD's own byte registers
    /// # Errors
    /// Returns an error on bus failure
    pub fn write_register(&mut self, offset: u32, value: u8) -> Result<()> {
        self.bus.write(self.base.wrapping_add(offset), u32::from(value))
    }

    /// Read one of the CPLD's own byte registers
    /// # Errors
    /// Returns an error on bus failure
    pub fn read_register(&mut self, offset: u32) -> Result<u8> {
        Ok((self.bus.read(self.base.wrapping_add(offset))? & 0xFF) as u8)
    }

    fn issue(&mut self, encoded: Encoded) -> Result<()> {
        for (i, byte) in (0u32..).zip(encoded.bytes()) {
            self.write_register(PAYLOAD + 4 * i, byte)?;
        }
        self.write_register(COMMAND, encoded.command)?;
        self.bus.sleep(TRANSACTION_SETTLE);
        Ok(())
    }

    /// Write `value` to the register `subaddress` of `device`
    /// # Errors
    /// Returns an error on bus failure
    pub fn write(&mut self, device: DeviceTarget, subaddress: u16, value: u32) -> Result<()> {
        debug!("{device} {subaddress:#05x} <- {value:#x}");
        self.issue(device.encode_write(subaddress, value))
    }

    /// Read the register `subaddress` of `device`
    /// # Errors
    /// Returns an error for the write-only targets (before any bus traffic) or on bus failure
    pub fn read(&mut self, device: DeviceTarget, subaddress: u16) -> Result<u32> {
        let read = device.encode_read(subaddress)?;
        self.issue(read.request)?;
        // Later phases re-strobe the command over the payload already loaded
        for _ in 1..read.phases.count() {
            self.write_register(COMMAND, read.request.command)?;
            self.bus.sleep(TRANSACTION_SETTLE);
        }
        let raw = match read.phases {
            // Only the second readback byte carries data
            ReadPhases::Single => [0, self.read_register(READBACK + 4)?, 0, 0],
            ReadPhases::Double => [
                self.read_register(READBACK)?,
                self.read_register(READBACK + 4)?,
                self.read_register(READBACK + 8)?,
                self.read_register(READBACK + 12)?,
            ],
        };
        let value = device.decode_read_result(raw)?;
        debug!("{device} {subaddress:#05x} -> {value:#x}");
        Ok(value)
    }

    /// Write a bit-field register to its own address on `device`
    /// # Errors
    /// Returns an error on packing or bus failure
    pub fn write_reg<R>(&mut self, device: DeviceTarget, reg: &R) -> Result<()>
    where
        R: Address + RegisterByte,
    {
        let byte = reg.to_byte()?;
        self.write(device, R::ADDRESS, u32::from(byte))
    }

    /// Read a bit-field register from its own address on `device`
    /// # Errors
    /// Returns an error on unpacking or bus failure
    pub fn read_reg<R>(&mut self, device: DeviceTarget) -> Result<R>
    where
        R: Address + RegisterByte,
    {
        let raw = self.read(device, R::ADDRESS)?;
        Ok(R::from_byte((raw & 0xFF) as u8)?)
    }

    /// Write a table of steps to `device` in order, honoring each settle time
    /// # Errors
    /// Stops at the first failing write
    pub fn apply(&mut self, device: DeviceTarget, steps: &[Step]) -> Result<()> {
        for step in steps {
            self.write(device, step.address, step.value)?;
            if !step.settle.is_zero() {
                self.bus.sleep(step.settle);
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn control1(&mut self) -> Result<CpldControl1> {
        let raw = self.read_register(CONTROL1)?;
        Ok(CpldControl1::from_byte(raw)?)
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn set_control1(&mut self, ctrl: CpldControl1) -> Result<()> {
        let byte = ctrl.to_byte()?;
        self.write_register(CONTROL1, byte)
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn control2(&mut self) -> Result<u8> {
        self.read_register(CONTROL2)
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn set_control2(&mut self, value: u8) -> Result<()> {
        self.write_register(CONTROL2, value)
    }

    /// Route the reference and sample clock for `mode`
    /// # Errors
    /// Returns an error on bus failure
    pub fn select_reference(&mut self, mode: ClockMode) -> Result<()> {
        let current = self.control2()?;
        self.set_control2(mode.reference_control(current))?;
        let mut ctrl = self.control1()?;
        ctrl.internal_sample_clock = mode.internal_sample_clock();
        self.set_control1(ctrl)
    }

    /// Pulse the reset line of the LMK04832
    /// # Errors
    /// Returns an error on bus failure
    pub fn reset_clock_chip(&mut self) -> Result<()> {
        let mut ctrl = self.control1()?;
        ctrl.clock_chip_reset = true;
        self.set_control1(ctrl)?;
        ctrl.clock_chip_reset = false;
        self.set_control1(ctrl)
    }

    /// Take both ADCs out of reset
    /// # Errors
    /// Returns an error on bus failure
    pub fn release_adc_resets(&mut self) -> Result<()> {
        let mut ctrl = self.control1()?;
        ctrl.adc0_reset = false;
        ctrl.adc1_reset = false;
        self.set_control1(ctrl)
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
        emulator::{
            ChipOp,
            Event,
            Fmc134Emulator,
        },
        Error,
    };

    fn bus(emulator: Fmc134Emulator) -> IndirectBus<Fmc134Emulator, impl Sleep> {
        let sleeper = emulator.sleeper();
        IndirectBus::new(emulator, DEFAULT_PROXY).with_sleeper(sleeper)
    }

    fn write(address: u32, value: u32) -> Transaction {
        Transaction {
            address,
            value,
            direction: Direction::Write,
        }
    }

    #[test]
    fn test_lmk_write_end_to_end() {
        let emulator = Fmc134Emulator::new();
        let events = emulator.events();
        let mut bus = bus(emulator);
        Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE)
            .write(DeviceTarget::Lmk, 0x100, 0x0A)
            .unwrap();
        assert_eq!(
            events.transactions(),
            vec![
                write(0x2818, 0x00),
                write(0x281C, 0x0A),
                write(0x2820, 0x00),
                write(0x2824, 0x01),
                write(0x2800, 8),
            ]
        );
        // The settle comes after the command
        assert_eq!(
            events.snapshot().last(),
            Some(&Event::Sleep(TRANSACTION_SETTLE))
        );
        assert_eq!(bus.transport().lmk_register(0x100), Some(0x0A));
    }

    #[test]
    fn test_lmk_and_adc_reads() {
        let mut bus = bus(Fmc134Emulator::new());
        let mut cpld = Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE);
        cpld.write(DeviceTarget::Lmk, 0x148, 0x33).unwrap();
        assert_eq!(cpld.read(DeviceTarget::Lmk, 0x148).unwrap(), 0x33);
        cpld.write(DeviceTarget::AdcBoth, 0x30, 0xA5).unwrap();
        cpld.write(DeviceTarget::Adc1, 0x31, 0x5A).unwrap();
        assert_eq!(cpld.read(DeviceTarget::Adc0, 0x30).unwrap(), 0xA5);
        assert_eq!(cpld.read(DeviceTarget::Adc1, 0x30).unwrap(), 0xA5);
        assert_eq!(cpld.read(DeviceTarget::Adc1, 0x31).unwrap(), 0x5A);
        assert_eq!(cpld.read(DeviceTarget::Adc0, 0x31).unwrap(), 0x00);
    }

    #[test]
    fn test_lmx_read_restrobes_command_only() {
        let emulator = Fmc134Emulator::new();
        let events = emulator.events();
        let mut bus = bus(emulator);
        let mut cpld = Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE);
        cpld.write(DeviceTarget::Lmx, 7, 0x004_E211).unwrap();
        events.clear();
        assert_eq!(cpld.read(DeviceTarget::Lmx, 7).unwrap(), 0x004_E211);
        let writes_and_settles: Vec<_> = events
            .snapshot()
            .into_iter()
            .filter(|e| match e {
                Event::Transaction(t) => t.direction == Direction::Write,
                Event::Sleep(d) => *d == TRANSACTION_SETTLE,
                Event::Chip(_) => false,
            })
            .collect();
        // R6 readback select of R7 is 0x4E6, loaded once
        assert_eq!(
            writes_and_settles,
            vec![
                Event::Transaction(write(0x2818, 0xE6)),
                Event::Transaction(write(0x281C, 0x04)),
                Event::Transaction(write(0x2820, 0x00)),
                Event::Transaction(write(0x2824, 0x00)),
                Event::Transaction(write(0x2800, 4)),
                Event::Sleep(TRANSACTION_SETTLE),
                Event::Transaction(write(0x2800, 4)),
                Event::Sleep(TRANSACTION_SETTLE),
            ]
        );
    }

    #[test]
    fn test_register_address_wraps() {
        let emulator = Fmc134Emulator::new();
        let events = emulator.events();
        let mut bus = bus(emulator);
        Fmc134Cpld::new(&mut bus, u32::MAX - 3)
            .write_register(CONTROL2, 0x5A)
            .unwrap();
        assert_eq!(events.transactions(), vec![write(0x04, 0x5A)]);
    }

    #[test]
    fn test_unsupported_read_sends_nothing() {
        let emulator = Fmc134Emulator::new();
        let events = emulator.events();
        let mut bus = bus(emulator);
        let mut cpld = Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE);
        for device in [DeviceTarget::Hmc, DeviceTarget::AdcBoth] {
            assert!(matches!(
                cpld.read(device, 1),
                Err(Error::UnsupportedOperation { .. })
            ));
        }
        assert!(events.snapshot().is_empty());
    }

    #[test]
    fn test_apply_honors_settle() {
        let emulator = Fmc134Emulator::new();
        let events = emulator.events();
        let mut bus = bus(emulator);
        let steps = [
            Step::write(0, 1).then_wait(300),
            Step::write(1, 1),
        ];
        Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE)
            .apply(DeviceTarget::Hmc, &steps)
            .unwrap();
        let ops: Vec<_> = events
            .snapshot()
            .into_iter()
            .filter(|e| {
                matches!(e, Event::Chip(_)) || *e == Event::Sleep(Duration::from_millis(300))
            })
            .collect();
        assert_eq!(
            ops,
            vec![
                Event::Chip(ChipOp::write(DeviceTarget::Hmc, 0, 1)),
                Event::Sleep(Duration::from_millis(300)),
                Event::Chip(ChipOp::write(DeviceTarget::Hmc, 1, 1)),
            ]
        );
    }

    #[test]
    fn test_select_reference() {
        let cases = [
            (ClockMode::InternalReference, 0x40, 0x4B, 0x04),
            (ClockMode::ExternalClockSource, 0x40, 0xC4, 0x00),
            (ClockMode::ExternalReference, 0x40, 0xCC, 0x04),
            (ClockMode::ExternalReferenceStacked, 0x40, 0xCD, 0x04),
        ];
        for (mode, initial2, expected2, expected1) in cases {
            let mut bus = bus(Fmc134Emulator::new().with_cpld_control(0x04, initial2));
            Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE)
                .select_reference(mode)
                .unwrap();
            assert_eq!(bus.transport().control2(), expected2, "{mode:?}");
            assert_eq!(bus.transport().control1(), expected1, "{mode:?}");
        }
    }

    #[test]
    fn test_reset_lines() {
        let emulator = Fmc134Emulator::new().with_cpld_control(0x07, 0x00);
        let events = emulator.events();
        let mut bus = bus(emulator);
        let mut cpld = Fmc134Cpld::new(&mut bus, DEFAULT_CPLD_BASE);
        cpld.reset_clock_chip().unwrap();
        let control_writes: Vec<_> = events
            .transactions()
            .into_iter()
            .filter(|t| {
                t.address == DEFAULT_CPLD_BASE + CONTROL1 && t.direction == Direction::Write
            })
            .map(|t| t.value)
            .collect();
        assert_eq!(control_writes, vec![0x0F, 0x07]);
        cpld.release_adc_resets().unwrap();
        assert_eq!(bus.transport().control1(), 0x04);
    }
}
