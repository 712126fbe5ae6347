//! A software model of an FMC134 behind the register proxy.
//!
//! The emulator is a [`Transport`] that implements the proxy CSRs, the I2C mux, the FMC CPLD and
//! enough of each chip to answer the reads the bring-up makes. Everything that reaches the far
//! side of the proxy is recorded in an [`EventLog`], interleaved with the waits of an
//! [`EmulatorSleeper`] sharing that log, so the exact order of transactions and delays can be
//! checked without sleeping.

use crate::{
    bus::{
        Direction,
        Transaction,
        ADDR,
        CMPL,
        DEFAULT_PROXY,
        DEFAULT_TARGET_BASE,
        RNW,
        VALU,
    },
    codec::DeviceTarget,
    cpld::{
        COMMAND,
        CONTROL1,
        CONTROL2,
        DEFAULT_CPLD_BASE,
        PAYLOAD,
        READBACK,
    },
    registers::{
        Address,
        CalStatus,
        Pll2LockDetect,
        SysrefCalStatus,
    },
    router::DEFAULT_MUX_REGISTER,
    sleep::Sleep,
    transport::{
        Error,
        Transport,
        TransportResult,
    },
};
use num_traits::FromPrimitive;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};
use tracing::{
    trace,
    warn,
};

const CSR_LEN: usize = 16;
const CPLD_WINDOW: u32 = 0x40;
/// R6 of the LMX2581 doubles as its readback select
const LMX_READBACK_SELECT: u16 = 6;

/// A chip register access as decoded by the CPLD
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChipOp {
    pub device: DeviceTarget,
    pub address: u16,
    pub value: u32,
    pub direction: Direction,
}

impl ChipOp {
    #[must_use]
    pub fn write(device: DeviceTarget, address: u16, value: u32) -> Self {
        Self {
            device,
            address,
            value,
            direction: Direction::Write,
        }
    }

    #[must_use]
    pub fn read(device: DeviceTarget, address: u16, value: u32) -> Self {
        Self {
            device,
            address,
            value,
            direction: Direction::Read,
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.direction == Direction::Write
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A proxied access, with the address relative to the proxied window
    Transaction(Transaction),
    Chip(ChipOp),
    Sleep(Duration),
}

/// Shared, ordered record of everything the emulator saw
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn events(&self) -> MutexGuard<'_, Vec<Event>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event) {
        self.events().push(event);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.events().clone()
    }

    #[must_use]
    pub fn transactions(&self) -> Vec<Transaction> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Transaction(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn chip_ops(&self) -> Vec<ChipOp> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Chip(op) => Some(*op),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Sleep(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events().clear();
    }
}

/// Records waits instead of blocking
#[derive(Debug, Clone)]
pub struct EmulatorSleeper {
    log: EventLog,
}

impl Sleep for EmulatorSleeper {
    fn sleep(&self, duration: Duration) {
        self.log.push(Event::Sleep(duration));
    }
}

#[derive(Debug)]
pub struct Fmc134Emulator {
    log: EventLog,
    proxy_name: &'static str,
    proxy_present: bool,
    csr: [u8; CSR_LEN],
    /// Completion checks left before the current transaction reports done
    pending_polls: u32,
    latency: u32,
    target_base: u32,
    memory: HashMap<u32, u32>,
    mux: u32,
    // CPLD
    cpld_base: u32,
    control1: u8,
    control2: u8,
    payload: [u8; 4],
    readback: [u8; 4],
    // Chips
    lmx: [u32; 16],
    lmx_last: Option<u32>,
    hmc: [u16; 16],
    lmk: HashMap<u16, u8>,
    adc: [HashMap<u16, u8>; 2],
    pll2_locked: bool,
    sysref_cal_done: [bool; 2],
    fg_cal_done: [bool; 2],
}

impl Default for Fmc134Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Fmc134Emulator {
    /// A healthy board: PLL2 locks and every calibration finishes
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: EventLog::default(),
            proxy_name: DEFAULT_PROXY,
            proxy_present: true,
            csr: [0; CSR_LEN],
            pending_polls: 0,
            latency: 0,
            target_base: DEFAULT_TARGET_BASE,
            memory: HashMap::new(),
            mux: 0,
            cpld_base: DEFAULT_CPLD_BASE,
            control1: 0,
            control2: 0,
            payload: [0; 4],
            readback: [0; 4],
            lmx: [0; 16],
            lmx_last: None,
            hmc: [0; 16],
            lmk: HashMap::new(),
            adc: [HashMap::new(), HashMap::new()],
            pll2_locked: true,
            sysref_cal_done: [true; 2],
            fg_cal_done: [true; 2],
        }
    }

    /// Number of completion checks that read zero before each transaction completes
    #[must_use]
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// The proxy CSRs ignore writes and read back zero
    #[must_use]
    pub fn without_proxy(mut self) -> Self {
        self.proxy_present = false;
        self
    }

    #[must_use]
    pub fn with_pll2_locked(mut self, locked: bool) -> Self {
        self.pll2_locked = locked;
        self
    }

    /// Only meaningful for `Adc0` and `Adc1`
    #[must_use]
    pub fn with_sysref_cal_done(mut self, adc: DeviceTarget, done: bool) -> Self {
        if let Some(i) = adc_index(adc) {
            self.sysref_cal_done[i] = done;
        }
        self
    }

    #[must_use]
    pub fn with_fg_cal_done(mut self, adc: DeviceTarget, done: bool) -> Self {
        if let Some(i) = adc_index(adc) {
            self.fg_cal_done[i] = done;
        }
        self
    }

    /// Initial values of the two CPLD control registers
    #[must_use]
    pub fn with_cpld_control(mut self, control1: u8, control2: u8) -> Self {
        self.control1 = control1;
        self.control2 = control2;
        self
    }

    /// Handle on the event log, valid after the emulator is moved into a bus
    #[must_use]
    pub fn events(&self) -> EventLog {
        self.log.clone()
    }

    /// A sleeper recording into this emulator's event log
    #[must_use]
    pub fn sleeper(&self) -> EmulatorSleeper {
        EmulatorSleeper {
            log: self.log.clone(),
        }
    }

    #[must_use]
    pub fn mux(&self) -> u32 {
        self.mux
    }

    #[must_use]
    pub fn control1(&self) -> u8 {
        self.control1
    }

    #[must_use]
    pub fn control2(&self) -> u8 {
        self.control2
    }

    #[must_use]
    pub fn lmk_register(&self, address: u16) -> Option<u8> {
        self.lmk.get(&address).copied()
    }

    #[must_use]
    pub fn lmx_register(&self, address: u16) -> u32 {
        self.lmx[usize::from(address & 0xF)]
    }

    #[must_use]
    pub fn hmc_register(&self, address: u16) -> u16 {
        self.hmc[usize::from(address & 0xF)]
    }

    /// Last value written to `address` of a single ADC
    #[must_use]
    pub fn adc_register(&self, adc: DeviceTarget, address: u16) -> Option<u8> {
        adc_index(adc).and_then(|i| self.adc[i].get(&address).copied())
    }

    fn csr_word(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.csr[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn set_csr_word(&mut self, offset: usize, value: u32) {
        self.csr[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn check_access(&self, register: &str, offset: usize, len: usize) -> TransportResult<()> {
        if register != self.proxy_name {
            return Err(Error::MissingRegister(register.to_owned()));
        }
        match offset.checked_add(len) {
            Some(end) if end <= CSR_LEN => Ok(()),
            _ => Err(Error::OutOfBounds {
                register: register.to_owned(),
                offset,
                len,
            }),
        }
    }

    /// Run the transaction described by the CSRs
    fn launch(&mut self) {
        let address = self.csr_word(ADDR).wrapping_sub(self.target_base);
        if self.csr_word(RNW) & 1 == 0 {
            let value = self.csr_word(VALU);
            self.remote_write(address, value);
        } else {
            let value = self.remote_read(address);
            self.set_csr_word(VALU, value);
        }
        self.set_csr_word(CMPL, 1);
        self.pending_polls = self.latency;
    }

    fn cpld_offset(&self, address: u32) -> Option<u32> {
        address
            .checked_sub(self.cpld_base)
            .filter(|off| *off < CPLD_WINDOW)
    }

    fn remote_write(&mut self, address: u32, value: u32) {
        self.log.push(Event::Transaction(Transaction {
            address,
            value,
            direction: Direction::Write,
        }));
        if address == DEFAULT_MUX_REGISTER {
            self.mux = value;
        } else if let Some(offset) = self.cpld_offset(address) {
            self.cpld_write(offset, (value & 0xFF) as u8);
        } else {
            self.memory.insert(address, value);
        }
    }

    fn remote_read(&mut self, address: u32) -> u32 {
        let value = if address == DEFAULT_MUX_REGISTER {
            self.mux
        } else if let Some(offset) = self.cpld_offset(address) {
            u32::from(self.cpld_read(offset))
        } else {
            self.memory.get(&address).copied().unwrap_or_default()
        };
        self.log.push(Event::Transaction(Transaction {
            address,
            value,
            direction: Direction::Read,
        }));
        value
    }

    fn cpld_write(&mut self, offset: u32, byte: u8) {
        match offset {
            COMMAND => self.execute(byte),
            CONTROL1 => self.control1 = byte,
            CONTROL2 => self.control2 = byte,
            o if (PAYLOAD..PAYLOAD + 16).contains(&o) && o % 4 == 0 => {
                self.payload[((o - PAYLOAD) / 4) as usize] = byte;
            }
            o => trace!(offset = o, "Ignoring write to CPLD"),
        }
    }

    fn cpld_read(&self, offset: u32) -> u8 {
        match offset {
            CONTROL1 => self.control1,
            CONTROL2 => self.control2,
            o if (PAYLOAD..PAYLOAD + 16).contains(&o) && o % 4 == 0 => {
                self.payload[((o - PAYLOAD) / 4) as usize]
            }
            o if (READBACK..READBACK + 16).contains(&o) && o % 4 == 0 => {
                self.readback[((o - READBACK) / 4) as usize]
            }
            _ => 0,
        }
    }

    /// Shift the payload out to the chip picked by `selector`
    fn execute(&mut self, selector: u8) {
        let Some(device) = DeviceTarget::from_u8(selector) else {
            warn!(selector, "Unknown CPLD selector");
            return;
        };
        let payload = u32::from_le_bytes(self.payload);
        let (address, value) = device.decode_write(payload);
        if device == DeviceTarget::Lmx {
            self.execute_lmx(payload, address, value);
            return;
        }
        self.lmx_last = None;
        if device.is_read_request(payload) {
            let byte = self.chip_read(device, address);
            self.readback = [0, byte, 0, 0];
            self.record(ChipOp::read(device, address, u32::from(byte)));
        } else {
            self.chip_write(device, address, value);
            self.record(ChipOp::write(device, address, value));
        }
    }

    /// Sending the same R6 readback select twice shifts the selected register out
    fn execute_lmx(&mut self, payload: u32, address: u16, value: u32) {
        if address == LMX_READBACK_SELECT && self.lmx_last == Some(payload) {
            let selected = ((payload >> 5) & 0xF) as u16;
            let register = self.lmx_register(selected);
            self.readback = ((register << 4) | u32::from(selected)).to_le_bytes();
            self.lmx_last = None;
            self.record(ChipOp::read(DeviceTarget::Lmx, selected, register));
        } else {
            self.lmx[usize::from(address)] = value;
            self.lmx_last = Some(payload);
            self.record(ChipOp::write(DeviceTarget::Lmx, address, value));
        }
    }

    fn record(&self, op: ChipOp) {
        trace!(?op, "Chip access");
        self.log.push(Event::Chip(op));
    }

    fn chip_write(&mut self, device: DeviceTarget, address: u16, value: u32) {
        let byte = (value & 0xFF) as u8;
        match device {
            DeviceTarget::Lmk => {
                self.lmk.insert(address, byte);
            }
            DeviceTarget::Adc0 | DeviceTarget::Adc1 => {
                if let Some(i) = adc_index(device) {
                    self.adc[i].insert(address, byte);
                }
            }
            DeviceTarget::AdcBoth => {
                for adc in &mut self.adc {
                    adc.insert(address, byte);
                }
            }
            DeviceTarget::Hmc => self.hmc[usize::from(address & 0xF)] = (value & 0x1FF) as u16,
            DeviceTarget::Lmx => self.lmx[usize::from(address & 0xF)] = value,
        }
    }

    fn chip_read(&self, device: DeviceTarget, address: u16) -> u8 {
        match (device, adc_index(device)) {
            (DeviceTarget::Lmk, _) if address == Pll2LockDetect::ADDRESS => {
                if self.pll2_locked {
                    0x02
                } else {
                    0x00
                }
            }
            (DeviceTarget::Lmk, _) => self.lmk.get(&address).copied().unwrap_or_default(),
            (_, Some(i)) if address == SysrefCalStatus::ADDRESS => {
                if self.sysref_cal_done[i] {
                    0x02
                } else {
                    0x00
                }
            }
            (_, Some(i)) if address == CalStatus::ADDRESS => u8::from(self.fg_cal_done[i]),
            (_, Some(i)) => self.adc[i].get(&address).copied().unwrap_or_default(),
            _ => 0,
        }
    }
}

fn adc_index(device: DeviceTarget) -> Option<usize> {
    match device {
        DeviceTarget::Adc0 => Some(0),
        DeviceTarget::Adc1 => Some(1),
        _ => None,
    }
}

impl Transport for Fmc134Emulator {
    fn read_bytes<const N: usize>(
        &mut self,
        register: &str,
        offset: usize,
    ) -> TransportResult<[u8; N]> {
        self.check_access(register, offset, N)?;
        let mut bytes = [0u8; N];
        if !self.proxy_present {
            return Ok(bytes);
        }
        bytes.copy_from_slice(&self.csr[offset..offset + N]);
        let covers_cmpl = offset <= CMPL && CMPL < offset + N;
        if covers_cmpl && self.pending_polls > 0 {
            self.pending_polls -= 1;
            bytes[CMPL - offset] &= !1;
        }
        Ok(bytes)
    }

    fn write_bytes(&mut self, register: &str, offset: usize, data: &[u8]) -> TransportResult<()> {
        self.check_access(register, offset, data.len())?;
        if !self.proxy_present {
            return Ok(());
        }
        self.csr[offset..offset + data.len()].copy_from_slice(data);
        if offset == RNW {
            self.launch();
        }
        Ok(())
    }
}
