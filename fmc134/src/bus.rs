//! The indirect register bus.
//!
//! The FPGA exposes a four register proxy that relays 32-bit reads and writes onto the slower
//! I2C fabric. A transaction is launched by loading the address (and value, for writes) and then
//! writing the read/not-write flag; bit 0 of the completion register goes high once the remote
//! side is done.

use crate::{
    error::{
        Error,
        Result,
    },
    sleep::{
        Sleep,
        StdSleeper,
    },
    transport::Transport,
};
use kstring::KString;
use std::{
    fmt::Display,
    time::Duration,
};
use tracing::{
    debug,
    warn,
};

/// Read/not-write flag, writing this launches the transaction
pub const RNW: usize = 0x0;
/// Completion flag, bit 0
pub const CMPL: usize = 0x4;
/// Remote address
pub const ADDR: usize = 0x8;
/// Remote value
pub const VALU: usize = 0xC;

/// Name of the proxy register block in the firmware register map
pub const DEFAULT_PROXY: &str = "i2c_proxy";
/// Start of the I2C register block in the proxied address space
pub const DEFAULT_TARGET_BASE: u32 = 0x0001_0000;

const PROBE_PATTERN: u32 = 0xDEAD_BEEF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Direction::Read => "read",
                Direction::Write => "write",
            }
        )
    }
}

/// A single proxied access. Created per call and consumed immediately.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Address relative to the proxied window
    pub address: u32,
    /// Value written, or zero for a read that hasn't completed
    pub value: u32,
    pub direction: Direction,
}

impl Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.direction {
            Direction::Read => write!(f, "read from {:#x}", self.address),
            Direction::Write => write!(f, "writing {:#x} to {:#x}", self.value, self.address),
        }
    }
}

/// How the bus waits for the completion flag
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before every check of the completion flag
    pub poll_interval: Duration,
    /// Give up with [`Error::TransactionTimeout`] after this many checks, or never if `None`
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            max_attempts: Some(10_000),
        }
    }
}

impl PollPolicy {
    /// Block until the proxy completes, however long that takes
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }
}

/// Callback invoked with the transaction and poll count each time a slow transaction is reported
pub type SlowObserver = Box<dyn FnMut(&Transaction, u32) + Send>;

/// A handle to the register proxy. Owns the transport it drives.
pub struct IndirectBus<T, S = StdSleeper> {
    transport: T,
    /// Name of the proxy register block
    csr: KString,
    target_base: u32,
    policy: PollPolicy,
    sleeper: S,
    observer: Option<SlowObserver>,
}

impl<T> IndirectBus<T, StdSleeper>
where
    T: Transport,
{
    /// Construct a bus over the proxy registers named `csr`
    pub fn new(transport: T, csr: &str) -> Self {
        Self {
            transport,
            csr: KString::from_ref(csr),
            target_base: DEFAULT_TARGET_BASE,
            policy: PollPolicy::default(),
            sleeper: StdSleeper,
            observer: None,
        }
    }
}

impl<T, S> IndirectBus<T, S>
where
    T: Transport,
    S: Sleep,
{
    /// Swap the sleeper used for polling and settle delays
    pub fn with_sleeper<S2: Sleep>(self, sleeper: S2) -> IndirectBus<T, S2> {
        IndirectBus {
            transport: self.transport,
            csr: self.csr,
            target_base: self.target_base,
            policy: self.policy,
            sleeper,
            observer: self.observer,
        }
    }

    #[must_use]
    pub fn with_target_base(mut self, target_base: u32) -> Self {
        self.target_base = target_base;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Install a callback for the slow-transaction reports
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&Transaction, u32) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Block for `duration` using the bus' sleeper
    pub fn sleep(&self, duration: Duration) {
        self.sleeper.sleep(duration);
    }

    /// Check that the proxy exists by bouncing a pattern off its address register
    /// # Errors
    /// Returns [`Error::ProxyMissing`] if the pattern doesn't come back
    pub fn probe(&mut self) -> Result<()> {
        self.transport.write(&self.csr, ADDR, &PROBE_PATTERN)?;
        let readback: u32 = self.transport.read(&self.csr, ADDR)?;
        if readback == PROBE_PATTERN {
            Ok(())
        } else {
            Err(Error::ProxyMissing { readback })
        }
    }

    /// Write `value` to the proxied `address`
    /// # Errors
    /// Returns an error on bad transport or if the proxy never completes
    pub fn write(&mut self, address: u32, value: u32) -> Result<()> {
        let transaction = Transaction {
            address,
            value,
            direction: Direction::Write,
        };
        self.transport.write(&self.csr, VALU, &value)?;
        self.transport
            .write(&self.csr, ADDR, &self.target_base.wrapping_add(address))?;
        self.transport.write(&self.csr, RNW, &0u32)?;
        let polls = self.wait_for_complete(transaction)?;
        debug!(%transaction, polls);
        Ok(())
    }

    /// Read the value at the proxied `address`
    /// # Errors
    /// Returns an error on bad transport or if the proxy never completes
    pub fn read(&mut self, address: u32) -> Result<u32> {
        let transaction = Transaction {
            address,
            value: 0,
            direction: Direction::Read,
        };
        self.transport
            .write(&self.csr, ADDR, &self.target_base.wrapping_add(address))?;
        self.transport.write(&self.csr, RNW, &1u32)?;
        let polls = self.wait_for_complete(transaction)?;
        let value: u32 = self.transport.read(&self.csr, VALU)?;
        debug!(%transaction, value, polls);
        Ok(value)
    }

    /// Poll the completion flag, reporting at 3, 7, 15, 31... polls. Returns the number of polls.
    fn wait_for_complete(&mut self, transaction: Transaction) -> Result<u32> {
        let mut tmo = 0u32;
        let mut tmo_mask = 0x3u32;
        loop {
            self.sleeper.sleep(self.policy.poll_interval);
            tmo = tmo.saturating_add(1);
            if (tmo & tmo_mask) == tmo_mask {
                tmo_mask = (tmo_mask << 1) | 1;
                warn!(%transaction, polls = tmo, "Slow indirect bus transaction");
                if let Some(observer) = self.observer.as_mut() {
                    observer(&transaction, tmo);
                }
            }
            let cmpl: u32 = self.transport.read(&self.csr, CMPL)?;
            if (cmpl & 1) == 1 {
                return Ok(tmo);
            }
            if let Some(max) = self.policy.max_attempts {
                if tmo >= max {
                    return Err(Error::TransactionTimeout {
                        transaction,
                        attempts: tmo,
                    });
                }
            }
        }
    }
}

impl<T, S> std::fmt::Debug for IndirectBus<T, S>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndirectBus")
            .field("transport", &self.transport)
            .field("csr", &self.csr)
            .field("target_base", &self.target_base)
            .field("policy", &self.policy)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::Register,
        emulator::{
            Event,
            Fmc134Emulator,
        },
        transport::mock::Mock,
    };
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            Mutex,
        },
    };

    fn emulated_bus(emulator: Fmc134Emulator) -> IndirectBus<Fmc134Emulator, impl Sleep> {
        let sleeper = emulator.sleeper();
        IndirectBus::new(emulator, DEFAULT_PROXY).with_sleeper(sleeper)
    }

    fn mock_bus(max_attempts: u32) -> IndirectBus<Mock, impl Sleep> {
        let mock = Mock::new(HashMap::from([(
            DEFAULT_PROXY.into(),
            Register { addr: 0, length: 16 },
        )]));
        let emulator = Fmc134Emulator::new();
        IndirectBus::new(mock, DEFAULT_PROXY)
            .with_sleeper(emulator.sleeper())
            .with_policy(PollPolicy {
                max_attempts: Some(max_attempts),
                ..Default::default()
            })
    }

    #[test]
    fn test_write_then_read() {
        let mut bus = emulated_bus(Fmc134Emulator::new());
        bus.write(0x4000, 0xDEAD_BEEF).unwrap();
        bus.write(0x4004, 0x1234_5678).unwrap();
        assert_eq!(bus.read(0x4000).unwrap(), 0xDEAD_BEEF);
        assert_eq!(bus.read(0x4004).unwrap(), 0x1234_5678);
        bus.write(0x4000, 7).unwrap();
        assert_eq!(bus.read(0x4000).unwrap(), 7);
    }

    #[test]
    fn test_proxy_register_order() {
        let emulator = Fmc134Emulator::new();
        let events = emulator.events();
        let mut bus = emulated_bus(emulator);
        bus.write(0x10, 0xAB).unwrap();
        // The remote side saw the address relative to the window, with the value
        assert_eq!(
            events.transactions(),
            vec![Transaction {
                address: 0x10,
                value: 0xAB,
                direction: Direction::Write
            }]
        );
        // And the proxy saw the absolute address
        let addr: u32 = bus.transport_mut().read(DEFAULT_PROXY, ADDR).unwrap();
        assert_eq!(addr, DEFAULT_TARGET_BASE + 0x10);
    }

    #[test]
    fn test_poll_sleeps_before_each_check() {
        let emulator = Fmc134Emulator::new().with_latency(4);
        let events = emulator.events();
        let mut bus = emulated_bus(emulator);
        bus.write(0x20, 1).unwrap();
        let sleeps: Vec<_> = events
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sleep(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(sleeps, vec![Duration::from_millis(1); 5]);
    }

    #[test]
    fn test_slow_transaction_reports_back_off() {
        let reports = Arc::new(Mutex::new(vec![]));
        let sink = reports.clone();
        let mut bus = emulated_bus(Fmc134Emulator::new().with_latency(40))
            .with_observer(move |t, polls| sink.lock().unwrap().push((t.address, polls)));
        bus.read(0x30).unwrap();
        assert_eq!(
            *reports.lock().unwrap(),
            vec![(0x30, 3), (0x30, 7), (0x30, 15), (0x30, 31)]
        );
    }

    #[test]
    fn test_timeout_when_proxy_never_completes() {
        let mut bus = mock_bus(25);
        match bus.write(0x40, 5) {
            Err(Error::TransactionTimeout {
                transaction,
                attempts,
            }) => {
                assert_eq!(attempts, 25);
                assert_eq!(transaction.address, 0x40);
                assert_eq!(transaction.direction, Direction::Write);
            }
            other => panic!("Expected a timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_probe() {
        let mut bus = emulated_bus(Fmc134Emulator::new());
        bus.probe().unwrap();
        let mut bus = mock_bus(1);
        bus.probe().unwrap();
        let mut bus = emulated_bus(Fmc134Emulator::new().without_proxy());
        assert!(matches!(
            bus.probe(),
            Err(Error::ProxyMissing { readback: 0 })
        ));
    }
}
