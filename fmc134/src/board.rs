//! The FMC134 board handle.
//!
//! The proxy and the I2C mux are shared by everything on the carrier, so selecting a mux port
//! and running a sequence on it has to be one critical section. [`Fmc134::lock`] hands out that
//! critical section as a guard.

use crate::{
    bus::IndirectBus,
    clocktree::ClockTreeStatus,
    config::{
        BringupConfig,
        RetryPolicy,
    },
    cpld::Fmc134Cpld,
    error::{
        Error,
        Result,
    },
    router::{
        I2cRouter,
        MuxPort,
    },
    sleep::{
        Sleep,
        StdSleeper,
    },
    transport::Transport,
};
use std::sync::{
    Mutex,
    MutexGuard,
};
use tracing::{
    info,
    instrument,
    warn,
};

#[derive(Debug)]
pub struct Fmc134<T, S = StdSleeper> {
    bus: Mutex<IndirectBus<T, S>>,
    config: BringupConfig,
}

impl<T, S> Fmc134<T, S>
where
    T: Transport,
    S: Sleep,
{
    pub fn new(bus: IndirectBus<T, S>, config: BringupConfig) -> Self {
        Self {
            bus: Mutex::new(bus),
            config,
        }
    }

    pub fn config(&self) -> &BringupConfig {
        &self.config
    }

    /// Take the bus and route it to `port`. The bus stays ours until the guard is dropped.
    /// # Errors
    /// Returns [`Error::Poisoned`] if a previous holder panicked, or an error from the mux write
    pub fn lock(&self, port: MuxPort) -> Result<Fmc134Guard<'_, T, S>> {
        let mut bus = self.bus.lock().map_err(|_| Error::Poisoned)?;
        I2cRouter::new(self.config.mux_register).select(&mut *bus, port)?;
        Ok(Fmc134Guard {
            bus,
            config: &self.config,
            port,
        })
    }

    /// Bring up the clock tree and then the ADCs on the configured port, retrying each stage
    /// per the configured [`RetryPolicy`]
    /// # Errors
    /// Returns the first error with `abort_on_error`, otherwise [`Error::Exhausted`] wrapping the
    /// last failure of the stage that ran out of attempts
    #[instrument(skip_all, fields(port = %self.config.port))]
    pub fn setup(&self) -> Result<ClockTreeStatus> {
        let retry = self.config.retry;
        let mut guard = self.lock(self.config.port)?;
        let status = guard.retry("clock tree initialization", retry, |g| g.clock_tree_init())?;
        guard.retry("ADC initialization", retry, |g| g.adc_init())?;
        info!(?status, "FMC134 ready");
        Ok(status)
    }

    /// Give back the bus
    /// # Errors
    /// Returns [`Error::Poisoned`] if a holder of the lock panicked
    pub fn into_bus(self) -> Result<IndirectBus<T, S>> {
        self.bus.into_inner().map_err(|_| Error::Poisoned)
    }
}

/// Exclusive access to the bus, routed to one mux port
pub struct Fmc134Guard<'a, T, S> {
    bus: MutexGuard<'a, IndirectBus<T, S>>,
    config: &'a BringupConfig,
    port: MuxPort,
}

impl<'a, T, S> Fmc134Guard<'a, T, S>
where
    T: Transport,
    S: Sleep,
{
    pub fn port(&self) -> MuxPort {
        self.port
    }

    pub fn bus(&mut self) -> &mut IndirectBus<T, S> {
        &mut *self.bus
    }

    pub fn cpld(&mut self) -> Fmc134Cpld<'_, T, S> {
        Fmc134Cpld::new(&mut *self.bus, self.config.cpld_base)
    }

    /// # Errors
    /// Returns an error on bus failure
    pub fn clock_tree_init(&mut self) -> Result<ClockTreeStatus> {
        let sequencer = self.config.clock_tree();
        sequencer.run(&mut self.cpld())
    }

    /// # Errors
    /// Returns an error on bus or calibration failure
    pub fn adc_init(&mut self) -> Result<()> {
        let sequencer = self.config.adc_init();
        sequencer.run(&mut self.cpld())
    }

    fn retry<R, F>(&mut self, stage: &'static str, policy: RetryPolicy, mut f: F) -> Result<R>
    where
        F: FnMut(&mut Self) -> Result<R>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f(self) {
                Ok(v) => return Ok(v),
                Err(e) if policy.abort_on_error => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(Error::Exhausted {
                        stage,
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => {
                    warn!(%e, attempt, "{stage} failed, retrying");
                    self.bus.sleep(policy.backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adc::CalibrationMode,
        clocktree::ClockMode,
        codec::DeviceTarget,
        emulator::{
            ChipOp,
            EmulatorSleeper,
            EventLog,
            Fmc134Emulator,
        },
        router::MuxPort,
        AdcInitError,
    };

    fn board(
        emulator: Fmc134Emulator,
        config: BringupConfig,
    ) -> (Fmc134<Fmc134Emulator, EmulatorSleeper>, EventLog) {
        let events = emulator.events();
        let sleeper = emulator.sleeper();
        let bus = config.bus(emulator).with_sleeper(sleeper);
        (Fmc134::new(bus, config), events)
    }

    fn adc_resets(events: &EventLog) -> usize {
        events
            .chip_ops()
            .into_iter()
            .filter(|op| *op == ChipOp::write(DeviceTarget::AdcBoth, 0x0000, 0xB0))
            .count()
    }

    #[test]
    fn test_lock_selects_port() {
        let (board, _) = board(Fmc134Emulator::new(), BringupConfig::default());
        {
            let mut guard = board.lock(MuxPort::LocalBus).unwrap();
            assert_eq!(guard.port(), MuxPort::LocalBus);
            assert_eq!(guard.bus().transport().mux(), 8);
        }
        let mut guard = board.lock(MuxPort::SecondaryFmc).unwrap();
        assert_eq!(guard.bus().transport().mux(), 2);
    }

    #[test]
    fn test_setup() {
        let config = BringupConfig {
            clock_mode: ClockMode::InternalReference,
            ..Default::default()
        };
        let (board, events) = board(Fmc134Emulator::new(), config);
        assert_eq!(board.setup().unwrap(), ClockTreeStatus::Locked);
        // The mux write comes before any chip traffic
        let first = events.transactions()[0];
        assert_eq!((first.address, first.value), (0x0000, 1));
        let ops = events.chip_ops();
        assert_eq!(ops[0].device, DeviceTarget::Lmx);
        assert_eq!(ops.last(), Some(&ChipOp::write(DeviceTarget::Lmk, 0x117, 0x00)));
        let emulator = board.into_bus().unwrap().into_transport();
        assert_eq!(emulator.lmk_register(0x143), Some(0x50));
        assert_eq!(emulator.adc_register(DeviceTarget::Adc1, 0x0200), Some(0x01));
    }

    #[test]
    fn test_setup_gives_up() {
        let config = BringupConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let (board, events) = board(
            Fmc134Emulator::new().with_sysref_cal_done(DeviceTarget::Adc0, false),
            config,
        );
        match board.setup() {
            Err(Error::Exhausted {
                stage,
                attempts,
                last,
            }) => {
                assert_eq!(stage, "ADC initialization");
                assert_eq!(attempts, 3);
                assert!(matches!(
                    *last,
                    Error::AdcInit(AdcInitError::SysrefCalibration {
                        adc: DeviceTarget::Adc0,
                        ..
                    })
                ));
            }
            other => panic!("Expected the ADC stage to run out of attempts, got {other:?}"),
        }
        assert_eq!(adc_resets(&events), 3);
        // The clock tree succeeded the first time
        let forced_resets = events
            .chip_ops()
            .into_iter()
            .filter(|op| *op == ChipOp::write(DeviceTarget::Lmx, 5, 0x408_7001))
            .count();
        assert_eq!(forced_resets, 1);
    }

    #[test]
    fn test_setup_aborts_on_error() {
        let config = BringupConfig {
            calibration: CalibrationMode::Foreground,
            retry: RetryPolicy {
                abort_on_error: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (board, events) = board(
            Fmc134Emulator::new().with_fg_cal_done(DeviceTarget::Adc1, false),
            config,
        );
        assert!(matches!(
            board.setup(),
            Err(Error::AdcInit(AdcInitError::ForegroundCalibration {
                adc: DeviceTarget::Adc1,
                ..
            }))
        ));
        assert_eq!(adc_resets(&events), 1);
    }

    #[test]
    fn test_poisoned_lock() {
        let (board, _) = board(Fmc134Emulator::new(), BringupConfig::default());
        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                let _guard = board.lock(MuxPort::PrimaryFmc).unwrap();
                panic!("Panicking while holding the bus");
            });
            assert!(handle.join().is_err());
        });
        assert!(matches!(
            board.lock(MuxPort::PrimaryFmc),
            Err(Error::Poisoned)
        ));
    }
}
