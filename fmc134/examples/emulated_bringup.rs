//! In this example, we bring up an emulated FMC134 on the secondary FMC site with the internal
//! reference, then read back the PLL2 lock detect and the LMX2581 sampling rate word.

use fmc134::{
    emulator::Fmc134Emulator,
    prelude::*,
    registers::Pll2LockDetect,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = BringupConfig {
        port: "SecondaryFmc".parse()?,
        clock_mode: "internal".parse()?,
        calibration: "FG_CAL".parse()?,
        ..Default::default()
    };
    let emulator = Fmc134Emulator::new().with_latency(3);
    let sleeper = emulator.sleeper();
    let bus = config.bus(emulator).with_sleeper(sleeper);
    bring_up(bus, config)
}

fn bring_up<T, S>(mut bus: IndirectBus<T, S>, config: BringupConfig) -> anyhow::Result<()>
where
    T: Transport,
    S: Sleep,
{
    bus.probe()?;
    let board = Fmc134::new(bus, config);
    let status = board.setup()?;
    println!("Clock tree: {status:?}");

    let mut guard = board.lock(board.config().port)?;
    let mut cpld = guard.cpld();
    let lock: Pll2LockDetect = cpld.read_reg(DeviceTarget::Lmk)?;
    let r0 = cpld.read(DeviceTarget::Lmx, 0)?;
    println!("PLL2 locked: {}, LMX R0: {r0:#09x}", lock.locked);
    Ok(())
}
