//! Mock transport implementation used in testing the interface

use super::{
    Error,
    Transport,
    TransportResult,
};
use crate::core::{
    Register,
    RegisterMap,
};
use std::collections::HashMap;

/// A flat register file that mocks reads and writes, useful for testing.
///
/// Nothing behind the registers reacts to writes, so a register proxy on a `Mock` never
/// reports completion.
#[derive(Debug)]
pub struct Mock {
    memory: HashMap<usize, u8>,
    registers: RegisterMap,
}

impl Mock {
    /// Construct a new mock platform by providing a register map `registers`
    #[must_use]
    pub fn new(registers: RegisterMap) -> Self {
        // We'll represent each address lazily instead of havig a dense array
        let mut memory: HashMap<usize, u8> = HashMap::default();

        for Register { addr, length } in registers.values() {
            for i in 0..*length {
                memory.insert(addr + i, 0u8);
            }
        }
        Self { memory, registers }
    }

    fn locate(&self, register: &str, offset: usize, len: usize) -> TransportResult<usize> {
        let reg = self
            .registers
            .get(register)
            .ok_or_else(|| Error::MissingRegister(register.to_owned()))?;
        match offset.checked_add(len) {
            Some(end) if end <= reg.length => Ok(reg.addr + offset),
            _ => Err(Error::OutOfBounds {
                register: register.to_owned(),
                offset,
                len,
            }),
        }
    }
}

impl Transport for Mock {
    fn read_bytes<const N: usize>(
        &mut self,
        register: &str,
        offset: usize,
    ) -> TransportResult<[u8; N]> {
        let start = self.locate(register, offset, N)?;
        let mut bytes = [0u8; N];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.memory.get(&(start + i)).copied().unwrap_or_default();
        }
        Ok(bytes)
    }

    fn write_bytes(&mut self, register: &str, offset: usize, data: &[u8]) -> TransportResult<()> {
        let start = self.locate(register, offset, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(start + i, *byte);
        }
        Ok(())
    }
}
