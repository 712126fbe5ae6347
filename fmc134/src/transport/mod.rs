//! Defines the register transport that the surrounding FPGA infrastructure must implement.
//!
//! Registers are addressed by name and byte offset, the same way the firmware's register map
//! exposes them. Values cross the transport as little-endian 32-bit AXI-Lite words.

pub mod mock;

/// Errors that can be thrown from register transports
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Requested register doesn't exist - `{0}`")]
    MissingRegister(String),
    #[error("Access of {len} bytes at offset {offset:#x} falls outside of `{register}`")]
    OutOfBounds {
        register: String,
        offset: usize,
        len: usize,
    },
}

pub type TransportResult<T> = Result<T, Error>;

/// Types that implement this trait can be serialized such that they can be written to FPGA
/// registers
pub trait Serialize {
    type Chunk;
    fn serialize(&self) -> Self::Chunk;
}

/// Types that implement this trait can be deserialized such that they can be read from FPGA
/// registers
pub trait Deserialize: Sized {
    type Chunk;
    fn deserialize(chunk: Self::Chunk) -> TransportResult<Self>;
}

macro_rules! ser_num {
    ($num:ty) => {
        impl Serialize for $num {
            type Chunk = [u8; core::mem::size_of::<$num>()];
            fn serialize(&self) -> Self::Chunk {
                self.to_le_bytes()
            }
        }
    };
}

macro_rules! deser_num {
    ($num:ty) => {
        impl Deserialize for $num {
            type Chunk = [u8; core::mem::size_of::<$num>()];
            fn deserialize(chunk: Self::Chunk) -> TransportResult<Self> {
                Ok(<$num>::from_le_bytes(chunk))
            }
        }
    };
}

ser_num!(u8);
ser_num!(u16);
ser_num!(u32);
ser_num!(u64);

deser_num!(u8);
deser_num!(u16);
deser_num!(u32);
deser_num!(u64);

/// The trait that is implemented for FPGA register transports.
/// The methods of this trait *assume* that the device is already mapped and running.
pub trait Transport {
    /// Read `N` bytes from `register` from byte offset `offset` into a const-sized array
    fn read_bytes<const N: usize>(
        &mut self,
        register: &str,
        offset: usize,
    ) -> TransportResult<[u8; N]>;

    /// Generically read a `Deserializable` type `T` from `register` at offset `offset`.
    /// # Example
    /// ```
    /// # use fmc134::core::Register;
    /// # use std::collections::HashMap;
    /// # use fmc134::transport::mock::Mock;
    /// # let mut transport = Mock::new(HashMap::from([("i2c_proxy".into(),Register { addr: 0, length: 16 },)]));
    /// # use fmc134::transport::Transport;
    /// let flag: u32 = transport.read("i2c_proxy", 0x4).unwrap();
    /// ```
    fn read<T, const N: usize>(&mut self, register: &str, offset: usize) -> TransportResult<T>
    where
        T: Deserialize<Chunk = [u8; N]>,
    {
        let bytes: [u8; N] = self.read_bytes(register, offset)?;
        T::deserialize(bytes)
    }

    /// Write `data` to `register` from byte offset `offset`
    fn write_bytes(&mut self, register: &str, offset: usize, data: &[u8]) -> TransportResult<()>;

    /// Generically write a `Serializable` type `T` to `register` at offset `offset`.
    /// # Example
    /// ```
    /// # use fmc134::core::Register;
    /// # use std::collections::HashMap;
    /// # use fmc134::transport::mock::Mock;
    /// # let mut transport = Mock::new(HashMap::from([("i2c_proxy".into(),Register { addr: 0, length: 16 },)]));
    /// # use fmc134::transport::Transport;
    /// transport.write("i2c_proxy", 0x8, &0x2818u32).unwrap();
    /// ```
    fn write<T, const N: usize>(
        &mut self,
        register: &str,
        offset: usize,
        data: &T,
    ) -> TransportResult<()>
    where
        T: Serialize<Chunk = [u8; N]>,
    {
        // Create bytes from the data and write with `write_bytes`
        self.write_bytes(register, offset, &data.serialize())
    }
}
