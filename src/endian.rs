//! Wire byte order. D-Bus messages are self-describing: the first header
//! byte is `'l'` (little) or `'B'` (big), and every multi-byte value in
//! the rest of the message follows that choice.

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// The endianness byte as it appears at offset 0 of a message.
    pub const LITTLE_CODE: u8 = b'l';
    pub const BIG_CODE: u8 = b'B';

    /// The native endianness, used when constructing outgoing messages.
    #[cfg(target_endian = "little")]
    pub fn native() -> Endianness {
        Endianness::Little
    }

    #[cfg(target_endian = "big")]
    pub fn native() -> Endianness {
        Endianness::Big
    }

    pub fn code(self) -> u8 {
        match self {
            Endianness::Little => Self::LITTLE_CODE,
            Endianness::Big => Self::BIG_CODE,
        }
    }

    pub fn from_code(code: u8) -> Result<Endianness> {
        match code {
            Self::LITTLE_CODE => Ok(Endianness::Little),
            Self::BIG_CODE => Ok(Endianness::Big),
            other => Err(Error::new(ErrorKind::InvalidEndianness(other))),
        }
    }
}
