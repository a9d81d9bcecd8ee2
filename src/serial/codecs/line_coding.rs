//! The CDC-ACM line coding structure.
//!
//! Seven bytes on the wire:
//!
//! | Offset | Field         | Size |
//! |--------|---------------|------|
//! | 0      | `dwDTERate`   | 4    |
//! | 4      | `bCharFormat` | 1    |
//! | 5      | `bParityType` | 1    |
//! | 6      | `bDataBits`   | 1    |

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    serial::{Parity, SerialOptions},
};

/// Size of an encoded [`LineCoding`].
pub const LINE_CODING_LEN: usize = 7;

/// Number of stop bits (`bCharFormat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharFormat {
    /// 1 stop bit.
    One = 0,

    /// 1.5 stop bits.
    OnePointFive = 1,

    /// 2 stop bits.
    Two = 2,
}

/// Parity (`bParityType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParityType {
    /// None.
    None = 0,

    /// Odd.
    Odd = 1,

    /// Even.
    Even = 2,

    /// Mark.
    Mark = 3,

    /// Space.
    Space = 4,
}

impl From<Parity> for ParityType {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => ParityType::None,
            Parity::Odd => ParityType::Odd,
            Parity::Even => ParityType::Even,
            Parity::Mark => ParityType::Mark,
            Parity::Space => ParityType::Space,
        }
    }
}

impl From<ParityType> for Parity {
    fn from(parity: ParityType) -> Self {
        match parity {
            ParityType::None => Parity::None,
            ParityType::Odd => Parity::Odd,
            ParityType::Even => Parity::Even,
            ParityType::Mark => Parity::Mark,
            ParityType::Space => Parity::Space,
        }
    }
}

/// The line coding of a CDC-ACM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineCoding {
    /// Baud rate.
    pub dte_rate: u32,

    /// Stop bits.
    pub char_format: CharFormat,

    /// Parity.
    pub parity_type: ParityType,

    /// Data bits: 5, 6, 7, 8 or 16.
    pub data_bits: u8,
}

impl LineCoding {
    /// Put on wire.
    pub fn encode(&self) -> [u8; LINE_CODING_LEN] {
        let mut out = [0; LINE_CODING_LEN];
        let mut buf = &mut out[..];

        buf.put_u32_le(self.dte_rate);
        buf.put_u8(self.char_format as u8);
        buf.put_u8(self.parity_type as u8);
        buf.put_u8(self.data_bits);

        out
    }

    /// Read from wire.
    /// Anything but exactly seven bytes with known field values is malformed.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != LINE_CODING_LEN {
            return Err(Error::MalformedResponse(format!(
                "Line coding must be {LINE_CODING_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let dte_rate = bytes.get_u32_le();

        let char_format = match bytes.get_u8() {
            0 => CharFormat::One,
            1 => CharFormat::OnePointFive,
            2 => CharFormat::Two,
            other => {
                return Err(Error::MalformedResponse(format!(
                    "Unknown char format {other}"
                )))
            }
        };

        let parity_type = match bytes.get_u8() {
            0 => ParityType::None,
            1 => ParityType::Odd,
            2 => ParityType::Even,
            3 => ParityType::Mark,
            4 => ParityType::Space,
            other => {
                return Err(Error::MalformedResponse(format!(
                    "Unknown parity type {other}"
                )))
            }
        };

        let data_bits = bytes.get_u8();
        if !matches!(data_bits, 5 | 6 | 7 | 8 | 16) {
            return Err(Error::MalformedResponse(format!(
                "Unknown data bits {data_bits}"
            )));
        }

        Ok(Self {
            dte_rate,
            char_format,
            parity_type,
            data_bits,
        })
    }

    /// Apply this line coding on top of some options.
    /// Fields without a line coding counterpart are kept as they are.
    ///
    /// Fails if the stop bits can't be expressed by [`SerialOptions`] (1.5).
    pub fn apply_to(&self, options: &SerialOptions) -> Result<SerialOptions, Error> {
        let stop_bits = match self.char_format {
            CharFormat::One => 1,
            CharFormat::Two => 2,
            CharFormat::OnePointFive => {
                return Err(Error::MalformedResponse(
                    "1.5 stop bits can not be represented".into(),
                ))
            }
        };

        Ok(SerialOptions {
            baud_rate: self.dte_rate,
            data_bits: self.data_bits,
            stop_bits,
            parity: self.parity_type.into(),
            ..options.clone()
        })
    }
}

/// Assumes the options were validated.
/// Stop bits other than 2 are sent as 1.
impl From<&SerialOptions> for LineCoding {
    fn from(options: &SerialOptions) -> Self {
        Self {
            dte_rate: options.baud_rate,
            char_format: if options.stop_bits == 2 {
                CharFormat::Two
            } else {
                CharFormat::One
            },
            parity_type: options.parity.into(),
            data_bits: options.data_bits,
        }
    }
}
