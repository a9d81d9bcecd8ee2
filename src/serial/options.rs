use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::Error, serial::error::OptionField};

/// Highest baud rate accepted.
pub const MAX_BAUD_RATE: u32 = 16_000_000;

/// Largest transfer chunk accepted, 16 MiB.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Transfer chunk size used when none is given.
pub const DEFAULT_BUFFER_SIZE: usize = 255;

/// Parity checking mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,

    /// Even parity.
    Even,

    /// Odd parity.
    Odd,

    /// Parity bit always set.
    Mark,

    /// Parity bit always cleared.
    Space,
}

impl FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "even" => Ok(Self::Even),
            "odd" => Ok(Self::Odd),
            "mark" => Ok(Self::Mark),
            "space" => Ok(Self::Space),
            other => Err(Error::invalid_option(
                OptionField::Parity,
                format!("`{other}` is not one of none, even, odd, mark, space"),
            )),
        }
    }
}

impl Display for Parity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
            Parity::Mark => "mark",
            Parity::Space => "space",
        };

        write!(f, "{s}")
    }
}

/// Flow control flags.
///
/// CDC-ACM has no way to express these, so they are accepted and kept
/// but never sent to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControl {
    /// Hardware (RTS/CTS) flow control.
    pub rtscts: bool,

    /// Software flow control, XON.
    pub xon: bool,

    /// Software flow control, XOFF.
    pub xoff: bool,

    /// Any character restarts output.
    pub xany: bool,
}

/// Which data bit counts are accepted when validating options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBitsPolicy {
    /// Only 8 data bits.
    /// This is what CDC-ACM devices are practically compatible with.
    #[default]
    EightOnly,

    /// Anything the line coding structure can carry: 5, 6, 7, 8 or 16.
    Wire,
}

impl DataBitsPolicy {
    /// The data bit counts this policy accepts.
    pub fn accepted(&self) -> &'static [u8] {
        match self {
            DataBitsPolicy::EightOnly => &[8],
            DataBitsPolicy::Wire => &[5, 6, 7, 8, 16],
        }
    }
}

/// How a serial port should be set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    /// Symbols per second.
    pub baud_rate: u32,

    /// Data bits per character.
    pub data_bits: u8,

    /// Stop bits per character, 1 or 2.
    pub stop_bits: u8,

    /// Parity mode.
    pub parity: Parity,

    /// Size of each bulk transfer.
    pub buffer_size: usize,

    /// Flow control. Not transmitted.
    pub flow_control: FlowControl,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            flow_control: FlowControl::default(),
        }
    }
}

impl SerialOptions {
    /// Options with the given baud rate, everything else default.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the data bits.
    pub fn data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the stop bits.
    pub fn stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Set the parity.
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the transfer chunk size.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the flow control flags.
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Validate with the default [`DataBitsPolicy`].
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_with(DataBitsPolicy::default())
    }

    /// Check every field, reporting the first one out of range.
    pub fn validate_with(&self, policy: DataBitsPolicy) -> Result<(), Error> {
        if self.baud_rate == 0 || self.baud_rate > MAX_BAUD_RATE {
            return Err(Error::invalid_option(
                OptionField::BaudRate,
                format!("{} is not within 1..={MAX_BAUD_RATE}", self.baud_rate),
            ));
        }

        if !policy.accepted().contains(&self.data_bits) {
            return Err(Error::invalid_option(
                OptionField::DataBits,
                format!(
                    "{} is not supported, use one of {:?}",
                    self.data_bits,
                    policy.accepted()
                ),
            ));
        }

        if !matches!(self.stop_bits, 1 | 2) {
            return Err(Error::invalid_option(
                OptionField::StopBits,
                format!("{} is not 1 or 2", self.stop_bits),
            ));
        }

        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(Error::invalid_option(
                OptionField::BufferSize,
                format!("{} is not within 1..={MAX_BUFFER_SIZE}", self.buffer_size),
            ));
        }

        Ok(())
    }
}

impl Display for SerialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };

        write!(
            f,
            "{} {}{parity}{}",
            self.baud_rate, self.data_bits, self.stop_bits
        )
    }
}

/// Output control signals.
/// Unset fields leave the device's current state alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSignals {
    /// Data terminal ready.
    pub dtr: Option<bool>,

    /// Request to send.
    pub rts: Option<bool>,

    /// Break.
    pub brk: Option<bool>,
}

impl OutputSignals {
    /// Only change DTR.
    pub fn dtr(dtr: bool) -> Self {
        Self {
            dtr: Some(dtr),
            ..Default::default()
        }
    }

    /// Only change RTS.
    pub fn rts(rts: bool) -> Self {
        Self {
            rts: Some(rts),
            ..Default::default()
        }
    }

    /// Only change break.
    pub fn brk(brk: bool) -> Self {
        Self {
            brk: Some(brk),
            ..Default::default()
        }
    }
}
