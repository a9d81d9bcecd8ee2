use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The serial option a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionField {
    /// See [`crate::serial::SerialOptions::baud_rate`].
    BaudRate,

    /// See [`crate::serial::SerialOptions::data_bits`].
    DataBits,

    /// See [`crate::serial::SerialOptions::stop_bits`].
    StopBits,

    /// See [`crate::serial::SerialOptions::parity`].
    Parity,

    /// See [`crate::serial::SerialOptions::buffer_size`].
    BufferSize,
}

impl Display for OptionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OptionField::BaudRate => "baud_rate",
            OptionField::DataBits => "data_bits",
            OptionField::StopBits => "stop_bits",
            OptionField::Parity => "parity",
            OptionField::BufferSize => "buffer_size",
        };

        write!(f, "{name}")
    }
}

/// Why a USB transfer did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferProblem {
    /// The endpoint stalled.
    Stall,

    /// The device sent more data than asked for.
    Babble,

    /// No reply in time.
    Timeout,

    /// The transfer was cancelled before it completed,
    /// for example because the port was closed.
    Cancelled,

    /// Anything else the transport reported.
    Other(String),
}

impl Display for TransferProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferProblem::Stall => write!(f, "stall"),
            TransferProblem::Babble => write!(f, "babble"),
            TransferProblem::Timeout => write!(f, "timeout"),
            TransferProblem::Cancelled => write!(f, "cancelled"),
            TransferProblem::Other(problem) => write!(f, "{problem}"),
        }
    }
}
