use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serial::error::{OptionField, TransferProblem};

/// Errors thay may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// A caller supplied configuration value was rejected.
    /// Detected before any I/O is performed.
    #[error("Invalid option `{field}`: {problem}")]
    InvalidOption {
        /// The offending field.
        field: OptionField,

        /// What is wrong with it.
        problem: String,
    },

    /// The device replied with data not matching what CDC-ACM mandates.
    #[error("Malformed response from device: {0}")]
    MalformedResponse(String),

    /// A submitted transfer failed.
    ///
    /// For writes, `bytes_written` is the number of bytes
    /// the device accepted before the failure.
    #[error("Device error ({problem}), {bytes_written} byte(s) written")]
    DeviceError {
        /// Why the transfer failed.
        problem: TransferProblem,

        /// Bytes successfully transferred before the failure.
        bytes_written: usize,
    },

    /// The device went away.
    #[error("The device was disconnected")]
    DeviceDisconnected,

    /// Open was called on a port which is already open.
    #[error("The port is already open")]
    AlreadyOpen,

    /// An operation needing an open port was called on a port which is not open.
    #[error("The port is not open")]
    NotOpen,

    /// The user did something which is not valid.
    /// For example, taking a second reader.
    #[error("The request did not conform to valid usage. Problem: `{0}`")]
    BadUsage(String),

    /// No device was chosen when requesting a port.
    #[error("No port was selected")]
    NoPortSelected,

    /// Bad configuration.
    #[error("The configuration is not valid. Problem: `{0}`")]
    BadConfig(String),
}

impl Error {
    /// A transfer failure where nothing was written.
    pub(crate) fn device(problem: TransferProblem) -> Self {
        Self::DeviceError {
            problem,
            bytes_written: 0,
        }
    }

    pub(crate) fn invalid_option<S: Into<String>>(field: OptionField, problem: S) -> Self {
        Self::InvalidOption {
            field,
            problem: problem.into(),
        }
    }

    /// Try to get the bad config message.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }

    /// The field named by an [`Error::InvalidOption`], if that is what this is.
    pub fn invalid_field(&self) -> Option<OptionField> {
        if let Self::InvalidOption { field, .. } = self {
            Some(*field)
        } else {
            None
        }
    }

    /// Bytes written before a [`Error::DeviceError`], if that is what this is.
    pub fn bytes_written(&self) -> Option<usize> {
        if let Self::DeviceError { bytes_written, .. } = self {
            Some(*bytes_written)
        } else {
            None
        }
    }
}
