use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Serial port related errors.
pub mod error;

/// Codecs for encoding/decoding structures to/from wire.
pub mod codecs;

/// Serial options, signals and their validation.
pub mod options;

/// CDC-ACM class requests on the control interface.
pub(crate) mod control;

/// Bulk transfers on the data interface.
pub mod data;

/// A live binding of a port to its claimed interfaces.
pub(crate) mod session;

/// The serial port handle and its lifecycle.
pub mod port;

pub use codecs::line_coding::{CharFormat, LineCoding, ParityType};
pub use data::{PortReader, PortWriter};
pub use options::{DataBitsPolicy, FlowControl, OutputSignals, Parity, SerialOptions};
pub use port::{Port, PortInfo};

/// Where a port is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Not open. Initial and terminal.
    #[default]
    Closed,

    /// Claiming interfaces and configuring the device.
    Opening,

    /// Open, streams are available.
    Open,

    /// Cancelling transfers and releasing interfaces.
    Closing,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
        };

        write!(f, "{s}")
    }
}
