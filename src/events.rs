use std::fmt::Display;

use crate::serial::Port;

/// Something happened to a port the registry knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A port appeared.
    Connected(Port),

    /// A port went away.
    /// It has been closed, and any further use fails.
    Disconnected(Port),
}

impl PortEvent {
    /// The port this event is about.
    pub fn port(&self) -> &Port {
        match self {
            PortEvent::Connected(port) | PortEvent::Disconnected(port) => port,
        }
    }

    /// Unwrap the event as a connection, else panic.
    pub fn into_connected(self) -> Port {
        if let Self::Connected(port) = self {
            port
        } else {
            panic!("Was not `Connected`: {self:?}")
        }
    }

    /// Unwrap the event as a disconnection, else panic.
    pub fn into_disconnected(self) -> Port {
        if let Self::Disconnected(port) = self {
            port
        } else {
            panic!("Was not `Disconnected`: {self:?}")
        }
    }
}

impl Display for PortEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortEvent::Connected(port) => write!(f, "connected: {port}"),
            PortEvent::Disconnected(port) => write!(f, "disconnected: {port}"),
        }
    }
}
