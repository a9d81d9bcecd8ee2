#![deny(missing_docs)]

//! Serial ports for USB CDC-ACM devices, driven through a generic USB host interface.
//!
//! Serial semantics (baud rate, data bits, stop bits, parity, DTR/RTS/break, byte streams)
//! are translated into the control requests and bulk transfers CDC-ACM mandates.
//! No class driver is needed on the host, only something implementing [`usb::UsbBackend`].
//!
//! A [`registry::Registry`] hands out [`serial::Port`]s.
//! Opening a port claims its interfaces and configures the device,
//! after which a [`serial::PortReader`] and a [`serial::PortWriter`] can be taken.

/// The USB host interface consumed by this library.
pub mod usb;

/// Serial ports on top of CDC-ACM.
pub mod serial;

/// Keeps track of ports and forwards connect/disconnect events.
pub mod registry;

/// Events the registry emits.
pub mod events;

/// In-memory devices and backend, for tests and demos.
pub mod mock;

/// Relates to config files.
pub mod config;

/// The command line interface.
pub mod cli;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;
