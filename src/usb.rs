//! The USB host side this library is built upon.
//!
//! Discovery, permissions and transfer submission live outside of this crate.
//! Anything able to implement [`UsbBackend`] and [`UsbDevice`] can carry serial ports.
//!
//! Cancelling an in-flight transfer is done by dropping its future.

use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{error::Error, serial::error::TransferProblem};

/// USB class code of a CDC communications interface.
pub const CDC_CLASS: u8 = 0x02;

/// CDC subclass code of the Abstract Control Model.
pub const ACM_SUBCLASS: u8 = 0x02;

/// USB class code of a CDC data interface.
pub const CDC_DATA_CLASS: u8 = 0x0A;

/// Identifies a device for as long as it stays attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<S: AsRef<str>> From<S> for DeviceId {
    fn from(id: S) -> Self {
        Self(id.as_ref().into())
    }
}

/// Direction of an endpoint, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host.
    In,

    /// Host to device.
    Out,
}

/// The kind of transfers an endpoint carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Bulk.
    Bulk,

    /// Interrupt.
    Interrupt,

    /// Isochronous.
    Isochronous,
}

/// An endpoint as described by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint number, without the direction bit.
    pub number: u8,

    /// Direction.
    pub direction: Direction,

    /// Transfer kind.
    pub kind: EndpointKind,

    /// Max packet size.
    pub packet_size: u16,
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateSetting {
    /// The alternate setting number.
    pub setting: u8,

    /// Interface class code.
    pub class: u8,

    /// Interface subclass code.
    pub subclass: u8,

    /// Interface protocol code.
    pub protocol: u8,

    /// Endpoints in this setting.
    pub endpoints: Vec<EndpointDescriptor>,
}

/// An interface and its alternate settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Interface number.
    pub number: u8,

    /// Alternate settings. The first one is the default.
    pub alternates: Vec<AlternateSetting>,
}

/// A configuration of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// The value used to select this configuration.
    pub value: u8,

    /// Interfaces of this configuration.
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// What is known about an attached device without opening it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Identifier.
    pub id: DeviceId,

    /// Vendor id.
    pub vendor_id: u16,

    /// Product id.
    pub product_id: u16,

    /// Device class code.
    pub class: u8,

    /// Manufacturer string.
    pub manufacturer: Option<String>,

    /// Product string.
    pub product: Option<String>,

    /// Serial number string.
    pub serial_number: Option<String>,

    /// The active configuration, if any.
    pub active_configuration: Option<u8>,

    /// All configurations.
    pub configurations: Vec<ConfigurationDescriptor>,
}

impl DeviceInfo {
    /// The configuration to use: the active one, else the first one.
    pub fn configuration(&self) -> Option<&ConfigurationDescriptor> {
        match self.active_configuration {
            Some(value) => self.configurations.iter().find(|c| c.value == value),
            None => self.configurations.first(),
        }
    }
}

/// Narrows which devices a chooser may offer.
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    /// Vendor id.
    pub usb_vendor_id: Option<u16>,

    /// Product id. Requires a vendor id.
    pub usb_product_id: Option<u16>,

    /// Device or interface class code.
    pub class_code: Option<u8>,
}

impl DeviceFilter {
    /// Check if a device passes this filter.
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        let vendor = self.usb_vendor_id.map_or(true, |v| v == info.vendor_id);
        let product = self.usb_product_id.map_or(true, |p| p == info.product_id);
        let class = self.class_code.map_or(true, |class| {
            info.class == class
                || info
                    .configurations
                    .iter()
                    .flat_map(|c| &c.interfaces)
                    .flat_map(|i| &i.alternates)
                    .any(|alt| alt.class == class)
        });

        vendor && product && class
    }
}

/// Type of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    /// Standard request.
    Standard,

    /// Class request.
    Class,

    /// Vendor request.
    Vendor,
}

/// Recipient of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// The device.
    Device,

    /// An interface, given by the index.
    Interface,

    /// An endpoint, given by the index.
    Endpoint,

    /// Other.
    Other,
}

/// The setup stage of a control transfer, minus the direction and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSetup {
    /// Request type.
    pub control_type: ControlType,

    /// Recipient.
    pub recipient: Recipient,

    /// bRequest.
    pub request: u8,

    /// wValue.
    pub value: u16,

    /// wIndex.
    pub index: u16,
}

/// A failure reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The endpoint stalled.
    #[error("stall")]
    Stall,

    /// The device sent more than requested.
    #[error("babble")]
    Babble,

    /// No reply in time.
    #[error("timeout")]
    Timeout,

    /// The device is gone.
    #[error("disconnected")]
    Disconnected,

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl From<TransferError> for TransferProblem {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Stall => TransferProblem::Stall,
            TransferError::Babble => TransferProblem::Babble,
            TransferError::Timeout => TransferProblem::Timeout,
            TransferError::Disconnected => TransferProblem::Other("disconnected".into()),
            TransferError::Other(problem) => TransferProblem::Other(problem),
        }
    }
}

impl TransferError {
    /// Turn into a library error, given how much was written before failing.
    pub(crate) fn into_error(self, bytes_written: usize) -> Error {
        match self {
            TransferError::Disconnected => Error::DeviceDisconnected,
            other => Error::DeviceError {
                problem: other.into(),
                bytes_written,
            },
        }
    }
}

impl From<TransferError> for Error {
    fn from(e: TransferError) -> Self {
        e.into_error(0)
    }
}

/// A USB device this host may talk to.
#[async_trait]
pub trait UsbDevice: Send + Sync {
    /// Descriptors and identifying strings.
    fn info(&self) -> &DeviceInfo;

    /// Open the device for I/O.
    async fn open(&self) -> Result<(), TransferError>;

    /// Close the device.
    async fn close(&self) -> Result<(), TransferError>;

    /// Select a configuration by its value.
    async fn select_configuration(&self, value: u8) -> Result<(), TransferError>;

    /// Claim an interface for exclusive use.
    async fn claim_interface(&self, number: u8) -> Result<(), TransferError>;

    /// Release a claimed interface.
    async fn release_interface(&self, number: u8) -> Result<(), TransferError>;

    /// Select an alternate setting of a claimed interface.
    async fn select_alternate_interface(&self, number: u8, setting: u8)
        -> Result<(), TransferError>;

    /// Host to device control transfer. Returns the number of bytes sent.
    async fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransferError>;

    /// Device to host control transfer of at most `length` bytes.
    async fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransferError>;

    /// Bulk OUT transfer. Returns the number of bytes the device accepted.
    async fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError>;

    /// Bulk IN transfer of at most `length` bytes.
    async fn bulk_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransferError>;

    /// Clear a halt (stall) condition on an endpoint.
    async fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<(), TransferError>;
}

/// Something which knows about attached devices.
#[async_trait]
pub trait UsbBackend: Send + Sync {
    /// Devices this host has been granted access to.
    async fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>, TransferError>;

    /// Ask the user (or OS) for a device matching any of the filters.
    /// `None` if nothing was chosen.
    async fn request_device(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<Arc<dyn UsbDevice>>, TransferError>;

    /// Subscribe to connect and disconnect events.
    fn events(&self) -> broadcast::Receiver<BackendEvent>;
}

/// Raw events from a [`UsbBackend`].
#[derive(Clone)]
pub enum BackendEvent {
    /// A device (which access was granted to) appeared.
    Connected(Arc<dyn UsbDevice>),

    /// A device went away.
    Disconnected(DeviceId),
}

impl std::fmt::Debug for BackendEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendEvent::Connected(device) => {
                f.debug_tuple("Connected").field(&device.info().id).finish()
            }
            BackendEvent::Disconnected(id) => f.debug_tuple("Disconnected").field(id).finish(),
        }
    }
}
