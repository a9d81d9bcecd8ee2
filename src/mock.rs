//! In-memory USB devices, useful to test serial port functionality without hardware.
//!
//! A [`MockDevice`] looks like a CDC-ACM device, records every request it gets,
//! and by default loops bytes written to it back as bytes to read.
//! Failures can be scripted per request.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};

use crate::{
    serial::{control::GET_LINE_CODING, control::SET_LINE_CODING, LineCoding, SerialOptions},
    usb::{
        AlternateSetting, BackendEvent, ConfigurationDescriptor, ControlSetup, DeviceFilter,
        DeviceId, DeviceInfo, Direction, EndpointDescriptor, EndpointKind, InterfaceDescriptor,
        TransferError, UsbBackend, UsbDevice, ACM_SUBCLASS, CDC_CLASS, CDC_DATA_CLASS,
    },
};

/// Bulk IN endpoint number of [`MockDevice::acm_info`].
pub const MOCK_IN_ENDPOINT: u8 = 2;

/// Bulk OUT endpoint number of [`MockDevice::acm_info`].
pub const MOCK_OUT_ENDPOINT: u8 = 2;

/// A request a [`MockDevice`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Device opened.
    Open,

    /// Device closed.
    Close,

    /// Configuration selected.
    SelectConfiguration(u8),

    /// Interface claimed.
    ClaimInterface(u8),

    /// Interface released.
    ReleaseInterface(u8),

    /// Alternate setting selected (interface, setting).
    SelectAlternateInterface(u8, u8),

    /// Host to device control transfer.
    ControlOut {
        /// Setup stage.
        setup: ControlSetup,

        /// Data stage.
        data: Vec<u8>,
    },

    /// Device to host control transfer.
    ControlIn {
        /// Setup stage.
        setup: ControlSetup,

        /// Requested length.
        length: u16,
    },

    /// Bulk OUT transfer.
    BulkOut {
        /// Endpoint number.
        endpoint: u8,

        /// The bytes.
        data: Vec<u8>,
    },

    /// Bulk IN transfer.
    BulkIn {
        /// Endpoint number.
        endpoint: u8,

        /// Requested length.
        length: usize,
    },

    /// Halt cleared.
    ClearHalt(Direction, u8),
}

impl Request {
    /// The class request code, if this is a control transfer.
    pub fn control_request(&self) -> Option<u8> {
        match self {
            Request::ControlOut { setup, .. } | Request::ControlIn { setup, .. } => {
                Some(setup.request)
            }
            _ => None,
        }
    }

    /// If this is a bulk transfer (either direction).
    pub fn is_bulk(&self) -> bool {
        matches!(self, Request::BulkOut { .. } | Request::BulkIn { .. })
    }
}

#[derive(Debug)]
struct MockState {
    requests: Vec<Request>,
    loopback: bool,
    incoming: VecDeque<Vec<u8>>,
    line_coding: Vec<u8>,
    reported_line_coding: Option<Vec<u8>>,
    bulk_out_count: usize,
    bulk_out_failures: HashMap<usize, TransferError>,
    bulk_in_failure: Option<TransferError>,
    control_failures: HashMap<u8, TransferError>,
    claim_failures: HashMap<u8, TransferError>,
    release_failures: HashMap<u8, TransferError>,
    hang_writes: bool,
    hang_claims: bool,
    disconnected: bool,
}

/// A CDC-ACM device living in memory.
#[derive(Debug)]
pub struct MockDevice {
    info: DeviceInfo,
    state: Mutex<MockState>,
    arrived: Notify,
}

impl MockDevice {
    /// Descriptors of a typical CDC-ACM device:
    /// a communications interface 0 with an interrupt endpoint,
    /// and a data interface 1 with bulk endpoints.
    pub fn acm_info(id: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.into(),
            vendor_id: 0x1209,
            product_id: 0x0001,
            class: CDC_CLASS,
            manufacturer: Some("Mock Devices".into()),
            product: Some("Mock Serial".into()),
            serial_number: Some(id.into()),
            active_configuration: None,
            configurations: vec![ConfigurationDescriptor {
                value: 1,
                interfaces: vec![
                    InterfaceDescriptor {
                        number: 0,
                        alternates: vec![AlternateSetting {
                            setting: 0,
                            class: CDC_CLASS,
                            subclass: ACM_SUBCLASS,
                            protocol: 1,
                            endpoints: vec![EndpointDescriptor {
                                number: 1,
                                direction: Direction::In,
                                kind: EndpointKind::Interrupt,
                                packet_size: 8,
                            }],
                        }],
                    },
                    InterfaceDescriptor {
                        number: 1,
                        alternates: vec![AlternateSetting {
                            setting: 0,
                            class: CDC_DATA_CLASS,
                            subclass: 0,
                            protocol: 0,
                            endpoints: vec![
                                EndpointDescriptor {
                                    number: MOCK_IN_ENDPOINT,
                                    direction: Direction::In,
                                    kind: EndpointKind::Bulk,
                                    packet_size: 64,
                                },
                                EndpointDescriptor {
                                    number: MOCK_OUT_ENDPOINT,
                                    direction: Direction::Out,
                                    kind: EndpointKind::Bulk,
                                    packet_size: 64,
                                },
                            ],
                        }],
                    },
                ],
            }],
        }
    }

    /// Descriptors of a device without any CDC interfaces.
    pub fn vendor_info(id: &str) -> DeviceInfo {
        let mut info = Self::acm_info(id);
        info.class = 0xFF;

        for alt in info.configurations[0]
            .interfaces
            .iter_mut()
            .flat_map(|i| &mut i.alternates)
        {
            alt.class = 0xFF;
        }

        info
    }

    /// A CDC-ACM device.
    pub fn new(id: &str) -> Arc<Self> {
        Self::with_info(Self::acm_info(id))
    }

    /// A device with custom descriptors.
    pub fn with_info(info: DeviceInfo) -> Arc<Self> {
        let line_coding = LineCoding::from(&SerialOptions::new(9600)).encode().to_vec();

        Arc::new(Self {
            info,
            state: Mutex::new(MockState {
                requests: vec![],
                loopback: true,
                incoming: VecDeque::new(),
                line_coding,
                reported_line_coding: None,
                bulk_out_count: 0,
                bulk_out_failures: HashMap::new(),
                bulk_in_failure: None,
                control_failures: HashMap::new(),
                claim_failures: HashMap::new(),
                release_failures: HashMap::new(),
                hang_writes: false,
                hang_claims: false,
                disconnected: false,
            }),
            arrived: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A test panicking while holding the lock should not hide
        // what was recorded so far.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a request, failing if the device is gone.
    fn record(&self, request: Request) -> Result<MutexGuard<'_, MockState>, TransferError> {
        trace!(?request, "Mock request");

        let mut state = self.state();
        state.requests.push(request);

        if state.disconnected {
            return Err(TransferError::Disconnected);
        }

        Ok(state)
    }

    /// Everything received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    /// Forget recorded requests.
    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    /// Control requests received so far as (request, value, data).
    pub fn control_requests(&self) -> Vec<(u8, u16, Vec<u8>)> {
        self.state()
            .requests
            .iter()
            .filter_map(|request| match request {
                Request::ControlOut { setup, data } => {
                    Some((setup.request, setup.value, data.clone()))
                }
                Request::ControlIn { setup, .. } => Some((setup.request, setup.value, vec![])),
                _ => None,
            })
            .collect()
    }

    /// Payloads of bulk OUT transfers received so far.
    pub fn written_chunks(&self) -> Vec<Vec<u8>> {
        self.state()
            .requests
            .iter()
            .filter_map(|request| match request {
                Request::BulkOut { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether bulk OUT data shows up as bulk IN data. On by default.
    pub fn set_loopback(&self, loopback: bool) {
        self.state().loopback = loopback;
    }

    /// Make bytes available for reading.
    pub fn push_incoming(&self, bytes: &[u8]) {
        self.state().incoming.push_back(bytes.to_vec());
        self.arrived.notify_one();
    }

    /// Fail the bulk OUT transfer with the given zero based index.
    pub fn fail_bulk_out_at(&self, index: usize, e: TransferError) {
        self.state().bulk_out_failures.insert(index, e);
    }

    /// Fail the next bulk IN transfer.
    pub fn fail_next_bulk_in(&self, e: TransferError) {
        self.state().bulk_in_failure = Some(e);
        self.arrived.notify_one();
    }

    /// Fail every control transfer with the given request code.
    pub fn fail_control(&self, request: u8, e: TransferError) {
        self.state().control_failures.insert(request, e);
    }

    /// Fail claiming the given interface.
    pub fn fail_claim(&self, interface: u8, e: TransferError) {
        self.state().claim_failures.insert(interface, e);
    }

    /// Fail releasing the given interface.
    pub fn fail_release(&self, interface: u8, e: TransferError) {
        self.state().release_failures.insert(interface, e);
    }

    /// Reply to GET_LINE_CODING with these bytes instead of what was set.
    pub fn report_line_coding(&self, bytes: &[u8]) {
        self.state().reported_line_coding = Some(bytes.to_vec());
    }

    /// Make bulk OUT transfers never complete.
    pub fn hang_writes(&self, hang: bool) {
        self.state().hang_writes = hang;
    }

    /// Make claiming interfaces never complete.
    pub fn hang_claims(&self, hang: bool) {
        self.state().hang_claims = hang;
    }

    /// The device goes away. Every following request fails.
    pub fn disconnect(&self) {
        self.state().disconnected = true;
        self.arrived.notify_waiters();
        self.arrived.notify_one();
    }
}

#[async_trait]
impl UsbDevice for MockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn open(&self) -> Result<(), TransferError> {
        self.record(Request::Open).map(|_| ())
    }

    async fn close(&self) -> Result<(), TransferError> {
        self.record(Request::Close).map(|_| ())
    }

    async fn select_configuration(&self, value: u8) -> Result<(), TransferError> {
        self.record(Request::SelectConfiguration(value)).map(|_| ())
    }

    async fn claim_interface(&self, number: u8) -> Result<(), TransferError> {
        let hang = {
            let state = self.record(Request::ClaimInterface(number))?;

            if let Some(e) = state.claim_failures.get(&number) {
                return Err(e.clone());
            }

            state.hang_claims
        };

        if hang {
            std::future::pending::<()>().await;
        }

        Ok(())
    }

    async fn release_interface(&self, number: u8) -> Result<(), TransferError> {
        let state = self.record(Request::ReleaseInterface(number))?;

        match state.release_failures.get(&number) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn select_alternate_interface(
        &self,
        number: u8,
        setting: u8,
    ) -> Result<(), TransferError> {
        self.record(Request::SelectAlternateInterface(number, setting))
            .map(|_| ())
    }

    async fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, TransferError> {
        let mut state = self.record(Request::ControlOut {
            setup,
            data: data.to_vec(),
        })?;

        if let Some(e) = state.control_failures.get(&setup.request) {
            return Err(e.clone());
        }

        if setup.request == SET_LINE_CODING {
            state.line_coding = data.to_vec();
        }

        Ok(data.len())
    }

    async fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransferError> {
        let state = self.record(Request::ControlIn { setup, length })?;

        if let Some(e) = state.control_failures.get(&setup.request) {
            return Err(e.clone());
        }

        if setup.request != GET_LINE_CODING {
            return Err(TransferError::Stall);
        }

        let mut reply = state
            .reported_line_coding
            .clone()
            .unwrap_or_else(|| state.line_coding.clone());
        reply.truncate(usize::from(length));

        Ok(reply)
    }

    async fn bulk_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError> {
        let hang = {
            let mut state = self.record(Request::BulkOut {
                endpoint,
                data: data.to_vec(),
            })?;

            let index = state.bulk_out_count;
            state.bulk_out_count += 1;

            if let Some(e) = state.bulk_out_failures.remove(&index) {
                debug!(index, %e, "Failing bulk out");
                return Err(e);
            }

            if !state.hang_writes && state.loopback {
                state.incoming.push_back(data.to_vec());
                self.arrived.notify_one();
            }

            state.hang_writes
        };

        if hang {
            std::future::pending::<()>().await;
        }

        Ok(data.len())
    }

    async fn bulk_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransferError> {
        drop(self.record(Request::BulkIn { endpoint, length })?);

        loop {
            {
                let mut state = self.state();

                if state.disconnected {
                    return Err(TransferError::Disconnected);
                }

                if let Some(e) = state.bulk_in_failure.take() {
                    return Err(e);
                }

                if let Some(mut data) = state.incoming.pop_front() {
                    if data.len() > length {
                        let rest = data.split_off(length);
                        state.incoming.push_front(rest);
                    }

                    return Ok(data);
                }
            }

            self.arrived.notified().await;
        }
    }

    async fn clear_halt(&self, direction: Direction, endpoint: u8) -> Result<(), TransferError> {
        self.record(Request::ClearHalt(direction, endpoint))
            .map(|_| ())
    }
}

#[derive(Debug)]
struct Attached {
    device: Arc<MockDevice>,
    granted: bool,
}

/// A backend whose devices are attached and detached by hand.
///
/// Requesting a device picks the first attached device matching the filters,
/// as if the user chose it.
#[derive(Debug)]
pub struct MockBackend {
    attached: Mutex<Vec<Attached>>,
    chooser_cancels: Mutex<bool>,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for MockBackend {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            attached: Mutex::new(vec![]),
            chooser_cancels: Mutex::new(false),
            events,
        }
    }
}

impl MockBackend {
    /// A backend with nothing attached.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attached(&self) -> MutexGuard<'_, Vec<Attached>> {
        self.attached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Plug a device in.
    /// A granted device is announced and listed right away,
    /// others need to be requested first.
    pub fn attach(&self, device: Arc<MockDevice>, granted: bool) {
        debug!(id = %device.info().id, granted, "Attaching mock device");

        self.attached().push(Attached {
            device: device.clone(),
            granted,
        });

        if granted {
            let _ = self.events.send(BackendEvent::Connected(device));
        }
    }

    /// Unplug a device.
    pub fn detach(&self, id: &DeviceId) {
        let removed = {
            let mut attached = self.attached();
            let before = attached.len();
            attached.retain(|a| &a.device.info().id != id);
            before != attached.len()
        };

        if removed {
            debug!(%id, "Detaching mock device");
            let _ = self.events.send(BackendEvent::Disconnected(id.clone()));
        }
    }

    /// Make the simulated chooser return nothing.
    pub fn chooser_cancels(&self, cancels: bool) {
        *self
            .chooser_cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cancels;
    }
}

#[async_trait]
impl UsbBackend for MockBackend {
    async fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>, TransferError> {
        Ok(self
            .attached()
            .iter()
            .filter(|a| a.granted)
            .map(|a| a.device.clone() as Arc<dyn UsbDevice>)
            .collect())
    }

    async fn request_device(
        &self,
        filters: &[DeviceFilter],
    ) -> Result<Option<Arc<dyn UsbDevice>>, TransferError> {
        let cancels = *self
            .chooser_cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if cancels {
            return Ok(None);
        }

        let mut attached = self.attached();

        let chosen = attached.iter_mut().find(|a| {
            filters.is_empty() || filters.iter().any(|f| f.matches(a.device.info()))
        });

        Ok(chosen.map(|a| {
            a.granted = true;
            a.device.clone() as Arc<dyn UsbDevice>
        }))
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
