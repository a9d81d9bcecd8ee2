use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    error::Error,
    serial::{
        data::{PortReader, PortWriter},
        session::Session,
        OutputSignals, SerialOptions, SessionState,
    },
    usb::{
        AlternateSetting, DeviceId, DeviceInfo, Direction, EndpointKind, UsbDevice, ACM_SUBCLASS,
        CDC_CLASS, CDC_DATA_CLASS,
    },
};

/// The interfaces and endpoints making up one CDC-ACM function of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmInterfaces {
    /// Configuration the interfaces belong to.
    pub configuration: u8,

    /// The communications (control) interface.
    pub control_interface: u8,

    /// The data interface.
    pub data_interface: u8,

    /// Alternate setting of the data interface carrying the bulk endpoints.
    pub data_setting: u8,

    /// Bulk IN endpoint number.
    pub in_endpoint: u8,

    /// Bulk OUT endpoint number.
    pub out_endpoint: u8,
}

impl AcmInterfaces {
    /// Find a control interface and its data interface.
    ///
    /// The data interface directly following the control interface is preferred,
    /// which is where the union descriptor of nearly every device points.
    pub fn find(info: &DeviceInfo) -> Option<Self> {
        let configuration = info.configuration()?;

        let control = configuration.interfaces.iter().find(|interface| {
            interface
                .alternates
                .first()
                .map_or(false, |alt| alt.class == CDC_CLASS && alt.subclass == ACM_SUBCLASS)
        })?;

        let bulk = |alt: &AlternateSetting, direction| {
            alt.endpoints
                .iter()
                .find(|ep| ep.kind == EndpointKind::Bulk && ep.direction == direction)
                .map(|ep| ep.number)
        };

        let mut candidates = configuration
            .interfaces
            .iter()
            .flat_map(|interface| {
                interface.alternates.iter().filter_map(move |alt| {
                    if alt.class != CDC_DATA_CLASS {
                        return None;
                    }

                    let in_endpoint = bulk(alt, Direction::In)?;
                    let out_endpoint = bulk(alt, Direction::Out)?;

                    Some(Self {
                        configuration: configuration.value,
                        control_interface: control.number,
                        data_interface: interface.number,
                        data_setting: alt.setting,
                        in_endpoint,
                        out_endpoint,
                    })
                })
            })
            .collect::<Vec<_>>();

        candidates.sort_by_key(|c| c.data_interface != control.number.wrapping_add(1));
        candidates.into_iter().next()
    }
}

/// Identifying information about the device behind a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// The device.
    pub device: DeviceId,

    /// Vendor id.
    pub usb_vendor_id: u16,

    /// Product id.
    pub usb_product_id: u16,

    /// Manufacturer string.
    pub manufacturer: Option<String>,

    /// Product string.
    pub product: Option<String>,

    /// Serial number string.
    pub serial_number: Option<String>,

    /// The control interface used.
    pub control_interface: u8,

    /// The data interface used.
    pub data_interface: u8,
}

impl Display for PortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} ({})",
            self.usb_vendor_id, self.usb_product_id, self.device
        )?;

        if let Some(product) = &self.product {
            write!(f, " {product}")?;
        }

        Ok(())
    }
}

struct PortInner {
    device: Arc<dyn UsbDevice>,
    interfaces: AcmInterfaces,
    info: PortInfo,
    config: Config,

    // Cancelled once the device is gone. Never reset.
    gone: CancellationToken,

    // Held for the whole of open, close, reconfigure and set_signals.
    session: Mutex<Option<Session>>,

    state: watch::Sender<SessionState>,
}

/// A serial port on a USB CDC-ACM device.
///
/// Cheap to clone, clones refer to the same port.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("info", &self.inner.info)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Port {}

impl Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.info)
    }
}

impl Port {
    /// Bind a port to the first CDC-ACM function of a device.
    pub fn new(device: Arc<dyn UsbDevice>, config: &Config) -> Result<Self, Error> {
        let info = device.info();

        let interfaces = AcmInterfaces::find(info).ok_or_else(|| {
            Error::BadUsage(format!(
                "Device {} has no CDC-ACM control and data interface pair",
                info.id
            ))
        })?;

        let port_info = PortInfo {
            device: info.id.clone(),
            usb_vendor_id: info.vendor_id,
            usb_product_id: info.product_id,
            manufacturer: info.manufacturer.clone(),
            product: info.product.clone(),
            serial_number: info.serial_number.clone(),
            control_interface: interfaces.control_interface,
            data_interface: interfaces.data_interface,
        };

        debug!(%port_info, ?interfaces, "New port");

        let (state, _) = watch::channel(SessionState::Closed);

        Ok(Self {
            inner: Arc::new(PortInner {
                device,
                interfaces,
                info: port_info,
                config: config.clone(),
                gone: CancellationToken::new(),
                session: Mutex::new(None),
                state,
            }),
        })
    }

    /// Information about the device behind this port.
    pub fn info(&self) -> &PortInfo {
        &self.inner.info
    }

    /// The interfaces this port uses.
    pub fn interfaces(&self) -> &AcmInterfaces {
        &self.inner.interfaces
    }

    /// Where the port is in its lifecycle right now.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Observe lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// If the device behind this port has been disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.inner.gone.is_cancelled()
    }

    fn set_state(&self, state: SessionState) {
        debug!(%state, "Port state");
        self.inner.state.send_replace(state);
    }

    fn span(&self) -> tracing::Span {
        info_span!("port", info = %self.inner.info)
    }

    /// Close whatever session is left and report disconnection, if the device is gone.
    async fn ensure_present(&self, slot: &mut Option<Session>) -> Result<(), Error> {
        if !self.is_disconnected() {
            return Ok(());
        }

        self.teardown(slot).await;

        Err(Error::DeviceDisconnected)
    }

    async fn teardown(&self, slot: &mut Option<Session>) {
        if let Some(session) = slot.take() {
            self.set_state(SessionState::Closing);
            session.close().await;
        }

        self.set_state(SessionState::Closed);
    }

    /// A failed control request leaves the device in an unknown state,
    /// so the session is closed.
    async fn invalidate(&self, slot: &mut Option<Session>, e: Error) -> Error {
        warn!(%e, "Closing port after failure");

        if e == Error::DeviceDisconnected {
            self.inner.gone.cancel();
        }

        self.teardown(slot).await;

        e
    }

    /// Open the port.
    ///
    /// Claims the interfaces, sends the line coding and the initial control line state.
    pub async fn open(&self, options: SerialOptions) -> Result<(), Error> {
        async {
            let mut slot = self.inner.session.lock().await;
            self.ensure_present(&mut slot).await?;

            if slot.is_some() {
                return Err(Error::AlreadyOpen);
            }

            options.validate_with(self.inner.config.data_bits_policy)?;

            self.set_state(SessionState::Opening);

            let session = Session::establish(
                self.inner.device.clone(),
                &self.inner.interfaces,
                options,
                &self.inner.config,
                &self.inner.gone,
            )
            .await;

            match session {
                Ok(session) => {
                    info!(session = %session.id, options = %session.options, "Opened");

                    self.watch_disconnect(&session);
                    *slot = Some(session);
                    self.set_state(SessionState::Open);

                    Ok(())
                }
                Err(e) => {
                    self.set_state(SessionState::Closed);
                    Err(e)
                }
            }
        }
        .instrument(self.span())
        .await
    }

    /// Tear the session down as soon as the device goes away,
    /// no matter who noticed.
    fn watch_disconnect(&self, session: &Session) {
        let port = Arc::downgrade(&self.inner);
        let abort = session.abort.clone();
        let id = session.id;

        tokio::spawn(
            async move {
                abort.cancelled().await;

                if !abort.is_gone() {
                    return;
                }

                if let Some(inner) = port.upgrade() {
                    let port = Port { inner };
                    let mut slot = port.inner.session.lock().await;

                    if slot.as_ref().map(|s| s.id) == Some(id) {
                        info!("Device gone, closing");
                        port.teardown(&mut slot).await;
                    }
                }
            }
            .instrument(self.span()),
        );
    }

    /// Close the port.
    ///
    /// Cancels transfers in flight and releases the interfaces.
    /// Cleanup problems are logged, the port always ends up closed.
    pub async fn close(&self) -> Result<(), Error> {
        async {
            let mut slot = self.inner.session.lock().await;
            self.ensure_present(&mut slot).await?;

            if slot.is_none() {
                return Err(Error::NotOpen);
            }

            self.teardown(&mut slot).await;
            info!("Closed");

            Ok(())
        }
        .instrument(self.span())
        .await
    }

    /// Change the options of an open port.
    pub async fn reconfigure(&self, options: SerialOptions) -> Result<(), Error> {
        async {
            let mut slot = self.inner.session.lock().await;
            self.ensure_present(&mut slot).await?;

            let session = slot.as_mut().ok_or(Error::NotOpen)?;

            options.validate_with(self.inner.config.data_bits_policy)?;

            match session
                .reconfigure(options, self.inner.config.verify_line_coding)
                .await
            {
                Ok(()) => {
                    info!(options = %session.options, "Reconfigured");
                    Ok(())
                }
                Err(e) => Err(self.invalidate(&mut slot, e).await),
            }
        }
        .instrument(self.span())
        .await
    }

    /// Set output signals of an open port.
    pub async fn set_signals(&self, signals: OutputSignals) -> Result<(), Error> {
        async {
            let mut slot = self.inner.session.lock().await;
            self.ensure_present(&mut slot).await?;

            let session = slot.as_ref().ok_or(Error::NotOpen)?;

            match session.set_signals(signals).await {
                Ok(()) => Ok(()),
                Err(e) => Err(self.invalidate(&mut slot, e).await),
            }
        }
        .instrument(self.span())
        .await
    }

    /// The options of an open port.
    pub async fn options(&self) -> Result<SerialOptions, Error> {
        let mut slot = self.inner.session.lock().await;
        self.ensure_present(&mut slot).await?;

        slot.as_ref()
            .map(|session| session.options.clone())
            .ok_or(Error::NotOpen)
    }

    /// The DTR and RTS levels last sent to an open port.
    pub async fn signals(&self) -> Result<OutputSignals, Error> {
        let mut slot = self.inner.session.lock().await;
        self.ensure_present(&mut slot).await?;

        let session = slot.as_ref().ok_or(Error::NotOpen)?;
        let lines = session.line_state().await;

        Ok(OutputSignals {
            dtr: Some(lines.dtr),
            rts: Some(lines.rts),
            brk: None,
        })
    }

    /// Take the reader of an open port.
    pub async fn reader(&self) -> Result<PortReader, Error> {
        let mut slot = self.inner.session.lock().await;
        self.ensure_present(&mut slot).await?;

        slot.as_ref().ok_or(Error::NotOpen)?.data.take_reader()
    }

    /// Take the writer of an open port.
    pub async fn writer(&self) -> Result<PortWriter, Error> {
        let mut slot = self.inner.session.lock().await;
        self.ensure_present(&mut slot).await?;

        slot.as_ref().ok_or(Error::NotOpen)?.data.take_writer()
    }

    /// The device behind this port went away.
    pub(crate) async fn disconnected(&self) {
        self.inner.gone.cancel();

        let mut slot = self.inner.session.lock().await;
        self.teardown(&mut slot).await;
    }
}
