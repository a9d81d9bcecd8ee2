//! The registry knows which ports exist.
//!
//! It asks the backend for devices, keeps one [`Port`] per CDC-ACM device,
//! and forwards connect and disconnect events annotated with the matching port.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use itertools::Itertools;
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::Config,
    error::Error,
    events::PortEvent,
    serial::{port::AcmInterfaces, Port},
    usb::{BackendEvent, DeviceFilter, DeviceId, UsbBackend, UsbDevice, CDC_CLASS},
};

struct RegistryInner {
    backend: Arc<dyn UsbBackend>,
    config: Config,
    ports: RwLock<HashMap<DeviceId, Port>>,
    events: broadcast::Sender<PortEvent>,
}

impl RegistryInner {
    /// The known port for a device, or a new one if it's a CDC-ACM device.
    async fn port_for(&self, device: Arc<dyn UsbDevice>) -> Option<(Port, bool)> {
        let id = device.info().id.clone();

        let mut ports = self.ports.write().await;

        if let Some(port) = ports.get(&id) {
            return Some((port.clone(), false));
        }

        AcmInterfaces::find(device.info())?;

        match Port::new(device, &self.config) {
            Ok(port) => {
                ports.insert(id, port.clone());
                Some((port, true))
            }
            Err(e) => {
                warn!(%id, %e, "Could not create port");
                None
            }
        }
    }

    fn send(&self, event: PortEvent) {
        match self.events.send(event) {
            Ok(listeners) => debug!("Broadcasted port event to {listeners} listener(s)"),
            Err(_) => debug!("No one is listening for port events"),
        }
    }

    async fn connected(&self, device: Arc<dyn UsbDevice>) {
        let id = device.info().id.clone();

        match self.port_for(device).await {
            Some((port, _)) => {
                info!(%port, "Port connected");
                self.send(PortEvent::Connected(port));
            }
            None => debug!(%id, "Ignoring non CDC-ACM device"),
        }
    }

    async fn disconnected(&self, id: &DeviceId) {
        let port = self.ports.write().await.remove(id);

        if let Some(port) = port {
            info!(%port, "Port disconnected");
            port.disconnected().await;
            self.send(PortEvent::Disconnected(port));
        }
    }

    /// Catch up after missing backend events.
    async fn resync(&self) {
        let devices = match self.backend.devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(%e, "Could not list devices to resync");
                return;
            }
        };

        let present = devices
            .iter()
            .map(|device| device.info().id.clone())
            .collect::<HashSet<_>>();

        let vanished = self
            .ports
            .read()
            .await
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect::<Vec<_>>();

        for id in vanished {
            self.disconnected(&id).await;
        }

        for device in devices {
            let known = self.ports.read().await.contains_key(&device.info().id);

            if !known {
                self.connected(device).await;
            }
        }
    }

    async fn handle(&self, event: BackendEvent) {
        debug!(?event, "Backend event");

        match event {
            BackendEvent::Connected(device) => self.connected(device).await,
            BackendEvent::Disconnected(id) => self.disconnected(&id).await,
        }
    }
}

/// Keeps track of serial ports.
///
/// Create one at startup and pass it to whoever needs ports.
/// Listening for backend events stops on [`Registry::shutdown`] or drop.
pub struct Registry {
    inner: Arc<RegistryInner>,
    listener: JoinHandle<()>,
}

impl Registry {
    /// Start a registry on top of a backend.
    /// Must be called from within a Tokio runtime.
    pub fn new(backend: Arc<dyn UsbBackend>, config: Config) -> Self {
        let mut backend_events = backend.events();
        let (events, _) = broadcast::channel(64);

        let inner = Arc::new(RegistryInner {
            backend,
            config,
            ports: RwLock::new(HashMap::new()),
            events,
        });

        let listener_inner = inner.clone();
        let listener = tokio::spawn(
            async move {
                loop {
                    match backend_events.recv().await {
                        Ok(event) => listener_inner.handle(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Missed backend events, resyncing");
                            listener_inner.resync().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Backend stopped sending events");
                            break;
                        }
                    }
                }
            }
            .instrument(info_span!("registry")),
        );

        Self { inner, listener }
    }

    /// Ports of all CDC-ACM devices access has been granted to.
    pub async fn get_ports(&self) -> Result<Vec<Port>, Error> {
        let devices = self.inner.backend.devices().await?;

        let mut ports = vec![];
        for device in devices {
            if let Some((port, _)) = self.inner.port_for(device).await {
                ports.push(port);
            }
        }

        Ok(ports
            .into_iter()
            .sorted_by(|a, b| a.info().device.cmp(&b.info().device))
            .collect())
    }

    /// Ask for access to a port matching any of the filters.
    /// No filters means any CDC-ACM device.
    pub async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Port, Error> {
        if let Some(filter) = filters
            .iter()
            .find(|f| f.usb_product_id.is_some() && f.usb_vendor_id.is_none())
        {
            return Err(Error::BadUsage(format!(
                "A filter with a product id needs a vendor id: {filter:?}"
            )));
        }

        let narrowed = if filters.is_empty() {
            vec![DeviceFilter {
                class_code: Some(CDC_CLASS),
                ..Default::default()
            }]
        } else {
            filters
                .iter()
                .map(|filter| DeviceFilter {
                    class_code: filter.class_code.or(Some(CDC_CLASS)),
                    ..filter.clone()
                })
                .collect()
        };

        let device = self
            .inner
            .backend
            .request_device(&narrowed)
            .await?
            .ok_or(Error::NoPortSelected)?;

        let id = device.info().id.clone();

        let (port, new) = self.inner.port_for(device).await.ok_or_else(|| {
            Error::BadUsage(format!("The selected device {id} is not a CDC-ACM device"))
        })?;

        if new {
            info!(%port, "Port granted");
        }

        Ok(port)
    }

    /// Receive connect and disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.inner.events.subscribe()
    }

    /// Connect and disconnect events as a stream.
    pub fn events(&self) -> BroadcastStream<PortEvent> {
        self.subscribe().into()
    }

    /// Stop listening for events and close every open port.
    pub async fn shutdown(self) {
        self.listener.abort();

        let ports = self
            .inner
            .ports
            .write()
            .await
            .drain()
            .map(|(_, port)| port)
            .collect::<Vec<_>>();

        for port in ports {
            match port.close().await {
                Ok(()) => info!(%port, "Closed on shutdown"),
                Err(Error::NotOpen) | Err(Error::DeviceDisconnected) => {}
                Err(e) => warn!(%port, %e, "Could not close on shutdown"),
            }
        }

        info!("Registry shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
