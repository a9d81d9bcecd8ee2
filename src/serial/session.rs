use std::{future::Future, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::Error,
    serial::{
        codecs::line_coding::LineCoding,
        control::{ControlChannel, LineState},
        data::DataChannel,
        error::TransferProblem,
        port::AcmInterfaces,
        OutputSignals, SerialOptions,
    },
    usb::{TransferError, UsbDevice},
};

/// Cancellation shared by everything a session has in flight.
///
/// The session token is a child of the port's disconnect token,
/// so it fires on close and on disconnection alike.
#[derive(Debug, Clone)]
pub(crate) struct Abort {
    gone: CancellationToken,
    session: CancellationToken,
}

impl Abort {
    pub(crate) fn new(gone: &CancellationToken) -> Self {
        Self {
            gone: gone.clone(),
            session: gone.child_token(),
        }
    }

    pub(crate) async fn cancelled(&self) {
        self.session.cancelled().await
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.session.cancel()
    }

    /// The device went away underneath us.
    pub(crate) fn device_gone(&self) {
        self.gone.cancel()
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone.is_cancelled()
    }

    /// Error for a transfer interrupted by cancellation.
    pub(crate) fn cancelled_error(&self, bytes_written: usize) -> Error {
        if self.is_gone() {
            Error::DeviceDisconnected
        } else {
            Error::DeviceError {
                problem: TransferProblem::Cancelled,
                bytes_written,
            }
        }
    }

    /// Error for an operation started after cancellation.
    pub(crate) fn closed_error(&self) -> Error {
        if self.is_gone() {
            Error::DeviceDisconnected
        } else {
            Error::NotOpen
        }
    }

    /// Map a failed transfer, noting if the device is gone.
    pub(crate) fn transfer_error(&self, e: TransferError, bytes_written: usize) -> Error {
        if e == TransferError::Disconnected {
            self.device_gone();
        }

        e.into_error(bytes_written)
    }
}

/// Interfaces (and the device itself) acquired while opening.
/// Everything here must be given back on every exit path.
struct Claims {
    device: Arc<dyn UsbDevice>,
    timeout: Duration,
    abort: Abort,
    device_open: bool,
    interfaces: Vec<u8>,
}

impl Claims {
    fn new(device: Arc<dyn UsbDevice>, timeout: Duration, abort: Abort) -> Self {
        Self {
            device,
            timeout,
            abort,
            device_open: false,
            interfaces: vec![],
        }
    }

    /// Run one acquisition step, bounded by the control timeout
    /// and given up as soon as the session is cancelled.
    async fn step<T>(
        &self,
        transfer: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, Error> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(self.abort.cancelled_error(0)),
            result = tokio::time::timeout(self.timeout, transfer) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(self.abort.transfer_error(e, 0)),
                Err(_) => Err(Error::device(TransferProblem::Timeout)),
            },
        }
    }

    async fn open_device(&mut self) -> Result<(), Error> {
        self.step(self.device.open()).await?;
        self.device_open = true;

        Ok(())
    }

    async fn select_configuration(&self, value: u8) -> Result<(), Error> {
        debug!(value, "Selecting configuration");
        self.step(self.device.select_configuration(value)).await
    }

    async fn claim(&mut self, number: u8) -> Result<(), Error> {
        debug!(number, "Claiming interface");

        self.step(self.device.claim_interface(number)).await?;
        self.interfaces.push(number);

        Ok(())
    }

    async fn select_alternate(&self, number: u8, setting: u8) -> Result<(), Error> {
        debug!(number, setting, "Selecting alternate setting");
        self.step(self.device.select_alternate_interface(number, setting))
            .await
    }

    /// Release in reverse order of acquisition.
    /// Failures are logged, never returned.
    async fn release_all(&mut self) {
        while let Some(number) = self.interfaces.pop() {
            match tokio::time::timeout(self.timeout, self.device.release_interface(number)).await
            {
                Ok(Ok(())) => debug!(number, "Released interface"),
                Ok(Err(e)) => warn!(number, %e, "Could not release interface"),
                Err(_) => warn!(number, "Timed out releasing interface"),
            }
        }

        if std::mem::take(&mut self.device_open) {
            match tokio::time::timeout(self.timeout, self.device.close()).await {
                Ok(Ok(())) => debug!("Closed device"),
                Ok(Err(e)) => warn!(%e, "Could not close device"),
                Err(_) => warn!("Timed out closing device"),
            }
        }
    }
}

/// A port while it is open.
pub(crate) struct Session {
    pub(crate) id: Uuid,
    pub(crate) options: SerialOptions,
    pub(crate) control: ControlChannel,
    pub(crate) data: Arc<DataChannel>,
    pub(crate) abort: Abort,
    claims: Claims,
    cancel_timeout: Duration,
}

impl Session {
    /// Claim interfaces and bring the device to the given options.
    /// On failure, whatever was acquired is released again.
    pub(crate) async fn establish(
        device: Arc<dyn UsbDevice>,
        interfaces: &AcmInterfaces,
        options: SerialOptions,
        config: &Config,
        gone: &CancellationToken,
    ) -> Result<Self, Error> {
        let abort = Abort::new(gone);
        let mut claims = Claims::new(device.clone(), config.control_timeout(), abort.clone());

        let result = Self::acquire(&mut claims, interfaces).await;
        let result = match result {
            Ok(()) => {
                let control = ControlChannel::new(
                    device.clone(),
                    interfaces.control_interface,
                    config.control_timeout(),
                    abort.clone(),
                );

                Self::configure(&control, &options, config)
                    .await
                    .map(|_| control)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(control) => {
                let data = Arc::new(DataChannel::new(
                    device,
                    interfaces,
                    options.buffer_size,
                    abort.clone(),
                ));

                Ok(Self {
                    id: Uuid::new_v4(),
                    options,
                    control,
                    data,
                    abort,
                    claims,
                    cancel_timeout: config.cancel_timeout(),
                })
            }
            Err(e) => {
                warn!(%e, "Could not open, unwinding");
                if matches!(e, Error::DeviceDisconnected) {
                    abort.device_gone();
                }

                if abort.is_gone() {
                    debug!("Device is gone, skipping release");
                } else {
                    claims.release_all().await;
                }

                Err(e)
            }
        }
    }

    async fn acquire(claims: &mut Claims, interfaces: &AcmInterfaces) -> Result<(), Error> {
        claims.open_device().await?;

        if claims.device.info().active_configuration != Some(interfaces.configuration) {
            claims
                .select_configuration(interfaces.configuration)
                .await?;
        }

        claims.claim(interfaces.control_interface).await?;

        if interfaces.data_interface != interfaces.control_interface {
            claims.claim(interfaces.data_interface).await?;
        }

        if interfaces.data_setting != 0 {
            claims
                .select_alternate(interfaces.data_interface, interfaces.data_setting)
                .await?;
        }

        Ok(())
    }

    async fn configure(
        control: &ControlChannel,
        options: &SerialOptions,
        config: &Config,
    ) -> Result<(), Error> {
        let coding = LineCoding::from(options);
        control.set_line_coding(&coding).await?;

        if config.verify_line_coding {
            verify(control, &coding).await?;
        }

        control
            .set_control_line_state(
                Some(config.initial_signals.dtr),
                Some(config.initial_signals.rts),
            )
            .await?;

        Ok(())
    }

    /// Change options while open.
    /// The new chunk size applies to transfers issued after this returns.
    pub(crate) async fn reconfigure(
        &mut self,
        options: SerialOptions,
        verify_line_coding: bool,
    ) -> Result<(), Error> {
        let coding = LineCoding::from(&options);

        self.control.set_line_coding(&coding).await?;

        if verify_line_coding {
            verify(&self.control, &coding).await?;
        }

        self.data.set_buffer_size(options.buffer_size);
        self.options = options;

        Ok(())
    }

    /// Apply the given signals.
    /// DTR/RTS go in one request, break in another.
    pub(crate) async fn set_signals(&self, signals: OutputSignals) -> Result<(), Error> {
        if signals.dtr.is_some() || signals.rts.is_some() {
            self.control
                .set_control_line_state(signals.dtr, signals.rts)
                .await?;
        }

        if let Some(brk) = signals.brk {
            self.control.send_break(brk).await?;
        }

        Ok(())
    }

    pub(crate) async fn line_state(&self) -> LineState {
        self.control.line_state().await
    }

    /// Cancel transfers, wait for them to let go (within the cancel budget)
    /// and release everything claimed. Never fails.
    pub(crate) async fn close(mut self) {
        self.abort.cancel();

        match tokio::time::timeout(self.cancel_timeout, self.data.drained()).await {
            Ok(()) => debug!("Transfers drained"),
            Err(_) => warn!(
                budget = ?self.cancel_timeout,
                "Transfers did not drain in time, releasing anyway"
            ),
        }

        if self.abort.is_gone() {
            debug!("Device is gone, skipping release");
        } else {
            self.claims.release_all().await;
        }

        info!(session = %self.id, "Session closed");
    }
}

async fn verify(control: &ControlChannel, expected: &LineCoding) -> Result<(), Error> {
    let reported = control.get_line_coding().await?;

    if &reported != expected {
        return Err(Error::MalformedResponse(format!(
            "Device reports line coding {reported:?}, expected {expected:?}"
        )));
    }

    Ok(())
}
