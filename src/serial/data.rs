//! The byte streams of an open port.
//!
//! Reads and writes go straight to the bulk endpoints of the data interface,
//! chunked by the buffer size in effect when the call starts.
//! The two directions are independent and may run at the same time.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::{
    error::Error,
    serial::{error::TransferProblem, port::AcmInterfaces, session::Abort},
    usb::{Direction, TransferError, UsbDevice},
};

/// The data interface of a session.
pub(crate) struct DataChannel {
    device: Arc<dyn UsbDevice>,
    in_endpoint: u8,
    out_endpoint: u8,
    buffer_size: AtomicUsize,
    abort: Abort,

    // Transfers hold this shared while in flight.
    // Closing takes it exclusively once they are cancelled, which
    // also keeps new transfers from starting.
    gate: RwLock<()>,

    reader_taken: AtomicBool,
    writer_taken: AtomicBool,
}

impl DataChannel {
    pub(crate) fn new(
        device: Arc<dyn UsbDevice>,
        interfaces: &AcmInterfaces,
        buffer_size: usize,
        abort: Abort,
    ) -> Self {
        Self {
            device,
            in_endpoint: interfaces.in_endpoint,
            out_endpoint: interfaces.out_endpoint,
            buffer_size: AtomicUsize::new(buffer_size),
            abort,
            gate: RwLock::new(()),
            reader_taken: AtomicBool::new(false),
            writer_taken: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_buffer_size(&self, buffer_size: usize) {
        self.buffer_size.store(buffer_size, Ordering::SeqCst);
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::SeqCst)
    }

    /// Resolves when no transfer is in flight.
    /// Meant to be awaited after cancelling.
    pub(crate) async fn drained(&self) {
        let _exclusive = self.gate.write().await;
    }

    pub(crate) fn take_reader(self: &Arc<Self>) -> Result<PortReader, Error> {
        if self.reader_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::BadUsage("The port already has a reader".into()));
        }

        Ok(PortReader {
            channel: self.clone(),
            done: false,
        })
    }

    pub(crate) fn take_writer(self: &Arc<Self>) -> Result<PortWriter, Error> {
        if self.writer_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::BadUsage("The port already has a writer".into()));
        }

        Ok(PortWriter {
            channel: self.clone(),
        })
    }

    /// A stalled endpoint is cleared so a new stream may continue.
    async fn recover(&self, e: &TransferError, direction: Direction, endpoint: u8) {
        if e != &TransferError::Stall {
            return;
        }

        match self.device.clear_halt(direction, endpoint).await {
            Ok(()) => debug!(?direction, endpoint, "Cleared halt"),
            Err(e) => warn!(?direction, endpoint, %e, "Could not clear halt"),
        }
    }
}

/// Reads bytes from an open port.
///
/// Only one reader exists per port at a time, dropping it allows taking another.
pub struct PortReader {
    channel: Arc<DataChannel>,
    done: bool,
}

impl PortReader {
    /// Wait for the next bytes from the device.
    ///
    /// Returns `Ok(None)` when the stream has ended,
    /// either because the port was closed while waiting or because a previous read failed.
    /// Reading after the port is closed is an error.
    pub async fn read(&mut self) -> Result<Option<Bytes>, Error> {
        let channel = &self.channel;

        if channel.abort.is_cancelled() {
            return Err(channel.abort.closed_error());
        }

        if self.done {
            return Ok(None);
        }

        let _in_flight = channel.gate.read().await;

        loop {
            if channel.abort.is_cancelled() {
                self.done = true;
                return Ok(None);
            }

            let length = channel.buffer_size();
            let transfer = channel.device.bulk_in(channel.in_endpoint, length);

            let result = tokio::select! {
                biased;
                _ = channel.abort.cancelled() => {
                    debug!("Read cancelled");
                    self.done = true;
                    return Ok(None);
                }
                result = transfer => result,
            };

            match result {
                Ok(data) if data.is_empty() => {
                    trace!("Zero length read");
                    continue;
                }
                Ok(data) => {
                    trace!(len = data.len(), "Read");
                    return Ok(Some(Bytes::from(data)));
                }
                Err(e) => {
                    warn!(%e, "Read failed, ending stream");
                    self.done = true;
                    channel.recover(&e, Direction::In, channel.in_endpoint).await;

                    return Err(channel.abort.transfer_error(e, 0));
                }
            }
        }
    }

    /// Turn into a stream of chunks.
    /// The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Error>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;

            match reader.read().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for PortReader {
    fn drop(&mut self) {
        self.channel.reader_taken.store(false, Ordering::SeqCst);
    }
}

/// Writes bytes to an open port.
///
/// Only one writer exists per port at a time, dropping it allows taking another.
/// At most one bulk transfer is in flight per writer, a write returns once
/// the device accepted every chunk.
pub struct PortWriter {
    channel: Arc<DataChannel>,
}

impl PortWriter {
    /// Write all of `data`, returning how many bytes were written.
    ///
    /// On failure the error carries the number of bytes the device accepted,
    /// always a whole number of chunks, so writing may resume from there.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let channel = &self.channel;

        if channel.abort.is_cancelled() {
            return Err(channel.abort.closed_error());
        }

        if data.is_empty() {
            return Ok(0);
        }

        let _in_flight = channel.gate.read().await;

        if channel.abort.is_cancelled() {
            return Err(channel.abort.cancelled_error(0));
        }

        let chunk_size = channel.buffer_size();
        let mut written = 0;

        for chunk in data.chunks(chunk_size) {
            let transfer = channel.device.bulk_out(channel.out_endpoint, chunk);

            let result = tokio::select! {
                biased;
                _ = channel.abort.cancelled() => {
                    debug!(written, "Write cancelled");
                    return Err(channel.abort.cancelled_error(written));
                }
                result = transfer => result,
            };

            match result {
                Ok(n) if n == chunk.len() => {
                    trace!(n, "Wrote chunk");
                    written += n;
                }
                Ok(n) => {
                    warn!(n, expected = chunk.len(), "Short write");

                    return Err(Error::DeviceError {
                        problem: TransferProblem::Other(format!(
                            "Device accepted {n} of {} bytes",
                            chunk.len()
                        )),
                        bytes_written: written + n,
                    });
                }
                Err(e) => {
                    warn!(%e, written, "Write failed");
                    channel
                        .recover(&e, Direction::Out, channel.out_endpoint)
                        .await;

                    return Err(channel.abort.transfer_error(e, written));
                }
            }
        }

        Ok(written)
    }
}

impl Drop for PortWriter {
    fn drop(&mut self) {
        self.channel.writer_taken.store(false, Ordering::SeqCst);
    }
}
