use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{
    error::Error,
    serial::{
        codecs::line_coding::{LineCoding, LINE_CODING_LEN},
        error::TransferProblem,
        session::Abort,
    },
    usb::{ControlSetup, ControlType, Recipient, UsbDevice},
};

/// Set the line coding, 7 bytes of data.
pub(crate) const SET_LINE_CODING: u8 = 0x20;

/// Get the line coding, 7 bytes of data.
pub(crate) const GET_LINE_CODING: u8 = 0x21;

/// DTR in bit 0 and RTS in bit 1 of wValue.
pub(crate) const SET_CONTROL_LINE_STATE: u8 = 0x22;

/// Break duration in milliseconds in wValue.
pub(crate) const SEND_BREAK: u8 = 0x23;

/// A break lasting until the next [`SEND_BREAK`].
pub(crate) const BREAK_ON: u16 = 0xFFFF;

/// Ends a break.
pub(crate) const BREAK_OFF: u16 = 0x0000;

/// The DTR and RTS levels last sent to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LineState {
    pub(crate) dtr: bool,
    pub(crate) rts: bool,
}

impl LineState {
    fn value(&self) -> u16 {
        u16::from(self.dtr) | (u16::from(self.rts) << 1)
    }
}

/// Issues CDC-ACM class requests to the control interface.
///
/// One request at a time: every request holds the line state lock
/// until the device has answered.
pub(crate) struct ControlChannel {
    device: Arc<dyn UsbDevice>,
    interface: u8,
    timeout: Duration,
    abort: Abort,
    lines: Mutex<LineState>,
}

impl ControlChannel {
    pub(crate) fn new(
        device: Arc<dyn UsbDevice>,
        interface: u8,
        timeout: Duration,
        abort: Abort,
    ) -> Self {
        Self {
            device,
            interface,
            timeout,
            abort,
            lines: Mutex::new(LineState::default()),
        }
    }

    fn setup(&self, request: u8, value: u16) -> ControlSetup {
        ControlSetup {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: u16::from(self.interface),
        }
    }

    async fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), Error> {
        trace!(request, value, len = data.len(), "Control out");

        let transfer = self.device.control_out(self.setup(request, value), data);

        let sent = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(self.abort.cancelled_error(0)),
            result = tokio::time::timeout(self.timeout, transfer) => result
                .map_err(|_| Error::device(TransferProblem::Timeout))??,
        };

        if sent != data.len() {
            return Err(Error::DeviceError {
                problem: TransferProblem::Other(format!(
                    "Control request {request:#04x} sent {sent} of {} bytes",
                    data.len()
                )),
                bytes_written: sent,
            });
        }

        Ok(())
    }

    async fn control_in(&self, request: u8, length: u16) -> Result<Vec<u8>, Error> {
        trace!(request, length, "Control in");

        let transfer = self.device.control_in(self.setup(request, 0), length);

        let data = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(self.abort.cancelled_error(0)),
            result = tokio::time::timeout(self.timeout, transfer) => result
                .map_err(|_| Error::device(TransferProblem::Timeout))??,
        };

        Ok(data)
    }

    /// SET_LINE_CODING.
    pub(crate) async fn set_line_coding(&self, coding: &LineCoding) -> Result<(), Error> {
        let _lines = self.lines.lock().await;

        debug!(?coding, "Setting line coding");
        self.control_out(SET_LINE_CODING, 0, &coding.encode()).await
    }

    /// GET_LINE_CODING.
    pub(crate) async fn get_line_coding(&self) -> Result<LineCoding, Error> {
        let _lines = self.lines.lock().await;

        let data = self
            .control_in(GET_LINE_CODING, LINE_CODING_LEN as u16)
            .await?;

        LineCoding::decode(&data)
    }

    /// SET_CONTROL_LINE_STATE.
    /// Levels not given keep what was last sent.
    pub(crate) async fn set_control_line_state(
        &self,
        dtr: Option<bool>,
        rts: Option<bool>,
    ) -> Result<LineState, Error> {
        let mut lines = self.lines.lock().await;

        let next = LineState {
            dtr: dtr.unwrap_or(lines.dtr),
            rts: rts.unwrap_or(lines.rts),
        };

        debug!(?next, "Setting control line state");
        self.control_out(SET_CONTROL_LINE_STATE, next.value(), &[])
            .await?;

        *lines = next;

        Ok(next)
    }

    /// SEND_BREAK, either indefinitely or ending one.
    pub(crate) async fn send_break(&self, active: bool) -> Result<(), Error> {
        let _lines = self.lines.lock().await;

        let duration = if active { BREAK_ON } else { BREAK_OFF };

        debug!(active, "Sending break");
        self.control_out(SEND_BREAK, duration, &[]).await
    }

    pub(crate) async fn line_state(&self) -> LineState {
        *self.lines.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_state_bits() {
        let value = |dtr, rts| LineState { dtr, rts }.value();

        assert_eq!(value(false, false), 0b00);
        assert_eq!(value(true, false), 0b01);
        assert_eq!(value(false, true), 0b10);
        assert_eq!(value(true, true), 0b11);
    }
}
