#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use acm_serial::{
    config::Config,
    mock::{MockDevice, Request},
    serial::{Port, SessionState},
    usb::UsbDevice,
};
use color_eyre::Result;
use tokio::time::timeout;
use tracing::debug;

pub const SET_LINE_CODING: u8 = 0x20;
pub const GET_LINE_CODING: u8 = 0x21;
pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
pub const SEND_BREAK: u8 = 0x23;

pub async fn init() {
    acm_serial::logging::init("debug").await;
}

/// A port on a fresh mock device, not yet open.
pub async fn mock_port(id: &str) -> Result<(Arc<MockDevice>, Port)> {
    mock_port_with(id, Config::default()).await
}

pub async fn mock_port_with(id: &str, config: Config) -> Result<(Arc<MockDevice>, Port)> {
    init().await;

    let device = MockDevice::new(id);
    let port = Port::new(device.clone() as Arc<dyn UsbDevice>, &config)?;

    Ok((device, port))
}

/// Wait until the port reaches `state`, failing after a few seconds.
pub async fn wait_for_state(port: &Port, state: SessionState) -> Result<()> {
    let mut watcher = port.watch_state();

    timeout(Duration::from_secs(5), async {
        loop {
            let current = *watcher.borrow_and_update();
            debug!(%current, wanted = %state, "Waiting for state");

            if current == state {
                return;
            }

            if watcher.changed().await.is_err() {
                return;
            }
        }
    })
    .await?;

    assert_eq!(port.state(), state);

    Ok(())
}

/// Wait until the device has received a request matching `pred`.
pub async fn wait_for_request(device: &MockDevice, pred: impl Fn(&Request) -> bool) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !device.requests().iter().any(&pred) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    Ok(())
}
