use std::time::Duration;

use acm_serial::{
    config::Config,
    error::Error,
    events::PortEvent,
    mock::{MockBackend, MockDevice, Request},
    registry::Registry,
    serial::{SerialOptions, SessionState},
    usb::{DeviceFilter, DeviceId},
};
use color_eyre::{eyre::eyre, Result};
use common::{wait_for_request, wait_for_state};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::{sync::broadcast, time::timeout};
use tracing::info;

mod common;

async fn registry() -> (std::sync::Arc<MockBackend>, Registry) {
    common::init().await;

    let backend = MockBackend::new();
    let registry = Registry::new(backend.clone(), Config::default());

    (backend, registry)
}

async fn next_event(events: &mut broadcast::Receiver<PortEvent>) -> Result<PortEvent> {
    let event = timeout(Duration::from_secs(5), events.recv()).await??;
    info!(%event, "Event");

    Ok(event)
}

#[tokio::test]
async fn get_ports_lists_granted_acm_devices() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::new("b-acm"), true);
    backend.attach(MockDevice::new("a-acm"), true);
    backend.attach(MockDevice::with_info(MockDevice::vendor_info("vendor")), true);
    backend.attach(MockDevice::new("not-granted"), false);

    let ids = registry
        .get_ports()
        .await?
        .iter()
        .map(|port| port.info().device.clone())
        .collect::<Vec<_>>();

    assert_eq!(ids, vec![DeviceId::from("a-acm"), DeviceId::from("b-acm")]);

    Ok(())
}

#[tokio::test]
async fn same_device_same_port() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::new("stable"), true);

    let first = registry.get_ports().await?;
    let second = registry.get_ports().await?;

    assert_eq!(first.len(), 1);
    assert_eq!(first, second);

    Ok(())
}

#[tokio::test]
async fn request_port_grants_access() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::new("chosen"), false);
    assert_eq!(registry.get_ports().await?, vec![]);

    let port = registry.request_port(&[]).await?;
    assert_eq!(port.info().device, DeviceId::from("chosen"));
    assert_eq!(port.info().usb_vendor_id, 0x1209);
    assert_eq!(port.info().control_interface, 0);
    assert_eq!(port.info().data_interface, 1);

    assert_eq!(registry.get_ports().await?, vec![port]);

    Ok(())
}

#[tokio::test]
async fn request_port_with_filters() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::new("filtered"), false);

    let wrong_vendor = DeviceFilter {
        usb_vendor_id: Some(0x0483),
        ..Default::default()
    };
    assert_eq!(
        registry.request_port(&[wrong_vendor.clone()]).await,
        Err(Error::NoPortSelected)
    );

    let right_vendor = DeviceFilter {
        usb_vendor_id: Some(0x1209),
        usb_product_id: Some(0x0001),
        ..Default::default()
    };
    let port = registry.request_port(&[wrong_vendor, right_vendor]).await?;
    assert_eq!(port.info().device, DeviceId::from("filtered"));

    Ok(())
}

#[tokio::test]
async fn product_id_needs_vendor_id() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::new("any"), false);

    let filter = DeviceFilter {
        usb_product_id: Some(0x0001),
        ..Default::default()
    };
    let result = registry.request_port(&[filter]).await;
    assert!(matches!(result, Err(Error::BadUsage(_))));

    Ok(())
}

#[tokio::test]
async fn cancelled_chooser_selects_nothing() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::new("ignored"), false);
    backend.chooser_cancels(true);

    assert_eq!(registry.request_port(&[]).await, Err(Error::NoPortSelected));

    Ok(())
}

#[tokio::test]
async fn non_acm_devices_are_not_offered() -> Result<()> {
    let (backend, registry) = registry().await;

    backend.attach(MockDevice::with_info(MockDevice::vendor_info("vendor")), false);

    assert_eq!(registry.request_port(&[]).await, Err(Error::NoPortSelected));

    Ok(())
}

#[tokio::test]
async fn connect_and_disconnect_events() -> Result<()> {
    let (backend, registry) = registry().await;
    let mut events = registry.subscribe();

    backend.attach(MockDevice::new("plugged"), true);

    let connected = next_event(&mut events).await?.into_connected();
    assert_eq!(registry.get_ports().await?, vec![connected.clone()]);

    backend.detach(&DeviceId::from("plugged"));

    let disconnected = next_event(&mut events).await?.into_disconnected();
    assert_eq!(disconnected, connected);
    assert!(disconnected.is_disconnected());
    assert_eq!(registry.get_ports().await?, vec![]);

    Ok(())
}

#[tokio::test]
async fn non_acm_devices_raise_no_events() -> Result<()> {
    let (backend, registry) = registry().await;
    let mut events = registry.subscribe();

    backend.attach(MockDevice::with_info(MockDevice::vendor_info("vendor")), true);
    backend.attach(MockDevice::new("acm"), true);

    // The first event is for the CDC-ACM device.
    let port = next_event(&mut events).await?.into_connected();
    assert_eq!(port.info().device, DeviceId::from("acm"));

    Ok(())
}

#[tokio::test]
async fn events_as_stream() -> Result<()> {
    let (backend, registry) = registry().await;
    let mut events = registry.events();

    backend.attach(MockDevice::new("streamed"), true);

    let event = timeout(Duration::from_secs(5), events.next())
        .await?
        .ok_or_else(|| eyre!("Event stream ended"))??;

    assert!(matches!(event, PortEvent::Connected(_)));
    assert_eq!(event.port().info().device, DeviceId::from("streamed"));

    Ok(())
}

#[tokio::test]
async fn unplugging_an_open_port_closes_it() -> Result<()> {
    let (backend, registry) = registry().await;
    let mut events = registry.subscribe();

    let device = MockDevice::new("unplugged");
    backend.attach(device.clone(), true);

    let port = next_event(&mut events).await?.into_connected();
    port.open(SerialOptions::default()).await?;
    let mut reader = port.reader().await?;

    device.disconnect();
    backend.detach(&DeviceId::from("unplugged"));

    let gone = next_event(&mut events).await?.into_disconnected();
    assert_eq!(gone, port);

    wait_for_state(&port, SessionState::Closed).await?;
    assert_eq!(reader.read().await, Err(Error::DeviceDisconnected));
    assert_eq!(
        port.open(SerialOptions::default()).await,
        Err(Error::DeviceDisconnected)
    );

    Ok(())
}

#[tokio::test]
async fn unplugging_while_opening_closes_the_port() -> Result<()> {
    common::init().await;

    // Long enough that only the unplug can end the open.
    let config = Config {
        control_timeout_ms: 60_000,
        ..Default::default()
    };
    let backend = MockBackend::new();
    let registry = Registry::new(backend.clone(), config);
    let mut events = registry.subscribe();

    let device = MockDevice::new("stuck-claim");
    device.hang_claims(true);
    backend.attach(device.clone(), true);

    let port = next_event(&mut events).await?.into_connected();

    let opening = {
        let port = port.clone();
        tokio::spawn(async move { port.open(SerialOptions::default()).await })
    };

    wait_for_request(&device, |r| matches!(r, Request::ClaimInterface(_))).await?;
    assert_eq!(port.state(), SessionState::Opening);

    backend.detach(&DeviceId::from("stuck-claim"));

    let gone = next_event(&mut events).await?.into_disconnected();
    assert_eq!(gone, port);

    let result = timeout(Duration::from_secs(5), opening).await??;
    assert_eq!(result, Err(Error::DeviceDisconnected));
    wait_for_state(&port, SessionState::Closed).await?;

    // Nothing is released on a device which is gone.
    assert!(!device
        .requests()
        .iter()
        .any(|r| matches!(r, Request::ReleaseInterface(_) | Request::Close)));

    // Events keep flowing for other devices.
    backend.attach(MockDevice::new("next"), true);
    let next = next_event(&mut events).await?.into_connected();
    assert_eq!(next.info().device, DeviceId::from("next"));

    Ok(())
}

#[tokio::test]
async fn replugged_device_is_a_new_port() -> Result<()> {
    let (backend, registry) = registry().await;
    let mut events = registry.subscribe();

    backend.attach(MockDevice::new("replug"), true);
    let before = next_event(&mut events).await?.into_connected();

    backend.detach(&DeviceId::from("replug"));
    next_event(&mut events).await?.into_disconnected();

    backend.attach(MockDevice::new("replug"), true);
    let after = next_event(&mut events).await?.into_connected();

    assert_ne!(before, after);
    assert!(before.is_disconnected());
    assert!(!after.is_disconnected());

    Ok(())
}

#[tokio::test]
async fn shutdown_closes_open_ports() -> Result<()> {
    let (backend, registry) = registry().await;

    let device = MockDevice::new("open-at-shutdown");
    backend.attach(device.clone(), false);

    let port = registry.request_port(&[]).await?;
    port.open(SerialOptions::default()).await?;
    device.clear_requests();

    registry.shutdown().await;

    assert_eq!(port.state(), SessionState::Closed);
    assert_eq!(
        device.requests(),
        vec![
            Request::ReleaseInterface(1),
            Request::ReleaseInterface(0),
            Request::Close,
        ]
    );

    Ok(())
}
