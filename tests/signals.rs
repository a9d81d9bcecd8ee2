use acm_serial::{
    config::{Config, InitialSignals},
    error::Error,
    serial::{error::TransferProblem, OutputSignals, SerialOptions, SessionState},
    usb::TransferError,
};
use color_eyre::Result;
use common::{mock_port, mock_port_with, SEND_BREAK, SET_CONTROL_LINE_STATE};
use pretty_assertions::assert_eq;

mod common;

#[tokio::test]
async fn break_on_then_off() -> Result<()> {
    let (device, port) = mock_port("break").await?;

    port.open(SerialOptions::default()).await?;
    let before = port.signals().await?;
    device.clear_requests();

    port.set_signals(OutputSignals::brk(true)).await?;
    port.set_signals(OutputSignals::brk(false)).await?;

    assert_eq!(
        device.control_requests(),
        vec![(SEND_BREAK, 0xFFFF, vec![]), (SEND_BREAK, 0x0000, vec![])]
    );
    assert_eq!(port.signals().await?, before);

    Ok(())
}

#[tokio::test]
async fn unset_levels_keep_what_was_sent() -> Result<()> {
    let (device, port) = mock_port("merge-levels").await?;

    port.open(SerialOptions::default()).await?;
    assert_eq!(
        port.signals().await?,
        OutputSignals {
            dtr: Some(true),
            rts: Some(false),
            brk: None
        }
    );
    device.clear_requests();

    port.set_signals(OutputSignals::rts(true)).await?;
    port.set_signals(OutputSignals::dtr(false)).await?;

    assert_eq!(
        device.control_requests(),
        vec![
            (SET_CONTROL_LINE_STATE, 0b11, vec![]),
            (SET_CONTROL_LINE_STATE, 0b10, vec![]),
        ]
    );
    assert_eq!(
        port.signals().await?,
        OutputSignals {
            dtr: Some(false),
            rts: Some(true),
            brk: None
        }
    );

    Ok(())
}

#[tokio::test]
async fn levels_and_break_together() -> Result<()> {
    let (device, port) = mock_port("levels-and-break").await?;

    port.open(SerialOptions::default()).await?;
    device.clear_requests();

    port.set_signals(OutputSignals {
        dtr: Some(false),
        rts: Some(false),
        brk: Some(true),
    })
    .await?;

    assert_eq!(
        device.control_requests(),
        vec![
            (SET_CONTROL_LINE_STATE, 0b00, vec![]),
            (SEND_BREAK, 0xFFFF, vec![]),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn nothing_to_set_sends_nothing() -> Result<()> {
    let (device, port) = mock_port("no-signals").await?;

    port.open(SerialOptions::default()).await?;
    device.clear_requests();

    port.set_signals(OutputSignals::default()).await?;
    assert_eq!(device.requests(), vec![]);

    Ok(())
}

#[tokio::test]
async fn initial_signals_come_from_config() -> Result<()> {
    let config = Config {
        initial_signals: InitialSignals {
            dtr: false,
            rts: true,
        },
        ..Default::default()
    };
    let (device, port) = mock_port_with("initial-signals", config).await?;

    port.open(SerialOptions::default()).await?;

    let (request, value, _) = device.control_requests()[1].clone();
    assert_eq!(request, SET_CONTROL_LINE_STATE);
    assert_eq!(value, 0b10);

    Ok(())
}

#[tokio::test]
async fn failed_break_closes_the_port() -> Result<()> {
    let (device, port) = mock_port("break-fails").await?;

    port.open(SerialOptions::default()).await?;
    device.fail_control(SEND_BREAK, TransferError::Stall);

    assert_eq!(
        port.set_signals(OutputSignals::brk(true)).await,
        Err(Error::DeviceError {
            problem: TransferProblem::Stall,
            bytes_written: 0
        })
    );
    assert_eq!(port.state(), SessionState::Closed);
    assert_eq!(
        port.set_signals(OutputSignals::brk(false)).await,
        Err(Error::NotOpen)
    );

    Ok(())
}
