use std::time::Duration;

use acm_serial::{
    error::Error,
    mock::{Request, MOCK_IN_ENDPOINT, MOCK_OUT_ENDPOINT},
    serial::{error::TransferProblem, SerialOptions, SessionState},
    usb::{Direction, TransferError},
};
use color_eyre::{eyre::eyre, Result};
use common::{mock_port, wait_for_request, wait_for_state};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use tokio::time::timeout;
use tracing::{debug, info};

mod common;

#[tokio::test]
async fn write_is_chunked_by_buffer_size() -> Result<()> {
    let (device, port) = mock_port("chunks").await?;
    device.set_loopback(false);

    port.open(SerialOptions::new(9600).buffer_size(4)).await?;
    let mut writer = port.writer().await?;

    let written = writer.write(b"0123456789").await?;
    assert_eq!(written, 10);

    assert_eq!(
        device.written_chunks(),
        vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]
    );

    Ok(())
}

#[tokio::test]
async fn empty_write_does_nothing() -> Result<()> {
    let (device, port) = mock_port("empty-write").await?;

    port.open(SerialOptions::default()).await?;
    let mut writer = port.writer().await?;

    assert_eq!(writer.write(&[]).await?, 0);
    assert_eq!(device.written_chunks(), Vec::<Vec<u8>>::new());

    Ok(())
}

#[tokio::test]
async fn failed_chunk_reports_bytes_written() -> Result<()> {
    let (device, port) = mock_port("third-chunk-stalls").await?;
    device.set_loopback(false);

    let buffer_size = 8;
    port.open(SerialOptions::new(9600).buffer_size(buffer_size))
        .await?;
    let mut writer = port.writer().await?;

    let data = (0..5 * buffer_size as u8).collect::<Vec<_>>();
    device.fail_bulk_out_at(2, TransferError::Stall);

    let e = writer
        .write(&data)
        .await
        .expect_err("Third chunk should fail");
    info!(%e, "Write failed");

    assert_eq!(
        e,
        Error::DeviceError {
            problem: TransferProblem::Stall,
            bytes_written: 2 * buffer_size
        }
    );
    assert_eq!(e.bytes_written(), Some(2 * buffer_size));

    assert!(device
        .requests()
        .contains(&Request::ClearHalt(Direction::Out, MOCK_OUT_ENDPOINT)));

    // The session survives, writing resumes where it failed.
    assert_eq!(port.state(), SessionState::Open);
    let resumed = writer.write(&data[2 * buffer_size..]).await?;
    assert_eq!(resumed, 3 * buffer_size);

    let chunks = device.written_chunks();
    assert_eq!(chunks.len(), 6);
    assert_eq!(chunks[2], chunks[3]);
    assert_eq!(&chunks.concat()[..2 * buffer_size], &data[..2 * buffer_size]);

    Ok(())
}

#[tokio::test]
async fn loopback_round_trip() -> Result<()> {
    let (_device, port) = mock_port("round-trip").await?;

    port.open(SerialOptions::new(115_200).buffer_size(16)).await?;

    let mut writer = port.writer().await?;
    let mut reader = port.reader().await?;

    let message = b"The quick brown fox jumps over the lazy dog";
    let written = writer.write(message).await?;
    assert_eq!(written, message.len());

    let mut received = vec![];
    while received.len() < message.len() {
        let chunk = timeout(Duration::from_secs(5), reader.read())
            .await??
            .ok_or_else(|| eyre!("Stream ended early"))?;
        debug!(len = chunk.len(), "Chunk");

        assert!(chunk.len() <= 16);
        received.extend_from_slice(&chunk);
    }

    assert_eq!(received, message.to_vec());

    Ok(())
}

#[tokio::test]
async fn reads_are_bounded_by_buffer_size() -> Result<()> {
    let (device, port) = mock_port("bounded-reads").await?;

    port.open(SerialOptions::new(9600).buffer_size(4)).await?;
    let mut reader = port.reader().await?;

    device.push_incoming(b"abcdefghij");

    let mut chunks = vec![];
    for _ in 0..3 {
        let chunk = timeout(Duration::from_secs(5), reader.read())
            .await??
            .ok_or_else(|| eyre!("Stream ended early"))?;
        chunks.push(chunk.to_vec());
    }

    assert_eq!(
        chunks,
        vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec()]
    );

    assert!(device.requests().contains(&Request::BulkIn {
        endpoint: MOCK_IN_ENDPOINT,
        length: 4
    }));

    Ok(())
}

#[tokio::test]
async fn zero_length_reads_do_not_end_the_stream() -> Result<()> {
    let (device, port) = mock_port("zero-length").await?;

    port.open(SerialOptions::default()).await?;
    let mut reader = port.reader().await?;

    device.push_incoming(b"");
    device.push_incoming(b"x");

    let chunk = timeout(Duration::from_secs(5), reader.read()).await??;
    assert_eq!(chunk.as_deref(), Some(&b"x"[..]));

    // Both the empty and the non-empty transfer were issued.
    let bulk_ins = device
        .requests()
        .iter()
        .filter(|r| matches!(r, Request::BulkIn { .. }))
        .count();
    assert_eq!(bulk_ins, 2);

    Ok(())
}

#[tokio::test]
async fn reader_as_stream() -> Result<()> {
    let (device, port) = mock_port("stream").await?;

    port.open(SerialOptions::default()).await?;
    let reader = port.reader().await?;

    for word in ["one", "two", "three"] {
        device.push_incoming(word.as_bytes());
    }

    let words = timeout(
        Duration::from_secs(5),
        reader.into_stream().take(3).collect::<Vec<_>>(),
    )
    .await?
    .into_iter()
    .map(|chunk| chunk.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    .collect::<Result<Vec<_>, _>>()?;

    assert_eq!(words, vec!["one", "two", "three"]);

    Ok(())
}

#[tokio::test]
async fn failed_read_ends_the_stream() -> Result<()> {
    let (device, port) = mock_port("read-stalls").await?;

    port.open(SerialOptions::default()).await?;
    let mut reader = port.reader().await?;

    device.fail_next_bulk_in(TransferError::Stall);

    assert_eq!(
        reader.read().await,
        Err(Error::DeviceError {
            problem: TransferProblem::Stall,
            bytes_written: 0
        })
    );
    assert_eq!(reader.read().await, Ok(None));

    assert!(device
        .requests()
        .contains(&Request::ClearHalt(Direction::In, MOCK_IN_ENDPOINT)));
    assert_eq!(port.state(), SessionState::Open);

    // A new reader continues.
    drop(reader);
    let mut reader = port.reader().await?;
    device.push_incoming(b"again");

    let chunk = timeout(Duration::from_secs(5), reader.read()).await??;
    assert_eq!(chunk.as_deref(), Some(&b"again"[..]));

    Ok(())
}

#[tokio::test]
async fn one_reader_and_one_writer() -> Result<()> {
    let (_device, port) = mock_port("single-owner").await?;

    port.open(SerialOptions::default()).await?;

    let reader = port.reader().await?;
    assert!(matches!(port.reader().await, Err(Error::BadUsage(_))));

    let writer = port.writer().await?;
    assert!(matches!(port.writer().await, Err(Error::BadUsage(_))));

    drop(reader);
    drop(writer);

    port.reader().await?;
    port.writer().await?;

    Ok(())
}

#[tokio::test]
async fn close_ends_pending_read() -> Result<()> {
    let (device, port) = mock_port("close-while-reading").await?;

    port.open(SerialOptions::default()).await?;
    let mut reader = port.reader().await?;

    let pending = tokio::spawn(async move {
        let result = reader.read().await;
        (reader, result)
    });

    wait_for_request(&device, Request::is_bulk).await?;

    timeout(Duration::from_secs(5), port.close()).await??;
    assert_eq!(port.state(), SessionState::Closed);

    let (mut reader, result) = timeout(Duration::from_secs(5), pending).await??;
    assert_eq!(result, Ok(None));

    assert_eq!(reader.read().await, Err(Error::NotOpen));

    Ok(())
}

#[tokio::test]
async fn close_cancels_pending_write() -> Result<()> {
    let (device, port) = mock_port("close-while-writing").await?;
    device.hang_writes(true);

    port.open(SerialOptions::new(9600).buffer_size(8)).await?;
    let mut writer = port.writer().await?;

    let pending = tokio::spawn(async move {
        let result = writer.write(&[0x55; 32]).await;
        (writer, result)
    });

    wait_for_request(&device, Request::is_bulk).await?;

    timeout(Duration::from_secs(5), port.close()).await??;
    wait_for_state(&port, SessionState::Closed).await?;

    let (mut writer, result) = timeout(Duration::from_secs(5), pending).await??;
    assert_eq!(
        result,
        Err(Error::DeviceError {
            problem: TransferProblem::Cancelled,
            bytes_written: 0
        })
    );

    assert_eq!(writer.write(b"late").await, Err(Error::NotOpen));

    // Only the first chunk was ever issued.
    assert_eq!(device.written_chunks().len(), 1);

    Ok(())
}

#[tokio::test]
async fn reconfigure_changes_chunk_size() -> Result<()> {
    let (device, port) = mock_port("rechunk").await?;
    device.set_loopback(false);

    port.open(SerialOptions::new(9600)).await?;
    let mut writer = port.writer().await?;

    writer.write(b"abcdefg").await?;
    port.reconfigure(SerialOptions::new(9600).buffer_size(3))
        .await?;
    writer.write(b"abcdefg").await?;

    let sizes = device
        .written_chunks()
        .iter()
        .map(Vec::len)
        .collect::<Vec<_>>();
    assert_eq!(sizes, vec![7, 3, 3, 1]);

    Ok(())
}

#[tokio::test]
async fn reads_and_writes_run_concurrently() -> Result<()> {
    let (_device, port) = mock_port("full-duplex").await?;

    port.open(SerialOptions::new(9600).buffer_size(32)).await?;

    let mut reader = port.reader().await?;
    let mut writer = port.writer().await?;

    let payload = (0..=255u8).cycle().take(1000).collect::<Vec<_>>();
    let expected = payload.clone();

    let read_all = tokio::spawn(async move {
        let mut received = vec![];
        while received.len() < expected.len() {
            match reader.read().await {
                Ok(Some(chunk)) => received.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(received)
    });

    // Let the reader block on the device first.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(writer.write(&payload).await?, payload.len());

    let received = timeout(Duration::from_secs(5), read_all).await???;
    assert_eq!(received, payload);

    Ok(())
}
