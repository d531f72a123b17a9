//! Packet pump between the virtual interface and the stack
//!
//! ```text
//!            read (one frame)                 inject_inbound
//! device  -------------------> inbound loop ------------------> stack
//!         <------------------- outbound task <-----------------
//!            write (one frame)                 read_outbound
//! ```
//!
//! The inbound loop runs on the caller's task; the outbound direction runs on
//! a task of its own. Either direction ending stops the other.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::PumpError;
use crate::stack::{LinkEndpoint, LinkReader, NetworkProtocol};

/// Read buffer headroom over the MTU
pub const FRAME_HEADROOM: usize = 80;

/// Pump counters
#[derive(Debug, Default)]
pub struct PumpStats {
    /// Frames read from the device and injected
    pub frames_in: AtomicU64,
    /// Frames written to the device
    pub frames_out: AtomicU64,
    /// Frames dropped for an unknown IP version
    pub frames_dropped: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl PumpStats {
    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`PumpStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PumpStatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_dropped: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// End-of-stream class errors are the device's way of saying it was closed
fn is_clean_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

/// Shuttle frames between `device` and `link` until cancelled or the device
/// closes
///
/// The device is shut down and dropped before this returns.
///
/// # Errors
///
/// - `PumpError::Cancelled` when `cancel` fired; this takes precedence
/// - `PumpError::DeviceRead` for a read error other than end-of-stream
/// - `PumpError::DeviceWrite` if writing a frame failed
pub async fn run<D>(
    cancel: CancellationToken,
    device: D,
    link: LinkEndpoint,
    stats: Arc<PumpStats>,
) -> Result<(), PumpError>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let mtu = link.mtu();
    let (injector, outbound) = link.split();
    let (mut reader, writer) = tokio::io::split(device);

    let pump_cancel = cancel.child_token();
    let outbound_task = tokio::spawn(drain_outbound(
        outbound,
        writer,
        pump_cancel.clone(),
        Arc::clone(&stats),
    ));

    debug!("Packet pump started (mtu {})", mtu);

    let mut buf = vec![0u8; mtu + FRAME_HEADROOM];
    let inbound_result = loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => break Err(PumpError::Cancelled),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if is_clean_close(&e) => break Ok(()),
                Err(e) => break Err(PumpError::DeviceRead(e)),
            },
        };

        let frame = &buf[..n];
        let Some(protocol) = NetworkProtocol::classify(frame) else {
            trace!("Dropping {} byte frame with IP version {}", n, frame[0] >> 4);
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        let injected = tokio::select! {
            biased;
            () = cancel.cancelled() => break Err(PumpError::Cancelled),
            result = injector.inject_inbound(protocol, Bytes::copy_from_slice(frame)) => result,
        };
        if injected.is_err() {
            debug!("Stack closed, stopping packet pump");
            break Ok(());
        }

        stats.frames_in.fetch_add(1, Ordering::Relaxed);
        stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    };

    // Stop the outbound direction and close the device
    pump_cancel.cancel();
    let outbound_result = match outbound_task.await {
        Ok((mut writer, result)) => {
            if let Err(e) = writer.shutdown().await {
                debug!("Device shutdown failed: {}", e);
            }
            result
        }
        Err(e) => Err(PumpError::DeviceWrite(io::Error::other(e))),
    };
    drop(reader);

    debug!("Packet pump stopped");

    match (inbound_result, outbound_result) {
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => {
            if cancel.is_cancelled() {
                Err(PumpError::Cancelled)
            } else {
                Ok(())
            }
        }
    }
}

async fn drain_outbound<W>(
    mut link: LinkReader,
    mut writer: W,
    cancel: CancellationToken,
    stats: Arc<PumpStats>,
) -> (W, Result<(), PumpError>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = link.read_outbound(&cancel).await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                stats.frames_out.fetch_add(1, Ordering::Relaxed);
                stats.bytes_out.fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(e) if is_clean_close(&e) => {
                debug!("Device closed for writing");
                return (writer, Ok(()));
            }
            Err(e) => {
                warn!("Failed to write {} byte frame to device: {}", frame.len(), e);
                return (writer, Err(PumpError::DeviceWrite(e)));
            }
        }
    }

    (writer, Ok(()))
}
