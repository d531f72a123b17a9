//! In-memory frame device
//!
//! [`ChannelDevice`] behaves like a TUN interface whose other side is a
//! [`DeviceHandle`]: frames sent through the handle are read by the engine,
//! frames the engine writes are received by the handle.
//!
//! ```ignore
//! let (device, mut handle) = ChannelDevice::pair(256);
//! engine.start(device)?;
//!
//! handle.send_frame(syn_frame).await?;
//! let syn_ack = handle.recv_frame().await;
//! ```

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

/// Frame-preserving in-memory device
///
/// Each read returns exactly one frame; a frame larger than the read buffer
/// is truncated, as a TUN interface would. Each write is one frame.
pub struct ChannelDevice {
    /// Frames injected by the handle
    rx: mpsc::Receiver<Bytes>,
    /// Frames produced by the engine (wrapped for polling)
    tx: Option<PollSender<Bytes>>,
}

impl ChannelDevice {
    /// Create a device and the handle driving its far side
    ///
    /// # Arguments
    ///
    /// * `capacity` - Frames buffered in each direction
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, DeviceHandle) {
        let capacity = capacity.max(1);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            Self {
                rx: in_rx,
                tx: Some(PollSender::new(out_tx)),
            },
            DeviceHandle {
                tx: in_tx,
                rx: out_rx,
            },
        )
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device closed")
}

impl AsyncRead for ChannelDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                let n = frame.len().min(buf.remaining());
                if n < frame.len() {
                    trace!("Truncating {} byte frame to {} bytes", frame.len(), n);
                }
                buf.put_slice(&frame[..n]);
                Poll::Ready(Ok(()))
            }
            // Handle dropped: end of stream
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for ChannelDevice {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(tx) = self.tx.as_mut() else {
            return Poll::Ready(Err(closed()));
        };

        match tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => match tx.send_item(Bytes::copy_from_slice(buf)) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(_) => Poll::Ready(Err(closed())),
            },
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The handle sees the end of the frame stream
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}

/// Far side of a [`ChannelDevice`]
#[derive(Debug)]
pub struct DeviceHandle {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl DeviceHandle {
    /// Deliver a frame to the engine, as if it arrived on the interface
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` once the device has been dropped.
    pub async fn send_frame(&self, frame: impl Into<Bytes>) -> io::Result<()> {
        self.tx.send(frame.into()).await.map_err(|_| closed())
    }

    /// Next frame the engine wrote, or `None` once the device is closed
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Self::recv_frame`]
    pub fn try_recv_frame(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}
