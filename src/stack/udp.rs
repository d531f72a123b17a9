//! Intercepted UDP flows
//!
//! A flow is one (client, destination) pair seen by the stack. Datagrams
//! keep their boundaries in both directions.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

/// Datagrams buffered per flow in each direction
pub(crate) const UDP_CHANNEL_DEPTH: usize = 64;

/// Raw addressing of a UDP flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FlowEndpoint {
    /// Original destination of the client's datagrams
    pub local: SocketAddr,
    /// The client endpoint
    pub remote: SocketAddr,
}

/// Stack-side ends of a flow's channels
pub(crate) struct UdpFlowIo {
    pub(crate) to_app: mpsc::Sender<Bytes>,
    pub(crate) from_app: mpsc::Receiver<Bytes>,
}

pub(crate) fn udp_channel(endpoint: FlowEndpoint, wake: Arc<Notify>) -> (InterceptedUdp, UdpFlowIo) {
    let (to_app, rx) = mpsc::channel(UDP_CHANNEL_DEPTH);
    let (tx, from_app) = mpsc::channel(UDP_CHANNEL_DEPTH);
    (
        InterceptedUdp {
            endpoint,
            rx,
            tx,
            wake,
        },
        UdpFlowIo { to_app, from_app },
    )
}

/// Application handle for a UDP flow
pub struct InterceptedUdp {
    endpoint: FlowEndpoint,
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    wake: Arc<Notify>,
}

impl InterceptedUdp {
    /// The destination the client originally addressed
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.endpoint.local
    }

    /// The client endpoint
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.endpoint.remote
    }

    #[must_use]
    pub const fn endpoint(&self) -> FlowEndpoint {
        self.endpoint
    }

    /// Receive the next datagram from the client
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` once the stack has dropped the flow.
    pub async fn recv_datagram(&mut self) -> io::Result<Bytes> {
        let datagram = self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "UDP flow closed by stack")
        })?;
        self.wake.notify_one();
        Ok(datagram)
    }

    /// Receive a datagram into `buf`, truncating it if `buf` is too small
    ///
    /// # Errors
    ///
    /// Same as [`Self::recv_datagram`].
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let datagram = self.recv_datagram().await?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    /// Send one datagram to the client
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` if the stack has shut down.
    pub async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.tx
            .send(Bytes::copy_from_slice(datagram))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "UDP flow closed by stack"))?;
        self.wake.notify_one();
        Ok(datagram.len())
    }

    /// Close the flow; datagrams already sent are still delivered
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for InterceptedUdp {
    fn drop(&mut self) {
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for InterceptedUdp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptedUdp")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
