//! Intercepted TCP connections
//!
//! An [`InterceptedTcp`] is the application side of a TCP connection the
//! stack terminated on behalf of a local client. Bytes move between it and the
//! stack driver over bounded channels; the driver owns the smoltcp socket.
//!
//! - Reading yields what the client sent, then EOF once the client sends FIN.
//!   An abortive close by the client surfaces as `ConnectionReset`.
//! - Writing queues bytes towards the client. `shutdown` sends FIN.
//! - Dropping the connection closes it gracefully; [`InterceptedTcp::abort`]
//!   resets it instead.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::PollSender;

/// Largest chunk handed across the channel in one message
pub(crate) const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Channel depth, in chunks, for each direction of a connection
pub(crate) const TCP_CHANNEL_DEPTH: usize = 16;

/// Item delivered from the stack to the application
pub(crate) type TcpChunk = Result<Bytes, io::ErrorKind>;

/// State shared by the application handle and the stack driver
#[derive(Debug)]
pub(crate) struct TcpControl {
    reset: AtomicBool,
    /// Set by the driver before it drops the read channel of an aborted flow
    aborted: OnceLock<io::ErrorKind>,
    wake: Arc<Notify>,
}

impl TcpControl {
    pub(crate) fn reset_requested(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Make reads fail with `kind` once the buffered chunks are consumed
    ///
    /// Must be called before the stack-side sender is dropped.
    pub(crate) fn mark_aborted(&self, kind: io::ErrorKind) {
        let _ = self.aborted.set(kind);
    }

    fn request_reset(&self) {
        self.reset.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Resets a connection from outside its owner
///
/// Obtained from [`InterceptedTcp::reset_handle`] so a supervisor can abort a
/// connection whose halves are owned by copy tasks.
#[derive(Debug, Clone)]
pub struct TcpResetHandle {
    control: Arc<TcpControl>,
}

impl TcpResetHandle {
    /// Send RST to the client and discard buffered data
    pub fn reset(&self) {
        self.control.request_reset();
    }
}

/// Stack-side ends of a connection's channels
pub(crate) struct TcpFlowIo {
    pub(crate) to_app: Option<mpsc::Sender<TcpChunk>>,
    pub(crate) from_app: mpsc::Receiver<Bytes>,
    pub(crate) control: Arc<TcpControl>,
}

/// Create a connected application handle and its stack-side ends
pub(crate) fn tcp_channel(
    local: SocketAddr,
    peer: SocketAddr,
    wake: Arc<Notify>,
) -> (InterceptedTcp, TcpFlowIo) {
    let (to_app, app_rx) = mpsc::channel(TCP_CHANNEL_DEPTH);
    let (app_tx, from_app) = mpsc::channel(TCP_CHANNEL_DEPTH);
    let control = Arc::new(TcpControl {
        reset: AtomicBool::new(false),
        aborted: OnceLock::new(),
        wake,
    });

    let conn = InterceptedTcp {
        local,
        peer,
        rx: app_rx,
        read_buf: None,
        tx: Some(PollSender::new(app_tx)),
        control: Arc::clone(&control),
        read_deadline: None,
        write_deadline: None,
    };
    let io = TcpFlowIo {
        to_app: Some(to_app),
        from_app,
        control,
    };
    (conn, io)
}

/// Application handle for a TCP connection terminated by the stack
pub struct InterceptedTcp {
    local: SocketAddr,
    peer: SocketAddr,
    rx: mpsc::Receiver<TcpChunk>,
    read_buf: Option<Bytes>,
    tx: Option<PollSender<Bytes>>,
    control: Arc<TcpControl>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl InterceptedTcp {
    /// The destination the client originally dialed
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// The client endpoint
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Abort the connection with RST
    pub fn abort(&self) {
        self.control.request_reset();
    }

    #[must_use]
    pub fn reset_handle(&self) -> TcpResetHandle {
        TcpResetHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Fail pending and future reads with `TimedOut` after `deadline`
    ///
    /// `None` clears the deadline. Must be called within a Tokio runtime.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Fail pending and future writes with `TimedOut` after `deadline`
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Set both read and write deadlines
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

fn deadline_expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    deadline
        .as_mut()
        .is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready())
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} deadline exceeded"))
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl AsyncRead for InterceptedTcp {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Some(chunk) = this.read_buf.as_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk.split_to(n));
            if chunk.is_empty() {
                this.read_buf = None;
            }
            return Poll::Ready(Ok(()));
        }

        if deadline_expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(mut chunk))) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk.split_to(n));
                if !chunk.is_empty() {
                    this.read_buf = Some(chunk);
                }
                // Room in the channel again; let the driver move more data
                this.control.wake.notify_one();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(kind))) => Poll::Ready(Err(io::Error::from(kind))),
            Poll::Ready(None) => match this.control.aborted.get() {
                Some(&kind) => Poll::Ready(Err(io::Error::from(kind))),
                None => Poll::Ready(Ok(())),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for InterceptedTcp {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if deadline_expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }

        let Some(tx) = this.tx.as_mut() else {
            return Poll::Ready(Err(closed()));
        };

        match tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(MAX_CHUNK_SIZE);
                match tx.send_item(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(()) => {
                        this.control.wake.notify_one();
                        Poll::Ready(Ok(n))
                    }
                    Err(_) => Poll::Ready(Err(closed())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Closing the write channel tells the driver to send FIN once the
        // queued bytes are in the socket
        if self.tx.take().is_some() {
            self.control.wake.notify_one();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for InterceptedTcp {
    fn drop(&mut self) {
        self.control.wake.notify_one();
    }
}

impl std::fmt::Debug for InterceptedTcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptedTcp")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("write_open", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}
