//! Copy implementations for relayed streams

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes moved in each direction of a relayed pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    write_done: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size.max(1)].into_boxed_slice(),
            read_done: false,
            write_done: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
        }
    }

    /// Copy until the reader hits EOF, then flush and shut down the writer
    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                if !self.write_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    // Half-close: the far side sees EOF, the other direction
                    // stays open
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => {
                            self.write_done = true;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(Ok(()));
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

/// One-direction copy future over owned halves
struct CopyHalf<R, W> {
    reader: R,
    writer: W,
    state: TransferState,
}

impl<R, W> Future for CopyHalf<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    type Output = io::Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match this
            .state
            .poll_transfer(cx, Pin::new(&mut this.reader), Pin::new(&mut this.writer))
        {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(this.state.bytes_transferred)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Copy `reader` into `writer` until EOF, then shut down `writer`
///
/// EOF is the normal end of the copy, not an error. Both halves are dropped
/// when the returned future completes or is dropped.
///
/// # Errors
///
/// Returns the first read, write or shutdown error.
pub async fn copy_half<R, W>(reader: R, writer: W, buf_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    CopyHalf {
        reader,
        writer,
        state: TransferState::new(buf_size),
    }
    .await
}
