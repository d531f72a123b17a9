//! File-descriptor backed TUN device

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// An open TUN descriptor registered with the reactor
///
/// Every read returns one frame and every write sends one. Readiness comes
/// from the runtime's I/O driver, so a pending read never holds up a write
/// on the same descriptor.
#[derive(Debug)]
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
}

impl TunDevice {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

/// Wrap an open, configured TUN file descriptor
///
/// The descriptor must be in packet mode without the packet-information
/// prefix (`IFF_TUN | IFF_NO_PI` on Linux), so every read and write carries
/// exactly one IP frame. Ownership of `fd` moves to the returned device.
/// The descriptor is switched to non-blocking mode. Must be called from
/// within a Tokio runtime.
///
/// # Errors
///
/// Returns `InvalidInput` for a negative descriptor, or the OS error if the
/// descriptor cannot be made non-blocking or registered with the reactor.
pub fn open_tun_fd(fd: RawFd) -> io::Result<TunDevice> {
    if fd < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid TUN file descriptor {fd}"),
        ));
    }

    // SAFETY: the caller hands over an open descriptor it no longer uses;
    // the returned device becomes its only owner and closes it on drop.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nonblocking(&owned)?;

    debug!("Using TUN device on fd {}", fd);

    Ok(TunDevice {
        fd: AsyncFd::new(owned)?,
    })
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is a valid open descriptor for the lifetime of `fd`.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: as above; only the status flags change.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl AsyncRead for TunDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            let read = guard.try_io(|inner| {
                // SAFETY: `unfilled` is a valid, initialized buffer of the given length.
                check(unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        unfilled.as_mut_ptr().cast(),
                        unfilled.len(),
                    )
                })
            });

            match read {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for TunDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;

            let written = guard.try_io(|inner| {
                // SAFETY: `buf` is a valid slice for the duration of the call.
                check(unsafe { libc::write(inner.as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
            });

            match written {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
