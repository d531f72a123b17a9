//! Virtual interface handles
//!
//! The engine accepts any `AsyncRead + AsyncWrite` value as the virtual
//! interface: each read yields one raw IP frame and each write carries one.
//! Creating and configuring the platform interface happens elsewhere; this
//! module only adapts already-open handles.

mod channel;
#[cfg(unix)]
mod tun;

pub use channel::{ChannelDevice, DeviceHandle};
#[cfg(unix)]
pub use tun::{open_tun_fd, TunDevice};
