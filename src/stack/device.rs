//! smoltcp device backed by in-memory frame queues
//!
//! The stack driver owns both ends: inbound frames from the link endpoint are
//! pushed onto the RX queue before each poll, and frames produced by smoltcp
//! are drained from the TX queue into the outbound channel after it.
//!
//! ```text
//! +----------------+     +---------------+     +---------------+
//! | smoltcp stack  | <-> | StackDevice   | <-> | LinkEndpoint  |
//! | (TCP/IP)       |     | (frame queues)|     | (mpsc frames) |
//! +----------------+     +---------------+     +---------------+
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use smoltcp::phy::{
    Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium, RxToken, TxToken,
};
use smoltcp::time::Instant as SmoltcpInstant;
use tracing::trace;

/// Frame queues shared between the device and the stack driver
#[derive(Debug)]
pub struct FrameQueue {
    rx_queue: Mutex<VecDeque<Bytes>>,
    tx_queue: Mutex<VecDeque<Bytes>>,
    max_depth: usize,
    rx_dropped: AtomicU64,
    tx_dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue pair holding at most `max_depth` frames per direction
    #[must_use]
    pub fn new(max_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            rx_queue: Mutex::new(VecDeque::new()),
            tx_queue: Mutex::new(VecDeque::new()),
            max_depth: max_depth.max(1),
            rx_dropped: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
        })
    }

    /// Queue an inbound frame for the next poll
    ///
    /// Returns `false` if the queue is full and the frame was dropped.
    pub fn push_rx(&self, frame: Bytes) -> bool {
        let mut queue = self.rx_queue.lock();
        if queue.len() >= self.max_depth {
            trace!("RX queue full, dropping frame ({} bytes)", frame.len());
            self.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(frame);
        true
    }

    pub fn pop_rx(&self) -> Option<Bytes> {
        self.rx_queue.lock().pop_front()
    }

    /// Queue a frame produced by smoltcp
    ///
    /// Returns `false` if the queue is full and the frame was dropped.
    pub fn push_tx(&self, frame: Bytes) -> bool {
        let mut queue = self.tx_queue.lock();
        if queue.len() >= self.max_depth {
            trace!("TX queue full, dropping frame ({} bytes)", frame.len());
            self.tx_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(frame);
        true
    }

    pub fn pop_tx(&self) -> Option<Bytes> {
        self.tx_queue.lock().pop_front()
    }

    /// Put a frame back at the head of the TX queue after a failed hand-off
    pub fn requeue_tx(&self, frame: Bytes) {
        self.tx_queue.lock().push_front(frame);
    }

    #[must_use]
    pub fn has_tx_frames(&self) -> bool {
        !self.tx_queue.lock().is_empty()
    }

    #[must_use]
    pub fn has_rx_frames(&self) -> bool {
        !self.rx_queue.lock().is_empty()
    }

    #[must_use]
    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.lock().len()
    }

    /// True once the TX queue holds `max_depth` frames
    #[must_use]
    pub fn is_tx_full(&self) -> bool {
        self.tx_queue_len() >= self.max_depth
    }

    /// Frames dropped because the RX queue was full
    #[must_use]
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }

    /// Frames dropped because the TX queue was full
    #[must_use]
    pub fn tx_dropped(&self) -> u64 {
        self.tx_dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.rx_queue.lock().clear();
        self.tx_queue.lock().clear();
    }
}

/// Virtual IP-layer device for smoltcp
///
/// Uses `Medium::Ip`: the host tunnel carries raw IP frames with no link
/// framing, so there is no neighbor discovery and no link address on the wire.
pub struct StackDevice {
    queue: Arc<FrameQueue>,
    mtu: usize,
}

impl StackDevice {
    #[must_use]
    pub fn new(queue: Arc<FrameQueue>, mtu: usize) -> Self {
        Self { queue, mtu }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

impl Device for StackDevice {
    type RxToken<'a> = FrameRxToken where Self: 'a;
    type TxToken<'a> = FrameTxToken<'a> where Self: 'a;

    fn receive(
        &mut self,
        _timestamp: SmoltcpInstant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        // An inbound frame may need a reply; leave it queued until there is room
        if self.queue.is_tx_full() {
            return None;
        }
        let frame = self.queue.pop_rx()?;
        Some((FrameRxToken { frame }, FrameTxToken { queue: &self.queue }))
    }

    fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
        // smoltcp keeps the data and retries on a later poll
        if self.queue.is_tx_full() {
            return None;
        }
        Some(FrameTxToken { queue: &self.queue })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        // Inbound frames come from the local host and were checksummed by its
        // kernel; outbound frames must carry valid checksums.
        let mut checksum = ChecksumCapabilities::default();
        checksum.ipv4 = Checksum::Tx;
        checksum.tcp = Checksum::Tx;
        checksum.udp = Checksum::Tx;
        checksum.icmpv4 = Checksum::Tx;
        checksum.icmpv6 = Checksum::Tx;
        caps.checksum = checksum;

        caps
    }
}

pub struct FrameRxToken {
    frame: Bytes,
}

impl RxToken for FrameRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

pub struct FrameTxToken<'a> {
    queue: &'a Arc<FrameQueue>,
}

impl<'a> TxToken for FrameTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = BytesMut::zeroed(len);
        let result = f(&mut buf);
        self.queue.push_tx(buf.freeze());
        result
    }
}
