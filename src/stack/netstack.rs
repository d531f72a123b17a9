//! smoltcp stack driver
//!
//! A single task owns the smoltcp interface and socket set. Each iteration:
//!
//! 1. ingests inbound frames, creating listeners/sockets for new flows
//! 2. moves application bytes into sockets
//! 3. polls the interface
//! 4. accepts completed handshakes and moves socket bytes to applications
//! 5. hands produced frames to the link endpoint
//!
//! then sleeps until a frame arrives, an application wakes it, the outbound
//! channel has room or the next smoltcp timer is due.
//!
//! smoltcp only accepts connections on listening sockets, so the driver peeks
//! at every inbound SYN and creates a listener bound to that SYN's destination
//! just before the frame is processed. With `any_ip` and a default route via
//! the interface's own address, the interface accepts frames for any
//! destination.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{self, CongestionControl, State as TcpState};
use smoltcp::socket::udp;
use smoltcp::time::{Duration as SmoltcpDuration, Instant as SmoltcpInstant};
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv6Address,
};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::acceptor::ConnectionAcceptor;
use super::device::{FrameQueue, StackDevice};
use super::frame::{self, FlowInfo, NetworkProtocol};
use super::link::{InboundFrame, LinkEndpoint};
use super::tcp::{tcp_channel, TcpFlowIo, MAX_CHUNK_SIZE};
use super::udp::{udp_channel, FlowEndpoint, UdpFlowIo};
use crate::config::{StackConfig, MAX_MTU, MIN_MTU};
use crate::error::StackError;

/// Address the interface owns; default routes point at it
const STACK_IPV4_ADDR: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 1);
const STACK_IPV6_ADDR: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x7475, 0x6e32, 0, 0, 0, 0, 1);

/// Seconds of silence before the first keepalive probe
pub const KEEPALIVE_IDLE_SECS: u64 = 60;
/// Seconds between keepalive probes
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;
/// Unanswered probes before the peer is considered dead
pub const KEEPALIVE_PROBES: u64 = 9;

/// Frames ingested before the driver yields to other tasks
const INGEST_BATCH: usize = 64;

/// Upper bound on sleeping when smoltcp has no timer pending
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

const UDP_METADATA_SLOTS: usize = 64;

/// Stack counters
///
/// All counters use relaxed atomic ordering; exact accuracy is not required.
#[derive(Debug, Default)]
pub struct StackStats {
    /// Frames handed to the stack by the link endpoint
    pub frames_received: AtomicU64,
    /// Frames handed from the stack to the link endpoint
    pub frames_sent: AtomicU64,
    /// Frames dropped (disabled family, full queues, closed link)
    pub frames_dropped: AtomicU64,
    /// TCP connections handed to the acceptor
    pub tcp_accepted: AtomicU64,
    /// SYNs refused because of the connection limit
    pub tcp_rejected: AtomicU64,
    /// TCP connections currently tracked
    pub tcp_active: AtomicU64,
    /// UDP flows handed to the acceptor
    pub udp_flows: AtomicU64,
    /// Datagrams dropped between stack and application
    pub udp_dropped: AtomicU64,
}

impl StackStats {
    pub fn snapshot(&self) -> StackStatsSnapshot {
        StackStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            tcp_accepted: self.tcp_accepted.load(Ordering::Relaxed),
            tcp_rejected: self.tcp_rejected.load(Ordering::Relaxed),
            tcp_active: self.tcp_active.load(Ordering::Relaxed),
            udp_flows: self.udp_flows.load(Ordering::Relaxed),
            udp_dropped: self.udp_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`StackStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackStatsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub tcp_accepted: u64,
    pub tcp_rejected: u64,
    pub tcp_active: u64,
    pub udp_flows: u64,
    pub udp_dropped: u64,
}

/// Per-socket TCP options
#[derive(Debug, Clone, Copy)]
struct TcpTuning {
    send_buffer: usize,
    recv_buffer: usize,
    congestion: CongestionControl,
}

impl TcpTuning {
    fn apply(&self, socket: &mut tcp::Socket<'_>) {
        socket.set_nagle_enabled(false);
        socket.set_congestion_control(self.congestion);
        // smoltcp probes at a fixed interval; the timeout keeps the overall
        // dead-peer budget of idle + probes * interval
        socket.set_keep_alive(Some(SmoltcpDuration::from_secs(KEEPALIVE_INTERVAL_SECS)));
        socket.set_timeout(Some(SmoltcpDuration::from_secs(
            KEEPALIVE_IDLE_SECS + KEEPALIVE_PROBES * KEEPALIVE_INTERVAL_SECS,
        )));
    }
}

struct TcpEntry {
    /// (client, original destination)
    tuple: (SocketAddr, SocketAddr),
    /// Present once the handshake completed and the acceptor was called
    io: Option<TcpFlowIo>,
    pending_write: Option<Bytes>,
    write_closed: bool,
    fin_sent: bool,
    reset_sent: bool,
}

struct UdpEntry {
    handle: SocketHandle,
    flows: HashMap<SocketAddr, UdpFlowIo>,
    /// Poll generation of the last datagram queued on the socket
    sent_at: Option<u64>,
}

/// Parse a MAC-style link address (`de:ad:be:ee:ee:ef`)
///
/// # Errors
///
/// Rejects anything but six hex octets and multicast addresses.
pub fn parse_link_address(raw: &str) -> Result<[u8; 6], StackError> {
    let mut octets = [0u8; 6];
    let parts: Vec<&str> = raw.split([':', '-']).collect();
    if parts.len() != octets.len() {
        return Err(StackError::invalid_link_address(raw, "expected six octets"));
    }

    for (octet, part) in octets.iter_mut().zip(parts) {
        if part.len() != 2 {
            return Err(StackError::invalid_link_address(raw, "octets must be two hex digits"));
        }
        *octet = u8::from_str_radix(part, 16)
            .map_err(|e| StackError::invalid_link_address(raw, e.to_string()))?;
    }

    if octets[0] & 0x01 != 0 {
        return Err(StackError::invalid_link_address(raw, "multicast address"));
    }
    Ok(octets)
}

/// Map a congestion control name to the smoltcp algorithm
///
/// # Errors
///
/// Returns `UnsupportedCongestionControl` for unknown names.
pub fn parse_congestion_control(name: &str) -> Result<CongestionControl, StackError> {
    match name.to_ascii_lowercase().as_str() {
        "cubic" => Ok(CongestionControl::Cubic),
        "reno" => Ok(CongestionControl::Reno),
        "none" => Ok(CongestionControl::None),
        _ => Err(StackError::UnsupportedCongestionControl(name.to_string())),
    }
}

/// Build a stack and its link endpoint
///
/// The returned [`NetStack`] does nothing until [`NetStack::run`] is spawned.
///
/// # Errors
///
/// Fails for an out-of-range MTU, a malformed link address, a zero interface
/// id, an unknown congestion control algorithm, or if the interface cannot be
/// given its addresses and routes.
pub fn build_stack(
    config: &StackConfig,
    mtu: usize,
    acceptor: Arc<dyn ConnectionAcceptor>,
) -> Result<(NetStack, LinkEndpoint), StackError> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(StackError::InvalidMtu {
            mtu,
            min: MIN_MTU,
            max: MAX_MTU,
        });
    }
    if config.interface_id == 0 {
        return Err(StackError::InvalidInterfaceId(config.interface_id));
    }
    let link_address = parse_link_address(&config.link_address)?;
    let congestion = parse_congestion_control(&config.congestion_control)?;
    if !config.ipv4 && !config.ipv6 {
        return Err(StackError::interface("no network protocol enabled"));
    }

    let queue = FrameQueue::new(config.channel_capacity.max(INGEST_BATCH));
    let mut device = StackDevice::new(Arc::clone(&queue), mtu);

    let mut iface_config = Config::new(HardwareAddress::Ip);
    iface_config.random_seed = rand::random();
    let mut iface = Interface::new(iface_config, &mut device, SmoltcpInstant::now());
    iface.set_any_ip(true);

    let mut addr_overflow = false;
    iface.update_ip_addrs(|addrs| {
        if config.ipv4 {
            let cidr = IpCidr::new(IpAddress::Ipv4(Ipv4Address::from(STACK_IPV4_ADDR)), 32);
            addr_overflow |= addrs.push(cidr).is_err();
        }
        if config.ipv6 {
            let cidr = IpCidr::new(IpAddress::Ipv6(Ipv6Address::from(STACK_IPV6_ADDR)), 128);
            addr_overflow |= addrs.push(cidr).is_err();
        }
    });
    if addr_overflow {
        return Err(StackError::interface("too many interface addresses"));
    }

    if config.ipv4 {
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::from(STACK_IPV4_ADDR))
            .map_err(|e| StackError::interface(format!("IPv4 default route: {e:?}")))?;
    }
    if config.ipv6 {
        iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Address::from(STACK_IPV6_ADDR))
            .map_err(|e| StackError::interface(format!("IPv6 default route: {e:?}")))?;
    }

    let capacity = config.channel_capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

    info!(
        interface_id = config.interface_id,
        link_address = %config.link_address,
        mtu,
        congestion = %config.congestion_control,
        ipv4 = config.ipv4,
        ipv6 = config.ipv6,
        "Stack built"
    );

    let stack = NetStack {
        iface,
        device,
        sockets: SocketSet::new(Vec::new()),
        queue,
        tuning: TcpTuning {
            send_buffer: config.tcp_send_buffer,
            recv_buffer: config.tcp_recv_buffer,
            congestion,
        },
        max_tcp_connections: config.max_tcp_connections,
        udp_buffer_size: config.udp_buffer_size,
        ipv4: config.ipv4,
        ipv6: config.ipv6,
        link_address,
        acceptor,
        inbound_rx,
        outbound_tx,
        wake: Arc::new(Notify::new()),
        tcp_flows: HashMap::new(),
        tcp_tuples: HashMap::new(),
        udp_sockets: HashMap::new(),
        polls: 0,
        tx_dropped_seen: 0,
        stats: Arc::new(StackStats::default()),
    };
    let link = LinkEndpoint::new(inbound_tx, outbound_rx, mtu);

    Ok((stack, link))
}

/// Stack driver state, consumed by [`NetStack::run`]
pub struct NetStack {
    iface: Interface,
    device: StackDevice,
    sockets: SocketSet<'static>,
    queue: Arc<FrameQueue>,
    tuning: TcpTuning,
    max_tcp_connections: usize,
    udp_buffer_size: usize,
    ipv4: bool,
    ipv6: bool,
    link_address: [u8; 6],
    acceptor: Arc<dyn ConnectionAcceptor>,
    inbound_rx: mpsc::Receiver<InboundFrame>,
    outbound_tx: mpsc::Sender<Bytes>,
    wake: Arc<Notify>,
    tcp_flows: HashMap<SocketHandle, TcpEntry>,
    tcp_tuples: HashMap<(SocketAddr, SocketAddr), SocketHandle>,
    udp_sockets: HashMap<SocketAddr, UdpEntry>,
    polls: u64,
    tx_dropped_seen: u64,
    stats: Arc<StackStats>,
}

impl NetStack {
    #[must_use]
    pub fn stats(&self) -> Arc<StackStats> {
        Arc::clone(&self.stats)
    }

    /// Validated link address; unused on the wire with an IP medium
    #[must_use]
    pub const fn link_address(&self) -> [u8; 6] {
        self.link_address
    }

    /// Drive the stack until `cancel` fires or the link endpoint is dropped
    ///
    /// # Errors
    ///
    /// Currently never fails; the signature leaves room for fatal stack
    /// conditions.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StackError> {
        debug!("Stack task started");

        loop {
            let mut ingested = 0;
            let mut link_closed = false;
            while ingested < INGEST_BATCH {
                match self.inbound_rx.try_recv() {
                    Ok(frame) => {
                        self.ingest(frame);
                        ingested += 1;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        link_closed = true;
                        break;
                    }
                }
            }

            self.service_sockets();
            self.poll_interface();
            self.service_sockets();
            self.flush_outbound();

            if link_closed {
                debug!("Link endpoint dropped, stopping stack");
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            let mut delay = self
                .iface
                .poll_delay(SmoltcpInstant::now(), &self.sockets)
                .map_or(IDLE_POLL_INTERVAL, |d| Duration::from_micros(d.total_micros()));
            // With the TX queue full, polling again cannot make progress; wait
            // for the outbound channel to take a frame instead
            let tx_full = self.queue.is_tx_full();
            if tx_full && delay.is_zero() {
                delay = IDLE_POLL_INTERVAL;
            }
            if ingested == INGEST_BATCH || delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            let has_tx = self.queue.has_tx_frames();
            let inbound = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                permit = self.outbound_tx.reserve(), if has_tx => {
                    if let (Ok(permit), Some(frame)) = (permit, self.queue.pop_tx()) {
                        permit.send(frame);
                        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    None
                }
                frame = self.inbound_rx.recv() => frame,
                () = self.wake.notified() => None,
                () = tokio::time::sleep(delay) => None,
            };

            if let Some(frame) = inbound {
                self.ingest(frame);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn poll_interface(&mut self) {
        let _ = self
            .iface
            .poll(SmoltcpInstant::now(), &mut self.device, &mut self.sockets);
        self.polls += 1;

        let tx_dropped = self.queue.tx_dropped();
        if tx_dropped > self.tx_dropped_seen {
            self.stats
                .frames_dropped
                .fetch_add(tx_dropped - self.tx_dropped_seen, Ordering::Relaxed);
            self.tx_dropped_seen = tx_dropped;
        }
    }

    fn ingest(&mut self, frame: InboundFrame) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let enabled = match frame.protocol {
            NetworkProtocol::Ipv4 => self.ipv4,
            NetworkProtocol::Ipv6 => self.ipv6,
        };
        if !enabled {
            trace!("{} disabled, dropping {} byte frame", frame.protocol, frame.data.len());
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut poll_now = false;
        if let Some(flow) = frame::inspect(&frame.data) {
            if flow.is_tcp_syn() {
                poll_now = self.prepare_tcp_listener(&flow);
            } else if flow.is_udp() {
                poll_now = self.prepare_udp_socket(flow.dst);
            }
        }

        if !self.queue.push_rx(frame.data) {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }

        // A fresh listener must see its SYN before the next one is created,
        // so every listener ends up bound to a single client
        if poll_now {
            self.poll_interface();
        }
    }

    fn prepare_tcp_listener(&mut self, flow: &FlowInfo) -> bool {
        let tuple = (flow.src, flow.dst);
        if self.tcp_tuples.contains_key(&tuple) {
            return false;
        }

        if self.tcp_flows.len() >= self.max_tcp_connections {
            self.stats.tcp_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "TCP connection limit ({}) reached, refusing {} -> {}",
                self.max_tcp_connections, flow.src, flow.dst
            );
            return false;
        }

        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0; self.tuning.recv_buffer]),
            tcp::SocketBuffer::new(vec![0; self.tuning.send_buffer]),
        );
        self.tuning.apply(&mut socket);

        if let Err(e) = socket.listen(listen_endpoint(flow.dst)) {
            debug!("Cannot listen on {} for {}: {}", flow.dst, flow.src, e);
            return false;
        }

        let handle = self.sockets.add(socket);
        self.tcp_flows.insert(
            handle,
            TcpEntry {
                tuple,
                io: None,
                pending_write: None,
                write_closed: false,
                fin_sent: false,
                reset_sent: false,
            },
        );
        self.tcp_tuples.insert(tuple, handle);
        trace!("Listening on {} for SYN from {}", flow.dst, flow.src);
        true
    }

    fn prepare_udp_socket(&mut self, local: SocketAddr) -> bool {
        if self.udp_sockets.contains_key(&local) {
            return false;
        }

        let mut socket = udp::Socket::new(
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_METADATA_SLOTS],
                vec![0; self.udp_buffer_size],
            ),
            udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_METADATA_SLOTS],
                vec![0; self.udp_buffer_size],
            ),
        );
        if let Err(e) = socket.bind(listen_endpoint(local)) {
            debug!("Cannot bind UDP socket to {}: {}", local, e);
            return false;
        }

        let handle = self.sockets.add(socket);
        self.udp_sockets.insert(
            local,
            UdpEntry {
                handle,
                flows: HashMap::new(),
                sent_at: None,
            },
        );
        true
    }

    fn service_sockets(&mut self) {
        self.service_tcp();
        self.service_udp();
    }

    fn service_tcp(&mut self) {
        let mut finished = Vec::new();

        for (&handle, entry) in &mut self.tcp_flows {
            let socket = self.sockets.get_mut::<tcp::Socket>(handle);

            if entry.io.is_none() {
                match socket.state() {
                    // Never completed: the SYN was rejected or the client reset
                    TcpState::Listen | TcpState::Closed => {
                        finished.push(handle);
                        continue;
                    }
                    TcpState::SynReceived | TcpState::SynSent => continue,
                    _ => {
                        let (client, destination) = entry.tuple;
                        let (conn, io) = tcp_channel(destination, client, Arc::clone(&self.wake));
                        entry.io = Some(io);
                        self.stats.tcp_accepted.fetch_add(1, Ordering::Relaxed);
                        debug!("TCP connection accepted: {} -> {}", client, destination);
                        self.acceptor.accept_tcp(conn);
                    }
                }
            }

            if pump_tcp(socket, entry) {
                finished.push(handle);
            }
        }

        for handle in finished {
            if let Some(entry) = self.tcp_flows.remove(&handle) {
                self.tcp_tuples.remove(&entry.tuple);
                trace!("TCP socket released: {} -> {}", entry.tuple.0, entry.tuple.1);
            }
            self.sockets.remove(handle);
        }
        self.stats
            .tcp_active
            .store(self.tcp_flows.len() as u64, Ordering::Relaxed);
    }

    fn service_udp(&mut self) {
        let mut idle = Vec::new();

        for (&local, entry) in &mut self.udp_sockets {
            let socket = self.sockets.get_mut::<udp::Socket>(entry.handle);

            // Replies first, so flows closed after replying are reaped
            // before new datagrams are matched to them
            let polls = self.polls;
            let stats = &self.stats;
            let sent_at = &mut entry.sent_at;
            entry.flows.retain(|&remote, flow| loop {
                match flow.from_app.try_recv() {
                    Ok(datagram) => match socket.send_slice(&datagram, ip_endpoint(remote)) {
                        Ok(()) => *sent_at = Some(polls),
                        Err(e) => {
                            stats.udp_dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("UDP reply {} -> {} dropped: {}", local, remote, e);
                        }
                    },
                    Err(TryRecvError::Empty) => break true,
                    Err(TryRecvError::Disconnected) => break false,
                }
            });

            while let Ok((payload, meta)) = socket.recv() {
                let remote = socket_addr(meta.endpoint);
                let flow = match entry.flows.entry(remote) {
                    Entry::Occupied(slot) => slot.into_mut(),
                    Entry::Vacant(slot) => {
                        let endpoint = FlowEndpoint { local, remote };
                        let (conn, io) = udp_channel(endpoint, Arc::clone(&self.wake));
                        self.stats.udp_flows.fetch_add(1, Ordering::Relaxed);
                        debug!("UDP flow accepted: {} -> {}", remote, local);
                        self.acceptor.accept_udp(conn, endpoint);
                        slot.insert(io)
                    }
                };

                if flow.to_app.try_send(Bytes::copy_from_slice(payload)).is_err() {
                    self.stats.udp_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("UDP flow {} -> {} not keeping up, datagram dropped", remote, local);
                }
            }

            let flushed = entry.sent_at.map_or(true, |at| at < self.polls);
            if entry.flows.is_empty() && flushed && !socket.can_recv() {
                idle.push(local);
            }
        }

        for local in idle {
            if let Some(entry) = self.udp_sockets.remove(&local) {
                self.sockets.remove(entry.handle);
            }
        }
    }

    fn flush_outbound(&mut self) {
        while let Some(frame) = self.queue.pop_tx() {
            match self.outbound_tx.try_send(frame) {
                Ok(()) => {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(frame)) => {
                    self.queue.requeue_tx(frame);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    let mut dropped = 1;
                    while self.queue.pop_tx().is_some() {
                        dropped += 1;
                    }
                    self.stats.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
                    trace!("Outbound link closed, dropped {} frames", dropped);
                    break;
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let active = self.tcp_flows.len();

        for (&handle, entry) in &mut self.tcp_flows {
            self.sockets.get_mut::<tcp::Socket>(handle).abort();
            if let Some(io) = entry.io.as_mut() {
                io.control.mark_aborted(io::ErrorKind::ConnectionAborted);
                io.to_app = None;
            }
        }

        // Best effort: let the resets reach the clients
        self.poll_interface();
        self.flush_outbound();

        self.tcp_flows.clear();
        self.tcp_tuples.clear();
        self.udp_sockets.clear();
        self.queue.clear();

        info!(
            active_connections = active,
            frames_dropped = self.queue.rx_dropped() + self.queue.tx_dropped(),
            "Stack stopped"
        );
    }
}

/// Move bytes between a socket and its application channels
///
/// Returns `true` once the socket can be released.
fn pump_tcp(socket: &mut tcp::Socket<'_>, entry: &mut TcpEntry) -> bool {
    let Some(io) = entry.io.as_mut() else {
        return false;
    };

    if io.control.reset_requested() {
        // The RST goes out on the next poll; release the socket after that
        if entry.reset_sent {
            return true;
        }
        socket.abort();
        entry.reset_sent = true;
        entry.pending_write = None;
        io.to_app = None;
        io.from_app.close();
        return false;
    }

    // application -> client
    loop {
        if let Some(chunk) = entry.pending_write.take() {
            match socket.send_slice(&chunk) {
                Ok(n) if n < chunk.len() => {
                    entry.pending_write = Some(chunk.slice(n..));
                    break;
                }
                Ok(_) => {}
                Err(_) => {
                    // Client side can no longer take data
                    entry.write_closed = true;
                    io.from_app.close();
                    break;
                }
            }
        }
        if entry.write_closed {
            break;
        }
        match io.from_app.try_recv() {
            Ok(chunk) => entry.pending_write = Some(chunk),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => entry.write_closed = true,
        }
    }

    if entry.write_closed && entry.pending_write.is_none() && !entry.fin_sent {
        socket.close();
        entry.fin_sent = true;
    }

    // client -> application
    let mut reached_eof = false;
    if let Some(to_app) = io.to_app.as_ref() {
        if to_app.is_closed() {
            // Reader is gone; keep the window open
            while socket.can_recv() {
                if socket.recv(|buf| (buf.len(), ())).is_err() {
                    break;
                }
            }
        } else {
            while socket.can_recv() {
                let Ok(permit) = to_app.try_reserve() else {
                    break;
                };
                let received = socket.recv(|buf| {
                    let n = buf.len().min(MAX_CHUNK_SIZE);
                    (n, Bytes::copy_from_slice(&buf[..n]))
                });
                match received {
                    Ok(chunk) => permit.send(Ok(chunk)),
                    Err(_) => break,
                }
            }
        }

        if !socket.may_recv() && !socket.can_recv() {
            // FIN leaves the socket in a closing state; reaching Closed with
            // the read side still open means the client reset
            if socket.state() == TcpState::Closed {
                io.control.mark_aborted(io::ErrorKind::ConnectionReset);
            }
            reached_eof = true;
        }
    }
    if reached_eof {
        io.to_app = None;
    }

    matches!(socket.state(), TcpState::Closed | TcpState::TimeWait) && !socket.can_recv()
}

fn smoltcp_addr(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6)),
    }
}

fn listen_endpoint(addr: SocketAddr) -> IpListenEndpoint {
    IpListenEndpoint {
        addr: Some(smoltcp_addr(addr.ip())),
        port: addr.port(),
    }
}

fn ip_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(smoltcp_addr(addr.ip()), addr.port())
}

fn socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6)),
    };
    SocketAddr::new(ip, endpoint.port)
}
