//! Packet transport: the production multicast socket and an in-memory
//! double for driving the engines in tests.
//!
//! Both implementations are polled from inside an engine task: `recv_from`
//! returns `Ok(None)` when nothing is ready (the task is parked for wakeup)
//! and `send_to` returns `Ok(false)` when the socket is not writable yet.
//!
//! The production receive path screens every packet before it reaches the
//! codec, in this order: size gate, link-local source gate, per-source rate
//! limit. Screened-out packets are dropped silently; a one-per-second debug
//! line is the only trace, so hostile traffic cannot amplify into logging.

use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::sync::mpsc;
use futures::{Async, Stream};
use log::debug;
use tokio_core::net::UdpSocket;
use tokio_core::reactor::Handle;

use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::proto::{MAX_PACKET_SIZE, MDNS_GROUP, MDNS_PORT};
use crate::ratelimit::RateLimiter;

use crate::net;

/// How many idle receive buffers the pool retains.
const POOL_RETENTION: usize = 8;

/// Packet I/O as the engines see it.
pub trait Transport {
    /// Non-blocking receive of one screened packet. `Ok(None)` means
    /// nothing is deliverable right now and the task will be woken.
    fn recv_from(&mut self) -> Result<Option<(Vec<u8>, SocketAddr)>>;

    /// Non-blocking send. `Ok(false)` means the socket is not writable;
    /// retry when the task wakes.
    fn send_to(&mut self, data: &[u8], dest: &SocketAddr) -> Result<bool>;

    /// Destination for group traffic.
    fn multicast_dest(&self) -> SocketAddr;
}

/// Shared screening logic: what may proceed from the wire to the codec.
pub struct PacketScreen {
    limiter: RateLimiter,
    last_log: Option<Instant>,
}

impl PacketScreen {
    pub fn new(limiter: RateLimiter) -> PacketScreen {
        PacketScreen {
            limiter,
            last_log: None,
        }
    }

    /// Applies the size, source, and rate gates, in that order.
    pub fn admit(&mut self, len: usize, src: &SocketAddr) -> bool {
        if len > MAX_PACKET_SIZE {
            self.log_drop(src, "oversized packet");
            return false;
        }
        if !link_local_source(&src.ip()) {
            self.log_drop(src, "non-link-local source");
            return false;
        }
        if !self.limiter.admit(src.ip()) {
            // The limiter logs its own cooldown transitions; per-packet
            // drops inside a cooldown stay quiet.
            return false;
        }
        true
    }

    fn log_drop(&mut self, src: &SocketAddr, reason: &str) {
        let now = Instant::now();
        let quiet = self
            .last_log
            .map(|at| now.duration_since(at) < Duration::from_secs(1))
            .unwrap_or(false);
        if !quiet {
            self.last_log = Some(now);
            debug!("dropping packet from {}: {}", src, reason);
        }
    }
}

/// The link-local gate: RFC 3927 addresses and the private ranges are
/// plausible on-link sources; a routed public source is a reflection
/// attempt.
fn link_local_source(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local() || v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// The production UDP/IPv4 multicast transport.
pub struct UdpTransport {
    socket: UdpSocket,
    pool: BufferPool,
    screen: PacketScreen,
}

impl UdpTransport {
    /// Binds the shared port, joins the group on each interface address,
    /// and wires up screening.
    pub fn new(
        handle: &Handle,
        interfaces: &[std::net::Ipv4Addr],
        limiter: RateLimiter,
    ) -> Result<UdpTransport> {
        let socket = net::bind_multicast(interfaces).map_err(|e| Error::network("bind", e))?;
        let socket =
            UdpSocket::from_socket(socket, handle).map_err(|e| Error::network("register", e))?;
        Ok(UdpTransport {
            socket,
            pool: BufferPool::new(POOL_RETENTION),
            screen: PacketScreen::new(limiter),
        })
    }
}

impl Transport for UdpTransport {
    fn recv_from(&mut self) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        loop {
            let mut buf = self.pool.checkout();
            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    // A read that fills the buffer was likely truncated by
                    // the kernel, which means the datagram was oversized.
                    let deliverable = len < buf.len() && self.screen.admit(len, &src);
                    let payload = if deliverable {
                        Some(buf[..len].to_vec())
                    } else {
                        None
                    };
                    self.pool.restore(buf);
                    match payload {
                        Some(data) => return Ok(Some((data, src))),
                        None => continue,
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.pool.restore(buf);
                    return Ok(None);
                }
                Err(err) => {
                    self.pool.restore(buf);
                    return Err(Error::network("receive", err));
                }
            }
        }
    }

    fn send_to(&mut self, data: &[u8], dest: &SocketAddr) -> Result<bool> {
        match self.socket.send_to(data, dest) {
            Ok(_) => Ok(true),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(Error::network("send", err)),
        }
    }

    fn multicast_dest(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
    }
}

/// One frame captured by the in-memory transport.
#[derive(Clone, Debug)]
pub struct SentFrame {
    pub data: Vec<u8>,
    pub dest: SocketAddr,
    pub at: Instant,
}

/// In-memory transport double: frames in over a channel, frames out into a
/// shared log the test inspects.
pub struct MemoryTransport {
    incoming: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    sent: Arc<Mutex<Vec<SentFrame>>>,
    screen: Option<PacketScreen>,
}

/// The test's side of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryHandle {
    tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    sent: Arc<Mutex<Vec<SentFrame>>>,
}

impl MemoryTransport {
    /// A transport with no screening: every injected frame is delivered.
    pub fn pair() -> (MemoryTransport, MemoryHandle) {
        Self::build(None)
    }

    /// A transport that screens injected frames exactly like the
    /// production receive path.
    pub fn screened(screen: PacketScreen) -> (MemoryTransport, MemoryHandle) {
        Self::build(Some(screen))
    }

    fn build(screen: Option<PacketScreen>) -> (MemoryTransport, MemoryHandle) {
        let (tx, rx) = mpsc::unbounded();
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            MemoryTransport {
                incoming: rx,
                sent: sent.clone(),
                screen,
            },
            MemoryHandle { tx, sent },
        )
    }
}

impl Transport for MemoryTransport {
    fn recv_from(&mut self) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        loop {
            match self.incoming.poll() {
                Ok(Async::Ready(Some((data, src)))) => {
                    if let Some(screen) = self.screen.as_mut() {
                        if !screen.admit(data.len(), &src) {
                            continue;
                        }
                    }
                    return Ok(Some((data, src)));
                }
                Ok(Async::Ready(None)) | Ok(Async::NotReady) | Err(()) => return Ok(None),
            }
        }
    }

    fn send_to(&mut self, data: &[u8], dest: &SocketAddr) -> Result<bool> {
        self.sent.lock().unwrap().push(SentFrame {
            data: data.to_vec(),
            dest: *dest,
            at: Instant::now(),
        });
        Ok(true)
    }

    fn multicast_dest(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
    }
}

impl MemoryHandle {
    /// Delivers a frame to the engine as if it had arrived from `src`.
    pub fn inject(&self, data: Vec<u8>, src: SocketAddr) {
        // Delivery failure just means the engine is gone; tests notice
        // through the send log instead.
        let _ = self.tx.unbounded_send((data, src));
    }

    /// Snapshot of everything the engine has sent so far.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Drops the frames recorded so far.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}
