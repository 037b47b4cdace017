//! UNIX socket construction for the shared mDNS port.
//!
//! `SO_REUSEADDR` and `SO_REUSEPORT` must both be set between `socket()` and
//! `bind()` or the bind loses to any already-running Avahi/mDNSResponder on
//! port 5353; `net2::UdpBuilder` is the pre-bind hook that makes this
//! possible. The socket binds the wildcard address once and joins the group
//! on every selected interface, so one socket covers the whole selection.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;

use log::{debug, warn};
use net2::unix::UnixUdpBuilderExt;
use net2::UdpBuilder;

use crate::proto::{MDNS_GROUP, MDNS_PORT, MULTICAST_TTL};

/// Builds the shared, non-blocking multicast socket.
pub fn bind_multicast(interfaces: &[Ipv4Addr]) -> io::Result<UdpSocket> {
    let builder = UdpBuilder::new_v4()?;
    builder.reuse_address(true)?;
    builder.reuse_port(true)?;
    let socket = builder.bind(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), MDNS_PORT))?;

    let mut joined = 0;
    for addr in interfaces {
        match socket.join_multicast_v4(&MDNS_GROUP, addr) {
            Ok(()) => joined += 1,
            Err(err) => warn!("failed to join {} on {}: {}", MDNS_GROUP, addr, err),
        }
    }
    if joined == 0 {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "could not join the mDNS group on any interface",
        ));
    }

    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    socket.set_nonblocking(true)?;
    bump_recv_buffer(&socket);
    Ok(socket)
}

/// Best-effort `SO_RCVBUF` enlargement so packet storms queue in the kernel
/// instead of dropping while the engine drains. Failure is ignored.
fn bump_recv_buffer(socket: &UdpSocket) {
    let size: libc::c_int = 1 << 20;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!("SO_RCVBUF bump refused: {}", io::Error::last_os_error());
    }
}

/// The system hostname, without any `.local` suffix handling; the caller
/// normalizes.
pub fn gethostname() -> io::Result<String> {
    let mut buf = [0u8; 256];
    let name = nix::unistd::gethostname(&mut buf)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, format!("gethostname: {}", err)))?;
    Ok(name.to_string_lossy().into_owned())
}
