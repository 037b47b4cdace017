//! Windows socket construction for the shared mDNS port.
//!
//! Windows has no `SO_REUSEPORT`; `SO_REUSEADDR` alone provides the
//! equivalent port sharing. `socket2` gives us the pre-bind option hook.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use log::warn;
use socket2::{Domain, Protocol, Socket, Type};

use crate::proto::{MDNS_GROUP, MDNS_PORT, MULTICAST_TTL};

/// Builds the shared, non-blocking multicast socket.
pub fn bind_multicast(interfaces: &[Ipv4Addr]) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::ipv4(), Type::dgram(), Some(Protocol::udp()))?;
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), MDNS_PORT).into();
    socket.bind(&bind_addr.into())?;
    let socket = socket.into_udp_socket();

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
    Ok(socket)
}

/// The system hostname via `GetComputerNameExW`, without any `.local`
/// suffix handling; the caller normalizes.
pub fn gethostname() -> io::Result<String> {
    use kernel32::GetComputerNameExW;
    use winapi::winbase::ComputerNamePhysicalDnsHostname;

    let mut size: u32 = 0;
    unsafe {
        // First call reports the required buffer size.
        GetComputerNameExW(
            ComputerNamePhysicalDnsHostname,
            std::ptr::null_mut(),
            &mut size,
        );
    }

    let mut buf = vec![0u16; size as usize];
    let ok = unsafe {
        GetComputerNameExW(ComputerNamePhysicalDnsHostname, buf.as_mut_ptr(), &mut size)
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(size as usize);
    Ok(String::from_utf16_lossy(&buf))
}
