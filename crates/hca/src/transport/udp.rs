// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP sockets for PV name resolution.
//!
//! Two roles share this module:
//! - the client's **search socket**: ephemeral port, `SO_BROADCAST`
//!   enabled so SEARCH datagrams reach the derived broadcast set
//! - the server's **discovery socket**: bound to the CA port with
//!   `SO_REUSEADDR` and (on unix) `SO_REUSEPORT`, so several co-resident
//!   servers can all hear the same search broadcasts

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Client-side search socket: broadcast-capable, ephemeral port.
pub fn search_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    let bind_addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    log::debug!(
        "[search] search socket bound to {}",
        socket.local_addr().map_or_else(|_| "?".into(), |a| a.to_string())
    );
    Ok(socket)
}

/// Server-side discovery socket on the CA port.
///
/// Without `SO_REUSEADDR` only one process could listen on the port, and a
/// restarted server would have to wait out the CLOSE_WAIT window.
/// `SO_REUSEPORT` additionally lets multiple servers on one machine all
/// receive search broadcasts; required on macOS, harmless on Linux.
pub fn discovery_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    set_reuseport(&socket)?;
    let bind_addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    log::debug!("[server] discovery socket bound to 0.0.0.0:{}", port);
    Ok(socket)
}

/// Set `SO_REUSEPORT` on a socket for multi-process port sharing.
#[cfg(unix)]
fn set_reuseport(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, standard socket option, and
    // correctly sized optval pointer
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::addr_of!(optval).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_socket_is_broadcast_capable() {
        let socket = search_socket().expect("search socket");
        assert!(socket.broadcast().expect("broadcast flag readable"));
        assert_ne!(socket.local_addr().expect("local addr").port(), 0);
    }

    #[test]
    fn test_discovery_socket_port_sharing() {
        // Two sockets on the same port must coexist (reuse options set).
        let port = 39000 + (std::process::id() % 1000) as u16;
        let first = discovery_socket(port).expect("first bind");
        let second = discovery_socket(port).expect("second bind on same port");
        assert_eq!(first.local_addr().expect("addr").port(), port);
        assert_eq!(second.local_addr().expect("addr").port(), port);
    }
}
