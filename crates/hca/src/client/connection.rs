// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side TCP connection to one CA server.
//!
//! One connection is shared by every PV hosted on that server. Opening a
//! connection immediately sends the greeting triple — VERSION,
//! CLIENT_NAME, HOST_NAME — as a single write so no CREATE_CHAN can ever
//! overtake it.

use crate::protocol::constants::{
    CLIENT_PRIORITY, CMD_CLIENT_NAME, CMD_HOST_NAME, CMD_VERSION, MINOR_VERSION,
};
use crate::protocol::{describe, CaMessage, FrameBuffer};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Per-server connection state.
pub struct ServerConnection {
    pub addr: SocketAddr,
    pub stream: mio::net::TcpStream,
    /// Reassembly buffer for the inbound stream.
    pub frames: FrameBuffer,
}

impl ServerConnection {
    /// Connect, switch to non-blocking mode and send the greeting.
    pub fn open(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let mut connection = Self {
            addr,
            stream: mio::net::TcpStream::from_std(stream),
            frames: FrameBuffer::new(),
        };
        connection.greet()?;
        log::debug!("[client] connected to {}", addr);
        Ok(connection)
    }

    /// The VERSION / CLIENT_NAME / HOST_NAME triple, one atomic write.
    fn greet(&mut self) -> io::Result<()> {
        let mut wire = CaMessage::bare(CMD_VERSION, CLIENT_PRIORITY, MINOR_VERSION, 0, 0).encode();
        let mut name = user_name().into_bytes();
        name.push(0);
        wire.extend_from_slice(&CaMessage::new(CMD_CLIENT_NAME, 0, 0, 0, 0, name).encode());
        let mut host = host_name().into_bytes();
        host.push(0);
        wire.extend_from_slice(&CaMessage::new(CMD_HOST_NAME, 0, 0, 0, 0, host).encode());
        self.send_bytes(&wire)
    }

    pub fn send(&mut self, message: &CaMessage) -> io::Result<()> {
        log::debug!("[client] send {} {}", self.addr, describe(message));
        self.send_bytes(&message.encode())
    }

    /// Write the whole buffer on the non-blocking stream. CA messages are
    /// small, so a full send buffer clears within the bounded retry
    /// window; a window that never clears counts as a dead connection.
    fn send_bytes(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !bytes.is_empty() {
            match self.stream.write(bytes) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "connection closed"));
                }
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "send buffer full"));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Login name for the CLIENT_NAME greeting.
pub fn user_name() -> String {
    for var in ["USER", "USERNAME", "LOGNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }
    "unknown".to_string()
}

/// Host name for the HOST_NAME greeting.
#[cfg(unix)]
pub fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes a NUL-terminated name into the provided
    // buffer, bounded by its length
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret == 0 {
        let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..len]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "localhost".to_string()
}

#[cfg(not(unix))]
pub fn host_name() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
