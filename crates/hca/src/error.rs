// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by hca operations.

use crate::protocol::WireError;

/// Errors returned by client and server operations.
///
/// Transport-level failures (lost connections, unreachable servers) are
/// recovered internally and surface as `None`/`false` results from the
/// timed calls, not as errors; this enum covers the conditions a caller
/// can actually act on.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration / startup
    // ========================================================================
    /// Failed to bind a listening socket.
    BindFailed(String),
    /// An address in the configured address list did not parse.
    InvalidAddress(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Send operation failed.
    SendFailed(String),

    // ========================================================================
    // Data
    // ========================================================================
    /// Wire encoding/decoding failed.
    Codec(WireError),
    /// Named PV is not hosted / not registered.
    UnknownPv(String),
    /// A registered provider rejected a value.
    ProviderRejected { name: String, reason: String },

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The engine thread is shut down.
    Shutdown,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::InvalidAddress(addr) => write!(f, "invalid address: {}", addr),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::SendFailed(msg) => write!(f, "send failed: {}", msg),
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::UnknownPv(name) => write!(f, "unknown PV: {}", name),
            Error::ProviderRejected { name, reason } => {
                write!(f, "provider rejected write to {}: {}", name, reason)
            }
            Error::Shutdown => write!(f, "engine is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Codec(e)
    }
}

/// Convenient alias for API results using the public [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
