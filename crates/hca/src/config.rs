// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! Every timing knob is a `Duration` field with a CA-conventional default,
//! so tests can shrink them and embedders can tune them without touching
//! the environment. [`CaConfig::from_env`] additionally honors the two
//! standard EPICS client variables:
//!
//! - `EPICS_CA_ADDR_LIST` — space-separated dotted IPv4 addresses added to
//!   the search broadcast set
//! - `EPICS_CA_AUTO_ADDR_LIST=NO` — suppress automatic derivation of
//!   broadcast addresses from the local interfaces

use crate::protocol::constants::CA_SERVER_PORT;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Environment variable naming extra search addresses.
pub const ENV_ADDR_LIST: &str = "EPICS_CA_ADDR_LIST";

/// Environment variable suppressing interface-derived addresses.
pub const ENV_AUTO_ADDR_LIST: &str = "EPICS_CA_AUTO_ADDR_LIST";

/// Client and server runtime configuration.
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// UDP port searched / listened on (server TCP also starts here).
    pub server_port: u16,
    /// Default timeout for user-facing calls (get/put/wait).
    pub io_timeout: Duration,
    /// How long an unanswered SEARCH stays outstanding before it is
    /// re-broadcast.
    pub search_retry: Duration,
    /// Server change-detection sweep interval.
    pub update_interval: Duration,
    /// TTL of the server-side value cache in front of providers.
    pub cache_ttl: Duration,
    /// Extra addresses for search broadcasts (dotted IPv4).
    pub addr_list: Vec<Ipv4Addr>,
    /// Derive broadcast addresses from local interfaces.
    pub auto_addr_list: bool,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            server_port: CA_SERVER_PORT,
            io_timeout: Duration::from_secs(1),
            search_retry: Duration::from_secs(1),
            update_interval: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(1),
            addr_list: Vec::new(),
            auto_addr_list: true,
        }
    }
}

impl CaConfig {
    /// Defaults overlaid with the `EPICS_CA_*` environment variables.
    ///
    /// Unparseable entries in `EPICS_CA_ADDR_LIST` are skipped with a
    /// warning rather than failing startup, the way IOC tooling behaves.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(list) = std::env::var(ENV_ADDR_LIST) {
            for entry in list.split_whitespace() {
                match entry.parse::<Ipv4Addr>() {
                    Ok(addr) => config.addr_list.push(addr),
                    Err(_) => {
                        log::warn!("[config] ignoring unparseable {} entry {:?}", ENV_ADDR_LIST, entry);
                    }
                }
            }
        }

        if let Ok(flag) = std::env::var(ENV_AUTO_ADDR_LIST) {
            if flag.eq_ignore_ascii_case("no") {
                config.auto_addr_list = false;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaConfig::default();
        assert_eq!(config.server_port, 5064);
        assert_eq!(config.io_timeout, Duration::from_secs(1));
        assert!(config.auto_addr_list);
        assert!(config.addr_list.is_empty());
    }

    // from_env is covered indirectly in transport::addr tests; mutating
    // process-wide environment variables from parallel unit tests races.
}
