// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local interface enumeration and broadcast-address derivation.
//!
//! PV name resolution works by broadcasting SEARCH datagrams, so the
//! client needs one broadcast address per local IPv4 interface: the
//! interface's explicit broadcast address when the platform reports one,
//! otherwise `address | !netmask`. Addresses from `EPICS_CA_ADDR_LIST`
//! are appended to the derived set (or replace it entirely when
//! `EPICS_CA_AUTO_ADDR_LIST=NO`).
//!
//! Enumeration strategy:
//! - Linux: parse `ip -4 addr show` (carries prefix length and the `brd`
//!   field)
//! - elsewhere, or when `ip` is unavailable (e.g. minimal containers):
//!   the `local-ip-address` crate with a /24 assumption

use crate::config::CaConfig;
use std::net::Ipv4Addr;

/// One local IPv4 interface address as far as broadcast derivation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddr {
    pub addr: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
}

/// `address | !netmask`, e.g. 192.168.1.42/255.255.255.0 -> 192.168.1.255.
pub fn broadcast_address(addr: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(netmask))
}

/// Dotted netmask for a CIDR prefix length (clamped to 32).
pub fn netmask_from_prefix(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix.min(32))))
}

/// The full set of addresses SEARCH datagrams are sent to: interface-derived
/// broadcasts (unless disabled) plus the configured address list,
/// deduplicated with the configured addresses last.
pub fn search_targets(config: &CaConfig) -> Vec<Ipv4Addr> {
    let auto = if config.auto_addr_list {
        derive_broadcasts(&local_interfaces())
    } else {
        Vec::new()
    };
    merge_targets(auto, &config.addr_list)
}

/// Broadcast set for a list of interfaces: explicit broadcast when known,
/// otherwise derived from the netmask; interfaces with neither are skipped.
pub fn derive_broadcasts(interfaces: &[IfaceAddr]) -> Vec<Ipv4Addr> {
    let mut out = Vec::new();
    for iface in interfaces {
        let target = match (iface.broadcast, iface.netmask) {
            (Some(brd), _) => brd,
            (None, Some(mask)) => broadcast_address(iface.addr, mask),
            (None, None) => {
                log::debug!(
                    "[search] interface {} has no netmask or broadcast, skipping",
                    iface.addr
                );
                continue;
            }
        };
        if !out.contains(&target) {
            out.push(target);
        }
    }
    out
}

fn merge_targets(auto: Vec<Ipv4Addr>, configured: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut out = auto;
    for addr in configured {
        if !out.contains(addr) {
            out.push(*addr);
        }
    }
    out
}

/// Enumerate local non-loopback IPv4 interfaces.
pub fn local_interfaces() -> Vec<IfaceAddr> {
    let interfaces = local_interfaces_platform();
    log::debug!("[search] local interfaces: {:?}", interfaces);
    interfaces
}

/// Linux: parse `ip -4 addr show`. Falls back to the `local-ip-address`
/// crate when the `ip` binary is unavailable.
#[cfg(target_os = "linux")]
fn local_interfaces_platform() -> Vec<IfaceAddr> {
    use std::process::Command;

    let output = match Command::new("ip").args(["-4", "addr", "show"]).output() {
        Ok(o) => o,
        Err(_) => {
            log::debug!("[search] 'ip' command not found, using local_ip_address crate");
            return local_interfaces_crate();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut interfaces = Vec::new();
    for line in stdout.lines() {
        if line.contains("127.0.0.1") || line.contains("host lo") {
            continue;
        }
        if let Some(iface) = parse_ip_line(line.trim()) {
            interfaces.push(iface);
        }
    }
    if interfaces.is_empty() {
        return local_interfaces_crate();
    }
    interfaces
}

#[cfg(not(target_os = "linux"))]
fn local_interfaces_platform() -> Vec<IfaceAddr> {
    local_interfaces_crate()
}

/// Parse one `inet a.b.c.d/prefix [brd x.y.z.w] ...` line.
fn parse_ip_line(line: &str) -> Option<IfaceAddr> {
    let rest = line.strip_prefix("inet ")?;
    let mut fields = rest.split_whitespace();
    let cidr = fields.next()?;
    let (addr_str, prefix_str) = match cidr.split_once('/') {
        Some(pair) => pair,
        None => (cidr, "32"),
    };
    let addr = addr_str.parse::<Ipv4Addr>().ok()?;
    let netmask = prefix_str
        .parse::<u8>()
        .ok()
        .map(netmask_from_prefix);

    // The optional `brd` field carries the explicit broadcast address.
    let mut broadcast = None;
    while let Some(field) = fields.next() {
        if field == "brd" {
            broadcast = fields.next().and_then(|s| s.parse().ok());
            break;
        }
    }
    Some(IfaceAddr { addr, netmask, broadcast })
}

/// Fallback enumeration without netmask information: assume /24, the
/// common case for lab subnets.
fn local_interfaces_crate() -> Vec<IfaceAddr> {
    let mut interfaces = Vec::new();
    match local_ip_address::list_afinet_netifas() {
        Ok(list) => {
            for (_name, ip) in list {
                if let std::net::IpAddr::V4(addr) = ip {
                    if addr.is_loopback() {
                        continue;
                    }
                    interfaces.push(IfaceAddr {
                        addr,
                        netmask: Some(Ipv4Addr::new(255, 255, 255, 0)),
                        broadcast: None,
                    });
                }
            }
        }
        Err(err) => {
            log::warn!("[search] interface enumeration failed: {}", err);
        }
    }
    interfaces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(addr: &str, netmask: Option<&str>, broadcast: Option<&str>) -> IfaceAddr {
        IfaceAddr {
            addr: addr.parse().expect("addr"),
            netmask: netmask.map(|s| s.parse().expect("netmask")),
            broadcast: broadcast.map(|s| s.parse().expect("broadcast")),
        }
    }

    #[test]
    fn test_broadcast_address() {
        assert_eq!(
            broadcast_address("192.168.1.42".parse().unwrap(), "255.255.255.0".parse().unwrap()),
            "192.168.1.255".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            broadcast_address("128.231.5.169".parse().unwrap(), "255.255.254.0".parse().unwrap()),
            "128.231.5.255".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_netmask_from_prefix() {
        assert_eq!(netmask_from_prefix(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask_from_prefix(23), Ipv4Addr::new(255, 255, 254, 0));
        assert_eq!(netmask_from_prefix(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(netmask_from_prefix(0), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_derive_from_netmask() {
        let set = derive_broadcasts(&[iface("192.168.1.42", Some("255.255.255.0"), None)]);
        assert_eq!(set, vec!["192.168.1.255".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_explicit_broadcast_wins() {
        let set = derive_broadcasts(&[iface(
            "10.1.2.3",
            Some("255.255.255.0"),
            Some("10.1.255.255"),
        )]);
        assert_eq!(set, vec!["10.1.255.255".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_addr_list_appended() {
        let config = CaConfig {
            addr_list: vec!["10.0.0.255".parse().unwrap()],
            ..CaConfig::default()
        };
        let auto = derive_broadcasts(&[iface("192.168.1.42", Some("255.255.255.0"), None)]);
        let set = merge_targets(auto, &config.addr_list);
        assert!(set.contains(&"192.168.1.255".parse().unwrap()));
        assert!(set.contains(&"10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn test_auto_addr_list_disabled() {
        // With auto derivation off only the configured list remains.
        let config = CaConfig {
            addr_list: vec!["10.0.0.255".parse().unwrap()],
            auto_addr_list: false,
            ..CaConfig::default()
        };
        let set = search_targets(&config);
        assert_eq!(set, vec!["10.0.0.255".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_merge_deduplicates() {
        let set = merge_targets(
            vec!["10.0.0.255".parse().unwrap()],
            &["10.0.0.255".parse().unwrap()],
        );
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_parse_ip_line() {
        let parsed = parse_ip_line(
            "inet 192.168.1.42/24 brd 192.168.1.255 scope global dynamic eth0",
        )
        .expect("line parses");
        assert_eq!(parsed.addr, Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(parsed.netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(parsed.broadcast, Some(Ipv4Addr::new(192, 168, 1, 255)));

        let parsed = parse_ip_line("inet 10.0.0.5/8 scope global eth1").expect("line parses");
        assert_eq!(parsed.broadcast, None);
        assert_eq!(parsed.netmask, Some(Ipv4Addr::new(255, 0, 0, 0)));

        assert!(parse_ip_line("link/ether aa:bb:cc:dd:ee:ff").is_none());
    }
}
