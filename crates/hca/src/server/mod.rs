// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel Access server (IOC side).
//!
//! A [`Server`] hosts named process variables over CA: it answers SEARCH
//! broadcasts on the CA UDP port, serves channels over TCP, and pushes
//! EVENT_ADD updates to subscribed clients whenever a value changes.
//!
//! ```no_run
//! use hca::Server;
//!
//! fn main() -> hca::Result<()> {
//!     let server = Server::start()?;
//!     server.put("LAB:DET.COUNT", 0)?;
//!     server.monitor("LAB:DET.COUNT", |name, value, _text| {
//!         println!("client wrote {} = {}", name, value);
//!     })?;
//!     loop {
//!         std::thread::sleep(std::time::Duration::from_secs(60));
//!     }
//! }
//! ```
//!
//! Values come from three sources, consulted in priority order: objects
//! registered under a prefix ([`RecordProvider`]), single registered
//! properties ([`PvProperty`]), and the in-memory table fed by
//! [`Server::put`].

pub mod cache;
pub mod engine;
pub mod provider;
pub mod pv;

pub use provider::{Lookup, PvProperty, RecordProvider};
pub use pv::{ServerCallback, ServerWriter};

use crate::config::CaConfig;
use crate::error::{Error, Result};
use crate::protocol::PvValue;
use crate::transport::discovery_socket;
use engine::{ServerShared, TCP_PORT_PROBE_RANGE};
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Channel Access server handle. Threads stop when the handle drops.
pub struct Server {
    shared: Arc<ServerShared>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Start on the standard CA port (5064), environment-configured.
    pub fn start() -> Result<Self> {
        Self::with_config(CaConfig::from_env())
    }

    /// Start with explicit configuration.
    ///
    /// UDP binds the configured port with address/port reuse so several
    /// servers can share discovery; TCP probes upward from the same port
    /// until a free one is found, and SEARCH replies advertise the port
    /// actually bound.
    pub fn with_config(config: CaConfig) -> Result<Self> {
        let udp = discovery_socket(config.server_port)?;

        let mut listener = None;
        for port in config.server_port..config.server_port.saturating_add(TCP_PORT_PROBE_RANGE) {
            match TcpListener::bind(("0.0.0.0", port)) {
                Ok(bound) => {
                    listener = Some((bound, port));
                    break;
                }
                Err(e) => {
                    log::debug!("[server] tcp port {} unavailable: {}", port, e);
                }
            }
        }
        let Some((listener, tcp_port)) = listener else {
            return Err(Error::BindFailed(format!(
                "no free TCP port in {}..{}",
                config.server_port,
                config.server_port.saturating_add(TCP_PORT_PROBE_RANGE)
            )));
        };
        log::debug!("[server] listening on TCP/UDP port {}", tcp_port);

        let shared = Arc::new(ServerShared::new(config, tcp_port));
        let threads = engine::spawn_threads(&shared, udp, listener)?;
        Ok(Self { shared, threads })
    }

    /// The TCP port this server advertises in SEARCH replies.
    pub fn tcp_port(&self) -> u16 {
        self.shared.tcp_port
    }

    /// Create a PV or update its value. Subscribers are notified when the
    /// wire encoding changed.
    pub fn put(&self, name: &str, value: impl Into<PvValue>) -> Result<()> {
        self.put_impl(name, value.into(), false)
    }

    /// Like [`put`](Self::put), but notifies subscribers even when the
    /// value is unchanged.
    pub fn put_always(&self, name: &str, value: impl Into<PvValue>) -> Result<()> {
        self.put_impl(name, value.into(), true)
    }

    fn put_impl(&self, name: &str, value: PvValue, update_always: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        let current = state.value(name, true);
        let changed = current
            .as_ref()
            .map_or(true, |c| c.fingerprint() != value.fingerprint());
        if changed || update_always {
            state.set_value(name, value, false).map_err(|reason| {
                Error::ProviderRejected {
                    name: name.to_string(),
                    reason,
                }
            })?;
        } else {
            // Make sure the name exists even when the value is a repeat.
            state
                .pvs
                .entry(name.to_string())
                .or_insert_with(|| pv::ServerPv::new(name));
        }
        Ok(())
    }

    /// Current value of a hosted name (which a client may have modified
    /// since the last put), or `None` when nothing resolves it.
    pub fn get(&self, name: &str) -> Option<PvValue> {
        self.shared.state.lock().value(name, true)
    }

    /// Does any source resolve this name?
    pub fn exists(&self, name: &str) -> bool {
        self.shared.state.lock().exists(name)
    }

    /// Observe client-initiated writes to `name`: `(name, value, text)`.
    /// Callbacks run on fresh threads, so calling back into the server is
    /// safe.
    pub fn monitor(
        &self,
        name: &str,
        callback: impl Fn(&str, &PvValue, &str) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        let pv = state
            .pvs
            .entry(name.to_string())
            .or_insert_with(|| pv::ServerPv::new(name));
        pv.callbacks.push(Arc::new(callback));
        Ok(())
    }

    /// Observe client-initiated writes as formatted text lines.
    pub fn monitor_writer(
        &self,
        name: &str,
        writer: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        let pv = state
            .pvs
            .entry(name.to_string())
            .or_insert_with(|| pv::ServerPv::new(name));
        pv.writers.push(Arc::new(writer));
        Ok(())
    }

    /// Drop a PV: every subscriber receives EVENT_CANCEL, then the name
    /// stops resolving (unless a provider still claims it).
    pub fn delete(&self, name: &str) {
        use crate::protocol::constants::CMD_EVENT_CANCEL;
        use crate::protocol::CaMessage;

        let mut state = self.shared.state.lock();
        state.cache.invalidate(name);
        let Some(removed) = state.pvs.remove(name) else {
            return;
        };
        log::debug!("[server] deleting PV {}", name);
        for (addr, subscriber) in &removed.subscribers {
            if let Some(connection) = state.connections.get(addr) {
                connection.send(&CaMessage::bare(
                    CMD_EVENT_CANCEL,
                    subscriber.data_type,
                    subscriber.data_count,
                    removed.channel_sid,
                    subscriber.subscription_id,
                ));
            }
        }
    }

    /// Delete every table-hosted PV whose name starts with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) {
        let names: Vec<String> = {
            let state = self.shared.state.lock();
            state
                .pvs
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect()
        };
        for name in names {
            self.delete(&name);
        }
    }

    /// Export an object's fields as PVs under `prefix`.
    pub fn register_object(&self, prefix: &str, provider: Arc<dyn RecordProvider>) {
        self.shared
            .state
            .lock()
            .providers
            .register_object(prefix, provider);
    }

    /// Remove an object registration and its table shadows.
    pub fn unregister_object(&self, prefix: &str) {
        self.shared.state.lock().providers.unregister_object(prefix);
        self.delete_prefix(prefix);
    }

    /// Export a get/set pair as a single PV.
    pub fn register_property(&self, name: &str, property: PvProperty) {
        self.shared
            .state
            .lock()
            .providers
            .register_property(name, property);
    }

    pub fn unregister_property(&self, name: &str) {
        self.shared
            .state
            .lock()
            .providers
            .unregister_property(name);
        self.delete(name);
    }

    /// How many clients subscribe to `name` right now.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .pvs
            .get(name)
            .map_or(0, |pv| pv.subscribers.len())
    }

    /// Is at least one client subscribed to `name`?
    pub fn is_connected(&self, name: &str) -> bool {
        self.subscriber_count(name) > 0
    }

    /// Names currently in the PV table.
    pub fn pv_names(&self) -> Vec<String> {
        self.shared.state.lock().pvs.keys().cloned().collect()
    }

    /// Run one change-detection sweep immediately (the periodic sweep
    /// keeps running). Useful in tests with long intervals.
    pub fn sweep_now(&self) {
        engine::update_subscribed_pvs(&self.shared);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(port: u16) -> CaConfig {
        CaConfig {
            server_port: port,
            update_interval: Duration::from_millis(100),
            cache_ttl: Duration::from_millis(50),
            ..CaConfig::default()
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let server = Server::with_config(test_config(52_801)).expect("server starts");
        server.put("TEST:A.VAL", 1).expect("put");
        assert_eq!(server.get("TEST:A.VAL"), Some(PvValue::Long(1)));
        assert!(server.exists("TEST:A.VAL"));
        assert!(!server.exists("TEST:B.VAL"));
        assert!(server.pv_names().contains(&"TEST:A.VAL".to_string()));
    }

    #[test]
    fn test_delete_removes_name() {
        let server = Server::with_config(test_config(52_802)).expect("server starts");
        server.put("TEST:DEL.VAL", 1.5).expect("put");
        assert!(server.exists("TEST:DEL.VAL"));
        server.delete("TEST:DEL.VAL");
        assert!(!server.exists("TEST:DEL.VAL"));
        assert_eq!(server.get("TEST:DEL.VAL"), None);
    }

    #[test]
    fn test_delete_prefix() {
        let server = Server::with_config(test_config(52_803)).expect("server starts");
        server.put("RIG:A", 1).expect("put");
        server.put("RIG:B", 2).expect("put");
        server.put("OTHER:C", 3).expect("put");
        server.delete_prefix("RIG:");
        assert!(!server.exists("RIG:A"));
        assert!(!server.exists("RIG:B"));
        assert!(server.exists("OTHER:C"));
    }

    #[test]
    fn test_co_resident_servers_pick_distinct_tcp_ports() {
        let first = Server::with_config(test_config(52_804)).expect("first server");
        let second = Server::with_config(test_config(52_804)).expect("second server");
        assert_eq!(first.tcp_port(), 52_804);
        assert!(second.tcp_port() > 52_804, "second server must probe upward");
    }

    #[test]
    fn test_registered_property_resolves() {
        let server = Server::with_config(test_config(52_805)).expect("server starts");
        server.register_property(
            "LAB:CONST",
            PvProperty::readonly(|| PvValue::Double(2.718)),
        );
        assert_eq!(server.get("LAB:CONST"), Some(PvValue::Double(2.718)));
        server.unregister_property("LAB:CONST");
        // The cache entry dies with the registration.
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(server.get("LAB:CONST"), None);
    }
}
