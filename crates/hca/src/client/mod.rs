// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel Access client.
//!
//! A [`Client`] owns one dispatcher thread, one search socket, and one TCP
//! connection per server, shared by every PV on that server. PVs are
//! created on first reference and reconnect transparently after server
//! restarts.
//!
//! ```no_run
//! use hca::Client;
//! use std::time::Duration;
//!
//! fn main() -> hca::Result<()> {
//!     let client = Client::new()?;
//!     let value = client.get("BEAM:CURRENT.VAL", Some(Duration::from_secs(2)))?;
//!     println!("current = {:?}", value);
//!     client.put("BEAM:SETPOINT.VAL", 7)?;
//!     client.monitor(
//!         "BEAM:CURRENT.VAL",
//!         |event| println!("{} -> {}", event.name, event.text),
//!         Default::default(),
//!     )?;
//!     Ok(())
//! }
//! ```
//!
//! Timed calls never fail on protocol or transport trouble: a PV that
//! cannot be resolved or read within the timeout yields `None`/`false`,
//! and the request keeps running in the background so a late reply still
//! lands in the PV table.

pub mod callback;
pub mod channel;
pub mod connection;
pub mod dispatcher;

pub use callback::{MonitorEvent, MonitorFn, MonitorOptions, WriterFn};
pub use channel::ChannelState;

use crate::config::CaConfig;
use crate::error::Result;
use crate::protocol::types::type_name;
use crate::protocol::PvValue;
use callback::Monitor;
use dispatcher::{Command, Dispatcher, Shared, WAKER_TOKEN};
use mio::{Poll, Waker};
use parking_lot::MutexGuard;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

/// A recent update inside this window counts as "just changed" for
/// [`Client::wait_for_update`].
const RECENT_UPDATE_WINDOW: Duration = Duration::from_millis(70);

/// Channel Access client handle.
pub struct Client {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Client {
    /// Client with defaults overlaid by the `EPICS_CA_*` environment.
    pub fn new() -> Result<Self> {
        Self::with_config(CaConfig::from_env())
    }

    pub fn with_config(config: CaConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (commands, receiver) = crossbeam::channel::unbounded();
        let shared = Arc::new(Shared::new(config, commands, waker));
        let dispatcher = Dispatcher::new(Arc::clone(&shared), receiver, poll)?;
        let handle = std::thread::Builder::new()
            .name("hca-client".to_string())
            .spawn(move || dispatcher.run())?;
        Ok(Self {
            shared,
            dispatcher: Some(handle),
        })
    }

    /// Current value of a PV, waiting up to `timeout` (default
    /// `io_timeout`) for discovery and the first update. `None` on
    /// timeout.
    pub fn get(&self, name: &str, timeout: Option<Duration>) -> Result<Option<PvValue>> {
        let timeout = timeout.unwrap_or(self.shared.config.io_timeout);
        self.shared.send_command(Command::EnsurePv {
            name: name.to_string(),
        })?;

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = state.pvs.get(name).and_then(channel::ClientPv::value) {
                return Ok(Some(value));
            }
            if !self.wait_until(&mut state, deadline) {
                return Ok(None);
            }
        }
    }

    /// Queue a write; it is sent as WRITE_NOTIFY as soon as the channel is
    /// open. Returns immediately.
    pub fn put(&self, name: &str, value: impl Into<PvValue>) -> Result<()> {
        self.shared.send_command(Command::QueueWrite {
            name: name.to_string(),
            value: value.into(),
        })
    }

    /// Write and block until the server confirms, up to `timeout`.
    /// `false` when the confirmation did not arrive in time (the write
    /// may still complete later).
    pub fn put_wait(
        &self,
        name: &str,
        value: impl Into<PvValue>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let timeout = timeout.unwrap_or(self.shared.config.io_timeout);
        let requested = Instant::now();
        self.put(name, value)?;

        let deadline = requested + timeout;
        let mut state = self.shared.state.lock();
        loop {
            let confirmed = state
                .pvs
                .get(name)
                .and_then(|pv| pv.write_confirmed)
                .map_or(false, |at| at >= requested);
            if confirmed {
                return Ok(true);
            }
            if !self.wait_until(&mut state, deadline) {
                return Ok(false);
            }
        }
    }

    /// Invoke `callback` on every update of `name`.
    pub fn monitor(
        &self,
        name: &str,
        callback: impl Fn(&MonitorEvent) + Send + Sync + 'static,
        options: MonitorOptions,
    ) -> Result<()> {
        self.shared.send_command(Command::AddMonitor {
            name: name.to_string(),
            monitor: Monitor::new(Arc::new(callback), options),
        })
    }

    /// Pass one formatted line per update of `name` to `writer`.
    pub fn monitor_writer(
        &self,
        name: &str,
        writer: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.send_command(Command::AddWriter {
            name: name.to_string(),
            writer: Arc::new(writer),
        })
    }

    /// Remove every monitor and writer of `name`.
    pub fn monitor_clear(&self, name: &str) -> Result<()> {
        self.shared.send_command(Command::ClearMonitors {
            name: name.to_string(),
        })
    }

    pub fn monitor_clear_all(&self) -> Result<()> {
        self.shared.send_command(Command::ClearAllMonitors)
    }

    /// Block until the server sends an update event for `name`, up to
    /// `timeout`. An update within the last 70 ms counts. `false` on
    /// timeout.
    pub fn wait_for_update(&self, name: &str, timeout: Option<Duration>) -> Result<bool> {
        let timeout = timeout.unwrap_or(self.shared.config.io_timeout);
        self.shared.send_command(Command::EnsurePv {
            name: name.to_string(),
        })?;

        let now = SystemTime::now();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        let baseline = state.pvs.get(name).and_then(|pv| pv.last_updated);
        if let Some(last) = baseline {
            if now.duration_since(last).map_or(true, |age| age < RECENT_UPDATE_WINDOW) {
                return Ok(true);
            }
        }
        loop {
            let updated = state.pvs.get(name).and_then(|pv| pv.last_updated);
            if updated != baseline {
                return Ok(true);
            }
            if !self.wait_until(&mut state, deadline) {
                return Ok(false);
            }
        }
    }

    /// Connection report for one PV.
    pub fn info(&self, name: &str) -> PvInfo {
        let state = self.shared.state.lock();
        match state.pvs.get(name) {
            Some(pv) => PvInfo {
                name: name.to_string(),
                state: Some(pv.state()),
                server_addr: pv.server_addr,
                access_bits: pv.access_bits,
                data_type: pv.data_type,
                data_count: pv.data_count,
                value: pv.value(),
                last_updated: pv.last_updated,
                response_time: pv.response_time,
                connection_requested: Some(pv.connection_requested),
            },
            None => PvInfo {
                name: name.to_string(),
                ..PvInfo::default()
            },
        }
    }

    /// Tear down every channel and stop the dispatcher. Further calls
    /// return [`crate::Error::Shutdown`].
    pub fn disconnect(&mut self) {
        let _ = self.shared.send_command(Command::Shutdown);
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        self.shared.state.lock().pvs.clear();
    }

    /// Wait on the update condvar until `deadline`; `false` once the
    /// deadline passed or the dispatcher is gone.
    fn wait_until(
        &self,
        state: &mut MutexGuard<'_, dispatcher::ClientState>,
        deadline: Instant,
    ) -> bool {
        if !self.shared.running.load(std::sync::atomic::Ordering::Acquire) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        self.shared.updates.wait_for(state, remaining);
        Instant::now() < deadline
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Snapshot of one PV's connection state, as reported by [`Client::info`].
#[derive(Debug, Clone, Default)]
pub struct PvInfo {
    pub name: String,
    /// `None` when the PV was never referenced.
    pub state: Option<ChannelState>,
    pub server_addr: Option<SocketAddr>,
    pub access_bits: Option<u32>,
    pub data_type: Option<u16>,
    pub data_count: Option<u16>,
    pub value: Option<PvValue>,
    pub last_updated: Option<SystemTime>,
    pub response_time: Option<SystemTime>,
    pub connection_requested: Option<SystemTime>,
}

impl PvInfo {
    /// Multi-line human-readable report.
    pub fn report(&self) -> String {
        let mut s = format!("{}\n", self.name);
        let state = match self.state {
            None => "never referenced".to_string(),
            Some(ChannelState::Subscribed) => "connected, receiving notifications".to_string(),
            Some(ChannelState::ChannelOpen) => "connected".to_string(),
            Some(state) => format!("not connected ({:?})", state),
        };
        s.push_str(&format!("    {:<14} {}\n", "State:", state));
        s.push_str(&format!(
            "    {:<14} {}\n",
            "Host:",
            self.server_addr
                .map_or_else(|| "N/A".to_string(), |addr| addr.to_string())
        ));
        let access = match self.access_bits {
            None => "N/A".to_string(),
            Some(bits) => {
                let mut parts = Vec::new();
                if bits & crate::protocol::constants::ACCESS_READ != 0 {
                    parts.push("read");
                }
                if bits & crate::protocol::constants::ACCESS_WRITE != 0 {
                    parts.push("write");
                }
                if parts.is_empty() {
                    "none".to_string()
                } else {
                    parts.join("/")
                }
            }
        };
        s.push_str(&format!("    {:<14} {}\n", "Access:", access));
        s.push_str(&format!(
            "    {:<14} {}\n",
            "Data type:",
            self.data_type
                .map_or_else(|| "N/A".to_string(), type_name)
        ));
        s.push_str(&format!(
            "    {:<14} {}\n",
            "Element count:",
            self.data_count
                .map_or_else(|| "N/A".to_string(), |count| count.to_string())
        ));
        s.push_str(&format!(
            "    {:<14} {}\n",
            "Value:",
            self.value
                .as_ref()
                .map_or_else(|| "N/A".to_string(), ToString::to_string)
        ));
        s
    }
}
