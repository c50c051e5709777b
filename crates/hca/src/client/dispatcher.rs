// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The client engine: a dedicated thread owning a `mio::Poll` over the
//! search socket, every server connection, and a waker.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Dispatcher thread                         |
//! |  +--------------------------------------------------------+  |
//! |  |                      mio::Poll                          |  |
//! |  |  - UDP search socket (SEARCH replies, NOT_FOUND)        |  |
//! |  |  - TCP connections (one per server, shared by PVs)      |  |
//! |  |  - Waker (command queue notifications)                  |  |
//! |  +--------------------------------------------------------+  |
//! |        |                |                    |               |
//! |        v                v                    v               |
//! |  drain commands   service sockets   sweep searches/writes    |
//! |        |                                                     |
//! |        v                                                     |
//! |  ClientState (mutex) --- condvar ---> blocked get/put/wait   |
//! +--------------------------------------------------------------+
//! ```
//!
//! API threads never touch a socket: they enqueue a [`Command`], wake the
//! poll, and wait on the condvar for the state change they care about.
//! Only the dispatcher mutates connection state, which keeps the whole
//! protocol pipeline single-threaded.

use crate::client::callback::{deliver, Monitor, MonitorEvent, WriterFn};
use crate::client::channel::ClientPv;
use crate::client::connection::ServerConnection;
use crate::config::CaConfig;
use crate::error::{Error, Result};
use crate::protocol::constants::{
    CMD_ACCESS_RIGHTS, CMD_CREATE_CHAN, CMD_CREATE_CH_FAIL, CMD_ECHO, CMD_EVENT_ADD,
    CMD_EVENT_CANCEL, CMD_NOT_FOUND, CMD_READ_NOTIFY, CMD_SEARCH, CMD_SERVER_DISCONN,
    CMD_VERSION, CMD_WRITE_NOTIFY, ECA_NORMAL, MASK_DEFAULT, MINOR_VERSION, SEARCH_NO_REPLY,
};
use crate::protocol::{
    command_name, decode_timestamp, decode_value, describe, encode_value, split_datagram,
    CaMessage, CursorMut, DbrType, PvValue,
};
use crate::transport::{search_socket, search_targets};
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Instant, SystemTime};

pub const UDP_TOKEN: Token = Token(0);
pub const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;

/// Poll timeout; bounds sweep latency when no socket is active.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

const MAX_EVENTS: usize = 64;
const RECV_BUFFER: usize = 65536;

/// Requests from API threads to the dispatcher.
pub enum Command {
    /// Create the PV record (and start discovery) if it does not exist.
    EnsurePv { name: String },
    /// Queue a native value for WRITE_NOTIFY.
    QueueWrite { name: String, value: PvValue },
    AddMonitor { name: String, monitor: Monitor },
    AddWriter { name: String, writer: WriterFn },
    ClearMonitors { name: String },
    ClearAllMonitors,
    Shutdown,
}

/// The PV table. Only the dispatcher mutates it; API threads take the
/// lock to read snapshots and to wait on the condvar.
#[derive(Default)]
pub struct ClientState {
    pub pvs: HashMap<String, ClientPv>,
}

/// State shared between the `Client` handle and its dispatcher thread.
pub struct Shared {
    pub config: CaConfig,
    pub state: Mutex<ClientState>,
    /// Broadcast on every dispatcher round that changed state.
    pub updates: Condvar,
    pub running: AtomicBool,
    commands: Sender<Command>,
    waker: Waker,
    cid_counter: AtomicU32,
    subscription_counter: AtomicU32,
}

impl Shared {
    pub fn new(config: CaConfig, commands: Sender<Command>, waker: Waker) -> Self {
        Self {
            config,
            state: Mutex::new(ClientState::default()),
            updates: Condvar::new(),
            running: AtomicBool::new(true),
            commands,
            waker,
            cid_counter: AtomicU32::new(0),
            subscription_counter: AtomicU32::new(0),
        }
    }

    /// Enqueue a command and wake the poll loop.
    pub fn send_command(&self, command: Command) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.commands.send(command).map_err(|_| Error::Shutdown)?;
        if let Err(e) = self.waker.wake() {
            log::debug!("[client] waker failed: {}", e);
        }
        Ok(())
    }

    /// Monotonic channel CIDs, never reused within this client.
    pub fn next_cid(&self) -> u32 {
        self.cid_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Monotonic subscription IDs, never reused within this client.
    pub fn next_subscription_id(&self) -> u32 {
        self.subscription_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up or create a PV record, refreshing its request stamp.
    pub fn ensure_pv<'a>(&self, state: &'a mut ClientState, name: &str) -> &'a mut ClientPv {
        let pv = state
            .pvs
            .entry(name.to_string())
            .or_insert_with(|| ClientPv::new(name, self.next_cid()));
        pv.last_connection_requested = SystemTime::now();
        pv
    }
}

/// The poll loop and everything only it may touch.
pub struct Dispatcher {
    shared: std::sync::Arc<Shared>,
    commands: Receiver<Command>,
    poll: Poll,
    events: Events,
    udp: mio::net::UdpSocket,
    connections: HashMap<Token, ServerConnection>,
    tokens_by_addr: HashMap<SocketAddr, Token>,
    next_token: usize,
    targets: Vec<SocketAddr>,
}

impl Dispatcher {
    /// Set up the poll with the search socket registered. The `Poll` (and
    /// its waker) are created by the caller so the `Client` handle can
    /// wake the loop before this thread even starts.
    pub fn new(
        shared: std::sync::Arc<Shared>,
        commands: Receiver<Command>,
        poll: Poll,
    ) -> Result<Self> {
        let socket = search_socket()?;
        socket.set_nonblocking(true)?;
        let mut udp = mio::net::UdpSocket::from_std(socket);
        poll.registry()
            .register(&mut udp, UDP_TOKEN, Interest::READABLE)?;

        let port = shared.config.server_port;
        let targets: Vec<SocketAddr> = search_targets(&shared.config)
            .into_iter()
            .map(|ip| SocketAddr::from((ip, port)))
            .collect();
        if targets.is_empty() {
            log::warn!("[search] no broadcast targets; name resolution cannot succeed");
        } else {
            log::debug!("[search] targets: {:?}", targets);
        }

        Ok(Self {
            shared,
            commands,
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            udp,
            connections: HashMap::new(),
            tokens_by_addr: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            targets,
        })
    }

    pub fn run(mut self) {
        log::debug!("[client] dispatcher started");
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_INTERVAL)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[client] poll failed: {}", e);
                break;
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    UDP_TOKEN => self.service_udp(),
                    WAKER_TOKEN => {} // commands are drained below
                    token => self.service_connection(token),
                }
            }

            if !self.drain_commands() {
                break;
            }
            self.sweep_searches();
            self.sweep_writes();
            self.shared.updates.notify_all();
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.updates.notify_all();
        log::debug!("[client] dispatcher stopped");
    }

    /// Returns false when the loop should exit.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Shutdown) => return false,
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let shared = std::sync::Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        match command {
            Command::EnsurePv { name } => {
                shared.ensure_pv(&mut state, &name);
            }
            Command::QueueWrite { name, value } => {
                let pv = shared.ensure_pv(&mut state, &name);
                pv.pending_write = Some(value);
                pv.write_requested = Some(Instant::now());
                pv.write_confirmed = None;
            }
            Command::AddMonitor { name, monitor } => {
                let pv = shared.ensure_pv(&mut state, &name);
                if pv
                    .callbacks
                    .iter()
                    .any(|registered| registered.same_callback(&monitor.callback))
                {
                    log::debug!("[client] {} already has this monitor", name);
                } else {
                    pv.callbacks.push(monitor);
                }
            }
            Command::AddWriter { name, writer } => {
                let pv = shared.ensure_pv(&mut state, &name);
                if pv
                    .writers
                    .iter()
                    .any(|registered| std::sync::Arc::ptr_eq(registered, &writer))
                {
                    log::debug!("[client] {} already has this writer", name);
                } else {
                    pv.writers.push(writer);
                }
            }
            Command::ClearMonitors { name } => {
                if let Some(pv) = state.pvs.get_mut(&name) {
                    pv.callbacks.clear();
                    pv.writers.clear();
                }
            }
            Command::ClearAllMonitors => {
                for pv in state.pvs.values_mut() {
                    pv.callbacks.clear();
                    pv.writers.clear();
                }
            }
            Command::Shutdown => unreachable!("handled in drain_commands"),
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Broadcast SEARCH for every PV still waiting on name resolution.
    /// One outstanding attempt per PV; re-broadcast after `search_retry`.
    fn sweep_searches(&mut self) {
        let retry = self.shared.config.search_retry;
        let due: Vec<(String, u32)> = {
            let state = self.shared.state.lock();
            state
                .pvs
                .values()
                .filter(|pv| {
                    pv.subscription_id.is_none()
                        && pv.server_addr.is_none()
                        && pv
                            .connection_initiated
                            .map_or(true, |at| at.elapsed() >= retry)
                })
                .map(|pv| (pv.name.clone(), pv.channel_cid))
                .collect()
        };

        for (name, cid) in due {
            self.send_search(&name, cid);
            let mut state = self.shared.state.lock();
            if let Some(pv) = state.pvs.get_mut(&name) {
                pv.connection_initiated = Some(Instant::now());
            }
        }
    }

    fn send_search(&self, name: &str, cid: u32) {
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        let message = CaMessage::new(
            CMD_SEARCH,
            SEARCH_NO_REPLY,
            MINOR_VERSION,
            cid,
            cid,
            payload,
        );
        let wire = message.encode();
        for target in &self.targets {
            if let Err(e) = self.udp.send_to(&wire, *target) {
                log::debug!("[search] send to {} failed: {}", target, e);
            }
        }
        log::debug!("[search] {} cid={} -> {} targets", name, cid, self.targets.len());
    }

    fn service_udp(&mut self) {
        let mut buf = [0u8; 2048];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((len, from)) => {
                    for message in split_datagram(&buf[..len]) {
                        log::debug!("[client] recv udp {} {}", from, describe(&message));
                        self.process_udp_message(from, &message);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[client] udp recv failed: {}", e);
                    break;
                }
            }
        }
    }

    fn process_udp_message(&mut self, from: SocketAddr, message: &CaMessage) {
        match message.header.command {
            CMD_SEARCH => {
                // Reply: data_type carries the server's TCP port,
                // parameter2 echoes our CID.
                let port = message.header.data_type;
                let cid = message.header.parameter2;
                let resolved: Option<String> = {
                    let mut state = self.shared.state.lock();
                    let pv = state
                        .pvs
                        .values_mut()
                        .find(|pv| pv.channel_cid == cid);
                    match pv {
                        Some(pv) if pv.server_addr.is_some() => {
                            log::debug!(
                                "[search] ignoring duplicate SEARCH reply for {} from {}",
                                pv.name,
                                from
                            );
                            None
                        }
                        Some(pv) => {
                            let addr = SocketAddr::new(from.ip(), port);
                            pv.server_addr = Some(addr);
                            pv.response_time = Some(SystemTime::now());
                            log::debug!("[search] {} hosted at {}", pv.name, addr);
                            Some(pv.name.clone())
                        }
                        None => None,
                    }
                };
                if let Some(name) = resolved {
                    self.connect_pv(&name);
                }
            }
            CMD_NOT_FOUND => {
                log::debug!("[search] NOT_FOUND for cid {}", message.header.parameter1);
            }
            other => {
                log::debug!("[client] unhandled udp command {}", command_name(other));
            }
        }
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    /// Open (or reuse) the TCP connection for a freshly resolved PV and
    /// issue CREATE_CHAN.
    fn connect_pv(&mut self, name: &str) {
        let (addr, cid) = {
            let state = self.shared.state.lock();
            let Some(pv) = state.pvs.get(name) else { return };
            if pv.channel_sid.is_some() {
                return;
            }
            let Some(addr) = pv.server_addr else { return };
            (addr, pv.channel_cid)
        };

        if !self.tokens_by_addr.contains_key(&addr) {
            match ServerConnection::open(addr, self.shared.config.io_timeout) {
                Ok(mut connection) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut connection.stream,
                        token,
                        Interest::READABLE,
                    ) {
                        log::error!("[client] register {} failed: {}", addr, e);
                        return;
                    }
                    self.tokens_by_addr.insert(addr, token);
                    self.connections.insert(token, connection);
                }
                Err(e) => {
                    log::debug!("[client] connect {} failed: {}", addr, e);
                    // Forget the address so the search sweep retries.
                    let mut state = self.shared.state.lock();
                    if let Some(pv) = state.pvs.get_mut(name) {
                        pv.server_addr = None;
                    }
                    return;
                }
            }
        }

        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        let message = CaMessage::new(
            CMD_CREATE_CHAN,
            0,
            0,
            cid,
            u32::from(MINOR_VERSION),
            payload,
        );
        self.send_on(addr, &message);
    }

    fn send_on(&mut self, addr: SocketAddr, message: &CaMessage) {
        let Some(&token) = self.tokens_by_addr.get(&addr) else {
            log::debug!("[client] no connection to {} for send", addr);
            return;
        };
        let failed = match self.connections.get_mut(&token) {
            Some(connection) => connection.send(message).is_err(),
            None => false,
        };
        if failed {
            self.drop_connection(token);
        }
    }

    fn service_connection(&mut self, token: Token) {
        let mut closed = false;
        let mut messages = Vec::new();
        let addr = {
            let Some(connection) = self.connections.get_mut(&token) else {
                return;
            };
            let mut buf = [0u8; RECV_BUFFER];
            loop {
                match connection.stream.read(&mut buf) {
                    Ok(0) => {
                        log::debug!("[client] server {} closed connection", connection.addr);
                        closed = true;
                        break;
                    }
                    Ok(len) => connection.frames.push(&buf[..len]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("[client] recv from {} failed: {}", connection.addr, e);
                        closed = true;
                        break;
                    }
                }
            }
            while let Some(message) = connection.frames.next_message() {
                messages.push(message);
            }
            connection.addr
        };

        for message in &messages {
            log::debug!("[client] recv {} {}", addr, describe(message));
            self.process_tcp_message(addr, message);
        }
        if closed {
            self.drop_connection(token);
        }
    }

    /// Transition every PV on a lost connection back to searching,
    /// preserving CIDs and observer lists.
    fn drop_connection(&mut self, token: Token) {
        let Some(mut connection) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut connection.stream);
        self.tokens_by_addr.remove(&connection.addr);
        log::debug!("[client] lost connection to {}", connection.addr);

        let mut state = self.shared.state.lock();
        for pv in state.pvs.values_mut() {
            if pv.server_addr == Some(connection.addr) {
                pv.reset();
            }
        }
    }

    // ========================================================================
    // Reply processing
    // ========================================================================

    fn process_tcp_message(&mut self, addr: SocketAddr, message: &CaMessage) {
        match message.header.command {
            CMD_CREATE_CHAN => self.on_create_chan(addr, message),
            CMD_ACCESS_RIGHTS => {
                let cid = message.header.parameter1;
                let mut state = self.shared.state.lock();
                if let Some(pv) = state.pvs.values_mut().find(|pv| pv.channel_cid == cid) {
                    pv.access_bits = Some(message.header.parameter2);
                    pv.response_time = Some(SystemTime::now());
                }
            }
            CMD_READ_NOTIFY => {
                let sid = message.header.parameter1;
                let mut state = self.shared.state.lock();
                if let Some(pv) = state
                    .pvs
                    .values_mut()
                    .find(|pv| pv.channel_sid == Some(sid))
                {
                    pv.data_type = Some(message.header.data_type);
                    pv.data_count = Some(message.header.data_count);
                    pv.last_payload = Some(message.payload.clone());
                    pv.response_time = Some(SystemTime::now());
                }
            }
            CMD_EVENT_ADD => self.on_event_add(addr, message),
            CMD_EVENT_CANCEL => {
                let subscription = message.header.parameter2;
                let mut state = self.shared.state.lock();
                let name = state
                    .pvs
                    .iter()
                    .find(|(_, pv)| {
                        pv.subscription_id == Some(subscription) && pv.server_addr == Some(addr)
                    })
                    .map(|(name, _)| name.clone());
                if let Some(name) = name {
                    log::debug!("[client] subscription cancelled, dropping {}", name);
                    state.pvs.remove(&name);
                }
            }
            CMD_WRITE_NOTIFY => {
                let status = message.header.parameter1;
                let ioid = message.header.parameter2;
                let mut state = self.shared.state.lock();
                if let Some(pv) = state
                    .pvs
                    .values_mut()
                    .find(|pv| pv.ioid == ioid && pv.server_addr == Some(addr))
                {
                    if status != ECA_NORMAL {
                        log::warn!("[client] write to {} failed, status {}", pv.name, status);
                    }
                    pv.write_confirmed = Some(Instant::now());
                    pv.response_time = Some(SystemTime::now());
                }
            }
            CMD_VERSION | CMD_ECHO => {}
            CMD_SERVER_DISCONN | CMD_CREATE_CH_FAIL => {
                log::debug!(
                    "[client] server signalled {} for cid {}",
                    command_name(message.header.command),
                    message.header.parameter1
                );
            }
            other => {
                log::warn!("[client] command {} not implemented", command_name(other));
            }
        }
    }

    fn on_create_chan(&mut self, addr: SocketAddr, message: &CaMessage) {
        let cid = message.header.parameter1;
        let sid = message.header.parameter2;
        let subscribe: Option<(String, CaMessage)> = {
            let shared = std::sync::Arc::clone(&self.shared);
            let mut state = shared.state.lock();
            let Some(pv) = state.pvs.values_mut().find(|pv| pv.channel_cid == cid) else {
                return;
            };
            if pv.channel_sid.is_some() {
                log::debug!(
                    "[client] ignoring duplicate CREATE_CHAN reply for {} from {}",
                    pv.name,
                    addr
                );
                return;
            }
            pv.server_addr = Some(addr);
            pv.channel_sid = Some(sid);
            pv.data_type = Some(message.header.data_type);
            pv.data_count = Some(message.header.data_count);
            pv.response_time = Some(SystemTime::now());

            if pv.subscription_id.is_some() {
                None
            } else {
                let subscription = shared.next_subscription_id();
                pv.subscription_id = Some(subscription);
                Some((
                    pv.name.clone(),
                    subscribe_message(
                        message.header.data_type,
                        message.header.data_count,
                        sid,
                        subscription,
                    ),
                ))
            }
        };

        if let Some((name, message)) = subscribe {
            log::debug!("[client] subscribing to {}", name);
            self.send_on(addr, &message);
        }
    }

    fn on_event_add(&mut self, addr: SocketAddr, message: &CaMessage) {
        let subscription = message.header.parameter2;
        let timestamp = decode_timestamp(message.header.data_type, &message.payload)
            .unwrap_or_else(SystemTime::now);

        let delivery = {
            let mut state = self.shared.state.lock();
            let Some(pv) = state.pvs.values_mut().find(|pv| {
                pv.subscription_id == Some(subscription) && pv.server_addr == Some(addr)
            }) else {
                return;
            };
            pv.data_type = Some(message.header.data_type);
            pv.data_count = Some(message.header.data_count);
            // The first EVENT_ADD is the initial snapshot, not a change.
            if pv.last_payload.is_some() {
                pv.last_updated = Some(timestamp);
            }
            pv.last_payload = Some(message.payload.clone());
            pv.response_time = Some(SystemTime::now());

            if pv.callbacks.is_empty() && pv.writers.is_empty() {
                None
            } else {
                let value = decode_value(
                    message.header.data_type,
                    message.header.data_count,
                    &message.payload,
                );
                let text = value.to_string();
                Some((
                    pv.callbacks.clone(),
                    pv.writers.clone(),
                    MonitorEvent {
                        name: pv.name.clone(),
                        value,
                        text,
                        timestamp,
                    },
                ))
            }
        };

        // Observers run outside the state lock; a monitor calling back
        // into the client must not deadlock.
        if let Some((callbacks, writers, event)) = delivery {
            deliver(&callbacks, &writers, &event);
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Send WRITE_NOTIFY for every queued write whose channel is open.
    fn sweep_writes(&mut self) {
        let ready: Vec<(SocketAddr, CaMessage)> = {
            let mut state = self.shared.state.lock();
            state
                .pvs
                .values_mut()
                .filter_map(|pv| {
                    pv.pending_write.as_ref()?;
                    let addr = pv.server_addr?;
                    let sid = pv.channel_sid?;
                    let declared = pv.data_type?;
                    let value = pv.pending_write.take()?;
                    pv.ioid += 1;
                    pv.write_sent = Some(Instant::now());
                    let base = DbrType::from_code(declared)
                        .map_or_else(|| DbrType::plain(value.ca_base()), DbrType::base_only);
                    let payload = encode_value(&value, base);
                    log::debug!("[client] write {} = {} (ioid {})", pv.name, value, pv.ioid);
                    Some((
                        addr,
                        CaMessage::new(
                            CMD_WRITE_NOTIFY,
                            base.code(),
                            value.ca_count(),
                            sid,
                            pv.ioid,
                            payload,
                        ),
                    ))
                })
                .collect()
        };

        for (addr, message) in ready {
            self.send_on(addr, &message);
        }
    }
}

/// EVENT_ADD subscription request: three zero f32 deadbands, the default
/// mask, two pad bytes. Always requests the TIME_ variant so updates carry
/// server timestamps, even when the channel reported a plain base.
fn subscribe_message(declared_type: u16, data_count: u16, sid: u32, subscription: u32) -> CaMessage {
    let requested = DbrType::from_code(declared_type)
        .map_or(declared_type, |dbr| dbr.time_variant().code());
    let mut payload = [0u8; 16];
    let mut w = CursorMut::new(&mut payload);
    let _ = w.write_f32(0.0); // low deadband
    let _ = w.write_f32(0.0); // high deadband
    let _ = w.write_f32(0.0); // to deadband
    let _ = w.write_u16(MASK_DEFAULT);
    CaMessage::new(
        CMD_EVENT_ADD,
        requested,
        data_count,
        sid,
        subscription,
        payload.to_vec(),
    )
}
