// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The server engine: UDP SEARCH responder, TCP accept loop, per-client
//! handler threads, and the periodic change-detection sweep.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +--------------------+     +-----------------+
//! | UDP responder    |     | TCP accept loop    |     | change sweep    |
//! | SEARCH/NOT_FOUND |     | spawns one handler |     | re-reads PVs,   |
//! |                  |     | thread per client  |     | fans out        |
//! +--------+---------+     +---------+----------+     +--------+--------+
//!          |                         |                         |
//!          +-----------+-------------+------------+------------+
//!                      v                          v
//!               ServerState (mutex)       per-socket write mutex
//!          PV table - providers - cache - connection set
//! ```
//!
//! All shared state lives behind one mutex; each client socket's write
//! half has its own lock so the handler's replies and the sweep's
//! EVENT_ADD fan-out never interleave mid-frame.

use crate::config::CaConfig;
use crate::protocol::constants::{
    ACCESS_READ, ACCESS_WRITE, CMD_ACCESS_RIGHTS, CMD_CLEAR_CHANNEL, CMD_CLIENT_NAME,
    CMD_CREATE_CHAN, CMD_ECHO, CMD_EVENT_ADD, CMD_EVENT_CANCEL, CMD_HOST_NAME, CMD_NOT_FOUND,
    CMD_READ_NOTIFY, CMD_SEARCH, CMD_VERSION, CMD_WRITE, CMD_WRITE_NOTIFY, ECA_NORMAL,
    ECA_PUTFAIL, MINOR_VERSION, SEARCH_DO_REPLY, SEARCH_REPLY_SID,
};
use crate::protocol::{
    command_name, decode_value, describe, encode_value, split_datagram, CaMessage, DbrBase,
    DbrType, FrameBuffer, PvValue,
};
use crate::server::cache::ValueCache;
use crate::server::provider::ProviderRegistry;
use crate::server::pv::{ServerCallback, ServerPv, ServerWriter, Subscriber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// Read timeout on handler sockets; bounds shutdown latency.
const HANDLER_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Write timeout so one stuck client cannot wedge the fan-out.
const SOCKET_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Accept-loop poll interval.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// How many TCP ports above the base to probe before giving up.
pub const TCP_PORT_PROBE_RANGE: u16 = 100;

/// One connected client, as the shared state sees it.
pub struct ClientConnection {
    writer: Arc<Mutex<TcpStream>>,
    pub client_name: Option<String>,
    pub host_name: Option<String>,
    pub minor_version: Option<u16>,
}

impl ClientConnection {
    fn new(writer: TcpStream) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            client_name: None,
            host_name: None,
            minor_version: None,
        }
    }

    /// Serialized write of one message; failures are logged and left for
    /// the reader side to notice as a closed connection.
    pub(crate) fn send(&self, message: &CaMessage) {
        self.send_bytes(&message.encode());
    }

    fn send_bytes(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.write_all(bytes) {
            log::debug!("[server] send failed: {}", e);
        }
    }
}

/// Everything behind the server mutex.
pub struct ServerState {
    pub pvs: HashMap<String, ServerPv>,
    pub providers: ProviderRegistry,
    pub cache: ValueCache,
    pub connections: HashMap<SocketAddr, ClientConnection>,
}

impl ServerState {
    fn new(cache_ttl: Duration) -> Self {
        Self {
            pvs: HashMap::new(),
            providers: ProviderRegistry::default(),
            cache: ValueCache::new(cache_ttl),
            connections: HashMap::new(),
        }
    }

    /// Resolve a name against the provider chain, bypassing the cache:
    /// registered objects, then properties, then the PV table.
    fn current_value(&self, name: &str) -> Option<PvValue> {
        if let Some(lookup) = self.providers.read(name) {
            return Some(lookup.into_value());
        }
        self.pvs.get(name).and_then(|pv| pv.value.clone())
    }

    /// Resolve a name through the cache. `cached = false` forces a fresh
    /// provider read (still refreshing the cache).
    pub fn value(&mut self, name: &str, cached: bool) -> Option<PvValue> {
        if cached {
            if let Some(hit) = self.cache.lookup(name) {
                return hit;
            }
        }
        let value = self.current_value(name);
        self.cache.store(name, value.clone());
        value
    }

    pub fn exists(&mut self, name: &str) -> bool {
        self.value(name, true).is_some()
    }

    /// Store a value: provider setter first (when one claims the name),
    /// then the PV table, then EVENT_ADD to every subscriber in insertion
    /// order. Returns the provider's verdict; the local bookkeeping
    /// happens regardless so readers see the attempted value.
    pub fn set_value(
        &mut self,
        name: &str,
        value: PvValue,
        keep_type: bool,
    ) -> std::result::Result<(), String> {
        let value = if keep_type {
            match self.value(name, true) {
                Some(current) => convert_like(&current, value),
                None => value,
            }
        } else {
            value
        };
        log::debug!("[server] set {} = {}", name, value);

        let verdict = self.providers.write(name, &value).unwrap_or(Ok(()));
        if let Err(reason) = &verdict {
            log::error!("[server] provider rejected {} = {}: {}", name, value, reason);
        }

        let pv = self
            .pvs
            .entry(name.to_string())
            .or_insert_with(|| ServerPv::new(name));
        pv.value = Some(value.clone());
        pv.last_updated = Some(SystemTime::now());
        self.cache.store(name, Some(value.clone()));
        self.notify_subscribers(name, &value);
        verdict
    }

    /// EVENT_ADD carrying `value` to every subscriber of `name`, each
    /// re-encoded to the wire type that subscriber requested.
    pub fn notify_subscribers(&mut self, name: &str, value: &PvValue) {
        let Self { pvs, connections, .. } = self;
        let Some(pv) = pvs.get(name) else { return };
        for (addr, subscriber) in &pv.subscribers {
            let Some(connection) = connections.get(addr) else {
                continue;
            };
            let dtype = DbrType::from_code(subscriber.data_type)
                .unwrap_or_else(|| DbrType::plain(value.ca_base()));
            let payload = encode_value(value, dtype);
            connection.send(&CaMessage::new(
                CMD_EVENT_ADD,
                dtype.code(),
                value.ca_count(),
                ECA_NORMAL,
                subscriber.subscription_id,
                payload,
            ));
        }
    }

    fn pv_name_by_sid(&self, sid: u32) -> Option<String> {
        self.pvs
            .values()
            .find(|pv| pv.channel_sid == sid)
            .map(|pv| pv.name.clone())
    }
}

/// State shared between the `Server` handle and its threads.
pub struct ServerShared {
    pub config: CaConfig,
    pub state: Mutex<ServerState>,
    /// The TCP port actually bound (>= the configured port when busy).
    pub tcp_port: u16,
    pub running: AtomicBool,
}

impl ServerShared {
    pub fn new(config: CaConfig, tcp_port: u16) -> Self {
        let cache_ttl = config.cache_ttl;
        Self {
            config,
            state: Mutex::new(ServerState::new(cache_ttl)),
            tcp_port,
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Convert `new` to the shape and base of `current`, so a client writing
/// "3.5" into a DOUBLE PV stores 3.5f64 and not a string. Conversion
/// failures become the zero value, never an error.
fn convert_like(current: &PvValue, new: PvValue) -> PvValue {
    if current.is_array() {
        let numbers = new.numeric_elements();
        match current {
            PvValue::StrArray(_) => PvValue::StrArray(new.string_elements()),
            PvValue::CharArray(_) => {
                PvValue::CharArray(numbers.iter().map(|v| *v as i8).collect())
            }
            PvValue::ShortArray(_) => {
                PvValue::ShortArray(numbers.iter().map(|v| *v as i16).collect())
            }
            PvValue::EnumArray(_) => {
                PvValue::EnumArray(numbers.iter().map(|v| *v as i16).collect())
            }
            PvValue::FloatArray(_) => {
                PvValue::FloatArray(numbers.iter().map(|v| *v as f32).collect())
            }
            PvValue::LongArray(_) => {
                PvValue::LongArray(numbers.iter().map(|v| *v as i32).collect())
            }
            _ => PvValue::DoubleArray(numbers),
        }
    } else {
        let number = if new.is_array() {
            0.0
        } else {
            new.numeric_elements().first().copied().unwrap_or(0.0)
        };
        match current {
            PvValue::Str(_) => PvValue::Str(new.to_string()),
            PvValue::Char(_) => PvValue::Char(number as i8),
            PvValue::Short(_) => PvValue::Short(number as i16),
            PvValue::Enum(_) => PvValue::Enum(number as i16),
            PvValue::Float(_) => PvValue::Float(number as f32),
            PvValue::Long(_) => PvValue::Long(number as i32),
            PvValue::Double(_) => PvValue::Double(number),
            _ => new,
        }
    }
}

// ============================================================================
// Threads
// ============================================================================

/// Spawn the UDP responder, the TCP accept loop and the change sweep.
pub fn spawn_threads(
    shared: &Arc<ServerShared>,
    udp: UdpSocket,
    listener: TcpListener,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    udp.set_read_timeout(Some(HANDLER_READ_TIMEOUT))?;
    listener.set_nonblocking(true)?;

    let mut handles = Vec::new();
    let for_udp = Arc::clone(shared);
    handles.push(
        std::thread::Builder::new()
            .name("hca-server-udp".to_string())
            .spawn(move || udp_loop(&for_udp, &udp))?,
    );
    let for_accept = Arc::clone(shared);
    handles.push(
        std::thread::Builder::new()
            .name("hca-server-accept".to_string())
            .spawn(move || accept_loop(&for_accept, &listener))?,
    );
    let for_sweep = Arc::clone(shared);
    handles.push(
        std::thread::Builder::new()
            .name("hca-server-sweep".to_string())
            .spawn(move || sweep_loop(&for_sweep))?,
    );
    Ok(handles)
}

/// Answer SEARCH broadcasts; one datagram may carry several requests.
fn udp_loop(shared: &ServerShared, udp: &UdpSocket) {
    let mut buf = [0u8; 2048];
    while shared.is_running() {
        let (len, from) = match udp.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[server] udp recv failed: {}", e);
                continue;
            }
        };
        for message in split_datagram(&buf[..len]) {
            log::debug!("[server] recv udp {} {}", from, describe(&message));
            let (reply, callbacks) = handle_message(shared, from, &message);
            if let Some(reply) = reply {
                if let Err(e) = udp.send_to(&reply, from) {
                    log::debug!("[server] udp reply to {} failed: {}", from, e);
                }
            }
            run_callbacks(callbacks);
        }
    }
    log::debug!("[server] udp responder stopped");
}

fn accept_loop(shared: &Arc<ServerShared>, listener: &TcpListener) {
    while shared.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = setup_client(shared, stream, addr) {
                    log::debug!("[server] setting up client {} failed: {}", addr, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::debug!("[server] accept failed: {}", e);
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
    log::debug!("[server] accept loop stopped");
}

fn setup_client(
    shared: &Arc<ServerShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> std::io::Result<()> {
    log::debug!("[server] accepted connection from {}", addr);
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(HANDLER_READ_TIMEOUT))?;
    let writer = stream.try_clone()?;
    writer.set_write_timeout(Some(SOCKET_WRITE_TIMEOUT))?;
    shared
        .state
        .lock()
        .connections
        .insert(addr, ClientConnection::new(writer));

    let for_handler = Arc::clone(shared);
    std::thread::Builder::new()
        .name(format!("hca-server-{}", addr))
        .spawn(move || handler_loop(&for_handler, stream, addr))?;
    Ok(())
}

/// One thread per client: read frames, dispatch, reply on the shared
/// writer so replies serialize with sweep notifications.
fn handler_loop(shared: &ServerShared, mut stream: TcpStream, addr: SocketAddr) {
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; 65536];
    while shared.is_running() {
        match stream.read(&mut buf) {
            Ok(0) => {
                log::debug!("[server] client {} disconnected", addr);
                break;
            }
            Ok(len) => frames.push(&buf[..len]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[server] lost connection to {}: {}", addr, e);
                break;
            }
        }

        while let Some(message) = frames.next_message() {
            log::debug!("[server] recv {} {}", addr, describe(&message));
            let (reply, callbacks) = handle_message(shared, addr, &message);
            if let Some(reply) = reply {
                let state = shared.state.lock();
                if let Some(connection) = state.connections.get(&addr) {
                    connection.send_bytes(&reply);
                }
            }
            run_callbacks(callbacks);
        }
    }

    // Drop the connection record and every subscription it held.
    let mut state = shared.state.lock();
    for pv in state.pvs.values_mut() {
        pv.drop_client(addr);
    }
    state.connections.remove(&addr);
    log::debug!("[server] closed connection to {}", addr);
}

/// Poll subscribed PVs for changes and fan updates out.
fn sweep_loop(shared: &ServerShared) {
    let interval = shared.config.update_interval;
    while shared.is_running() {
        // Sleep in short slices so shutdown is prompt.
        let mut remaining = interval;
        while shared.is_running() && !remaining.is_zero() {
            let step = remaining.min(Duration::from_millis(100));
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        if !shared.is_running() {
            break;
        }
        update_subscribed_pvs(shared);
    }
    log::debug!("[server] change sweep stopped");
}

/// One sweep round: re-read each subscribed PV with the cache bypassed
/// and broadcast when the wire encoding changed. Equality is judged in
/// wire form — `(type, count, bytes)` — not native form.
pub fn update_subscribed_pvs(shared: &ServerShared) {
    let mut state = shared.state.lock();
    let names: Vec<String> = state
        .pvs
        .iter()
        .filter(|(_, pv)| !pv.subscribers.is_empty())
        .map(|(name, _)| name.clone())
        .collect();

    for name in names {
        let Some(fresh) = state.value(&name, false) else {
            continue;
        };
        let changed = state.pvs.get(&name).map_or(false, |pv| {
            pv.value
                .as_ref()
                .map_or(true, |old| old.fingerprint() != fresh.fingerprint())
        });
        if changed {
            if let Some(pv) = state.pvs.get_mut(&name) {
                pv.value = Some(fresh.clone());
                pv.last_updated = Some(SystemTime::now());
            }
            log::debug!("[sweep] {} changed, notifying subscribers", name);
            state.notify_subscribers(&name, &fresh);
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Local observers to run after the state lock is released.
pub struct DeferredCallbacks {
    name: String,
    value: PvValue,
    callbacks: Vec<ServerCallback>,
    writers: Vec<ServerWriter>,
}

/// Run write observers. Callbacks go to fresh threads so one that calls
/// back into the server cannot deadlock against the handler; writers run
/// inline but panic-isolated.
fn run_callbacks(deferred: Option<DeferredCallbacks>) {
    let Some(deferred) = deferred else { return };
    let text = deferred.value.to_string();
    for callback in deferred.callbacks {
        let name = deferred.name.clone();
        let value = deferred.value.clone();
        let text = text.clone();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&name, &value, &text);
            }));
            if result.is_err() {
                log::error!("[server] write callback for {} panicked", name);
            }
        });
    }
    if !deferred.writers.is_empty() {
        let stamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let line = format!("{} {:.6} {}\n", deferred.name, stamp, text);
        for writer in deferred.writers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                writer(&line);
            }));
            if result.is_err() {
                log::error!("[server] write observer for {} panicked", deferred.name);
            }
        }
    }
}

/// Interpret one message. Returns the reply bytes (several messages may be
/// concatenated, e.g. CREATE_CHAN + ACCESS_RIGHTS) and any deferred
/// observers.
pub fn handle_message(
    shared: &ServerShared,
    addr: SocketAddr,
    message: &CaMessage,
) -> (Option<Vec<u8>>, Option<DeferredCallbacks>) {
    let header = &message.header;
    match header.command {
        CMD_SEARCH => (on_search(shared, message), None),
        CMD_CREATE_CHAN => (on_create_chan(shared, message), None),
        CMD_READ_NOTIFY => (on_read_notify(shared, message), None),
        CMD_EVENT_ADD => (on_event_add(shared, addr, message), None),
        CMD_EVENT_CANCEL => {
            let mut state = shared.state.lock();
            if let Some(name) = state.pv_name_by_sid(header.parameter1) {
                if let Some(pv) = state.pvs.get_mut(&name) {
                    pv.unsubscribe(addr, header.parameter2);
                    log::debug!("[server] cancelled updates for {} to {}", name, addr);
                }
            }
            (None, None)
        }
        CMD_WRITE_NOTIFY => {
            let (status, callbacks) = on_write(shared, message);
            let reply = CaMessage::bare(
                CMD_WRITE_NOTIFY,
                header.data_type,
                header.data_count,
                status,
                header.parameter2,
            );
            (Some(reply.encode()), callbacks)
        }
        CMD_WRITE => {
            let (_, callbacks) = on_write(shared, message);
            (None, callbacks)
        }
        CMD_CLEAR_CHANNEL => {
            // No per-channel server resources; echo the request back.
            let reply =
                CaMessage::bare(CMD_CLEAR_CHANNEL, 0, 0, header.parameter1, header.parameter2);
            (Some(reply.encode()), None)
        }
        CMD_ECHO => (Some(CaMessage::bare(CMD_ECHO, 0, 0, 0, 0).encode()), None),
        CMD_VERSION => {
            let mut state = shared.state.lock();
            if let Some(connection) = state.connections.get_mut(&addr) {
                connection.minor_version = Some(header.data_count);
            }
            (None, None)
        }
        CMD_CLIENT_NAME => {
            let name = payload_string(&message.payload);
            let mut state = shared.state.lock();
            if let Some(connection) = state.connections.get_mut(&addr) {
                connection.client_name = Some(name);
            }
            (None, None)
        }
        CMD_HOST_NAME => {
            let name = payload_string(&message.payload);
            let mut state = shared.state.lock();
            if let Some(connection) = state.connections.get_mut(&addr) {
                connection.host_name = Some(name);
            }
            (None, None)
        }
        CMD_ACCESS_RIGHTS => (None, None), // server-originated, ignore echoes
        other => {
            log::debug!("[server] command {} not supported", command_name(other));
            (None, None)
        }
    }
}

fn on_search(shared: &ServerShared, message: &CaMessage) -> Option<Vec<u8>> {
    let name = payload_string(&message.payload);
    let reply_flag = message.header.data_type;
    let minor = message.header.data_count;
    let cid = message.header.parameter1;

    let exists = shared.state.lock().exists(&name);
    if exists {
        log::debug!("[server] SEARCH hit for {} (cid {})", name, cid);
        let payload = encode_value(
            &PvValue::Short(MINOR_VERSION as i16),
            DbrType::plain(DbrBase::Short),
        );
        return Some(
            CaMessage::new(
                CMD_SEARCH,
                shared.tcp_port,
                0,
                SEARCH_REPLY_SID,
                cid,
                payload,
            )
            .encode(),
        );
    }
    if reply_flag == SEARCH_DO_REPLY {
        return Some(CaMessage::bare(CMD_NOT_FOUND, reply_flag, minor, cid, cid).encode());
    }
    None
}

fn on_create_chan(shared: &ServerShared, message: &CaMessage) -> Option<Vec<u8>> {
    let name = payload_string(&message.payload);
    let cid = message.header.parameter1;

    let mut state = shared.state.lock();
    let Some(value) = state.value(&name, true) else {
        log::debug!("[server] CREATE_CHAN for unknown {} ignored", name);
        return None;
    };
    let pv = state
        .pvs
        .entry(name.clone())
        .or_insert_with(|| ServerPv::new(&name));
    let sid = pv.channel_sid;
    let dtype = DbrType::plain(value.ca_base());

    // The ACCESS_RIGHTS message must follow the CREATE_CHAN reply on the
    // wire, so both go out as one write.
    let mut reply =
        CaMessage::bare(CMD_CREATE_CHAN, dtype.code(), value.ca_count(), cid, sid).encode();
    reply.extend_from_slice(
        &CaMessage::bare(CMD_ACCESS_RIGHTS, 0, 0, cid, ACCESS_READ | ACCESS_WRITE).encode(),
    );
    Some(reply)
}

fn on_read_notify(shared: &ServerShared, message: &CaMessage) -> Option<Vec<u8>> {
    let sid = message.header.parameter1;
    let ioid = message.header.parameter2;

    let mut state = shared.state.lock();
    let name = state.pv_name_by_sid(sid)?;
    let value = state.value(&name, true)?;
    let dtype = DbrType::from_code(message.header.data_type)
        .unwrap_or_else(|| DbrType::plain(value.ca_base()));
    let payload = encode_value(&value, dtype);
    Some(
        CaMessage::new(
            CMD_READ_NOTIFY,
            dtype.code(),
            value.ca_count(),
            ECA_NORMAL,
            ioid,
            payload,
        )
        .encode(),
    )
}

fn on_event_add(shared: &ServerShared, addr: SocketAddr, message: &CaMessage) -> Option<Vec<u8>> {
    let sid = message.header.parameter1;
    let subscription_id = message.header.parameter2;

    let mut state = shared.state.lock();
    let name = state.pv_name_by_sid(sid)?;
    let subscriber = Subscriber {
        subscription_id,
        data_type: message.header.data_type,
        data_count: message.header.data_count,
    };
    state.pvs.get_mut(&name)?.subscribe(addr, subscriber);
    log::debug!(
        "[server] {} subscribed to {} (id {})",
        addr,
        name,
        subscription_id
    );

    // Initial snapshot so the subscriber starts with the current value.
    let value = state.value(&name, true)?;
    let dtype = DbrType::from_code(message.header.data_type)
        .unwrap_or_else(|| DbrType::plain(value.ca_base()));
    let payload = encode_value(&value, dtype);
    Some(
        CaMessage::new(
            CMD_EVENT_ADD,
            dtype.code(),
            value.ca_count(),
            ECA_NORMAL,
            subscription_id,
            payload,
        )
        .encode(),
    )
}

/// WRITE / WRITE_NOTIFY: decode, store with type preservation, collect
/// observers. Returns the wire status for the reply.
fn on_write(
    shared: &ServerShared,
    message: &CaMessage,
) -> (u32, Option<DeferredCallbacks>) {
    let sid = message.header.parameter1;
    let new_value = decode_value(
        message.header.data_type,
        message.header.data_count,
        &message.payload,
    );

    let mut state = shared.state.lock();
    let Some(name) = state.pv_name_by_sid(sid) else {
        log::debug!("[server] write for unknown sid {} ignored", sid);
        return (ECA_NORMAL, None);
    };
    let verdict = state.set_value(&name, new_value, true);
    let status = if verdict.is_ok() { ECA_NORMAL } else { ECA_PUTFAIL };

    let deferred = state.pvs.get(&name).and_then(|pv| {
        if pv.callbacks.is_empty() && pv.writers.is_empty() {
            None
        } else {
            Some(DeferredCallbacks {
                name: name.clone(),
                value: pv.value.clone().unwrap_or(PvValue::Long(0)),
                callbacks: pv.callbacks.clone(),
                writers: pv.writers.clone(),
            })
        }
    });
    (status, deferred)
}

/// Payload bytes up to the first NUL, as a string.
fn payload_string(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> ServerShared {
        ServerShared::new(CaConfig::default(), 5064)
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    #[test]
    fn test_convert_like_preserves_scalar_type() {
        assert_eq!(
            convert_like(&PvValue::Double(1.0), PvValue::Str("3.5".into())),
            PvValue::Double(3.5)
        );
        assert_eq!(
            convert_like(&PvValue::Long(1), PvValue::Double(7.9)),
            PvValue::Long(7)
        );
        assert_eq!(
            convert_like(&PvValue::Str("a".into()), PvValue::Long(5)),
            PvValue::Str("5".into())
        );
        // Unparseable input becomes the base's zero.
        assert_eq!(
            convert_like(&PvValue::Long(1), PvValue::Str("junk".into())),
            PvValue::Long(0)
        );
    }

    #[test]
    fn test_convert_like_preserves_array_shape() {
        assert_eq!(
            convert_like(
                &PvValue::DoubleArray(vec![0.0]),
                PvValue::LongArray(vec![1, 2])
            ),
            PvValue::DoubleArray(vec![1.0, 2.0])
        );
        // Scalar into array PV becomes a one-element array.
        assert_eq!(
            convert_like(&PvValue::LongArray(vec![0]), PvValue::Long(4)),
            PvValue::LongArray(vec![4])
        );
    }

    #[test]
    fn test_search_hit_and_miss() {
        let shared = shared();
        shared
            .state
            .lock()
            .set_value("TEST:A.VAL", PvValue::Long(1), false)
            .expect("no providers involved");

        let mut payload = b"TEST:A.VAL".to_vec();
        payload.push(0);
        let request = CaMessage::new(CMD_SEARCH, 5, MINOR_VERSION, 42, 42, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let reply = reply.expect("hosted PV must be answered");
        let reply = split_datagram(&reply).remove(0);
        assert_eq!(reply.header.command, CMD_SEARCH);
        assert_eq!(reply.header.data_type, 5064); // advertised TCP port
        assert_eq!(reply.header.parameter1, SEARCH_REPLY_SID);
        assert_eq!(reply.header.parameter2, 42);

        // Unknown PV, reply_flag 5: silence.
        let mut payload = b"NOSUCH".to_vec();
        payload.push(0);
        let request = CaMessage::new(CMD_SEARCH, 5, MINOR_VERSION, 43, 43, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        assert!(reply.is_none());

        // Unknown PV, reply_flag 10: NOT_FOUND echoing the CID.
        let mut payload = b"NOSUCH".to_vec();
        payload.push(0);
        let request = CaMessage::new(CMD_SEARCH, SEARCH_DO_REPLY, MINOR_VERSION, 44, 44, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let reply = split_datagram(&reply.expect("NOT_FOUND requested")).remove(0);
        assert_eq!(reply.header.command, CMD_NOT_FOUND);
        assert_eq!(reply.header.parameter1, 44);
        assert_eq!(reply.header.parameter2, 44);
    }

    #[test]
    fn test_create_chan_reply_precedes_access_rights() {
        let shared = shared();
        shared
            .state
            .lock()
            .set_value("TEST:A.VAL", PvValue::Long(1), false)
            .expect("no providers involved");

        let mut payload = b"TEST:A.VAL".to_vec();
        payload.push(0);
        let request = CaMessage::new(CMD_CREATE_CHAN, 0, 0, 7, MINOR_VERSION as u32, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let messages = split_datagram(&reply.expect("CREATE_CHAN must be answered"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].header.command, CMD_CREATE_CHAN);
        assert_eq!(messages[0].header.data_type, 5); // LONG
        assert_eq!(messages[0].header.data_count, 1);
        assert_eq!(messages[0].header.parameter1, 7);
        let sid = messages[0].header.parameter2;
        assert!(sid > 0);
        assert_eq!(messages[1].header.command, CMD_ACCESS_RIGHTS);
        assert_eq!(messages[1].header.parameter1, 7);
        assert_eq!(messages[1].header.parameter2, 3);
    }

    #[test]
    fn test_write_notify_roundtrip() {
        let shared = shared();
        shared
            .state
            .lock()
            .set_value("TEST:A.VAL", PvValue::Long(1), false)
            .expect("no providers involved");
        let sid = shared.state.lock().pvs["TEST:A.VAL"].channel_sid;

        let payload = encode_value(&PvValue::Long(7), DbrType::plain(DbrBase::Long));
        let request = CaMessage::new(CMD_WRITE_NOTIFY, 5, 1, sid, 12, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let reply = split_datagram(&reply.expect("WRITE_NOTIFY must be confirmed")).remove(0);
        assert_eq!(reply.header.command, CMD_WRITE_NOTIFY);
        assert_eq!(reply.header.parameter1, ECA_NORMAL);
        assert_eq!(reply.header.parameter2, 12);

        let value = shared.state.lock().value("TEST:A.VAL", true);
        assert_eq!(value, Some(PvValue::Long(7)));
    }

    #[test]
    fn test_rejected_provider_write_reports_putfail() {
        use crate::server::provider::PvProperty;
        let shared = shared();
        {
            let mut state = shared.state.lock();
            state.providers.register_property(
                "LAB:RO",
                PvProperty::readonly(|| PvValue::Long(5)),
            );
        }
        // Open the channel so a SID exists.
        let mut payload = b"LAB:RO".to_vec();
        payload.push(0);
        let request = CaMessage::new(CMD_CREATE_CHAN, 0, 0, 1, MINOR_VERSION as u32, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let sid = split_datagram(&reply.expect("channel opens")).remove(0).header.parameter2;

        let payload = encode_value(&PvValue::Long(9), DbrType::plain(DbrBase::Long));
        let request = CaMessage::new(CMD_WRITE_NOTIFY, 5, 1, sid, 3, payload);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let reply = split_datagram(&reply.expect("reply still sent")).remove(0);
        assert_eq!(reply.header.parameter1, ECA_PUTFAIL);
    }

    #[test]
    fn test_echo_and_clear_channel() {
        let shared = shared();
        let (reply, _) = handle_message(&shared, addr(), &CaMessage::bare(CMD_ECHO, 0, 0, 0, 0));
        let reply = split_datagram(&reply.expect("ECHO must be answered")).remove(0);
        assert_eq!(reply.header.command, CMD_ECHO);
        assert_eq!(reply.header.payload_size, 0);

        let request = CaMessage::bare(CMD_CLEAR_CHANNEL, 0, 0, 9, 4);
        let (reply, _) = handle_message(&shared, addr(), &request);
        let reply = split_datagram(&reply.expect("CLEAR_CHANNEL echoes")).remove(0);
        assert_eq!(reply.header.command, CMD_CLEAR_CHANNEL);
        assert_eq!(reply.header.parameter1, 9);
        assert_eq!(reply.header.parameter2, 4);
    }

    #[test]
    fn test_record_lookup_over_search() {
        use crate::server::provider::{Lookup, RecordProvider};
        struct Motor;
        impl RecordProvider for Motor {
            fn fields(&self) -> Vec<String> {
                vec!["RBV".to_string(), "VAL".to_string()]
            }
            fn read(&self, field: &str) -> Option<Lookup> {
                match field {
                    "" => Some(Lookup::Record(self.fields())),
                    "RBV" | "VAL" => Some(Lookup::Value(PvValue::Double(0.0))),
                    _ => None,
                }
            }
            fn write(&self, _: &str, _: PvValue) -> std::result::Result<(), String> {
                Ok(())
            }
        }
        let shared = shared();
        shared
            .state
            .lock()
            .providers
            .register_object("LAB:M1", Arc::new(Motor));

        // The bare prefix resolves to the synthetic record marker.
        let value = shared.state.lock().value("LAB:M1", true);
        assert_eq!(value, Some(PvValue::Str("<record: RBV, VAL>".into())));
        let value = shared.state.lock().value("LAB:M1.RBV", true);
        assert_eq!(value, Some(PvValue::Double(0.0)));
    }
}
