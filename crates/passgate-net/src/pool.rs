//! The connection pool and its control plane.
//!
//! Ownership model: the orchestrator task owns the `Pool` and is the only
//! writer of the connection and reconnection maps. Reader tasks never
//! touch shared state; they forward bytes through the pool's mailbox.
//! Writer tasks own the socket write halves behind bounded channels, so
//! no lock is ever held across I/O.

use crate::connection::{
    ConnState, Connection, ConnectionInfo, JspOutstanding, PingState, ProtoState, Reconnection,
    ReconnectionInfo,
};
use crate::event::{GatewayEvent, ListenerKind, PoolEvent};
use bytes::{Bytes, BytesMut};
use passgate_core::{
    Clock, Config, Error, GatSolar, Result, TagType, TerminalSettings, TerminalType, Uid,
    constants,
};
use passgate_protocol::{DecodeOutcome, gat, jsp, pocket, sphinx};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const MAILBOX_CAPACITY: usize = 1024;
const WRITER_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

pub struct Pool {
    cfg: Arc<Config>,
    clock: Arc<dyn Clock>,
    connections: HashMap<String, Connection>,
    reconnections: HashMap<String, Reconnection>,
    /// Listed terminals by IP, for inbound connections
    terminal_index: HashMap<String, TerminalSettings>,
    events_tx: mpsc::Sender<PoolEvent>,
    listener_tasks: Vec<JoinHandle<()>>,
    dial_tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Pool {
    /// Create the pool and its control-plane mailbox. The receiver is
    /// drained by the orchestrator and fed back via
    /// [`handle_event`](Pool::handle_event).
    #[must_use]
    pub fn new(cfg: Arc<Config>, clock: Arc<dyn Clock>) -> (Self, mpsc::Receiver<PoolEvent>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let mut terminal_index = HashMap::new();
        for term in &cfg.terminals {
            match TerminalSettings::parse(term) {
                Ok(settings) if cfg.terminal_admitted(&settings.ip) => {
                    terminal_index.insert(settings.ip.clone(), settings);
                }
                Ok(settings) => {
                    debug!(ip = %settings.ip, "terminal filtered out");
                }
                Err(e) => warn!(term = %term, error = %e, "unparseable terminal entry"),
            }
        }

        let pool = Pool {
            cfg,
            clock,
            connections: HashMap::new(),
            reconnections: HashMap::new(),
            terminal_index,
            events_tx: tx,
            listener_tasks: Vec::new(),
            dial_tasks: Vec::new(),
            closed: false,
        };
        (pool, rx)
    }

    /// Terminals enumerated in the configuration, for initial dialing.
    #[must_use]
    pub fn listed_terminals(&self) -> Vec<TerminalSettings> {
        self.terminal_index.values().cloned().collect()
    }

    /// Bind a listener and start accepting. Returns the bound address.
    ///
    /// # Errors
    /// Returns the bind error; a failed bind at boot is fatal.
    pub async fn listen(&mut self, addr: SocketAddr, kind: ListenerKind) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, ?kind, "listening");

        let tx = self.events_tx.clone();
        self.listener_tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if tx
                            .send(PoolEvent::Accepted {
                                stream,
                                peer,
                                listener: kind,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }));
        Ok(local)
    }

    /// Dial a terminal. The result arrives as a [`PoolEvent::DialDone`].
    pub fn connect(&mut self, settings: TerminalSettings) {
        let key = settings.key();
        if self.connections.contains_key(&key) {
            debug!(key = %key, "connect skipped: already connected");
            return;
        }
        let now = self.clock.now();
        self.terminal_index
            .insert(settings.ip.clone(), settings.clone());
        self.reconnections.entry(key.clone()).or_insert(Reconnection {
            key: key.clone(),
            ip: settings.ip.clone(),
            port: settings.port,
            settings: Some(settings),
            last_attempt: None,
            next_attempt: now,
            count: 0,
            in_flight: false,
        });
    }

    fn spawn_dial(&mut self, key: String, ip: String, port: u16) {
        let tx = self.events_tx.clone();
        let timeout = Duration::from_secs_f64(self.cfg.terminal_connect_timeout);
        self.dial_tasks.push(tokio::spawn(async move {
            let attempt =
                tokio::time::timeout(timeout, TcpStream::connect((ip.as_str(), port))).await;
            let result = match attempt {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("connect timeout".to_string()),
            };
            let _ = tx.send(PoolEvent::DialDone { key, result }).await;
        }));
    }

    /// Process one control-plane event; returns decoded gateway activity.
    pub fn handle_event(&mut self, event: PoolEvent) -> Vec<GatewayEvent> {
        if self.closed {
            return Vec::new();
        }
        match event {
            PoolEvent::Accepted {
                stream,
                peer,
                listener,
            } => {
                self.handle_accept(stream, peer, listener);
                Vec::new()
            }
            PoolEvent::DialDone { key, result } => {
                self.handle_dial_done(key, result);
                Vec::new()
            }
            PoolEvent::Data { key, bytes } => self.handle_data(&key, &bytes),
            PoolEvent::Closed { key, reason } => {
                self.drop_connection(&key, &reason, true);
                Vec::new()
            }
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, peer: SocketAddr, listener: ListenerKind) {
        let key = format!("{}:{}", peer.ip(), peer.port());
        if self.connections.contains_key(&key) {
            warn!(key = %key, "duplicate inbound connection dropped");
            return;
        }

        let settings = match listener {
            ListenerKind::Jsp => Some(
                self.terminal_index
                    .get(&peer.ip().to_string())
                    .cloned()
                    .unwrap_or_else(|| {
                        TerminalSettings::adhoc(&peer.ip().to_string(), peer.port(), TerminalType::Jsp)
                    }),
            ),
            ListenerKind::Main => self.terminal_index.get(&peer.ip().to_string()).cloned(),
        };

        info!(key = %key, ?listener, "inbound connection");
        self.install_connection(key, stream, settings, false);
    }

    fn handle_dial_done(&mut self, key: String, result: std::result::Result<TcpStream, String>) {
        match result {
            Ok(stream) => {
                let settings = self
                    .reconnections
                    .remove(&key)
                    .and_then(|r| r.settings)
                    .or_else(|| {
                        let ip = key.split(':').next().unwrap_or_default();
                        self.terminal_index.get(ip).cloned()
                    });
                info!(key = %key, "connected");
                self.install_connection(key, stream, settings, true);
            }
            Err(reason) => {
                let count = match self.reconnections.get_mut(&key) {
                    Some(entry) => {
                        entry.count += 1;
                        entry.in_flight = false;
                        entry.count
                    }
                    None => return,
                };
                let next_attempt = self.clock.now() + self.backoff(count);
                if let Some(entry) = self.reconnections.get_mut(&key) {
                    entry.next_attempt = next_attempt;
                }
                debug!(key = %key, attempt = count, reason = %reason, "dial failed");
            }
        }
    }

    fn install_connection(
        &mut self,
        key: String,
        stream: TcpStream,
        settings: Option<TerminalSettings>,
        dialed: bool,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(key = %key, error = %e, "set_nodelay failed");
        }
        let (mut read_half, mut write_half) = stream.into_split();

        let tx = self.events_tx.clone();
        let reader_key = key.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx
                            .send(PoolEvent::Closed {
                                key: reader_key,
                                reason: "eof".to_string(),
                            })
                            .await;
                        return;
                    }
                    Ok(n) => {
                        if tx
                            .send(PoolEvent::Data {
                                key: reader_key.clone(),
                                bytes: Bytes::copy_from_slice(&buf[..n]),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(PoolEvent::Closed {
                                key: reader_key,
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CAPACITY);
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    return; // the reader surfaces the close
                }
            }
        });

        let (ip, port) = split_key(&key);
        let proto = self.proto_state_for(settings.as_ref());
        let now = self.clock.now();
        self.connections.insert(
            key.clone(),
            Connection {
                key,
                ip,
                port,
                state: ConnState::Connected,
                settings,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                writer: writer_tx,
                started_wall: self.clock.wall(),
                start: now,
                last_activity: now,
                lock_owner: None,
                proto,
                dialed,
                reader_task,
                writer_task,
            },
        );
    }

    fn proto_state_for(&self, settings: Option<&TerminalSettings>) -> ProtoState {
        match settings.map(|s| s.ttype) {
            Some(TerminalType::Pocket) => ProtoState::Pocket {
                ping: PingState::new(self.cfg.pocket_ping),
            },
            Some(TerminalType::Gat) => ProtoState::Gat {
                ping: PingState::new(self.cfg.gat_ping),
                terminal_kind: gat::GatTerminalKind::Access.to_u8(),
            },
            Some(TerminalType::Sphinx) => ProtoState::Sphinx {
                ping: PingState::new(self.cfg.sphinx_ping),
                expect: sphinx::Expectation::None,
            },
            Some(TerminalType::Jsp) => {
                let ping = if self.cfg.jsp_dev_auto_ping_enabled {
                    PingState::new(self.cfg.jsp_ping)
                } else {
                    PingState::new(passgate_core::config::PingConfig {
                        interval: 0,
                        timeout: 0,
                    })
                };
                ProtoState::Jsp {
                    ping,
                    rid: jsp::RidCounter::new(),
                    requests: HashMap::new(),
                }
            }
            None => ProtoState::Unknown,
        }
    }

    fn handle_data(&mut self, key: &str, bytes: &[u8]) -> Vec<GatewayEvent> {
        let now = self.clock.now();
        let cfg = self.cfg.clone();
        let mut events = Vec::new();
        let drop_conn = {
            let Some(conn) = self.connections.get_mut(key) else {
                return events;
            };
            conn.last_activity = now;
            conn.buffer.extend_from_slice(bytes);

            if matches!(conn.proto, ProtoState::Unknown) {
                detect_protocol(conn, &cfg);
            }
            process_connection(conn, now, &mut events)
        };

        if drop_conn {
            self.drop_connection(key, "protocol violation", true);
        }
        events
    }

    /// Idle processing: due reconnections, liveness pings, activity expiry.
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }
        let now = self.clock.now();

        // reconnections due
        let due: Vec<(String, String, u16)> = self
            .reconnections
            .values_mut()
            .filter(|r| !r.in_flight && now >= r.next_attempt)
            .map(|r| {
                r.in_flight = true;
                r.last_attempt = Some(now);
                (r.key.clone(), r.ip.clone(), r.port)
            })
            .collect();
        for (key, ip, port) in due {
            debug!(key = %key, "dialing");
            self.spawn_dial(key, ip, port);
        }

        // liveness
        let expire = Duration::from_secs_f64(self.cfg.service_request_expire_time);
        let mut to_close: Vec<(String, &'static str)> = Vec::new();
        for conn in self.connections.values_mut() {
            let last_activity = conn.last_activity;
            let idle = now.duration_since(last_activity);

            let outcome = match &mut conn.proto {
                ProtoState::Pocket { ping } => {
                    probe(ping, now, last_activity, &conn.writer, pocket::enquire_packet)
                }
                ProtoState::Gat {
                    ping,
                    terminal_kind,
                } => {
                    let kind = gat::GatTerminalKind::from_u8(*terminal_kind);
                    probe(ping, now, last_activity, &conn.writer, || {
                        gat::req_master_packet(0, kind)
                    })
                }
                ProtoState::Sphinx { ping, .. } => {
                    probe(ping, now, last_activity, &conn.writer, sphinx::ping_packet)
                }
                ProtoState::Jsp {
                    ping,
                    rid,
                    requests,
                } => {
                    if ping.timed_out(now) {
                        Probe::TimedOut
                    } else if ping.due(now, last_activity) {
                        let request_id = rid.next();
                        let sent = jsp::ping_packet(&request_id)
                            .is_some_and(|packet| conn.writer.try_send(packet).is_ok());
                        if sent {
                            requests.insert(
                                request_id,
                                JspOutstanding {
                                    cmd: "ping".to_string(),
                                    sent_at: now,
                                },
                            );
                            ping.mark_sent(now);
                            Probe::Sent
                        } else {
                            Probe::Idle
                        }
                    } else {
                        Probe::Idle
                    }
                }
                ProtoState::Unknown => Probe::Idle,
            };

            match outcome {
                Probe::TimedOut => to_close.push((conn.key.clone(), "ping timeout")),
                Probe::Sent => conn.last_activity = now,
                Probe::Idle => {
                    if idle > expire && !matches!(conn.proto, ProtoState::Unknown) {
                        to_close.push((conn.key.clone(), "activity timeout"));
                    }
                }
            }
        }

        for (key, reason) in to_close {
            self.drop_connection(&key, reason, true);
        }
    }

    fn backoff(&self, count: u32) -> Duration {
        let delay = (f64::from(count) * self.cfg.reconnection_wait_time_step)
            .min(self.cfg.reconnection_wait_time_max)
            .max(constants::RECONNECT_FLOOR_SECS);
        Duration::from_secs_f64(delay)
    }

    fn drop_connection(&mut self, key: &str, reason: &str, reschedule: bool) {
        let Some(conn) = self.connections.remove(key) else {
            return;
        };
        conn.abort_tasks();
        info!(key = %key, reason, "disconnected");

        if reschedule && conn.dialed {
            let count = 1;
            let next_attempt = self.clock.now() + self.backoff(count);
            self.reconnections.insert(
                key.to_string(),
                Reconnection {
                    key: key.to_string(),
                    ip: conn.ip,
                    port: conn.port,
                    settings: conn.settings,
                    last_attempt: None,
                    next_attempt,
                    count,
                    in_flight: false,
                },
            );
        }
    }

    /// Close a connection without rescheduling (operator action).
    pub fn disconnect(&mut self, key: &str) {
        self.drop_connection(key, "manual disconnect", false);
        self.reconnections.remove(key);
    }

    /// Write raw bytes to a connection.
    ///
    /// # Errors
    /// `ConnectionNotFound` when the key has no live connection,
    /// `ConnectionClosed` when the writer has gone away or is saturated.
    pub fn send(&mut self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let now = self.clock.now();
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| Error::ConnectionNotFound(key.to_string()))?;
        conn.writer
            .try_send(bytes)
            .map_err(|_| Error::ConnectionClosed {
                key: key.to_string(),
                reason: "writer unavailable".to_string(),
            })?;
        conn.last_activity = now;
        Ok(())
    }

    /// Snapshot listings for the status surface.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = self.clock.now();
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .values()
            .map(|c| ConnectionInfo {
                key: c.key.clone(),
                ip: c.ip.clone(),
                port: c.port,
                state: c.state,
                terminal_id: c
                    .settings
                    .as_ref()
                    .map(|s| s.id.clone())
                    .unwrap_or_default(),
                terminal_type: c.settings.as_ref().map(|s| s.ttype.to_string()),
                connected_at: c.started_wall,
                idle: now.duration_since(c.last_activity),
                lock_owner: c.lock_owner.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    #[must_use]
    pub fn reconnections(&self) -> Vec<ReconnectionInfo> {
        let now = self.clock.now();
        let mut list: Vec<ReconnectionInfo> = self
            .reconnections
            .values()
            .map(|r| ReconnectionInfo {
                key: r.key.clone(),
                count: r.count,
                next_in: r.next_attempt.saturating_duration_since(now),
                in_flight: r.in_flight,
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    /// Shut the pool down: stop accepting, cancel every task, drain the
    /// reconnection schedule. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for task in self.listener_tasks.drain(..) {
            task.abort();
        }
        for task in self.dial_tasks.drain(..) {
            task.abort();
        }
        for (_, conn) in self.connections.drain() {
            conn.abort_tasks();
        }
        self.reconnections.clear();
        info!("pool closed");
    }
}

impl passgate_session::TerminalLink for Pool {
    fn send(&mut self, key: &str, bytes: Vec<u8>) -> Result<()> {
        Pool::send(self, key, bytes)
    }

    fn lock_terminal(&mut self, key: &str, session_id: &str, text: &str) -> Result<()> {
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| Error::ConnectionNotFound(key.to_string()))?;

        match conn.lock_owner.as_deref() {
            Some(owner) if owner == session_id => return Ok(()),
            Some(owner) => {
                return Err(Error::TerminalLocked {
                    key: key.to_string(),
                    owner: owner.to_string(),
                });
            }
            None => {}
        }
        conn.lock_owner = Some(session_id.to_string());

        let packet = match conn.settings.as_ref().map(|s| s.ttype) {
            Some(TerminalType::Pocket) => Some(pocket::lock_packet(text)),
            Some(TerminalType::Jsp) => jsp::message_packet(
                if text.is_empty() {
                    constants::MSG_WAITING
                } else {
                    text
                },
                0,
            ),
            _ => None, // GAT/SPHINX: in-memory flag only
        };
        match packet {
            Some(packet) => Pool::send(self, key, packet),
            None => Ok(()),
        }
    }

    fn unlock_terminal(&mut self, key: &str, session_id: &str) -> Result<()> {
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| Error::ConnectionNotFound(key.to_string()))?;

        if conn.lock_owner.as_deref() != Some(session_id) {
            return Err(Error::NotLockOwner {
                key: key.to_string(),
                session: session_id.to_string(),
            });
        }
        conn.lock_owner = None;

        let packet = match conn.settings.as_ref().map(|s| s.ttype) {
            Some(TerminalType::Pocket) => Some(pocket::unlock_packet()),
            Some(TerminalType::Jsp) => jsp::message_packet("", 0),
            _ => None,
        };
        match packet {
            Some(packet) => Pool::send(self, key, packet),
            None => Ok(()),
        }
    }

    fn terminal_settings(&self, key: &str) -> Option<TerminalSettings> {
        self.connections.get(key)?.settings.clone()
    }

    fn send_jsp_relay_open(
        &mut self,
        key: &str,
        uid: &str,
        caption: &str,
        time_ms: u32,
        cid: Option<&str>,
    ) -> Result<()> {
        let packet = self.jsp_request(key, "relay_open", |rid| {
            jsp::relay_open_packet(rid, uid, caption, time_ms, cid)
        })?;
        Pool::send(self, key, packet)
    }

    fn send_jsp_relay_close(&mut self, key: &str) -> Result<()> {
        let packet = self.jsp_request(key, "relay_close", jsp::relay_close_packet)?;
        Pool::send(self, key, packet)
    }

    fn send_jsp_message(&mut self, key: &str, text: &str, time_ms: u32) -> Result<()> {
        let packet = jsp::message_packet(text, time_ms).ok_or_else(|| {
            Error::MalformedFrame("JSP message does not fit a frame".to_string())
        })?;
        Pool::send(self, key, packet)
    }
}

impl Pool {
    /// Build a correlatable JSP request on a connection's rid counter.
    fn jsp_request(
        &mut self,
        key: &str,
        cmd: &str,
        build: impl FnOnce(&str) -> Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let now = self.clock.now();
        let conn = self
            .connections
            .get_mut(key)
            .ok_or_else(|| Error::ConnectionNotFound(key.to_string()))?;
        let ProtoState::Jsp { rid, requests, .. } = &mut conn.proto else {
            return Err(Error::MalformedFrame(format!(
                "connection {key} is not JSP"
            )));
        };
        let request_id = rid.next();
        let packet = build(&request_id).ok_or_else(|| {
            Error::MalformedFrame("JSP request does not fit a frame".to_string())
        })?;
        requests.insert(
            request_id,
            JspOutstanding {
                cmd: cmd.to_string(),
                sent_at: now,
            },
        );
        Ok(packet)
    }
}

fn split_key(key: &str) -> (String, u16) {
    match key.rsplit_once(':') {
        Some((ip, port)) => (ip.to_string(), port.parse().unwrap_or(0)),
        None => (key.to_string(), 0),
    }
}

/// Outcome of one liveness check.
enum Probe {
    TimedOut,
    Sent,
    Idle,
}

/// Send a liveness probe when due.
fn probe(
    ping: &mut PingState,
    now: Instant,
    last_activity: Instant,
    writer: &mpsc::Sender<Vec<u8>>,
    packet: impl FnOnce() -> Vec<u8>,
) -> Probe {
    if ping.timed_out(now) {
        return Probe::TimedOut;
    }
    if ping.due(now, last_activity) && writer.try_send(packet()).is_ok() {
        ping.mark_sent(now);
        return Probe::Sent;
    }
    Probe::Idle
}

/// First-bytes protocol detection for inbound connections without a
/// terminal-list entry.
fn detect_protocol(conn: &mut Connection, cfg: &Config) {
    let Some(&first) = conn.buffer.first() else {
        return;
    };
    let ttype = match first {
        pocket::MARKER => TerminalType::Pocket,
        jsp::SOF => TerminalType::Jsp,
        _ if conn.buffer.len() >= 4 => TerminalType::Gat,
        _ => return, // too early to tell
    };

    debug!(key = %conn.key, %ttype, "protocol detected");
    conn.settings = Some(TerminalSettings::adhoc(&conn.ip, conn.port, ttype));
    conn.proto = match ttype {
        TerminalType::Pocket => ProtoState::Pocket {
            ping: PingState::new(cfg.pocket_ping),
        },
        TerminalType::Jsp => ProtoState::Jsp {
            ping: PingState::new(cfg.jsp_ping),
            rid: jsp::RidCounter::new(),
            requests: HashMap::new(),
        },
        TerminalType::Gat => ProtoState::Gat {
            ping: PingState::new(cfg.gat_ping),
            terminal_kind: gat::GatTerminalKind::Access.to_u8(),
        },
        TerminalType::Sphinx => ProtoState::Sphinx {
            ping: PingState::new(cfg.sphinx_ping),
            expect: sphinx::Expectation::None,
        },
    };
}

/// Drain every complete frame from the connection buffer, updating
/// protocol state and collecting gateway events. Returns `true` when the
/// connection must be dropped.
fn process_connection(conn: &mut Connection, now: Instant, events: &mut Vec<GatewayEvent>) -> bool {
    let key = conn.key.clone();
    let reg_query = conn.settings.as_ref().is_some_and(|s| s.reg_query);

    match &mut conn.proto {
        ProtoState::Unknown => false,

        ProtoState::Pocket { ping } => loop {
            match pocket::decode_frame(&mut conn.buffer) {
                DecodeOutcome::Frame(frame) => match frame.command() {
                    Ok(pocket::PocketCommand::ReadTag {
                        reader_type, uid, ..
                    }) => events.push(GatewayEvent::TagRead {
                        key: key.clone(),
                        uid,
                        reader_type,
                        auth: true,
                        lockers: Vec::new(),
                        temp_card: false,
                        tag_type: TagType::Rfid,
                        gat_solar: None,
                    }),
                    Ok(pocket::PocketCommand::ReadTagExtended {
                        uid,
                        lockers,
                        auth,
                        temp_card,
                        ..
                    }) => events.push(GatewayEvent::TagRead {
                        key: key.clone(),
                        uid,
                        reader_type: 0,
                        auth,
                        lockers,
                        temp_card,
                        tag_type: TagType::Rfid,
                        gat_solar: None,
                    }),
                    Ok(pocket::PocketCommand::InputChanged { passed, .. }) => {
                        events.push(GatewayEvent::PassReport {
                            key: key.clone(),
                            passed,
                        });
                    }
                    Ok(pocket::PocketCommand::EnquireResponse) => ping.pong(),
                    Ok(other) => trace!(key = %key, ?other, "POCKET frame ignored"),
                    Err(e) => debug!(key = %key, error = %e, "POCKET frame dropped"),
                },
                DecodeOutcome::NeedMore(_) => break false,
                DecodeOutcome::Resync => {
                    trace!(key = %key, "POCKET resync");
                }
                DecodeOutcome::Fatal(e) => {
                    warn!(key = %key, error = %e, "POCKET stream fatal");
                    break true;
                }
            }
        },

        ProtoState::Gat {
            ping,
            terminal_kind,
        } => loop {
            match gat::decode_frame(&mut conn.buffer) {
                DecodeOutcome::Frame(frame) => match frame.command() {
                    Ok(gat::GatCommand::ReqMaster { kind }) => {
                        *terminal_kind = kind.to_u8();
                        ping.pong();
                    }
                    Ok(gat::GatCommand::CardIdent {
                        kind,
                        reader_type,
                        data_valid,
                        uid,
                        time,
                        price,
                    }) => {
                        let gat_solar = (kind == gat::GatTerminalKind::Time).then(|| GatSolar {
                            terminal_kind: kind.to_u8(),
                            time,
                            price,
                            vendor: None,
                            reg_query,
                        });
                        events.push(GatewayEvent::TagRead {
                            key: key.clone(),
                            uid,
                            reader_type,
                            auth: data_valid,
                            lockers: Vec::new(),
                            temp_card: false,
                            tag_type: TagType::Rfid,
                            gat_solar,
                        });
                    }
                    Ok(other) => trace!(key = %key, ?other, "GAT frame ignored"),
                    Err(e) => debug!(key = %key, error = %e, "GAT frame dropped"),
                },
                DecodeOutcome::NeedMore(_) => break false,
                DecodeOutcome::Resync => {
                    trace!(key = %key, "GAT resync");
                }
                DecodeOutcome::Fatal(e) => {
                    warn!(key = %key, error = %e, "GAT stream fatal");
                    break true;
                }
            }
        },

        ProtoState::Sphinx { ping, expect } => loop {
            match sphinx::decode_frame(&mut conn.buffer) {
                DecodeOutcome::Frame(line) => match line.command.as_str() {
                    "OK" | "ERROR" => {
                        if *expect == sphinx::Expectation::None {
                            warn!(key = %key, line = %line.command, "unexpected response");
                            break true; // out-of-order terminates the session
                        }
                        if line.is_error() {
                            warn!(key = %key, params = ?line.params, "SPHINX error response");
                        }
                        *expect = sphinx::Expectation::None;
                        ping.pong();
                    }
                    "DELEGATION_START" => ping.pong(),
                    "PING" => {
                        let _ = conn.writer.try_send(sphinx::encode_line("PONG", &[]));
                    }
                    "DELEGATION_REQUEST" => match sphinx::parse_delegation_request(&line.params) {
                        Ok(request) => events.push(GatewayEvent::Delegation {
                            key: key.clone(),
                            request,
                        }),
                        Err(e) => debug!(key = %key, error = %e, "delegation request dropped"),
                    },
                    _ => trace!(key = %key, line = %line.command, "SPHINX line ignored"),
                },
                DecodeOutcome::NeedMore(_) => break false,
                DecodeOutcome::Resync => {}
                DecodeOutcome::Fatal(e) => {
                    warn!(key = %key, error = %e, "SPHINX stream fatal");
                    break true;
                }
            }
        },

        ProtoState::Jsp {
            ping,
            requests,
            ..
        } => loop {
            match jsp::decode_frame(&mut conn.buffer) {
                DecodeOutcome::Frame(mut packet) => match jsp::packet_kind(&packet) {
                    jsp::PacketKind::Command => {
                        let cmd = packet
                            .get("cmd")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .trim()
                            .to_lowercase();
                        match cmd.as_str() {
                            "tag_read" => {
                                jsp::normalize_lockers(&mut packet);
                                let Some(uid) = packet
                                    .get("uid")
                                    .and_then(|v| v.as_str())
                                    .and_then(|u| Uid::new(u).ok())
                                else {
                                    debug!(key = %key, "tag_read without usable uid");
                                    continue;
                                };
                                events.push(GatewayEvent::TagRead {
                                    key: key.clone(),
                                    uid,
                                    reader_type: packet
                                        .get("reader_type")
                                        .and_then(|v| v.as_u64())
                                        .unwrap_or(1)
                                        as u8,
                                    auth: packet
                                        .get("auth")
                                        .and_then(|v| v.as_bool())
                                        .unwrap_or(true),
                                    lockers: jsp::packet_lockers(&packet),
                                    temp_card: false,
                                    tag_type: TagType::Rfid,
                                    gat_solar: None,
                                });
                            }
                            "pass_report" => events.push(GatewayEvent::PassReport {
                                key: key.clone(),
                                passed: packet
                                    .get("passed")
                                    .and_then(|v| v.as_bool())
                                    .unwrap_or(true),
                            }),
                            "pong" => ping.pong(),
                            other => {
                                debug!(key = %key, cmd = other, "unknown JSP command");
                                if let Some(rid) = packet.get("rid").and_then(|v| v.as_str()) {
                                    let mut params = serde_json::Map::new();
                                    params.insert("result".to_string(), json!(false));
                                    params.insert("error".to_string(), json!("unknown command"));
                                    if let Some(answer) = jsp::answer_packet(rid, &params) {
                                        let _ = conn.writer.try_send(answer);
                                    }
                                }
                            }
                        }
                    }
                    jsp::PacketKind::Answer => {
                        let rid = packet
                            .get("rid")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        if let Some(outstanding) = requests.remove(&rid) {
                            trace!(
                                key = %key,
                                rid = %rid,
                                cmd = %outstanding.cmd,
                                elapsed_ms = now.duration_since(outstanding.sent_at).as_millis()
                                    as u64,
                                "JSP answer"
                            );
                            if outstanding.cmd == "ping" {
                                ping.pong();
                            }
                        }
                    }
                    jsp::PacketKind::Unknown => trace!(key = %key, "JSP packet without cmd or rid"),
                },
                DecodeOutcome::NeedMore(_) => break false,
                DecodeOutcome::Resync => {}
                DecodeOutcome::Fatal(e) => {
                    warn!(key = %key, error = %e, "JSP stream fatal");
                    break true;
                }
            }
        },
    }
}
