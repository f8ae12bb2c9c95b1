//! Per-connection state.

use bytes::BytesMut;
use chrono::{DateTime, Local};
use passgate_core::{TerminalSettings, config::PingConfig};
use passgate_protocol::jsp::RidCounter;
use passgate_protocol::sphinx::Expectation;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Reconnecting => "reconnecting",
        };
        write!(f, "{s}")
    }
}

/// Liveness probe state for one connection.
#[derive(Debug)]
pub struct PingState {
    pub interval: Duration,
    pub timeout: Duration,
    /// When the outstanding probe was sent
    pub sent_at: Option<Instant>,
}

impl PingState {
    #[must_use]
    pub fn new(cfg: PingConfig) -> Self {
        PingState {
            interval: Duration::from_secs(cfg.interval),
            timeout: Duration::from_secs(cfg.timeout),
            sent_at: None,
        }
    }

    /// Should a probe go out now?
    #[must_use]
    pub fn due(&self, now: Instant, last_activity: Instant) -> bool {
        self.sent_at.is_none()
            && !self.interval.is_zero()
            && now.duration_since(last_activity) >= self.interval
    }

    /// Has the outstanding probe gone unanswered too long?
    #[must_use]
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.sent_at {
            Some(sent) => !self.timeout.is_zero() && now.duration_since(sent) >= self.timeout,
            None => false,
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    /// Any inbound response clears the probe.
    pub fn pong(&mut self) {
        self.sent_at = None;
    }
}

/// An outbound JSP request awaiting its answer.
#[derive(Debug, Clone)]
pub struct JspOutstanding {
    pub cmd: String,
    pub sent_at: Instant,
}

/// Protocol-specific connection state.
#[derive(Debug)]
pub enum ProtoState {
    /// Inbound connection before protocol detection
    Unknown,
    Pocket {
        ping: PingState,
    },
    Gat {
        ping: PingState,
        terminal_kind: u8,
    },
    Sphinx {
        ping: PingState,
        expect: Expectation,
    },
    Jsp {
        ping: PingState,
        rid: RidCounter,
        requests: HashMap<String, JspOutstanding>,
    },
}

/// One live connection. At most one exists per `(ip, port)`.
pub struct Connection {
    pub key: String,
    pub ip: String,
    pub port: u16,
    pub state: ConnState,
    pub settings: Option<TerminalSettings>,
    pub buffer: BytesMut,
    pub writer: mpsc::Sender<Vec<u8>>,
    pub started_wall: DateTime<Local>,
    pub start: Instant,
    pub last_activity: Instant,
    /// Session currently holding the reader lock
    pub lock_owner: Option<String>,
    pub proto: ProtoState,
    /// True when we dialed this terminal (reconnect on loss)
    pub dialed: bool,
    pub reader_task: JoinHandle<()>,
    pub writer_task: JoinHandle<()>,
}

impl Connection {
    pub fn abort_tasks(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("dialed", &self.dialed)
            .field("lock_owner", &self.lock_owner)
            .finish_non_exhaustive()
    }
}

/// Read-only connection snapshot for the status surface.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub key: String,
    pub ip: String,
    pub port: u16,
    pub state: ConnState,
    pub terminal_id: String,
    pub terminal_type: Option<String>,
    pub connected_at: DateTime<Local>,
    pub idle: Duration,
    pub lock_owner: Option<String>,
}

/// One scheduled reconnection attempt.
#[derive(Debug)]
pub struct Reconnection {
    pub key: String,
    pub ip: String,
    pub port: u16,
    pub settings: Option<TerminalSettings>,
    pub last_attempt: Option<Instant>,
    pub next_attempt: Instant,
    pub count: u32,
    pub in_flight: bool,
}

/// Read-only reconnection snapshot for the status surface.
#[derive(Debug, Clone)]
pub struct ReconnectionInfo {
    pub key: String,
    pub count: u32,
    pub next_in: Duration,
    pub in_flight: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> PingState {
        PingState::new(PingConfig {
            interval: 10,
            timeout: 15,
        })
    }

    #[test]
    fn test_ping_due_after_interval() {
        let mut p = ping();
        let t0 = Instant::now();
        assert!(!p.due(t0 + Duration::from_secs(5), t0));
        assert!(p.due(t0 + Duration::from_secs(10), t0));

        p.mark_sent(t0 + Duration::from_secs(10));
        assert!(!p.due(t0 + Duration::from_secs(25), t0)); // probe outstanding
    }

    #[test]
    fn test_ping_timeout_and_pong() {
        let mut p = ping();
        let t0 = Instant::now();
        assert!(!p.timed_out(t0));

        p.mark_sent(t0);
        assert!(!p.timed_out(t0 + Duration::from_secs(14)));
        assert!(p.timed_out(t0 + Duration::from_secs(15)));

        p.pong();
        assert!(!p.timed_out(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_disabled_ping_never_due() {
        let p = PingState::new(PingConfig {
            interval: 0,
            timeout: 0,
        });
        let t0 = Instant::now();
        assert!(!p.due(t0 + Duration::from_secs(3600), t0));
    }
}
