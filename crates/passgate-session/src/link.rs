//! Collaborator contracts.
//!
//! The session manager never references the connection pool type; it
//! addresses terminals through [`TerminalLink`], and hands completed
//! sessions to [`SessionSink`] / GAT TIME reads to [`GTimeSink`]. This
//! keeps the core testable without sockets and breaks the
//! pool <-> session-manager cycle.

use crate::data::Session;
use chrono::{DateTime, Local};
use passgate_core::{Result, TerminalSettings};

/// The slice of the connection pool the session machinery may use.
pub trait TerminalLink {
    /// Write raw protocol bytes to a terminal.
    fn send(&mut self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Show the waiting display and refuse other sessions' locks.
    fn lock_terminal(&mut self, key: &str, session_id: &str, text: &str) -> Result<()>;

    /// Clear the waiting display; only the lock owner may unlock.
    fn unlock_terminal(&mut self, key: &str, session_id: &str) -> Result<()>;

    /// Settings of the terminal behind a connection key.
    fn terminal_settings(&self, key: &str) -> Option<TerminalSettings>;

    /// JSP relay open; the pool supplies the request id.
    fn send_jsp_relay_open(
        &mut self,
        key: &str,
        uid: &str,
        caption: &str,
        time_ms: u32,
        cid: Option<&str>,
    ) -> Result<()>;

    /// JSP relay close.
    fn send_jsp_relay_close(&mut self, key: &str) -> Result<()>;

    /// JSP display message.
    fn send_jsp_message(&mut self, key: &str, text: &str, time_ms: u32) -> Result<()>;
}

/// Audit row for one completed session.
///
/// Newlines in message fields are normalised to `;` so the row stays one
/// line in any downstream format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    /// `dd.MM.yy HH:mm:ss`
    pub session_time: String,
    pub term_id: String,
    /// `ip:port`
    pub term_addr: String,
    pub term_role: String,
    pub uid: String,
    pub kpo_result: String,
    pub kpo_msg: String,
    pub cam_result: String,
    pub cam_cid: String,
    pub final_result: String,
    pub final_msg: String,
}

fn one_line(s: &str) -> String {
    s.replace(['\r', '\n'], ";")
}

impl SessionRow {
    /// Build the row for a completed session.
    #[must_use]
    pub fn build(session: &Session, settings: Option<&TerminalSettings>) -> Self {
        let (term_id, term_addr, term_role) = match settings {
            Some(s) => (
                s.id.clone(),
                format!("{}:{}", s.ip, s.port),
                s.role.clone().unwrap_or_default(),
            ),
            None => (String::new(), session.terminal_key.clone(), String::new()),
        };

        SessionRow {
            session_time: session.req_time.format("%d.%m.%y %H:%M:%S").to_string(),
            term_id,
            term_addr,
            term_role,
            uid: session.uid.to_string(),
            kpo_result: session.data.kpo.result.as_str().to_string(),
            kpo_msg: one_line(&session.data.kpo.message),
            cam_result: session.data.cam.result.as_str().to_string(),
            cam_cid: session.cid.clone().unwrap_or_default(),
            final_result: if session.data.granted.unwrap_or(false) {
                "YES".to_string()
            } else {
                "NO".to_string()
            },
            final_msg: one_line(&session.data.message),
        }
    }
}

/// Persistence collaborator for completed sessions. Called exactly once
/// per session.
pub trait SessionSink: Send {
    fn log_session(&mut self, row: &SessionRow) -> Result<()>;
}

/// One GAT TIME-kind read.
#[derive(Debug, Clone)]
pub struct GTimeRecord {
    pub timestamp: DateTime<Local>,
    pub term_id: String,
    pub term_addr: String,
    pub uid: String,
    pub time: Option<u16>,
    pub price: Option<u32>,
}

/// Persistence collaborator for GAT TIME events.
pub trait GTimeSink: Send {
    fn register_gtime_event(&mut self, record: &GTimeRecord) -> Result<()>;
}
