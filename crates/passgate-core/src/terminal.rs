//! Terminal settings and the terminal-list config-string parser.
//!
//! The backend's terminal list describes each terminal as a compact
//! colon-separated string:
//!
//! ```text
//! T1:192.168.12.232:8902:type=jsp:memreg_deny=towel:memreg_role=checkout:ctrole=card_taker
//! ```
//!
//! Fields after the address are either bare flags (`u`, `r`, `gate`,
//! `deny_lockers`, `deny_ct`), `key=value` pairs, or a numeric port.
//! When no port is given, the default for the terminal type applies.

use crate::{Result, error::Error, types::TerminalType};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Static description of one terminal and its semantic modifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    /// Backend-assigned terminal id (may be empty for ad-hoc connections)
    pub id: String,
    pub ip: String,
    pub port: u16,
    /// Wire protocol; immutable once assigned from the terminal list
    pub ttype: TerminalType,
    /// Terminal display expects UTF-8 text
    pub utf: bool,
    /// Access reports include the registration flag
    pub reg_query: bool,
    /// Terminal fronts a two-door mantrap
    pub gate: bool,
    /// Deny access while lockers are still bound to the card
    pub deny_lockers: bool,
    /// Deny access for temporary (card-capture) cards
    pub deny_ct: bool,
    /// Card-capture role, e.g. "card_taker"
    pub ctrole: Option<String>,
    /// What this device registers, e.g. "towel/add"
    pub memreg_dev: Option<String>,
    /// Usage storage that blocks the pass, e.g. "towel"
    pub memreg_deny: Option<String>,
    /// MEMREG role, e.g. "checkout"
    pub memreg_role: Option<String>,
    /// Verification camera bound to this terminal
    pub cam_pid: Option<String>,
    /// Reporting role for craft-dialect backends
    pub role: Option<String>,
    /// Raw string this record was parsed from
    pub config_string: String,
}

impl TerminalSettings {
    /// Minimal settings for a connection whose terminal is not (yet) known
    /// from the list, e.g. an inbound connection before protocol detection.
    #[must_use]
    pub fn adhoc(ip: &str, port: u16, ttype: TerminalType) -> Self {
        TerminalSettings {
            id: String::new(),
            ip: ip.to_string(),
            port,
            ttype,
            utf: false,
            reg_query: false,
            gate: false,
            deny_lockers: false,
            deny_ct: false,
            ctrole: None,
            memreg_dev: None,
            memreg_deny: None,
            memreg_role: None,
            cam_pid: None,
            role: None,
            config_string: String::new(),
        }
    }

    /// Connection key for this terminal, `ip:port`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Parse a terminal config string.
    ///
    /// The first field is the terminal id when the second field is an IP
    /// address; otherwise the first field is itself the address and the id
    /// is empty. Remaining fields are ports, bare flags, or `key=value`
    /// pairs. Fields starting with `_` are ignored.
    ///
    /// # Errors
    /// Returns `Error::Config` if no valid IP address is present.
    pub fn parse(term: &str) -> Result<Self> {
        let term = term.trim();
        let parts: Vec<&str> = term.split(':').collect();
        if parts.is_empty() || parts[0].is_empty() {
            return Err(Error::Config(format!("invalid terminal string: {term:?}")));
        }

        let mut id = parts[0].trim().to_string();
        let ip;
        let rest;
        if parts.len() > 1 && is_ip(parts[1]) {
            ip = parts[1].trim().to_string();
            rest = &parts[2..];
        } else if is_ip(&id) {
            ip = id.clone();
            id = String::new();
            rest = &parts[1..];
        } else {
            return Err(Error::Config(format!(
                "invalid terminal address in {term:?}"
            )));
        }

        let mut port: Option<u16> = None;
        let mut settings = TerminalSettings::adhoc(&ip, 0, TerminalType::Pocket);
        settings.id = id;
        settings.config_string = term.to_string();

        for part in rest {
            let part = part.trim();
            if part.is_empty() || part.starts_with('_') {
                continue;
            }

            if let Ok(p) = part.parse::<u16>() {
                if p > 0 {
                    port = Some(p);
                    continue;
                }
            }

            match part.split_once('=') {
                Some((key, val)) => {
                    let key = key.trim().to_lowercase();
                    let val = val.trim();
                    match key.as_str() {
                        "type" => settings.ttype = TerminalType::parse(val),
                        "ctrole" => settings.ctrole = non_empty(val),
                        "memreg_dev" => settings.memreg_dev = non_empty(val),
                        "memreg_deny" => settings.memreg_deny = non_empty(val),
                        "memreg_role" => settings.memreg_role = non_empty(val),
                        "cam_pid" => settings.cam_pid = non_empty(val),
                        "role" => settings.role = non_empty(val),
                        _ => {}
                    }
                }
                None => match part.to_lowercase().as_str() {
                    "u" | "utf" => settings.utf = true,
                    "r" => settings.reg_query = true,
                    "gate" => settings.gate = true,
                    "deny_lockers" => settings.deny_lockers = true,
                    "deny_ct" => settings.deny_ct = true,
                    _ => {}
                },
            }
        }

        settings.port = port.unwrap_or_else(|| settings.ttype.default_port());
        Ok(settings)
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

fn is_ip(s: &str) -> bool {
    s.trim().parse::<IpAddr>().is_ok()
}
