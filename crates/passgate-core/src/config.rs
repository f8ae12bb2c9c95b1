//! Daemon configuration.
//!
//! The configuration is delivered as a plain struct, deserialized once at
//! boot and read-only afterwards. Out-of-range values fail fast through
//! [`Config::validate`].

use crate::{Result, constants, error::Error};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Ping cadence for one protocol, seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingConfig {
    pub interval: u64,
    pub timeout: u64,
}

impl From<(u64, u64)> for PingConfig {
    fn from((interval, timeout): (u64, u64)) -> Self {
        PingConfig { interval, timeout }
    }
}

/// Identification / verification camera-service settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CrtConfig {
    pub active: bool,
    /// `true` = identification mode (poller synthesises sessions),
    /// `false` = verification mode (poller resolves pending requests)
    pub identification_mode: bool,
    pub host: String,
    pub port: u16,
    pub name: String,
    /// API prefix, e.g. "/vizir/v1/api/"
    pub url: String,
    pub connect_time1: f64,
    pub connect_time2: f64,
    pub connect_time3: f64,
    pub expire_time: f64,
    pub extra_headers: Vec<String>,
    /// Polling interval, seconds; 0 disables the poller
    pub check_time: f64,
    pub ban_cam_pid_time: f64,
    pub ban_pass_only: bool,
    pub ban_from_catch: bool,
    pub no_kpo_pass: bool,
    pub seen_timeout: f64,
    /// camera_id -> terminal_id
    pub cam_links: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Listener
    pub server_addr: String,
    pub server_port: u16,

    // Backend (KPO) service
    pub service_active: bool,
    pub service_name: String,
    pub termlist_path: String,
    pub ident_path: String,
    pub uid_path: String,
    pub solar_path: String,
    pub url_fmt_suff: String,
    pub service_request_extra_headers: Vec<String>,

    // Timeouts, seconds
    pub service_request_expire_time: f64,
    pub session_expire_time: f64,
    pub terminal_connect_timeout: f64,
    pub reconnection_wait_time_step: f64,
    pub reconnection_wait_time_max: f64,
    pub term_pass_add_expire_time: f64,

    // Error handling
    pub service_autofix_expired: bool,
    pub http_request_retry_count: u32,
    pub http_request_retry_delay: f64,

    // Messages
    pub service_err_msg: String,
    pub service_fixed_msg: String,
    pub service_denied_msg: String,
    pub service_link_err_msg: String,

    // JSP
    /// JSON `false` means disabled; a positive integer enables the
    /// dedicated JSP listener on that port.
    #[serde(deserialize_with = "de_jsp_listener_port")]
    pub jsp_listener_port: Option<u16>,
    pub jsp_dev_auto_ping_enabled: bool,

    // Face verification (WebSocket)
    pub cam_service_active: bool,
    pub cam_host: String,
    pub cam_port: u16,
    pub cam_extra_headers: Vec<String>,
    pub cam_always_pass: bool,
    pub cam_service_result_msg_no: String,
    pub cam_service_result_msg_nf: String,
    pub cam_service_result_msg_fail: String,

    // Identification poller
    pub crt: CrtConfig,

    // Terminal list
    pub terminals: Vec<String>,
    pub term_list_check_time: f64,
    pub term_list_filter: String,
    pub term_list_filter_absent: bool,

    // Liveness
    pub pocket_ping: PingConfig,
    pub gat_ping: PingConfig,
    pub jsp_ping: PingConfig,
    pub sphinx_ping: PingConfig,

    // Relay
    pub pass_time_ms: u32,

    /// Display-text substitution table, applied exactly once per outgoing
    /// string
    pub phrases_fixes: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_addr: "0.0.0.0".to_string(),
            server_port: 8999,

            service_active: true,
            service_name: String::new(),
            termlist_path: String::new(),
            ident_path: String::new(),
            uid_path: String::new(),
            solar_path: String::new(),
            url_fmt_suff: String::new(),
            service_request_extra_headers: Vec::new(),

            service_request_expire_time: 5.0,
            session_expire_time: 300.0,
            terminal_connect_timeout: 10.0,
            reconnection_wait_time_step: 2.0,
            reconnection_wait_time_max: 60.0,
            term_pass_add_expire_time: 2.0,

            service_autofix_expired: false,
            http_request_retry_count: 2,
            http_request_retry_delay: 0.5,

            service_err_msg: constants::MSG_DB_ERROR.to_string(),
            service_fixed_msg: constants::MSG_PROCEED.to_string(),
            service_denied_msg: constants::MSG_DENIED.to_string(),
            service_link_err_msg: constants::MSG_LINK_ERROR.to_string(),

            jsp_listener_port: None,
            jsp_dev_auto_ping_enabled: true,

            cam_service_active: false,
            cam_host: String::new(),
            cam_port: 0,
            cam_extra_headers: Vec::new(),
            cam_always_pass: false,
            cam_service_result_msg_no: constants::MSG_CAM_NO.to_string(),
            cam_service_result_msg_nf: constants::MSG_CAM_NF.to_string(),
            cam_service_result_msg_fail: constants::MSG_CAM_FAIL.to_string(),

            crt: CrtConfig::default(),

            terminals: Vec::new(),
            term_list_check_time: 60.0,
            term_list_filter: String::new(),
            term_list_filter_absent: false,

            pocket_ping: constants::POCKET_PING_DEFAULTS.into(),
            gat_ping: constants::GAT_PING_DEFAULTS.into(),
            jsp_ping: constants::JSP_PING_DEFAULTS.into(),
            sphinx_ping: constants::SPHINX_PING_DEFAULTS.into(),

            pass_time_ms: constants::DEFAULT_PASS_TIME_MS,

            phrases_fixes: HashMap::new(),
        }
    }
}

impl Config {
    /// Replace a display text by its configured fix, if one exists.
    /// The substitution is static and applied once per outgoing string.
    #[must_use]
    pub fn fix_phrase<'a>(&'a self, text: &'a str) -> &'a str {
        self.phrases_fixes.get(text).map_or(text, String::as_str)
    }

    /// `true` when a terminal IP passes the terminal-list filter.
    ///
    /// The filter is a regular expression, optionally wrapped in `/.../ `
    /// delimiters; `term_list_filter_absent` inverts the match. An invalid
    /// pattern admits everything.
    #[must_use]
    pub fn terminal_admitted(&self, ip: &str) -> bool {
        if self.term_list_filter.is_empty() {
            return true;
        }
        let pattern = self.term_list_filter.trim_matches('/');
        match regex::Regex::new(pattern) {
            Ok(re) => re.is_match(ip) != self.term_list_filter_absent,
            Err(_) => true,
        }
    }

    /// Validate ranges that would otherwise misbehave at runtime.
    ///
    /// # Errors
    /// Returns `Error::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.service_request_expire_time <= 0.0 {
            return Err(Error::Config(
                "service_request_expire_time must be positive".to_string(),
            ));
        }
        if self.session_expire_time <= 0.0 {
            return Err(Error::Config(
                "session_expire_time must be positive".to_string(),
            ));
        }
        if self.terminal_connect_timeout <= 0.0 {
            return Err(Error::Config(
                "terminal_connect_timeout must be positive".to_string(),
            ));
        }
        if self.reconnection_wait_time_max < self.reconnection_wait_time_step {
            return Err(Error::Config(
                "reconnection_wait_time_max must be >= reconnection_wait_time_step".to_string(),
            ));
        }
        if self.service_active && self.service_name.is_empty() {
            return Err(Error::Config(
                "service_name is required while service_active".to_string(),
            ));
        }
        if self.cam_service_active && self.cam_host.is_empty() {
            return Err(Error::Config(
                "cam_host is required while cam_service_active".to_string(),
            ));
        }
        if self.crt.active && self.crt.host.is_empty() {
            return Err(Error::Config(
                "crt.host is required while crt.active".to_string(),
            ));
        }
        for ping in [
            &self.pocket_ping,
            &self.gat_ping,
            &self.jsp_ping,
            &self.sphinx_ping,
        ] {
            if ping.interval > 0 && ping.timeout <= ping.interval {
                return Err(Error::Config(
                    "ping timeout must exceed ping interval".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// `jsp_listener_port` historically accepts either `false` or an integer.
fn de_jsp_listener_port<'de, D>(de: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let value = serde_json::Value::deserialize(de)?;
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => Ok(None),
        serde_json::Value::Bool(true) => Err(D::Error::custom(
            "jsp_listener_port: true is not a port; use an integer",
        )),
        serde_json::Value::Number(n) => {
            let port = n
                .as_u64()
                .filter(|p| (1..=u64::from(u16::MAX)).contains(p))
                .ok_or_else(|| D::Error::custom("jsp_listener_port out of range"))?;
            Ok(Some(port as u16))
        }
        other => Err(D::Error::custom(format!(
            "jsp_listener_port: unexpected value {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_timeouts() {
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.service_request_expire_time = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_service_name() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_fix_phrase() {
        let mut cfg = Config::default();
        cfg.phrases_fixes.insert(
            "Извините;клиент не идентифицирован;".to_string(),
            "Извините;Клиент не;идентифицирован".to_string(),
        );
        assert_eq!(
            cfg.fix_phrase("Извините;клиент не идентифицирован;"),
            "Извините;Клиент не;идентифицирован"
        );
        assert_eq!(cfg.fix_phrase("Проходите"), "Проходите");
    }

    #[test]
    fn test_jsp_listener_port_false() {
        let cfg: Config = serde_json::from_str(r#"{"jsp_listener_port": false}"#).unwrap();
        assert_eq!(cfg.jsp_listener_port, None);
    }

    #[test]
    fn test_jsp_listener_port_number() {
        let cfg: Config = serde_json::from_str(r#"{"jsp_listener_port": 8902}"#).unwrap();
        assert_eq!(cfg.jsp_listener_port, Some(8902));
    }

    #[test]
    fn test_jsp_listener_port_true_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"jsp_listener_port": true}"#).is_err());
    }

    #[test]
    fn test_terminal_filter() {
        let mut cfg = Config::default();
        cfg.term_list_filter = r"/192\.168\.12\.2(3|4)(2|3|4|5|6|7|8)/".to_string();
        assert!(cfg.terminal_admitted("192.168.12.232"));
        assert!(!cfg.terminal_admitted("192.168.12.100"));

        cfg.term_list_filter_absent = true;
        assert!(!cfg.terminal_admitted("192.168.12.232"));
        assert!(cfg.terminal_admitted("192.168.12.100"));
    }
}
