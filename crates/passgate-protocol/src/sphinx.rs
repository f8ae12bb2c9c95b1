//! SPHINX protocol: line-oriented ASCII, CRLF delimited.
//!
//! Frames are whitespace-tokenised; the first token is the command. A
//! per-connection expectation counter tracks which command's response is
//! outstanding: an `OK`/`ERROR` that arrives while nothing is expected
//! terminates the session. Liveness is implemented by emitting
//! `DELEGATION_START` every 5 s and accepting any response within 10 s.

use crate::decode::DecodeOutcome;
use bytes::BytesMut;
use passgate_core::{Error, Result, constants::MAX_FRAME_SIZE};

pub const DELIMITER: &[u8] = b"\r\n";

pub const ACCESS_NORMAL: &str = "NORMAL";
pub const ACCESS_ESCORT: &str = "ESCORT";

const VALID_COMMANDS: &[&str] = &[
    "OK",
    "ERROR",
    "LOGIN",
    "LOGOUT",
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "DELEGATION_START",
    "DELEGATION_STOP",
    "DELEGATION_REQUEST",
    "DELEGATION_REPLY",
    "GETAPLIST",
    "GETZONEINFO",
    "PING",
    "PONG",
];

/// Which command's response this connection is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expectation {
    #[default]
    None,
    Auth,
    DelegationStart,
    Subscribe,
}

/// One decoded SPHINX line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SphinxLine {
    pub command: String,
    pub params: Vec<String>,
}

impl SphinxLine {
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.command == "OK"
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.command == "ERROR"
    }
}

/// One decoding step: extract the next CRLF-terminated line.
///
/// Lines that are empty or start with an unknown command are dropped with
/// a `Resync`-style consumption of the whole line (the line boundary is
/// unambiguous, so there is no byte-wise recovery to do).
pub fn decode_frame(buf: &mut BytesMut) -> DecodeOutcome<SphinxLine> {
    let Some(pos) = buf
        .windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
    else {
        if buf.len() > MAX_FRAME_SIZE {
            return DecodeOutcome::Fatal(Error::FrameTooLarge {
                size: buf.len(),
                max_size: MAX_FRAME_SIZE,
            });
        }
        return DecodeOutcome::NeedMore(1);
    };

    let line = buf.split_to(pos + DELIMITER.len());
    let text = String::from_utf8_lossy(&line[..pos]);
    let mut tokens = text.split_whitespace().map(str::to_string);

    let Some(command) = tokens.next().map(|c| c.to_uppercase()) else {
        return DecodeOutcome::Resync; // blank line
    };
    if !VALID_COMMANDS.contains(&command.as_str()) {
        return DecodeOutcome::Resync;
    }

    DecodeOutcome::Frame(SphinxLine {
        command,
        params: tokens.collect(),
    })
}

/// Encode a command line with parameters.
#[must_use]
pub fn encode_line(cmd: &str, params: &[&str]) -> Vec<u8> {
    let mut line = cmd.to_string();
    for p in params {
        line.push(' ');
        line.push_str(p);
    }
    line.push_str("\r\n");
    line.into_bytes()
}

/// LOGIN frame; username and password are quoted.
#[must_use]
pub fn login_packet(version: &str, username: &str, password: &str) -> Vec<u8> {
    encode_line(
        "LOGIN",
        &[version, &format!("\"{username}\""), &format!("\"{password}\"")],
    )
}

/// DELEGATION_REPLY frame.
#[must_use]
pub fn delegation_reply(ticket: &str, access_type: &str, result: i32, flags: &[&str]) -> Vec<u8> {
    let result = result.to_string();
    let mut params = vec![ticket, access_type, result.as_str()];
    params.extend_from_slice(flags);
    encode_line("DELEGATION_REPLY", &params)
}

/// Liveness probe.
#[must_use]
pub fn ping_packet() -> Vec<u8> {
    encode_line("DELEGATION_START", &[])
}

/// Key descriptor carried by DELEGATION_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDescriptor {
    /// Wiegand-26 facility code + card number
    W26 { facility: u32, card: u32 },
    /// 8 hex characters decoded as bytes
    W34 { hex: String },
    /// Person id known to the access server
    PersonId(String),
}

impl KeyDescriptor {
    /// The UID this key resolves to for deny lists and backend checks.
    #[must_use]
    pub fn uid_hex(&self) -> String {
        match self {
            KeyDescriptor::W26 { facility, card } => {
                format!("{:02X}{:04X}", facility & 0xFF, card & 0xFFFF)
            }
            KeyDescriptor::W34 { hex } => hex.to_uppercase(),
            KeyDescriptor::PersonId(pid) => pid.clone(),
        }
    }
}

/// Parsed DELEGATION_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    pub ticket: String,
    /// `NORMAL` or `ESCORT`
    pub access_type: String,
    pub key: Option<KeyDescriptor>,
    pub direction: Option<String>,
    pub access_point_id: Option<String>,
}

/// Parse DELEGATION_REQUEST parameters:
/// `ticket access_type key_kind key_fields... [direction] [access_point]`.
///
/// # Errors
/// Returns a frame-kind error when the ticket or access type is missing.
pub fn parse_delegation_request(params: &[String]) -> Result<DelegationRequest> {
    if params.len() < 2 {
        return Err(Error::MalformedFrame(
            "DELEGATION_REQUEST needs ticket and access type".into(),
        ));
    }
    let ticket = params[0].clone();
    if ticket.is_empty() || ticket.len() > 32 {
        return Err(Error::MalformedFrame("invalid delegation ticket".into()));
    }
    let access_type = params[1].to_uppercase();

    let key = match params.get(2).map(String::as_str) {
        Some("W26") => {
            let facility = params.get(3).and_then(|p| p.parse::<u32>().ok());
            let card = params.get(4).and_then(|p| p.parse::<u32>().ok());
            match (facility, card) {
                (Some(facility), Some(card)) => Some(KeyDescriptor::W26 { facility, card }),
                _ => None,
            }
        }
        Some("W34") => params
            .get(3)
            .filter(|h| h.len() == 8 && h.bytes().all(|b| b.is_ascii_hexdigit()))
            .map(|h| KeyDescriptor::W34 {
                hex: h.to_uppercase(),
            }),
        Some("ID") => params.get(3).map(|p| KeyDescriptor::PersonId(p.clone())),
        _ => None,
    };

    Ok(DelegationRequest {
        ticket,
        access_type,
        key,
        direction: params.get(5).cloned(),
        access_point_id: params.get(6).cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<SphinxLine> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        loop {
            match decode_frame(&mut buf) {
                DecodeOutcome::Frame(f) => frames.push(f),
                DecodeOutcome::NeedMore(_) => break,
                DecodeOutcome::Resync => continue,
                DecodeOutcome::Fatal(e) => panic!("fatal: {e}"),
            }
        }
        frames
    }

    #[test]
    fn test_decode_simple_line() {
        let frames = decode_all(b"OK\r\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ack());
        assert!(frames[0].params.is_empty());
    }

    #[test]
    fn test_decode_lowercase_command() {
        let frames = decode_all(b"pong extra\r\n");
        assert_eq!(frames[0].command, "PONG");
        assert_eq!(frames[0].params, vec!["extra"]);
    }

    #[test]
    fn test_partial_line() {
        let mut buf = BytesMut::from(&b"DELEGATION_REQ"[..]);
        assert!(matches!(decode_frame(&mut buf), DecodeOutcome::NeedMore(1)));
        assert_eq!(buf.len(), 14);
    }

    #[test]
    fn test_unknown_command_dropped() {
        let frames = decode_all(b"BOGUS 1 2\r\nOK\r\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ack());
    }

    #[test]
    fn test_multiple_lines() {
        let frames = decode_all(b"OK\r\nDELEGATION_START\r\nERROR denied\r\n");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].params, vec!["denied"]);
    }

    #[test]
    fn test_delegation_request_w26() {
        let frames = decode_all(b"DELEGATION_REQUEST T42 normal W26 18 44041\r\n");
        let req = parse_delegation_request(&frames[0].params).unwrap();
        assert_eq!(req.ticket, "T42");
        assert_eq!(req.access_type, "NORMAL");
        match req.key.unwrap() {
            KeyDescriptor::W26 { facility, card } => {
                assert_eq!(facility, 18);
                assert_eq!(card, 44041);
                assert_eq!(
                    KeyDescriptor::W26 { facility, card }.uid_hex(),
                    "12AC09" // 0x12, 0xAC09
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_delegation_request_w34() {
        let frames = decode_all(b"DELEGATION_REQUEST T1 ESCORT W34 04aeecfa\r\n");
        let req = parse_delegation_request(&frames[0].params).unwrap();
        assert_eq!(
            req.key,
            Some(KeyDescriptor::W34 {
                hex: "04AEECFA".to_string()
            })
        );
        assert_eq!(req.key.unwrap().uid_hex(), "04AEECFA");
    }

    #[test]
    fn test_delegation_request_person_id() {
        let frames = decode_all(b"DELEGATION_REQUEST T1 NORMAL ID 123456\r\n");
        let req = parse_delegation_request(&frames[0].params).unwrap();
        assert_eq!(req.key, Some(KeyDescriptor::PersonId("123456".to_string())));
    }

    #[test]
    fn test_delegation_request_too_short() {
        assert!(parse_delegation_request(&["T1".to_string()]).is_err());
    }

    #[test]
    fn test_delegation_reply_encoding() {
        let wire = delegation_reply("T42", ACCESS_NORMAL, 1, &[]);
        assert_eq!(wire, b"DELEGATION_REPLY T42 NORMAL 1\r\n");
    }

    #[test]
    fn test_login_encoding() {
        let wire = login_packet("1.8", "svc", "secret");
        assert_eq!(wire, b"LOGIN 1.8 \"svc\" \"secret\"\r\n");
    }

    #[test]
    fn test_ping_is_delegation_start() {
        assert_eq!(ping_packet(), b"DELEGATION_START\r\n");
    }
}
