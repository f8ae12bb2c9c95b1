use crate::{
    Result,
    constants::{MAX_UID_LENGTH, MIN_UID_LENGTH},
    error::Error,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

/// Credential identifier read from a terminal (card UID, barcode digits,
/// or a face-server person id).
///
/// The value is normalized (trimmed, upper-cased) before validation.
///
/// # Security
/// This type implements constant-time comparison to prevent timing attacks
/// when comparing credentials during access decisions.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    /// Create a new UID with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidCardFormat` if:
    /// - The value length is not between 1-32 characters after trimming
    /// - The value contains characters other than ASCII letters and digits
    pub fn new(value: &str) -> Result<Self> {
        let value = value.trim().to_uppercase();

        let len = value.len();
        if !(MIN_UID_LENGTH..=MAX_UID_LENGTH).contains(&len) {
            return Err(Error::InvalidCardFormat(format!(
                "UID must be {MIN_UID_LENGTH}-{MAX_UID_LENGTH} chars, got {len}"
            )));
        }

        if !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::InvalidCardFormat(
                "UID must be ASCII alphanumeric".to_string(),
            ));
        }

        Ok(Uid(value))
    }

    /// Build a UID from raw reader bytes (hex encoding, upper-case).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidCardFormat("empty UID".to_string()));
        }
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        Uid::new(&hex)
    }

    /// Get the UID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if every character is a hex digit.
    #[must_use]
    pub fn is_hex(&self) -> bool {
        self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Uid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uid::new(s)
    }
}

/// Constant-time comparison implementation for Uid
impl PartialEq for Uid {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::hash::Hash for Uid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Wire protocol spoken by a terminal.
///
/// The type is immutable once assigned from the terminal list; `(ip, port)`
/// is the identity used for reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalType {
    Gat,
    Pocket,
    Sphinx,
    Jsp,
}

impl TerminalType {
    /// Parse a terminal type token; unrecognized tokens fall back to GAT,
    /// matching the terminal-list convention.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token.trim().to_lowercase().as_str() {
            "pocket" => TerminalType::Pocket,
            "sphinx" => TerminalType::Sphinx,
            "jsp" => TerminalType::Jsp,
            _ => TerminalType::Gat,
        }
    }

    /// Default TCP port for terminals of this type.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            TerminalType::Gat => 8000,
            TerminalType::Pocket => 8080,
            TerminalType::Sphinx => 3312,
            TerminalType::Jsp => 8902,
        }
    }
}

impl fmt::Display for TerminalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TerminalType::Gat => "gat",
            TerminalType::Pocket => "pocket",
            TerminalType::Sphinx => "sphinx",
            TerminalType::Jsp => "jsp",
        };
        write!(f, "{s}")
    }
}

/// Kind of credential that initiated a session; selects the backend
/// `tagN` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagType {
    Rfid,
    Barcode,
    FaceId,
}

impl TagType {
    /// Numeric tag parameter for path-style backend dialects.
    #[must_use]
    pub fn as_num(self) -> u8 {
        match self {
            TagType::Rfid => 0,
            TagType::Barcode => 1,
            TagType::FaceId => 2,
        }
    }

    /// Query-parameter spelling for the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TagType::Rfid => "rfid",
            TagType::Barcode => "qr",
            TagType::FaceId => "faceid",
        }
    }
}

/// Remote access-policy check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KpoResult {
    Undef,
    Yes,
    No,
    Fail,
}

impl KpoResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KpoResult::Undef => "UNDEF",
            KpoResult::Yes => "YES",
            KpoResult::No => "NO",
            KpoResult::Fail => "FAIL",
        }
    }
}

/// Face-verification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CamResult {
    Undef,
    Yes,
    No,
    Fail,
    /// Person has no face card on the server
    Nf,
}

impl CamResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CamResult::Undef => "UNDEF",
            CamResult::Yes => "YES",
            CamResult::No => "NO",
            CamResult::Fail => "FAIL",
            CamResult::Nf => "NF",
        }
    }
}

/// Access-session lifecycle stage.
///
/// Stage transitions are sequential and monotone per session; a session
/// never re-enters an earlier stage. Validity is encoded in
/// [`can_transition_to`](SessionStage::can_transition_to) rather than in
/// the numeric order (the granted path legitimately goes
/// `LastAnswer -> Passed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    /// Session created; terminal is being locked and the backend check started.
    Init,
    /// Waiting for / acting on the backend (KPO) verdict.
    KpoResult,
    /// No gate and no camera: present the verdict directly.
    KpoDirect,
    /// Waiting for / acting on the face-verification verdict.
    CamResult,
    /// First door relay is being opened.
    OpenFirst,
    /// Waiting for passage through the first door.
    FirstPassed,
    /// Second door relay is being opened.
    OpenSecond,
    /// Waiting for passage through the second door.
    SecondPassed,
    /// Physical passage complete; report to the backend.
    Passed,
    /// Emit the final allow/deny frame.
    LastAnswer,
    /// Terminal state; the session has been logged exactly once.
    Done,
}

impl SessionStage {
    /// Check whether a transition to `target` is allowed from this stage.
    pub fn can_transition_to(self, target: SessionStage) -> bool {
        use SessionStage::*;
        matches!(
            (self, target),
            (Init, KpoResult)
                | (Init, LastAnswer)
                | (KpoResult, OpenFirst | CamResult | KpoDirect | LastAnswer)
                | (KpoDirect, LastAnswer)
                | (CamResult, OpenFirst | OpenSecond | LastAnswer)
                | (OpenFirst, FirstPassed)
                | (FirstPassed, CamResult | OpenSecond | LastAnswer)
                | (OpenSecond, SecondPassed)
                | (SecondPassed, Passed)
                | (Passed, Done)
                | (LastAnswer, Passed | Done)
        )
    }

    /// Returns `true` once the session can no longer advance.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStage::Done)
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SessionStage::Init => "INIT",
            SessionStage::KpoResult => "KPO_RESULT",
            SessionStage::KpoDirect => "KPO_DIRECT",
            SessionStage::CamResult => "CAM_RESULT",
            SessionStage::OpenFirst => "OPEN_FIRST",
            SessionStage::FirstPassed => "FIRST_PASSED",
            SessionStage::OpenSecond => "OPEN_SECOND",
            SessionStage::SecondPassed => "SECOND_PASSED",
            SessionStage::Passed => "PASSED",
            SessionStage::LastAnswer => "LAST_ANSWER",
            SessionStage::Done => "DONE",
        };
        write!(f, "{s}")
    }
}

/// Extra data attached to a session created from a GAT TIME-kind read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatSolar {
    pub terminal_kind: u8,
    pub time: Option<u16>,
    pub price: Option<u32>,
    pub vendor: Option<u32>,
    pub reg_query: bool,
}
