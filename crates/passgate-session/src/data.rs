//! Typed session state.
//!
//! Inputs and sub-results are plain records aggregated by [`SessionData`];
//! each one is present only when the corresponding step happened.

use chrono::{DateTime, Local};
use passgate_core::{CamResult, GatSolar, KpoResult, LockerInfo, SessionStage, TagType, Uid};
use serde::Serialize;
use std::time::Instant;

/// Card / bracelet read that started the session.
#[derive(Debug, Clone, Serialize)]
pub struct RfidInput {
    pub uid: Uid,
    pub reader_type: u8,
    pub auth: bool,
    pub lockers: Vec<LockerInfo>,
    pub temp_card: bool,
}

/// Camera identification that started the session.
#[derive(Debug, Clone, Serialize)]
pub struct FaceIdInput {
    pub pid: String,
    pub fio: String,
    pub cam_id: String,
    pub score: f64,
    /// Raw identification payload, kept for the audit trail
    pub raw: serde_json::Value,
}

/// Barcode / QR read that started the session.
#[derive(Debug, Clone, Serialize)]
pub struct BarcodeInput {
    pub data: String,
}

/// Backend (KPO) verdict.
#[derive(Debug, Clone, Serialize)]
pub struct KpoOutcome {
    pub result: KpoResult,
    pub message: String,
}

impl Default for KpoOutcome {
    fn default() -> Self {
        KpoOutcome {
            result: KpoResult::Undef,
            message: String::new(),
        }
    }
}

/// Face-verification verdict and progress.
#[derive(Debug, Clone, Serialize)]
pub struct CamOutcome {
    pub result: CamResult,
    pub message: String,
    /// Diagnostic tag carried into the answer data, e.g. "idle_timeout"
    pub answer: Option<String>,
    /// Best correlation percentage seen so far
    pub max_correlation: Option<u8>,
}

impl Default for CamOutcome {
    fn default() -> Self {
        CamOutcome {
            result: CamResult::Undef,
            message: String::new(),
            answer: None,
            max_correlation: None,
        }
    }
}

/// Physical passage through one gate.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PassOutcome {
    pub passed: bool,
    pub timed_out: bool,
}

/// Which asynchronous step a pending [`Wait`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitKind {
    Kpo,
    Cam,
    Pass,
}

/// A pending asynchronous step. The session does not advance beyond its
/// current wait until the step resolves or the deadline fires.
#[derive(Debug, Clone)]
pub struct Wait {
    pub kind: WaitKind,
    pub expires_at: Instant,
    /// Gate the wait listens on: "first" or "second" (Pass waits only)
    pub gate: Option<&'static str>,
}

/// Everything a session accumulates while it runs.
#[derive(Debug, Default, Serialize)]
pub struct SessionData {
    pub rfid: Option<RfidInput>,
    pub faceid: Option<FaceIdInput>,
    pub barcode: Option<BarcodeInput>,
    pub kpo: KpoOutcome,
    pub cam: CamOutcome,
    /// Outstanding face-verification request id, for event correlation
    pub cam_request: Option<String>,
    pub passed_first: Option<PassOutcome>,
    pub passed_second: Option<PassOutcome>,
    pub gat_solar: Option<GatSolar>,
    /// SPHINX delegation ticket and access type, echoed in the reply
    pub sphinx_ticket: Option<(String, String)>,
    /// Final verdict; `None` until decided
    pub granted: Option<bool>,
    /// Final display message
    pub message: String,
    /// Suppress the backend report (identification auto-pass)
    pub no_report: bool,
}

/// What started the session.
#[derive(Debug)]
pub enum SessionInput {
    Rfid(RfidInput),
    Barcode(BarcodeInput),
    FaceId {
        input: FaceIdInput,
        /// Pre-resolved KPO verdict for `no_kpo_pass` identification
        prefilled_kpo: Option<KpoOutcome>,
    },
    SphinxDelegation {
        uid: Uid,
        ticket: String,
        access_type: String,
    },
}

impl SessionInput {
    #[must_use]
    pub fn tag_type(&self) -> TagType {
        match self {
            SessionInput::Rfid(_) | SessionInput::SphinxDelegation { .. } => TagType::Rfid,
            SessionInput::Barcode(_) => TagType::Barcode,
            SessionInput::FaceId { .. } => TagType::FaceId,
        }
    }
}

/// One access session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub terminal_key: String,
    pub uid: Uid,
    pub cid: Option<String>,
    pub tag_type: TagType,
    pub stage: SessionStage,
    pub req_time: DateTime<Local>,
    pub started: Instant,
    pub data: SessionData,
    pub wait: Option<Wait>,
    pub processed: bool,
    pub completed: bool,
    pub report_sent: bool,
    /// Set once the session row has been handed to the persistence sink
    pub logged: bool,
}

impl Session {
    /// A session is active while it can still affect its terminal.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.completed && !self.stage.is_terminal()
    }
}
