//! The access-session state machine.
//!
//! A session is created from a credential read, walks the
//! check / verify / open / confirm / report lifecycle, and is logged
//! exactly once on completion. The manager owns every session and is
//! advanced only from the orchestrator's idle tick and typed events;
//! asynchronous steps (backend check, face verification, physical pass)
//! are represented as [`data::Wait`] records resolved by the tick.

pub mod data;
pub mod link;
pub mod manager;

pub use data::{
    BarcodeInput, CamOutcome, FaceIdInput, KpoOutcome, PassOutcome, RfidInput, Session,
    SessionInput, Wait, WaitKind,
};
pub use link::{GTimeRecord, GTimeSink, SessionRow, SessionSink, TerminalLink};
pub use manager::{SessionManager, SideRequest};
