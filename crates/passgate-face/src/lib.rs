//! Clients for the face server.
//!
//! Two independent modes:
//!
//! - **Verification** ([`verify`]): one WebSocket per pending session
//!   asking "is the person at this camera the expected client?". The
//!   server answers with a verdict event; correlation updates stream in
//!   the meantime.
//! - **Identification** ([`ident`]): a background REST poller that asks
//!   "who did any camera just see?" and synthesises access sessions from
//!   fresh identifications.

pub mod ident;
pub mod verify;

pub use ident::{IdentCommand, IdentEvent, spawn_poller};
pub use verify::{VerifyClient, VerifyEvent, VerifyRequestInfo};
