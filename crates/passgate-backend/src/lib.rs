//! Plain-HTTP client for the business backend (the KPO).
//!
//! One client serialises all backend traffic per configured base URL.
//! The URL shape is selected by `url_fmt_suff`; see [`dialect`] for the
//! supported families. Every request retries up to the configured count
//! with a fixed delay, carries a browser user agent plus the configured
//! extra headers, and times out at `service_request_expire_time`.

pub mod client;
pub mod dialect;

pub use client::{AccessDecision, BackendClient};
