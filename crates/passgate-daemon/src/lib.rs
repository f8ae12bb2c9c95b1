//! passgate daemon: orchestration, dispatch and the process surface.

pub mod daemon;
pub mod dispatch;
pub mod logring;

pub use daemon::{Daemon, LogGTimeSink, LogSessionSink, StopHandle};
pub use logring::{LogRecord, LogRing, RingLayer};
