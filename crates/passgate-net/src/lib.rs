//! The terminal connection pool.
//!
//! The pool owns every socket. Each connection gets a reader task and a
//! writer task; every effect on shared state funnels through the
//! orchestrator's control loop as a [`PoolEvent`]. Decoded frames become
//! [`GatewayEvent`]s for access-action dispatch.

pub mod connection;
pub mod event;
pub mod pool;

pub use connection::{ConnState, ConnectionInfo, ReconnectionInfo};
pub use event::{GatewayEvent, ListenerKind, PoolEvent};
pub use pool::Pool;
