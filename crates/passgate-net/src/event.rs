//! Events flowing through the pool's control plane.

use bytes::Bytes;
use passgate_core::{GatSolar, LockerInfo, TagType, Uid};
use passgate_protocol::sphinx::DelegationRequest;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Which listener accepted an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// The main terminal listener; protocol is detected from traffic.
    Main,
    /// The dedicated JSP listener.
    Jsp,
}

/// Raw transport events delivered to the orchestrator's mailbox by
/// listener, dial and reader tasks.
#[derive(Debug)]
pub enum PoolEvent {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
        listener: ListenerKind,
    },
    DialDone {
        key: String,
        result: std::result::Result<TcpStream, String>,
    },
    Data {
        key: String,
        bytes: Bytes,
    },
    Closed {
        key: String,
        reason: String,
    },
}

/// Decoded protocol activity handed to access-action dispatch.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A credential was presented at a terminal.
    TagRead {
        key: String,
        uid: Uid,
        reader_type: u8,
        auth: bool,
        lockers: Vec<LockerInfo>,
        temp_card: bool,
        tag_type: TagType,
        /// Present for GAT TIME-kind reads
        gat_solar: Option<GatSolar>,
    },
    /// A person physically passed (or a gate input changed).
    PassReport { key: String, passed: bool },
    /// A SPHINX server delegated an access decision to us.
    Delegation {
        key: String,
        request: DelegationRequest,
    },
}
