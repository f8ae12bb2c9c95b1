use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Frame errors: recovered by skipping one byte and retrying, never
    // surfaced to a session
    #[error("Invalid frame marker: expected 0x{expected:02X}, got 0x{actual:02X}")]
    InvalidMarker { expected: u8, actual: u8 },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Invalid frame length: {message}")]
    InvalidFrameLength { message: String },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {size} bytes exceeds maximum {max_size} bytes")]
    FrameTooLarge { size: usize, max_size: usize },

    // Link errors
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Connection closed: {key}: {reason}")]
    ConnectionClosed { key: String, reason: String },

    #[error("Connect failed for {key}: {reason}")]
    ConnectFailed { key: String, reason: String },

    // Backend errors
    #[error("Backend request failed: {0}")]
    Backend(String),

    #[error("Backend returned HTTP {status}")]
    BackendStatus { status: u16 },

    // Timeout errors
    #[error("{what} timed out after {seconds:.1} s")]
    Timeout { what: String, seconds: f64 },

    // Policy errors: the deny is the intended effect
    #[error("Access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("Terminal {key} locked by session {owner}")]
    TerminalLocked { key: String, owner: String },

    #[error("Terminal {key} is not locked by session {session}")]
    NotLockOwner { key: String, session: String },

    // Validation errors
    #[error("Invalid card format: {0}")]
    InvalidCardFormat(String),

    #[error("Invalid storage key: {0}")]
    InvalidStorageKey(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field format: {message}")]
    InvalidFieldFormat { message: String },

    // Configuration errors: fail fast at boot
    #[error("Configuration error: {0}")]
    Config(String),

    // Fatal: invariant violation; the affected session is terminated
    // defensively, the daemon keeps running
    #[error("Invalid stage transition from {from} to {to}")]
    StageRegression { from: String, to: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for frame-level errors that are recovered by
    /// resynchronising the stream instead of propagating.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidMarker { .. }
                | Error::ChecksumMismatch { .. }
                | Error::InvalidFrameLength { .. }
                | Error::MalformedFrame(_)
                | Error::FrameTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
