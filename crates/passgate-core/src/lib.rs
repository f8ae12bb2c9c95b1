pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod lockers;
pub mod terminal;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use lockers::LockerInfo;
pub use terminal::TerminalSettings;
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
