pub mod cardlist;
pub mod memreg;

pub use cardlist::{CardEntry, CardList, SyncDiff};
pub use memreg::{MemRegAction, MemRegKey, MemRegMode, MemRegStore, deny_message, device_message};
