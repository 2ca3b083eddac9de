//! # Storage
//!
//! A small key/value contract (SPEC_FULL.md §4.2) with two implementations:
//! [`BrowserStorage`] (wasm32, backed by `window.localStorage`) and
//! [`MemoryStorage`] (every target, used for native tests and as a
//! same-origin fallback when `localStorage` is unavailable).
//!
//! Consumers must tolerate `get` returning `None` on I/O failure rather
//! than propagating an error — quota/backend failures are reported through
//! `set`/`remove` instead (SPEC_FULL.md §7 "Storage errors").

#[cfg(target_arch = "wasm32")]
mod browser;
mod memory;

#[cfg(target_arch = "wasm32")]
pub use browser::BrowserStorage;
pub use memory::MemoryStorage;

use crate::error::Result;

/// Abstract key/value store. Implementations must tolerate concurrent
/// readers/writers only in the weak sense described by SPEC_FULL.md §5:
/// the Tab registry re-reads before every write rather than relying on the
/// store itself to serialize read-modify-write sequences.
pub trait Storage {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn key_at(&self, index: usize) -> Option<String>;
    fn length(&self) -> usize;
}

/// Well-known persistence keys (SPEC_FULL.md §6).
pub mod keys {
    pub const NAME: &str = "name";
    pub const DISPLAY_NAME: &str = "rtchat_name";
    pub const TOPIC: &str = "topic";
    pub const PRIVATE_KEY_STRING: &str = "privateKeyString";
    pub const PUBLIC_KEY_STRING: &str = "publicKeyString";
    pub const KNOWN_HOSTS_STRINGS: &str = "knownHostsStrings";
    pub const TABS: &str = "tabs";
    pub const AUTO_ACCEPT: &str = "rtchat_autoAccept";

    pub fn tab_poll(id: u32) -> String {
        format!("tabpoll_{id}")
    }
}
