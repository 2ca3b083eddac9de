use super::Storage;
use crate::error::{Error, Result};

/// Backed by `window.localStorage`. Quota/availability failures are
/// surfaced as `Error::StorageUnavailable`/`Error::StorageQuotaExceeded`
/// from `set`; `get` always degrades to `None` on failure per
/// SPEC_FULL.md §4.2.
pub struct BrowserStorage {
    storage: web_sys::Storage,
}

impl BrowserStorage {
    pub fn new() -> Result<Self> {
        let window = web_sys::window()
            .ok_or_else(|| Error::StorageUnavailable("no window".into()))?;
        let storage = window
            .local_storage()
            .map_err(|_| Error::StorageUnavailable("localStorage threw".into()))?
            .ok_or_else(|| Error::StorageUnavailable("localStorage not available".into()))?;
        Ok(BrowserStorage { storage })
    }
}

impl Storage for BrowserStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.storage.get_item(key).ok().flatten()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.storage.set_item(key, value).map_err(|_| Error::StorageQuotaExceeded)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.storage
            .remove_item(key)
            .map_err(|_| Error::StorageUnavailable("removeItem threw".into()))
    }

    fn clear(&self) -> Result<()> {
        self.storage.clear().map_err(|_| Error::StorageUnavailable("clear threw".into()))
    }

    fn key_at(&self, index: usize) -> Option<String> {
        self.storage.key(index as u32).ok().flatten()
    }

    fn length(&self) -> usize {
        self.storage.length().unwrap_or(0) as usize
    }
}
