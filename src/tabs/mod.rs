//! # Tab registry
//!
//! Assigns a unique short tab-id per concurrent instance of the library in
//! the same origin, for disambiguating the display name (SPEC_FULL.md
//! §4.4). The tab-id is composed into the public name as `name(tabID)`.

use crate::platform;
use crate::storage::{keys, Storage};
use crate::time::now_timestamp;
use std::rc::Rc;

pub struct TabRegistry<S: Storage> {
    storage: Rc<S>,
    id: u32,
    timeout_s: u32,
    interval: Option<platform::IntervalHandle>,
}

impl<S: Storage + 'static> TabRegistry<S> {
    /// Purge stale entries, claim the lowest free id, and start the
    /// keep-alive writer. Returns `None` (no registry at all) when `tabs`
    /// is disabled in configuration.
    pub fn new(storage: Rc<S>, poll_interval_ms: u32, timeout_s: u32) -> Self {
        let mut ids = read_tab_ids(&storage);
        purge_stale(&storage, &mut ids, timeout_s);

        let id = lowest_free_id(&ids);
        ids.push(id);
        write_tab_ids(&storage, &ids);
        touch(&storage, id);

        let storage_for_interval = storage.clone();
        let interval = platform::run_interval(poll_interval_ms, move || {
            touch(&storage_for_interval, id);
            true
        });

        TabRegistry { storage, id, timeout_s, interval: Some(interval) }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn timeout_s(&self) -> u32 {
        self.timeout_s
    }

    /// `name(tabID)`, or the bare name when disambiguation is disabled.
    pub fn public_name(&self, base_name: &str) -> String {
        format!("{}({})", base_name, self.id)
    }
}

impl<S: Storage> Drop for TabRegistry<S> {
    fn drop(&mut self) {
        if let Some(interval) = self.interval.take() {
            interval.cancel();
        }
        let mut ids = read_tab_ids(&*self.storage);
        ids.retain(|id| *id != self.id);
        write_tab_ids(&*self.storage, &ids);
        let _ = self.storage.remove(&keys::tab_poll(self.id));
    }
}

fn read_tab_ids(storage: &impl Storage) -> Vec<u32> {
    storage
        .get(keys::TABS)
        .and_then(|raw| serde_json::from_str::<Vec<u32>>(&raw).ok())
        .unwrap_or_default()
}

fn write_tab_ids(storage: &impl Storage, ids: &[u32]) {
    if let Ok(raw) = serde_json::to_string(ids) {
        let _ = storage.set(keys::TABS, &raw);
    }
}

fn touch(storage: &impl Storage, id: u32) {
    let _ = storage.set(&keys::tab_poll(id), &now_timestamp().to_string());
}

fn purge_stale(storage: &impl Storage, ids: &mut Vec<u32>, timeout_s: u32) {
    let now = now_timestamp();
    ids.retain(|id| {
        let last = storage
            .get(&keys::tab_poll(*id))
            .and_then(|raw| raw.parse::<i64>().ok());
        match last {
            Some(ts) if now - ts < timeout_s as i64 => true,
            _ => {
                let _ = storage.remove(&keys::tab_poll(*id));
                false
            }
        }
    });
    write_tab_ids(storage, ids);
}

fn lowest_free_id(existing: &[u32]) -> u32 {
    let mut candidate = 0u32;
    loop {
        if !existing.contains(&candidate) {
            return candidate;
        }
        candidate += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn first_tab_claims_id_zero() {
        let storage = Rc::new(MemoryStorage::new());
        let tabs = TabRegistry::new(storage, 60_000, 15);
        assert_eq!(tabs.id(), 0);
        assert_eq!(tabs.public_name("alice"), "alice(0)");
    }

    #[test]
    fn second_concurrent_tab_claims_lowest_free_id() {
        let storage = Rc::new(MemoryStorage::new());
        let tab_a = TabRegistry::new(storage.clone(), 60_000, 15);
        let tab_b = TabRegistry::new(storage, 60_000, 15);
        assert_eq!(tab_a.id(), 0);
        assert_eq!(tab_b.id(), 1);
    }

    #[test]
    fn dropping_a_tab_frees_its_id() {
        let storage = Rc::new(MemoryStorage::new());
        let tab_a = TabRegistry::new(storage.clone(), 60_000, 15);
        assert_eq!(tab_a.id(), 0);
        drop(tab_a);
        let tab_b = TabRegistry::new(storage, 60_000, 15);
        assert_eq!(tab_b.id(), 0);
    }

    #[test]
    fn stale_entries_with_no_keepalive_are_purged_on_construction() {
        let storage = Rc::new(MemoryStorage::new());
        // Simulate a crashed tab: registered, but no keep-alive timestamp.
        storage.set(keys::TABS, "[0]").unwrap();
        let tab = TabRegistry::new(storage, 60_000, 15);
        assert_eq!(tab.id(), 0, "the stale id 0 should have been purged and reclaimed");
    }

    #[test]
    fn stale_entries_older_than_timeout_are_purged() {
        let storage = Rc::new(MemoryStorage::new());
        storage.set(keys::TABS, "[0]").unwrap();
        storage.set(&keys::tab_poll(0), &(now_timestamp() - 1000).to_string()).unwrap();
        let tab = TabRegistry::new(storage, 60_000, 15);
        assert_eq!(tab.id(), 0);
    }
}
