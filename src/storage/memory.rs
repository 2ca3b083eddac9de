use super::Storage;
use crate::error::Result;
use indexmap::IndexMap;
use std::cell::RefCell;

/// An in-process key/value store, insertion-ordered so `key_at` has the
/// same stable semantics as `localStorage.key(i)`.
#[derive(Default)]
pub struct MemoryStorage {
    map: RefCell<IndexMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.borrow_mut().shift_remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.map.borrow_mut().clear();
        Ok(())
    }

    fn key_at(&self, index: usize) -> Option<String> {
        self.map.borrow().get_index(index).map(|(k, _)| k.clone())
    }

    fn length(&self) -> usize {
        self.map.borrow().len()
    }
}
