//! Known-hosts table: the durable binding from a peer's bare name to the
//! public-key string it last presented. Lives in [`crate::storage`] under
//! [`crate::storage::keys::KNOWN_HOSTS_STRINGS`] as a single JSON object.

use crate::error::{Error, Result};
use crate::storage::{keys, Storage};
use std::collections::HashMap;

/// Strips the tab-disambiguation suffix (`"(3)"`) and any trailing
/// `name|publicKeyString` identity tail, leaving the bare display name a
/// peer is known by.
pub fn barename(name: &str) -> String {
    let without_identity = name.split('|').next().unwrap_or(name);
    match without_identity.rfind('(') {
        Some(idx) if without_identity.ends_with(')') => without_identity[..idx].to_string(),
        _ => without_identity.to_string(),
    }
}

fn read_table(storage: &dyn Storage) -> HashMap<String, String> {
    storage
        .get(keys::KNOWN_HOSTS_STRINGS)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn write_table(storage: &dyn Storage, table: &HashMap<String, String>) -> Result<()> {
    let raw = serde_json::to_string(table)?;
    storage.set(keys::KNOWN_HOSTS_STRINGS, &raw)
}

/// Every name currently bound to a public key.
pub fn peer_names(storage: &dyn Storage) -> Vec<String> {
    read_table(storage).into_keys().collect()
}

/// The full known-hosts table, name -> public-key JWK string.
pub fn known_hosts(storage: &dyn Storage) -> HashMap<String, String> {
    read_table(storage)
}

pub fn get_public_key(storage: &dyn Storage, name: &str) -> Option<String> {
    read_table(storage).get(&barename(name)).cloned()
}

/// Unconditionally (re)binds `name` to `public_key_string`. Used for initial
/// save and for the explicit rebind flow; never called implicitly by
/// [`register`].
pub fn save_public_key(storage: &dyn Storage, name: &str, public_key_string: &str) -> Result<()> {
    let mut table = read_table(storage);
    table.insert(barename(name), public_key_string.to_string());
    write_table(storage, &table)
}

pub fn remove_public_key(storage: &dyn Storage, name: &str) -> Result<()> {
    let mut table = read_table(storage);
    table.remove(&barename(name));
    write_table(storage, &table)
}

/// Binds `name` to `public_key_string` for the first time. If `name` is
/// already bound to a *different* key, this is a conflict: names are not
/// silently rebound. Use [`rebind`] to move a binding to a new name on
/// purpose.
pub fn register(storage: &dyn Storage, name: &str, public_key_string: &str) -> Result<()> {
    let bare = barename(name);
    let table = read_table(storage);
    if let Some(existing) = table.get(&bare) {
        if existing != public_key_string {
            return Err(Error::KeyBindingConflict { name: bare });
        }
        return Ok(());
    }
    save_public_key(storage, &bare, public_key_string)
}

/// Explicitly moves the binding for `old_name`'s key to `new_name`,
/// overwriting whatever `new_name` was previously bound to. This is the
/// only way a binding moves to a different name.
pub fn rebind(storage: &dyn Storage, old_name: &str, new_name: &str) -> Result<()> {
    let mut table = read_table(storage);
    let Some(key) = table.remove(&barename(old_name)) else {
        return Err(Error::UnknownPeer { peer: old_name.to_string() });
    };
    table.insert(barename(new_name), key);
    write_table(storage, &table)
}
