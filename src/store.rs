use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// The atomic primitives the lock protocol needs from a key-value store.
///
/// Every call is expected to be a single atomic round trip with
/// read-your-write consistency per key. No multi-key transactions.
pub trait Store: Send + Sync {
    /// Sets `key` to `value` only if it is absent. Returns true if the key was set.
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Sets `key` to `value` unconditionally, returning the value it replaced.
    fn swap(&self, key: &str, value: &str) -> Result<Option<String>>;

    /// Removes `key`. No-op if absent.
    fn delete(&self, key: &str) -> Result<()>;

    /// Removes `key` only if it currently holds `value`. Returns true if removed.
    fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;
}

/// In-process [`Store`]. A single mutex guards the map, so every primitive
/// is linearizable across threads sharing the same instance.
#[derive(Debug, Default)]
pub struct MemStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Unconditional write, outside the lock protocol.
    pub fn set(&self, key: &str, value: &str) {
        self.with_map(|m| {
            m.insert(key.to_string(), value.to_string());
        });
    }

    pub fn len(&self) -> usize {
        self.with_map(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> T {
        let mut m = self.map.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut m)
    }
}

impl Store for MemStore {
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.with_map(|m| {
            if m.contains_key(key) {
                return false;
            }

            m.insert(key.to_string(), value.to_string());
            true
        }))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_map(|m| m.get(key).cloned()))
    }

    fn swap(&self, key: &str, value: &str) -> Result<Option<String>> {
        Ok(self.with_map(|m| m.insert(key.to_string(), value.to_string())))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.with_map(|m| m.remove(key));
        Ok(())
    }

    fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        Ok(self.with_map(|m| match m.get(key) {
            Some(v) if v == value => {
                m.remove(key);
                true
            }
            _ => false,
        }))
    }
}
