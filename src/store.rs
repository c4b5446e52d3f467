//! Durable key-value storage boundary.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::Result;

/// Byte-level store addressed by `(namespace, key)`.
pub trait Store: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;
}

/// JSON helpers available on every [`Store`].
pub trait StoreExt: Store {
    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        self.set(namespace, key, serde_json::to_vec(value)?)
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// In-memory store (intended for tests).
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read();
        Ok(entries.get(&(namespace.to_owned(), key.to_owned())).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries
            .write()
            .insert((namespace.to_owned(), key.to_owned()), value);
        Ok(())
    }
}
