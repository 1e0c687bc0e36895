//! A cache of resolved keys, shared between contexts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::key::KeyHandle;


//------------ KeyCache ------------------------------------------------------

/// Maps key locators to the keys they resolved to.
///
/// Object handles stay valid for as long as the provider is loaded, so the
/// entries can be used by every context cloned from the same global one.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: Mutex<BTreeMap<String, KeyHandle>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, locator: &str) -> Option<KeyHandle> {
        self.keys.lock().unwrap().get(&normalize(locator)).cloned()
    }

    /// Adds a key unless the locator is cached already.
    ///
    /// Returns the key that is cached afterwards.
    pub fn insert(&self, locator: &str, key: KeyHandle) -> KeyHandle {
        self.keys
            .lock()
            .unwrap()
            .entry(normalize(locator))
            .or_insert(key)
            .clone()
    }

    pub fn remove(&self, locator: &str) -> Option<KeyHandle> {
        self.keys.lock().unwrap().remove(&normalize(locator))
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.keys.lock().unwrap().clear();
    }
}

fn normalize(locator: &str) -> String {
    locator.to_ascii_lowercase()
}


//------------ Tests ---------------------------------------------------------
