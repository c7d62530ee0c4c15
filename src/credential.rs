use std::sync::{PoisonError, RwLock};

/// The single API key used for model calls. Read once when a run starts.
#[derive(Debug, Default)]
pub struct CredentialStore {
    key: RwLock<Option<String>>,
}

impl CredentialStore {
    pub fn new(initial: Option<String>) -> Self {
        let store = Self::default();
        if let Some(key) = initial {
            store.set(&key);
        }
        store
    }

    pub fn get(&self) -> Option<String> {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns `false` and leaves the store untouched for a blank key.
    pub fn set(&self, key: &str) -> bool {
        let key = key.trim();
        if key.is_empty() {
            return false;
        }
        *self.key.write().unwrap_or_else(PoisonError::into_inner) = Some(key.to_string());
        true
    }

    pub fn clear(&self) {
        self.key.write().unwrap_or_else(PoisonError::into_inner).take();
    }
}
