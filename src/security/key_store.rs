use super::ApiKeyRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home of API key records. The manager caches on top of it.
pub trait KeyStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError>;
    fn save(&self, record: &ApiKeyRecord) -> Result<(), KeyStoreError>;
    fn list(&self) -> Result<Vec<ApiKeyRecord>, KeyStoreError>;
}

#[derive(Default)]
pub struct MemoryKeyStore {
    records: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self, id: &str) -> Result<Option<ApiKeyRecord>, KeyStoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn save(&self, record: &ApiKeyRecord) -> Result<(), KeyStoreError> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<ApiKeyRecord>, KeyStoreError> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
