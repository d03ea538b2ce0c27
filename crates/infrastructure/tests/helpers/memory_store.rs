#![allow(dead_code)]
use async_trait::async_trait;
use fdyn_domain::DomainError;
use fdyn_infrastructure::dns::rewrite::AddressStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory address store that records every key it is asked for.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    asked: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        let store = Self::default();
        for (key, value) in entries {
            store.insert(key, value);
        }
        store
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DomainError> {
        self.asked.lock().unwrap().push(key.to_string());
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
