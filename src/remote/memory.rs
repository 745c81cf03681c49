//! In-process document store for tests and bench runs without a server.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;

use super::{AggregatedReading, RemoteError, RemoteStore, Result};
use crate::config::BoardConfig;

#[derive(Debug, Default)]
struct MemoryState {
    boards: HashMap<String, BoardConfig>,
    readings: Vec<AggregatedReading>,
    logs: HashMap<String, String>,
    failures_left: u32,
    insert_failures_left: u32,
}

/// Shared handle; clones see the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record the way an operator edit from the dashboard would
    pub fn put_config(&self, id: &str, config: BoardConfig) {
        self.lock().boards.insert(id.to_string(), config);
    }

    pub fn config(&self, id: &str) -> Option<BoardConfig> {
        self.lock().boards.get(id).cloned()
    }

    pub fn delete_config(&self, id: &str) {
        self.lock().boards.remove(id);
    }

    /// Ids of every stored configuration record
    pub fn config_ids(&self) -> Vec<String> {
        self.lock().boards.keys().cloned().collect()
    }

    pub fn readings(&self) -> Vec<AggregatedReading> {
        self.lock().readings.clone()
    }

    pub fn log(&self, id: &str) -> Option<String> {
        self.lock().logs.get(id).cloned()
    }

    /// Make the next `count` calls fail as if the server were unreachable
    pub fn fail_next(&self, count: u32) {
        self.lock().failures_left = count;
    }

    /// Make only the next `count` reading inserts fail
    pub fn fail_inserts(&self, count: u32) {
        self.lock().insert_failures_left = count;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(RemoteError::Unavailable("connection refused".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn fetch_config(&self, id: &str) -> Result<Option<BoardConfig>> {
        let state = self.begin()?;
        Ok(state.boards.get(id).cloned())
    }

    async fn upsert_config(&self, id: &str, config: &BoardConfig) -> Result<()> {
        let mut state = self.begin()?;
        state.boards.insert(id.to_string(), config.clone());
        Ok(())
    }

    async fn insert_reading(&self, reading: &AggregatedReading) -> Result<()> {
        let mut state = self.begin()?;
        if state.insert_failures_left > 0 {
            state.insert_failures_left -= 1;
            return Err(RemoteError::Unavailable("insert timed out".to_string()));
        }
        state.readings.push(reading.clone());
        Ok(())
    }

    async fn upload_log(&self, id: &str, contents: &str) -> Result<()> {
        self.begin()?.logs.insert(id.to_string(), contents.to_string());
        Ok(())
    }
}
