use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;

use super::{AggregatedReading, RemoteStore, Result};
use crate::config::BoardConfig;

/// Retries transient failures of another store at a fixed interval.
///
/// Log uploads are best effort and get a single attempt.
pub struct RetryingStore {
    inner: Arc<dyn RemoteStore>,
    attempts: u32,
    interval: Duration,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn RemoteStore>, attempts: u32, interval: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            interval,
        }
    }

    async fn retry<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{} succeeded after {} attempts", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    log::warn!(
                        "{} failed: {} (attempt {}/{}), retrying in {:?}",
                        operation,
                        e,
                        attempt,
                        self.attempts,
                        self.interval
                    );
                    tokio::time::sleep(self.interval).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("{} failed: {}", operation, e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl RemoteStore for RetryingStore {
    async fn fetch_config(&self, id: &str) -> Result<Option<BoardConfig>> {
        self.retry("Fetching configuration", || self.inner.fetch_config(id)).await
    }

    async fn upsert_config(&self, id: &str, config: &BoardConfig) -> Result<()> {
        self.retry("Saving configuration", || self.inner.upsert_config(id, config)).await
    }

    async fn insert_reading(&self, reading: &AggregatedReading) -> Result<()> {
        self.retry("Inserting reading", || self.inner.insert_reading(reading)).await
    }

    async fn upload_log(&self, id: &str, contents: &str) -> Result<()> {
        self.inner.upload_log(id, contents).await
    }
}
