//! Asynchronous audit pipeline.
//!
//! A bounded channel with exactly one producer-side path and one consumer
//! task. Backpressure is expressed by refusing enqueues, never by blocking
//! the request that produced the entry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::warn;

use super::store::AuditStore;
use super::NewAuditEntry;

const DRAIN_INTERVAL: Duration = Duration::from_millis(1000);
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_BATCH: usize = 10;

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Shared {
    store: Arc<dyn AuditStore>,
    receiver: Mutex<mpsc::Receiver<NewAuditEntry>>,
    depth: AtomicUsize,
}

impl Shared {
    /// Removes up to [`DRAIN_BATCH`] entries and inserts them concurrently.
    /// A failed insert is logged and swallowed so one bad entry cannot
    /// poison the batch. Returns how many entries were taken.
    async fn drain_batch(&self) -> usize {
        let mut batch = Vec::with_capacity(DRAIN_BATCH);
        {
            let mut receiver = self.receiver.lock().await;
            while batch.len() < DRAIN_BATCH {
                match receiver.try_recv() {
                    Ok(entry) => batch.push(entry),
                    Err(_) => break,
                }
            }
        }

        if batch.is_empty() {
            return 0;
        }

        self.depth.fetch_sub(batch.len(), Ordering::Relaxed);

        let inserts = batch.iter().map(|entry| {
            let store = Arc::clone(&self.store);
            async move {
                if let Err(err) = store.insert(entry).await {
                    warn!(request_id = %entry.request_id, error = %err, "audit insert failed, entry lost");
                }
            }
        });
        join_all(inserts).await;

        batch.len()
    }
}

/// Best-effort audit sink. Asynchronous mode drops entries with a warning
/// when the queue is full; synchronous mode awaits every insert inline and
/// never starts the drainer.
pub struct AuditLogger {
    shared: Arc<Shared>,
    sender: mpsc::Sender<NewAuditEntry>,
    asynchronous: bool,
    _drainer: Option<AbortOnDrop>,
}

impl AuditLogger {
    pub fn asynchronous(store: Arc<dyn AuditStore>, capacity: usize) -> Self {
        Self::build(store, capacity, true, true)
    }

    pub fn synchronous(store: Arc<dyn AuditStore>) -> Self {
        Self::build(store, 1, false, false)
    }

    /// Asynchronous queue without the drainer, for tests that need the
    /// backlog to hold still while they measure it.
    #[cfg(test)]
    pub(crate) fn asynchronous_paused(store: Arc<dyn AuditStore>, capacity: usize) -> Self {
        Self::build(store, capacity, true, false)
    }

    fn build(
        store: Arc<dyn AuditStore>,
        capacity: usize,
        asynchronous: bool,
        spawn_drainer: bool,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            store,
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        });

        let drainer = (asynchronous && spawn_drainer).then(|| {
            let shared = Arc::clone(&shared);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    shared.drain_batch().await;
                }
            });
            AbortOnDrop(handle.abort_handle())
        });

        Self {
            shared,
            sender,
            asynchronous,
            _drainer: drainer,
        }
    }

    /// Hands an entry to the pipeline. Never delays or fails the request:
    /// a full queue drops the entry with a warning.
    pub async fn log(&self, entry: NewAuditEntry) {
        if !self.asynchronous {
            if let Err(err) = self.shared.store.insert(&entry).await {
                warn!(request_id = %entry.request_id, error = %err, "audit insert failed, entry lost");
            }
            return;
        }

        // Count before sending: the drainer may pop the entry the moment
        // it lands, and its decrement must never observe a stale zero.
        self.shared.depth.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                self.shared.depth.fetch_sub(1, Ordering::Relaxed);
                warn!(request_id = %entry.request_id, "audit queue full, dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                self.shared.depth.fetch_sub(1, Ordering::Relaxed);
                warn!(request_id = %entry.request_id, "audit queue closed, dropping entry");
            }
        }
    }

    /// Drains the queue to empty, sleeping between iterations. Called
    /// during shutdown; bounded by the coordinator's ceiling, not here.
    pub async fn flush(&self) {
        if !self.asynchronous {
            return;
        }
        loop {
            let taken = self.shared.drain_batch().await;
            if taken == 0 && self.size() == 0 {
                return;
            }
            tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        }
    }

    /// Current queue depth, exposed as a gauge.
    pub fn size(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;

    use super::*;
    use crate::audit::store::AuditStoreError;
    use crate::audit::{AuditEntry, AuditFilter, AuditStats};

    #[derive(Default)]
    struct MemoryStore {
        rows: StdMutex<Vec<NewAuditEntry>>,
        fail_inserts: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl AuditStore for MemoryStore {
        async fn insert(&self, entry: &NewAuditEntry) -> Result<i64, AuditStoreError> {
            if self.fail_inserts.load(Ordering::Relaxed) {
                return Err(AuditStoreError::Sqlx(sqlx::Error::PoolClosed));
            }
            let mut rows = self.rows.lock().unwrap();
            rows.push(entry.clone());
            Ok(rows.len() as i64)
        }

        async fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError> {
            Ok(Vec::new())
        }

        async fn erase_by_caller(&self, _fingerprint: &str) -> Result<u64, AuditStoreError> {
            Ok(0)
        }

        async fn sweep_expired(&self) -> Result<u64, AuditStoreError> {
            Ok(0)
        }

        async fn stats_over(
            &self,
            _from: chrono::DateTime<Utc>,
            _to: chrono::DateTime<Utc>,
        ) -> Result<AuditStats, AuditStoreError> {
            Err(AuditStoreError::Sqlx(sqlx::Error::PoolClosed))
        }

        async fn health(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn entry(request_id: &str) -> NewAuditEntry {
        NewAuditEntry {
            request_id: request_id.to_string(),
            ts: Utc::now(),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            client_ip_hash: "hash".to_string(),
            user_agent_hash: None,
            api_key_hash: None,
            request_bytes: 0,
            response_status: 200,
            response_bytes: 0,
            latency_ms: 1,
            is_blocked: false,
            block_reason: None,
            detected_issues_count: 0,
            security_confidence: None,
            llm_provider: None,
            llm_model: None,
            metadata: serde_json::json!({}),
            retention_until: Utc::now(),
        }
    }

    #[tokio::test]
    async fn overflow_drops_exactly_the_excess() {
        let store = Arc::new(MemoryStore::default());
        let logger = AuditLogger::asynchronous_paused(store.clone(), 4);

        for i in 0..10 {
            logger.log(entry(&format!("req-{i}"))).await;
        }

        // Capacity 4: six entries were refused, none blocked the caller.
        assert_eq!(logger.size(), 4);
        assert!(store.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_drains_everything_into_the_store() {
        let store = Arc::new(MemoryStore::default());
        let logger = AuditLogger::asynchronous_paused(store.clone(), 64);

        for i in 0..25 {
            logger.log(entry(&format!("req-{i}"))).await;
        }
        logger.flush().await;

        assert_eq!(logger.size(), 0);
        assert_eq!(store.rows.lock().unwrap().len(), 25);
    }

    #[tokio::test]
    async fn failed_insert_does_not_poison_the_batch() {
        let store = Arc::new(MemoryStore::default());
        let logger = AuditLogger::asynchronous_paused(store.clone(), 64);

        store.fail_inserts.store(true, Ordering::Relaxed);
        logger.log(entry("req-lost")).await;
        logger.flush().await;

        store.fail_inserts.store(false, Ordering::Relaxed);
        logger.log(entry("req-kept")).await;
        logger.flush().await;

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_id, "req-kept");
    }

    #[tokio::test]
    async fn synchronous_mode_writes_inline() {
        let store = Arc::new(MemoryStore::default());
        let logger = AuditLogger::synchronous(store.clone());

        logger.log(entry("req-sync")).await;

        assert_eq!(store.rows.lock().unwrap().len(), 1);
        assert_eq!(logger.size(), 0);
    }

    #[tokio::test]
    async fn drainer_empties_the_queue_on_its_own() {
        let store = Arc::new(MemoryStore::default());
        let logger = AuditLogger::asynchronous(store.clone(), 64);

        for i in 0..5 {
            logger.log(entry(&format!("req-{i}"))).await;
        }

        for _ in 0..50 {
            if store.rows.lock().unwrap().len() == 5 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("drainer never caught up");
    }
}
