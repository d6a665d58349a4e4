//! The task store: per-bucket mirror queues plus storage lock counters,
//! snapshotted to a [`SnapshotStore`].
//!
//! Tasks stay in the store from enqueue until a worker reports them
//! finished, so a snapshot always contains everything not yet completed.
//! After a crash, in-flight tasks are replayed (at-least-once delivery).

use bytes::Bytes;
use metrics::{counter, gauge};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::snapshot::{SnapshotError, SnapshotStore};
use super::task::MirrorTask;

/// Key of the lock counter snapshot.
pub const STORAGE_LOCKS_KEY: &str = "storage_locks.json";

/// Snapshot key for the queue of `bucket`.
pub fn queue_key(bucket: &str) -> String {
    format!("{bucket}/queue.json")
}

/// A task handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: u64,
    pub queue: String,
    pub task: MirrorTask,
}

#[derive(Default)]
struct TaskQueue {
    pending: VecDeque<(u64, MirrorTask)>,
    in_flight: BTreeMap<u64, MirrorTask>,
    notify: Arc<Notify>,
}

impl TaskQueue {
    /// In-flight tasks first (they were dispatched earlier), then pending.
    fn snapshot(&self) -> Vec<MirrorTask> {
        self.in_flight
            .values()
            .chain(self.pending.iter().map(|(_, task)| task))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct StoreState {
    queues: BTreeMap<String, TaskQueue>,
    locks: BTreeMap<String, u64>,
    next_id: u64,
}

impl StoreState {
    fn push(&mut self, queue: &str, task: MirrorTask) {
        let id = self.next_id;
        self.next_id += 1;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .pending
            .push_back((id, task));
    }
}

pub struct TaskStore {
    state: Mutex<StoreState>,
    snapshots: Arc<dyn SnapshotStore>,
    /// Pending length above which enqueue warns about a backlog.
    backlog_warning: usize,
    shutdown: AtomicBool,
}

impl TaskStore {
    /// An empty store. Nothing is read from `snapshots`.
    pub fn new(snapshots: Arc<dyn SnapshotStore>, backlog_warning: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshots,
            backlog_warning,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Rebuild the store from the latest snapshot.
    ///
    /// Each queue in `queues` is checked with HEAD and fetched when present;
    /// missing snapshots are created empty. The lock counters are restored
    /// the same way.
    pub async fn open(
        snapshots: Arc<dyn SnapshotStore>,
        queues: impl IntoIterator<Item = String>,
        backlog_warning: usize,
    ) -> Result<Self, SnapshotError> {
        let store = Self::new(snapshots, backlog_warning);
        let mut restored = 0usize;
        {
            let mut state = store.state.lock().await;

            for queue in queues {
                let key = queue_key(&queue);
                state.queues.entry(queue.clone()).or_default();
                let tasks: Vec<MirrorTask> = match store.load(&key).await? {
                    Some(tasks) => tasks,
                    None => {
                        store.snapshots.put(&key, Bytes::from_static(b"[]")).await?;
                        Vec::new()
                    }
                };
                restored += tasks.len();
                for task in tasks {
                    state.push(&queue, task);
                }
            }

            let locks: Vec<(String, u64)> = match store.load(STORAGE_LOCKS_KEY).await? {
                Some(locks) => locks,
                None => {
                    store
                        .snapshots
                        .put(STORAGE_LOCKS_KEY, Bytes::from_static(b"[]"))
                        .await?;
                    Vec::new()
                }
            };
            for (storage, count) in locks {
                gauge!(crate::metrics::STORAGE_LOCKS, "storage" => storage.clone()).set(count as f64);
                state.locks.insert(storage, count);
            }
        }

        info!("Task store opened, {restored} task(s) restored");
        Ok(store)
    }

    async fn load<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, SnapshotError> {
        if !self.snapshots.head(key).await? {
            return Ok(None);
        }
        match self.snapshots.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Add `task` to its bucket's queue. Stamps a fresh nonce, bumps the
    /// destination's lock counter and wakes the queue's dispatcher.
    pub async fn enqueue(&self, mut task: MirrorTask) -> String {
        let nonce = uuid::Uuid::new_v4().to_string();
        task.nonce = nonce.clone();
        let queue = task.queue_name().to_string();
        let storage = task.backup_bucket.storage_key();
        let command = task.command.as_str();

        let mut state = self.state.lock().await;
        let lock_count = {
            let count = state.locks.entry(storage.clone()).or_insert(0);
            *count += 1;
            *count
        };
        state.push(&queue, task);

        let entry = state.queues.entry(queue.clone()).or_default();
        let pending = entry.pending.len();
        entry.notify.notify_one();
        drop(state);

        gauge!(crate::metrics::STORAGE_LOCKS, "storage" => storage.clone()).set(lock_count as f64);
        counter!(crate::metrics::MIRROR_TASKS_ENQUEUED_TOTAL, "command" => command).increment(1);
        debug!("Enqueued {command} for '{queue}' -> {storage} (nonce {nonce})");
        if pending > self.backlog_warning {
            warn!("Mirror queue '{queue}' has {pending} pending tasks");
        }
        nonce
    }

    /// Claim the next pending task of `queue` without waiting.
    pub async fn try_next(&self, queue: &str) -> Option<ClaimedTask> {
        let mut state = self.state.lock().await;
        let entry = state.queues.get_mut(queue)?;
        let (id, task) = entry.pending.pop_front()?;
        entry.in_flight.insert(id, task.clone());
        Some(ClaimedTask {
            id,
            queue: queue.to_string(),
            task,
        })
    }

    /// Wait for the next task of `queue`. Returns `None` once the store is
    /// shutting down.
    pub async fn next_task(&self, queue: &str) -> Option<ClaimedTask> {
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(claimed) = self.try_next(queue).await {
                return Some(claimed);
            }
            let notify = {
                let mut state = self.state.lock().await;
                state.queues.entry(queue.to_string()).or_default().notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Drop a claimed task once its worker is done, whatever the outcome.
    pub async fn finish(&self, queue: &str, id: u64) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.queues.get_mut(queue) {
            entry.in_flight.remove(&id);
        }
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.lock().await.queues.keys().cloned().collect()
    }

    /// Pending plus in-flight tasks of `queue`.
    pub async fn outstanding(&self, queue: &str) -> usize {
        let state = self.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.pending.len() + q.in_flight.len())
            .unwrap_or(0)
    }

    /// Outstanding tasks of `queue` in dispatch order.
    pub async fn tasks(&self, queue: &str) -> Vec<MirrorTask> {
        let state = self.state.lock().await;
        state.queues.get(queue).map(TaskQueue::snapshot).unwrap_or_default()
    }

    /// Tasks ever enqueued towards `storage`.
    pub async fn storage_lock(&self, storage: &str) -> u64 {
        self.state.lock().await.locks.get(storage).copied().unwrap_or(0)
    }

    /// Write every queue and the lock counters to the snapshot store.
    pub async fn sync_to_remote(&self) -> Result<(), SnapshotError> {
        let (queues, locks) = {
            let state = self.state.lock().await;
            let queues: Vec<(String, Vec<MirrorTask>)> = state
                .queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.snapshot()))
                .collect();
            let locks: Vec<(String, u64)> =
                state.locks.iter().map(|(k, v)| (k.clone(), *v)).collect();
            (queues, locks)
        };

        let result = self.write_snapshot(&queues, &locks).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        counter!(crate::metrics::TASK_STORE_SYNCS_TOTAL, "outcome" => outcome).increment(1);
        if result.is_ok() {
            let total: usize = queues.iter().map(|(_, tasks)| tasks.len()).sum();
            debug!("Task store synced ({total} outstanding task(s))");
        }
        result
    }

    async fn write_snapshot(
        &self,
        queues: &[(String, Vec<MirrorTask>)],
        locks: &[(String, u64)],
    ) -> Result<(), SnapshotError> {
        for (name, tasks) in queues {
            let body = serde_json::to_vec(tasks)?;
            self.snapshots.put(&queue_key(name), Bytes::from(body)).await?;
        }
        let body = serde_json::to_vec(locks)?;
        self.snapshots.put(STORAGE_LOCKS_KEY, Bytes::from(body)).await
    }

    /// Snapshot every `interval` until [`TaskStore::close`] is called.
    pub fn start_background_sync(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if store.is_shutdown() {
                    break;
                }
                if let Err(e) = store.sync_to_remote().await {
                    error!("Background task store sync failed: {e}");
                }
            }
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Stop handing out tasks and wake every waiting dispatcher.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let state = self.state.lock().await;
        for queue in state.queues.values() {
            queue.notify.notify_one();
        }
    }

    /// Shut down and take a final snapshot.
    pub async fn close(&self) -> Result<(), SnapshotError> {
        self.shutdown().await;
        self.sync_to_remote().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::fixtures::{s3_config, swift_config};
    use crate::buckets::Bucket;
    use crate::replication::snapshot::FileSnapshotStore;
    use crate::replication::task::MirrorCommand;
    use crate::request::ProxyRequest;
    use axum::http::{HeaderMap, Method};

    fn bucket() -> Bucket {
        Bucket::primary(
            "photos",
            "minio",
            s3_config("http://s3.local:9000", "photos"),
            vec![Bucket::replica(
                "photos-swift",
                "ovh",
                swift_config("http://keystone/v3", "photos"),
            )],
        )
    }

    fn task(key: &str) -> MirrorTask {
        let req = ProxyRequest::new(
            Method::PUT,
            &format!("/photos/{key}").parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
        );
        MirrorTask::for_replicas(&bucket(), MirrorCommand::PutObject, &req).remove(0)
    }

    fn file_store(dir: &tempfile::TempDir) -> Arc<dyn SnapshotStore> {
        Arc::new(FileSnapshotStore::new(dir.path()).unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_sets_nonce_and_counts_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(file_store(&dir), 16);

        let first = store.enqueue(task("a.png")).await;
        let second = store.enqueue(task("b.png")).await;
        assert_ne!(first, second);
        assert!(!first.is_empty());

        let storage = bucket().replicas[0].storage_key();
        assert_eq!(store.storage_lock(&storage).await, 2);
        assert_eq!(store.outstanding("photos").await, 2);
    }

    #[tokio::test]
    async fn test_claims_in_enqueue_order_and_lock_never_decrements() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(file_store(&dir), 16);
        store.enqueue(task("a.png")).await;
        store.enqueue(task("b.png")).await;

        let first = store.try_next("photos").await.unwrap();
        let second = store.try_next("photos").await.unwrap();
        assert!(first.task.original_request.url.ends_with("a.png"));
        assert!(second.task.original_request.url.ends_with("b.png"));
        assert!(store.try_next("photos").await.is_none());

        store.finish("photos", first.id).await;
        assert_eq!(store.outstanding("photos").await, 1);
        store.finish("photos", second.id).await;
        assert_eq!(store.outstanding("photos").await, 0);

        let storage = bucket().replicas[0].storage_key();
        assert_eq!(store.storage_lock(&storage).await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_restores_pending_and_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(file_store(&dir), 16);
        store.enqueue(task("a.png")).await;
        store.enqueue(task("b.png")).await;
        store.enqueue(task("c.png")).await;

        // a.png is in flight, c.png is finished.
        let a = store.try_next("photos").await.unwrap();
        let b = store.try_next("photos").await.unwrap();
        let c = store.try_next("photos").await.unwrap();
        store.finish("photos", c.id).await;
        drop((a, b));
        store.close().await.unwrap();

        let reopened = TaskStore::open(file_store(&dir), vec!["photos".to_string()], 16)
            .await
            .unwrap();
        let urls: Vec<String> = reopened
            .tasks("photos")
            .await
            .into_iter()
            .map(|t| t.original_request.url)
            .collect();
        assert_eq!(urls, vec!["/photos/a.png", "/photos/b.png"]);

        let storage = bucket().replicas[0].storage_key();
        assert_eq!(reopened.storage_lock(&storage).await, 3);
    }

    #[tokio::test]
    async fn test_open_creates_missing_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = file_store(&dir);
        let store = TaskStore::open(snapshots.clone(), vec!["docs".to_string()], 16)
            .await
            .unwrap();
        assert_eq!(store.queue_names().await, vec!["docs".to_string()]);
        assert_eq!(
            snapshots.get("docs/queue.json").await.unwrap().unwrap(),
            Bytes::from_static(b"[]")
        );
        assert!(snapshots.head(STORAGE_LOCKS_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_snapshot_format() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = file_store(&dir);
        let store = TaskStore::new(snapshots.clone(), 16);
        store.enqueue(task("a.png")).await;
        store.sync_to_remote().await.unwrap();

        let raw = snapshots.get(STORAGE_LOCKS_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value[0][0], "swift:http://keystone/v3/RegionOne");
        assert_eq!(value[0][1], 1);
    }

    #[tokio::test]
    async fn test_next_task_wakes_on_enqueue_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(file_store(&dir), 16));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.next_task("photos").await })
        };
        tokio::task::yield_now().await;
        store.enqueue(task("a.png")).await;
        let claimed = waiter.await.unwrap().unwrap();
        assert!(claimed.task.original_request.url.ends_with("a.png"));

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.next_task("photos").await })
        };
        store.shutdown().await;
        assert!(waiter.await.unwrap().is_none());
    }
}
