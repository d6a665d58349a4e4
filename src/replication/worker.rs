//! Mirror workers.
//!
//! One dispatcher per queue pulls tasks from the [`TaskStore`] and runs up
//! to `workers_per_bucket` of them at once. Every task gets a hard timeout;
//! a task that overruns is aborted, logged and dropped like any other
//! failure. Workers never retry on their own: retries happen inside the
//! backend calls.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::mirror::process_task;
use super::store::{ClaimedTask, TaskStore};
use crate::backends::Backends;
use crate::config::ReplicationConfig;

pub struct Replicator {
    store: Arc<TaskStore>,
    backends: Backends,
    workers_per_bucket: usize,
    task_timeout: Duration,
}

impl Replicator {
    pub fn new(store: Arc<TaskStore>, backends: Backends, config: &ReplicationConfig) -> Self {
        Self {
            store,
            backends,
            workers_per_bucket: config.workers_per_bucket.max(1),
            task_timeout: Duration::from_secs(config.task_timeout),
        }
    }

    /// Spawn one dispatcher per queue. The dispatchers exit once the task
    /// store is shut down.
    pub fn start(self: Arc<Self>, queues: Vec<String>) -> Vec<JoinHandle<()>> {
        queues
            .into_iter()
            .map(|queue| {
                let replicator = Arc::clone(&self);
                tokio::spawn(async move { replicator.dispatch(queue).await })
            })
            .collect()
    }

    async fn dispatch(self: Arc<Self>, queue: String) {
        info!(
            "Mirror dispatcher for '{queue}' started ({} workers)",
            self.workers_per_bucket
        );
        let slots = Arc::new(Semaphore::new(self.workers_per_bucket));

        loop {
            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(claimed) = self.store.next_task(&queue).await else {
                break;
            };
            let replicator = Arc::clone(&self);
            tokio::spawn(async move {
                replicator.run_task(claimed).await;
                drop(permit);
            });
        }

        debug!("Mirror dispatcher for '{queue}' stopped");
    }

    /// Run one task to completion, failure or timeout, then release it.
    async fn run_task(&self, claimed: ClaimedTask) {
        let ClaimedTask { id, queue, task } = claimed;
        let command = task.command.as_str();
        let destination = task.backup_bucket.name.clone();
        let nonce = task.nonce.clone();

        let backends = self.backends.clone();
        let worker = tokio::spawn(async move { process_task(&backends, &task).await });
        let abort = worker.abort_handle();

        let outcome = match tokio::time::timeout(self.task_timeout, worker).await {
            Ok(Ok(Ok(()))) => {
                debug!("Mirrored {command} to '{destination}' (nonce {nonce})");
                "success"
            }
            Ok(Ok(Err(e))) => {
                error!("Mirror {command} to '{destination}' failed (nonce {nonce}): {e}");
                "error"
            }
            Ok(Err(e)) => {
                error!("Mirror {command} to '{destination}' panicked (nonce {nonce}): {e}");
                "error"
            }
            Err(_) => {
                abort.abort();
                error!(
                    "Mirror {command} to '{destination}' timed out after {:?} (nonce {nonce})",
                    self.task_timeout
                );
                "timeout"
            }
        };

        counter!(
            crate::metrics::MIRROR_TASKS_FINISHED_TOTAL,
            "command" => command,
            "outcome" => outcome,
        )
        .increment(1);
        self.store.finish(&queue, id).await;
    }
}
