//! Queue consumers
//!
//! Worker loops dequeue single tasks, the batch loop claims same-agent
//! batches, and the maintenance loop sweeps timeouts, old tasks and stale
//! cache entries. Every loop runs as its own tokio task.
//!
//! Single tasks and batches share one pool of `num_workers` permits. Work is
//! only claimed from the queue while a permit is held, so anything beyond
//! the pool stays QUEUED and counts against `max_queue_size`.

use crate::router::{GenerateOutcome, GenerationConstraints, ModelRouter};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use triage_common::config::{DispatcherConfig, QueueConfig};
use triage_common::{AgentType, METRICS};
use triage_queue::{BatchFormer, InferenceTask, TaskBatch, TaskQueue, TaskStatus};

/// Drives tasks from the queue through the model router
pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    router: Arc<ModelRouter>,
    batcher: BatchFormer,
    permits: Arc<Semaphore>,
    config: DispatcherConfig,
    cleanup_max_age: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        router: Arc<ModelRouter>,
        config: DispatcherConfig,
        queue_config: &QueueConfig,
    ) -> Self {
        let batcher = BatchFormer::new(
            queue.clone(),
            config.max_batch_size,
            Duration::from_millis(config.batch_window_ms),
        );

        let permits = Arc::new(Semaphore::new(config.num_workers.max(1)));

        Self {
            queue,
            router,
            batcher,
            permits,
            config,
            cleanup_max_age: Duration::from_secs(queue_config.cleanup_max_age_secs),
        }
    }

    /// Generate for a PROCESSING task and record the outcome on the queue
    pub async fn process_task(&self, task: InferenceTask) -> TaskStatus {
        if task.is_expired(chrono::Utc::now()) {
            match self.queue.timeout_task(&task.id) {
                Ok(expired) => debug!(task_id = %task.id, expired, "Task expired before dispatch"),
                Err(e) => debug!(task_id = %task.id, error = %e, "Timeout not recorded"),
            }
            return self.status_of(&task.id);
        }

        let constraints = GenerationConstraints {
            preferred_model: task.model_preference.clone(),
            ..Default::default()
        };

        let outcome = self
            .router
            .generate(
                task.agent_type,
                task.messages.clone(),
                &constraints,
                task.max_tokens,
                task.temperature,
            )
            .await;

        let recorded = match outcome {
            Ok(GenerateOutcome::Success { content, .. }) => self.queue.complete_task(&task.id, content),
            Ok(GenerateOutcome::Degraded { reason, .. }) => {
                self.queue.fail_task(&task.id, reason).map(|_| ())
            }
            Err(e) => self.queue.fail_task(&task.id, e.to_string()).map(|_| ()),
        };

        // The timeout sweep may have finalized the task while the call was in flight
        if let Err(e) = recorded {
            debug!(task_id = %task.id, error = %e, "Outcome not recorded");
        }

        self.status_of(&task.id)
    }

    fn status_of(&self, id: &str) -> TaskStatus {
        self.queue
            .get_task(id)
            .map(|task| task.status)
            .unwrap_or(TaskStatus::Failed)
    }

    /// Start every task of a batch concurrently and stamp the batch when done
    pub async fn process_batch(&self, batch: TaskBatch) {
        let claimed: Vec<InferenceTask> = batch
            .task_ids
            .iter()
            .filter_map(|id| match self.queue.mark_processing(id) {
                Ok(task) => Some(task),
                Err(e) => {
                    debug!(batch_id = %batch.batch_id, task_id = %id, error = %e, "Skipping batch member");
                    None
                }
            })
            .collect();

        join_all(claimed.into_iter().map(|task| self.process_task(task))).await;

        if let Err(e) = self.queue.complete_batch(&batch.batch_id) {
            warn!(batch_id = %batch.batch_id, error = %e, "Failed to complete batch");
        }
    }

    /// Wait for a free slot in the shared worker pool
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Idle until new work arrives, or for one poll interval when the queue
    /// only holds work this loop cannot claim
    async fn idle(&self) {
        let idle = Duration::from_millis(self.config.idle_poll_ms);
        if self.queue.queue_depth() > 0 {
            tokio::time::sleep(idle).await;
        } else {
            self.queue.wait_for_work(idle).await;
        }
    }

    /// Dequeue and process single tasks until aborted
    pub async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Worker started");

        loop {
            let Some(permit) = self.acquire().await else {
                return;
            };

            match self.queue.get_next_task() {
                Some(task) => {
                    let task_id = task.id.clone();
                    let status = self.process_task(task).await;
                    drop(permit);
                    debug!(worker_id, task_id = %task_id, status = %status, "Task processed");
                }
                None => {
                    drop(permit);
                    self.idle().await;
                }
            }
        }
    }

    /// Agent types with queued work and the model their batches are tagged with
    fn batchable_agent_types(&self) -> Vec<(AgentType, String)> {
        self.queue
            .queued_agent_types()
            .into_iter()
            .filter_map(|agent_type| match self.router.agent_model(agent_type) {
                Ok(model) => Some((agent_type, model.name.clone())),
                Err(e) => {
                    debug!(agent = %agent_type, error = %e, "Leaving unmapped agent type to workers");
                    None
                }
            })
            .collect()
    }

    /// Claim one batch per free pool slot and process it in the background
    pub async fn run_batch_former(self: Arc<Self>) {
        loop {
            let Some(permit) = self.acquire().await else {
                return;
            };

            let mut permit = Some(permit);
            for (agent_type, model) in self.batchable_agent_types() {
                match self.batcher.next_batch(agent_type, &model).await {
                    Ok(Some(batch)) => {
                        let held = permit.take();
                        let dispatcher = self.clone();
                        tokio::spawn(async move {
                            dispatcher.process_batch(batch).await;
                            drop(held);
                        });
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(agent = %agent_type, error = %e, "Batch formation failed"),
                }
            }

            if let Some(unused) = permit {
                drop(unused);
                self.idle().await;
            }
        }
    }

    /// One maintenance pass: timeouts, cleanup, cache purge, depth gauge
    pub fn run_maintenance_once(&self) {
        let timed_out = self.queue.sweep_timeouts();
        let removed = self.queue.cleanup_old_tasks(self.cleanup_max_age);
        let purged = self.queue.purge_expired_cache();
        METRICS.queue.queue_depth.set(self.queue.queue_depth() as i64);

        if timed_out + removed + purged > 0 {
            info!(timed_out, removed, purged, "Queue maintenance");
        }
    }

    pub async fn run_maintenance(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.maintenance_interval_secs.max(1)));

        loop {
            interval.tick().await;
            self.run_maintenance_once();
        }
    }

    /// Spawn the worker, batch and maintenance loops
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.config.num_workers,
            batching = self.config.batching_enabled,
            "Starting dispatcher"
        );

        let mut handles: Vec<JoinHandle<()>> = (0..self.config.num_workers)
            .map(|worker_id| tokio::spawn(self.clone().run_worker(worker_id)))
            .collect();

        if self.config.batching_enabled {
            handles.push(tokio::spawn(self.clone().run_batch_former()));
        }
        handles.push(tokio::spawn(self.run_maintenance()));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, router_with, ScriptedBackend};
    use triage_common::{AgentType, ChatMessage, Priority, TriageConfig, TriageError};

    fn small_pool() -> TriageConfig {
        let mut config = fast_config();
        config.dispatcher.num_workers = 1;
        config.dispatcher.max_batch_size = 2;
        config.dispatcher.batch_window_ms = 5;
        config.dispatcher.idle_poll_ms = 5;
        config.queue.max_queue_size = 4;
        config
    }

    fn in_flight(queue: &TaskQueue) -> usize {
        let stats = queue.get_stats();
        stats.by_status[&TaskStatus::Processing] + stats.by_status[&TaskStatus::Batched]
    }

    fn dispatcher(backend: Arc<ScriptedBackend>) -> (Arc<Dispatcher>, Arc<TaskQueue>) {
        dispatcher_with(fast_config(), backend)
    }

    fn dispatcher_with(
        config: TriageConfig,
        backend: Arc<ScriptedBackend>,
    ) -> (Arc<Dispatcher>, Arc<TaskQueue>) {
        let (router, _) = router_with(&config, backend);
        let queue = Arc::new(TaskQueue::new(config.queue.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            router,
            config.dispatcher.clone(),
            &config.queue,
        ));
        (dispatcher, queue)
    }

    fn task(prompt: &str) -> InferenceTask {
        InferenceTask::new(AgentType::General, vec![ChatMessage::user(prompt)])
    }

    #[tokio::test]
    async fn test_process_task_completes() {
        let (dispatcher, queue) = dispatcher(Arc::new(ScriptedBackend::echo()));
        let id = queue.add_task(task("hello")).unwrap();

        let claimed = queue.get_next_task().unwrap();
        assert_eq!(dispatcher.process_task(claimed).await, TaskStatus::Completed);

        let done = queue.get_task(&id).unwrap();
        assert_eq!(done.result.as_deref(), Some("response to: hello"));
    }

    #[tokio::test]
    async fn test_degraded_outcome_requeues_then_fails() {
        let backend = Arc::new(ScriptedBackend::new(|_| Err(TriageError::backend_unavailable("down"))));
        let (dispatcher, queue) = dispatcher(backend);
        let id = queue.add_task(task("hello").with_retries(2)).unwrap();

        let claimed = queue.get_next_task().unwrap();
        assert_eq!(dispatcher.process_task(claimed).await, TaskStatus::Queued);

        let claimed = queue.get_next_task().unwrap();
        assert_eq!(dispatcher.process_task(claimed).await, TaskStatus::Failed);
        assert!(queue.get_task(&id).unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_expired_task_is_timed_out_without_backend_call() {
        let backend = Arc::new(ScriptedBackend::echo());
        let (dispatcher, queue) = dispatcher(backend.clone());

        let mut stale = task("late").with_timeout(1);
        stale.created_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        queue.add_task(stale).unwrap();

        let claimed = queue.get_next_task().unwrap();
        assert_eq!(dispatcher.process_task(claimed).await, TaskStatus::Timeout);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_process_batch() {
        let backend = Arc::new(ScriptedBackend::echo());
        let (dispatcher, queue) = dispatcher(backend.clone());
        for priority in [Priority::Low, Priority::High] {
            queue.add_task(task(&format!("{}", priority)).with_priority(priority)).unwrap();
        }

        let batch = dispatcher.batcher.form_batch(AgentType::General, "general-1b").unwrap().unwrap();
        let batch_id = batch.batch_id.clone();
        dispatcher.process_batch(batch).await;

        let results = queue.get_batch_results(&batch_id).unwrap();
        assert!(results.batch.completed_at.is_some());
        assert_eq!(results.tasks.len(), 2);
        assert!(results.tasks.iter().all(|task| task.status == TaskStatus::Completed));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_started_dispatcher_drains_queue() {
        let (dispatcher, queue) = dispatcher(Arc::new(ScriptedBackend::echo()));
        let ids: Vec<String> = (0..6)
            .map(|i| queue.add_task(task(&format!("task {}", i))).unwrap())
            .collect();

        let handles = dispatcher.start();
        for _ in 0..200 {
            if ids
                .iter()
                .all(|id| queue.get_task(id).map(|task| task.is_terminal()).unwrap_or(false))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handles.iter().for_each(|handle| handle.abort());

        for id in &ids {
            assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_timeouts() {
        let (dispatcher, queue) = dispatcher(Arc::new(ScriptedBackend::echo()));
        let mut stale = task("late").with_timeout(1);
        stale.created_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        let id = queue.add_task(stale).unwrap();

        dispatcher.run_maintenance_once();
        assert_eq!(queue.get_task(&id).unwrap().status, TaskStatus::Timeout);
        assert_eq!(queue.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_work_bounded_by_pool() {
        let backend = Arc::new(ScriptedBackend::echo().with_delay(Duration::from_millis(50)));
        let (dispatcher, queue) = dispatcher_with(small_pool(), backend);
        let handles = dispatcher.start();

        let mut admitted = Vec::new();
        let mut rejected = 0;
        for i in 0..12 {
            match queue.add_task(task(&format!("burst {}", i))) {
                Ok(id) => admitted.push(id),
                Err(TriageError::QueueFull(_)) => rejected += 1,
                Err(e) => panic!("unexpected admission error: {}", e),
            }
        }
        assert_eq!(admitted.len(), 4);
        assert_eq!(rejected, 8);

        let mut peak = 0;
        for _ in 0..300 {
            peak = peak.max(in_flight(&queue));
            if admitted
                .iter()
                .all(|id| queue.get_task(id).map(|task| task.is_terminal()).unwrap_or(false))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handles.iter().for_each(|handle| handle.abort());

        // One pool slot holds at most one batch
        assert!(peak >= 1);
        assert!(peak <= 2, "{} tasks in flight with a single slot", peak);
        for id in &admitted {
            assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_nothing_claimed_while_pool_is_busy() {
        let backend = Arc::new(ScriptedBackend::echo());
        let (dispatcher, queue) = dispatcher_with(small_pool(), backend.clone());
        let busy = dispatcher.permits.clone().acquire_owned().await.unwrap();
        let handles = dispatcher.clone().start();

        let id = queue.add_task(task("waiting")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get_task(&id).unwrap().status, TaskStatus::Queued);
        assert_eq!(queue.queue_depth(), 1);
        assert_eq!(backend.call_count(), 0);

        drop(busy);
        for _ in 0..100 {
            if queue.get_task(&id).unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handles.iter().for_each(|handle| handle.abort());
        assert_eq!(queue.get_task(&id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unmapped_agent_left_to_workers() {
        let mut config = small_pool();
        config.agents.remove(&AgentType::Radiology);
        let backend = Arc::new(ScriptedBackend::echo());
        let (dispatcher, queue) = dispatcher_with(config, backend.clone());

        let unmapped = InferenceTask::new(AgentType::Radiology, vec![ChatMessage::user("scan")]);
        queue.add_task(unmapped.clone()).unwrap();
        assert!(dispatcher.batchable_agent_types().is_empty());

        let handles = dispatcher.start();
        for _ in 0..100 {
            if queue.get_task(&unmapped.id).unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handles.iter().for_each(|handle| handle.abort());

        let task = queue.get_task(&unmapped.id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(backend.call_count(), 0);
    }
}
