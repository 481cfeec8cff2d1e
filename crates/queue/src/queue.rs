//! Priority task queue with admission control, caching and lifecycle tracking
//!
//! All state lives behind a single mutex: tiers, the task table, batches, the
//! response cache and the rolling completion window are only ever mutated
//! together, so a task can never be dequeued twice or counted in two buckets.

use crate::cache::{cache_key, ResponseCache};
use crate::task::{BatchResults, InferenceTask, TaskBatch, TaskStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use triage_common::config::QueueConfig;
use triage_common::{AgentType, ChatMessage, Priority, Result, TriageError, METRICS};

/// Outcome of `submit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Admitted to the queue
    Queued(String),

    /// Answered from the response cache without touching the queue
    Cached { task_id: String, result: String },
}

impl Submission {
    pub fn task_id(&self) -> &str {
        match self {
            Submission::Queued(id) => id,
            Submission::Cached { task_id, .. } => task_id,
        }
    }
}

/// Point-in-time queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Tasks currently tracked, in any state
    pub total_tasks: usize,

    /// Tasks waiting in the priority tiers
    pub queue_depth: usize,

    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_priority: BTreeMap<Priority, usize>,

    /// Mean processing time over the rolling window
    pub avg_processing_time_ms: f64,

    /// Completions per second over the rolling window
    pub throughput_per_sec: f64,

    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub batches: usize,
}

struct QueueState {
    tasks: HashMap<String, InferenceTask>,

    /// FIFO of task ids per priority, indexed by `Priority::index`
    tiers: [VecDeque<String>; 4],

    batches: HashMap<String, TaskBatch>,
    cache: ResponseCache,

    /// `(completed_at, processing_time_ms)` of the most recent completions
    completions: VecDeque<(DateTime<Utc>, f64)>,
}

impl QueueState {
    fn queued_len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn remove_from_tier(&mut self, id: &str, priority: Priority) {
        self.tiers[priority.index()].retain(|queued| queued != id);
    }

    /// Move a non-terminal task to TIMEOUT
    fn expire(&mut self, id: &str, now: DateTime<Utc>) {
        let priority = match self.tasks.get_mut(id) {
            Some(task) if !task.is_terminal() => {
                let was_queued = task.status == TaskStatus::Queued;
                task.status = TaskStatus::Timeout;
                task.completed_at = Some(now);
                let error = TriageError::task_timeout(format!(
                    "{} after {:.1}s (limit {}s)",
                    id,
                    task.elapsed_seconds(now),
                    task.timeout_seconds
                ));
                task.error = Some(error.to_string());
                warn!(task_id = %id, status = %TaskStatus::Timeout, "Task timed out");
                was_queued.then_some(task.priority)
            }
            _ => return,
        };

        if let Some(priority) = priority {
            self.remove_from_tier(id, priority);
        }
        METRICS.queue.tasks_timed_out.inc();
    }
}

/// Priority task queue
pub struct TaskQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    notify: Notify,
}

impl TaskQueue {
    /// Create a new task queue
    pub fn new(config: QueueConfig) -> Self {
        let state = QueueState {
            tasks: HashMap::new(),
            tiers: Default::default(),
            batches: HashMap::new(),
            cache: ResponseCache::new(config.cache_ttl_seconds),
            completions: VecDeque::with_capacity(config.stats_window),
        };

        Self {
            state: Mutex::new(state),
            config,
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Build a task carrying this queue's configured deadline and retry budget
    pub fn new_task(&self, agent_type: AgentType, messages: Vec<ChatMessage>) -> InferenceTask {
        InferenceTask::new(agent_type, messages)
            .with_timeout(self.config.default_timeout_seconds)
            .with_retries(self.config.default_retries)
    }

    /// Answer from the cache if possible, otherwise admit the task
    pub fn submit(&self, mut task: InferenceTask) -> Result<Submission> {
        let now = Utc::now();
        let key = cache_key(task.agent_type, task.model_preference.as_deref(), &task.messages);

        let mut state = self.state.lock();
        if let Some(result) = state.cache.get(&key, now) {
            METRICS.queue.cache_hits.inc();
            debug!(task_id = %task.id, agent_type = %task.agent_type, "Cache hit");

            if state.tasks.contains_key(&task.id) {
                return Err(TriageError::invalid_input(format!("Duplicate task id {}", task.id)));
            }

            task.status = TaskStatus::Completed;
            task.started_at = Some(now);
            task.completed_at = Some(now);
            task.processing_time_ms = Some(0.0);
            task.result = Some(result.clone());

            let task_id = task.id.clone();
            state.tasks.insert(task_id.clone(), task);
            return Ok(Submission::Cached { task_id, result });
        }

        METRICS.queue.cache_misses.inc();
        let id = self.admit(&mut state, task)?;
        drop(state);

        self.notify.notify_one();
        Ok(Submission::Queued(id))
    }

    /// Look up a cached response for an equivalent request
    pub fn check_cache(&self, task: &InferenceTask) -> Option<String> {
        let key = cache_key(task.agent_type, task.model_preference.as_deref(), &task.messages);
        let hit = self.state.lock().cache.get(&key, Utc::now());

        if hit.is_some() {
            METRICS.queue.cache_hits.inc();
        } else {
            METRICS.queue.cache_misses.inc();
        }
        hit
    }

    /// Admit a task into its priority tier
    ///
    /// Returns `QueueFull` once `max_queue_size` tasks are waiting.
    pub fn add_task(&self, task: InferenceTask) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            self.admit(&mut state, task)?
        };

        self.notify.notify_one();
        Ok(id)
    }

    fn admit(&self, state: &mut QueueState, mut task: InferenceTask) -> Result<String> {
        if task.messages.is_empty() {
            return Err(TriageError::invalid_input("Task has no messages"));
        }

        if state.tasks.contains_key(&task.id) {
            return Err(TriageError::invalid_input(format!("Duplicate task id {}", task.id)));
        }

        let depth = state.queued_len();
        if depth >= self.config.max_queue_size {
            METRICS.queue.tasks_rejected.inc();
            return Err(TriageError::queue_full(format!(
                "{} tasks queued (limit {})",
                depth, self.config.max_queue_size
            )));
        }

        task.status = TaskStatus::Queued;
        let id = task.id.clone();
        let priority = task.priority;

        state.tiers[priority.index()].push_back(id.clone());
        state.tasks.insert(id.clone(), task);

        METRICS.queue.tasks_submitted.inc();
        METRICS.queue.queue_depth.set(state.queued_len() as i64);
        debug!(task_id = %id, priority = %priority, depth = depth + 1, "Task queued");

        Ok(id)
    }

    /// Pop the oldest task of the highest non-empty priority tier
    pub fn get_next_task(&self) -> Option<InferenceTask> {
        let now = Utc::now();
        let mut state = self.state.lock();

        for priority in Priority::descending() {
            while let Some(id) = state.tiers[priority.index()].pop_front() {
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued {
                    continue;
                }

                task.status = TaskStatus::Processing;
                task.started_at = Some(now);
                let task = task.clone();

                METRICS.queue.queue_depth.set(state.queued_len() as i64);
                trace!(task_id = %task.id, priority = %priority, "Task dequeued");
                return Some(task);
            }
        }

        None
    }

    /// Sample up to one queued task per priority tier for `agent_type`
    ///
    /// Tiers are visited CRITICAL first and the front-most matching task of
    /// each tier is taken. Tasks found past their deadline are moved to
    /// TIMEOUT instead of being batched. Sampled tasks stay QUEUED until
    /// `create_batch` claims them.
    pub fn get_tasks_for_batch(&self, agent_type: AgentType, count: usize) -> Vec<InferenceTask> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut selected = Vec::new();
        let mut expired = Vec::new();

        for priority in Priority::descending() {
            if selected.len() >= count {
                break;
            }

            for id in &state.tiers[priority.index()] {
                let Some(task) = state.tasks.get(id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued || task.agent_type != agent_type {
                    continue;
                }
                if task.is_expired(now) {
                    expired.push(id.clone());
                    continue;
                }

                selected.push(task.clone());
                break;
            }
        }

        for id in expired {
            state.expire(&id, now);
        }
        if !selected.is_empty() {
            METRICS.queue.queue_depth.set(state.queued_len() as i64);
        }

        selected
    }

    /// Claim queued tasks into a new batch, tagging them BATCHED
    pub fn create_batch(&self, tasks: &[InferenceTask], model_name: &str) -> Result<TaskBatch> {
        let first = tasks
            .first()
            .ok_or_else(|| TriageError::invalid_input("Cannot create an empty batch"))?;
        let agent_type = first.agent_type;

        let mut state = self.state.lock();

        let mut seen = HashSet::new();
        for task in tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(TriageError::invalid_input(format!(
                    "Task {} listed twice in batch",
                    task.id
                )));
            }
            let current = state
                .tasks
                .get(&task.id)
                .ok_or_else(|| TriageError::task_not_found(&task.id))?;
            if current.agent_type != agent_type {
                return Err(TriageError::invalid_input(format!(
                    "Batch mixes agent types {} and {}",
                    agent_type, current.agent_type
                )));
            }
            if current.status != TaskStatus::Queued {
                return Err(TriageError::invalid_state(format!(
                    "Task {} is {} and cannot be batched",
                    task.id, current.status
                )));
            }
        }

        let batch = TaskBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            agent_type,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            model_name: model_name.to_string(),
            created_at: Utc::now(),
            completed_at: None,
        };

        for id in &batch.task_ids {
            let priority = match state.tasks.get_mut(id) {
                Some(task) => {
                    task.status = TaskStatus::Batched;
                    task.batch_id = Some(batch.batch_id.clone());
                    task.priority
                }
                None => continue,
            };
            state.remove_from_tier(id, priority);
        }

        state.batches.insert(batch.batch_id.clone(), batch.clone());
        METRICS.queue.batches_created.inc();
        METRICS.queue.queue_depth.set(state.queued_len() as i64);
        info!(
            batch_id = %batch.batch_id,
            agent_type = %agent_type,
            model = %model_name,
            size = batch.len(),
            "Created batch"
        );

        Ok(batch)
    }

    /// Move a QUEUED or BATCHED task to PROCESSING
    pub fn mark_processing(&self, id: &str) -> Result<InferenceTask> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TriageError::task_not_found(id))?;

        let from = task.status;
        match from {
            TaskStatus::Queued | TaskStatus::Batched => {
                task.status = TaskStatus::Processing;
                task.started_at = Some(Utc::now());
            }
            other => {
                return Err(TriageError::invalid_state(format!(
                    "Task {} is {} and cannot start processing",
                    id, other
                )))
            }
        }

        let task = task.clone();
        if from == TaskStatus::Queued {
            state.remove_from_tier(id, task.priority);
            METRICS.queue.queue_depth.set(state.queued_len() as i64);
        }
        Ok(task)
    }

    /// Record a successful result and populate the response cache
    pub fn complete_task(&self, id: &str, result: String) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TriageError::task_not_found(id))?;
        if task.status != TaskStatus::Processing {
            return Err(TriageError::invalid_state(format!(
                "Task {} is {} and cannot complete",
                id, task.status
            )));
        }

        let started = task.started_at.unwrap_or(task.created_at);
        let processing_ms = (now - started)
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or_default();

        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.processing_time_ms = Some(processing_ms);
        task.result = Some(result.clone());
        task.error = None;

        let key = cache_key(task.agent_type, task.model_preference.as_deref(), &task.messages);
        state.cache.insert(key, result, now);

        if state.completions.len() >= self.config.stats_window.max(1) {
            state.completions.pop_front();
        }
        state.completions.push_back((now, processing_ms));

        METRICS.queue.tasks_completed.inc();
        METRICS.queue.processing_time.observe(processing_ms / 1000.0);
        debug!(task_id = %id, processing_ms, "Task completed");

        Ok(())
    }

    /// Record a failed attempt
    ///
    /// While retries remain the task goes back to the end of its priority
    /// tier; the last failure makes it terminal FAILED. Returns the new status.
    pub fn fail_task(&self, id: &str, error: impl Into<String>) -> Result<TaskStatus> {
        let error = error.into();
        let now = Utc::now();
        let mut state = self.state.lock();

        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TriageError::task_not_found(id))?;
        if !matches!(task.status, TaskStatus::Processing | TaskStatus::Batched) {
            return Err(TriageError::invalid_state(format!(
                "Task {} is {} and cannot fail",
                id, task.status
            )));
        }

        task.retries_left = task.retries_left.saturating_sub(1);
        task.error = Some(error.clone());

        if task.retries_left > 0 {
            task.status = TaskStatus::Queued;
            task.started_at = None;
            task.batch_id = None;
            let priority = task.priority;
            let retries_left = task.retries_left;

            state.tiers[priority.index()].push_back(id.to_string());
            METRICS.queue.tasks_retried.inc();
            METRICS.queue.queue_depth.set(state.queued_len() as i64);
            drop(state);

            warn!(task_id = %id, retries_left, error = %error, "Task failed, re-queued");
            self.notify.notify_one();
            return Ok(TaskStatus::Queued);
        }

        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        METRICS.queue.tasks_failed.inc();
        warn!(task_id = %id, error = %error, "Task failed permanently");

        Ok(TaskStatus::Failed)
    }

    /// Mark a task TIMEOUT if it is non-terminal and past its deadline
    ///
    /// This is bookkeeping only; an in-flight backend call keeps running.
    pub fn timeout_task(&self, id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let task = state
            .tasks
            .get(id)
            .ok_or_else(|| TriageError::task_not_found(id))?;
        if task.is_terminal() || !task.is_expired(now) {
            return Ok(false);
        }

        state.expire(id, now);
        METRICS.queue.queue_depth.set(state.queued_len() as i64);
        Ok(true)
    }

    /// Apply `timeout_task` to every non-terminal task
    pub fn sweep_timeouts(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .tasks
            .values()
            .filter(|task| !task.is_terminal() && task.is_expired(now))
            .map(|task| task.id.clone())
            .collect();

        for id in &expired {
            state.expire(id, now);
        }
        if !expired.is_empty() {
            METRICS.queue.queue_depth.set(state.queued_len() as i64);
        }

        expired.len()
    }

    /// Cancel a task that has not been picked up yet
    ///
    /// Only QUEUED tasks can be cancelled; they become terminal FAILED.
    pub fn cancel_task(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TriageError::task_not_found(id))?;

        if task.status != TaskStatus::Queued {
            return Err(TriageError::invalid_state(format!(
                "Task {} is {} and can no longer be cancelled",
                id, task.status
            )));
        }

        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some("cancelled".to_string());
        let priority = task.priority;

        state.remove_from_tier(id, priority);
        METRICS.queue.queue_depth.set(state.queued_len() as i64);
        info!(task_id = %id, "Task cancelled");

        Ok(())
    }

    /// Stamp a batch as finished
    pub fn complete_batch(&self, batch_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| TriageError::task_not_found(format!("batch {}", batch_id)))?;

        if batch.completed_at.is_none() {
            batch.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Snapshot of a task
    pub fn get_task(&self, id: &str) -> Result<InferenceTask> {
        self.state
            .lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TriageError::task_not_found(id))
    }

    /// Snapshot of a batch and its member tasks
    pub fn get_batch_results(&self, batch_id: &str) -> Result<BatchResults> {
        let state = self.state.lock();
        let batch = state
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| TriageError::task_not_found(format!("batch {}", batch_id)))?;

        let tasks = batch
            .task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect();

        Ok(BatchResults { batch, tasks })
    }

    /// Live counts per status and priority plus smoothed latency/throughput
    pub fn get_stats(&self) -> QueueStats {
        let now = Utc::now();
        let state = self.state.lock();

        let mut by_status: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut by_priority: BTreeMap<Priority, usize> =
            Priority::descending().iter().map(|p| (*p, 0)).collect();

        for task in state.tasks.values() {
            *by_status.entry(task.status).or_default() += 1;
            *by_priority.entry(task.priority).or_default() += 1;
        }

        let samples = state.completions.len();
        let avg_processing_time_ms = if samples == 0 {
            0.0
        } else {
            state.completions.iter().map(|(_, ms)| ms).sum::<f64>() / samples as f64
        };

        let throughput_per_sec = match state.completions.front() {
            Some((oldest, _)) => {
                let span = (now - *oldest).num_milliseconds() as f64 / 1000.0;
                if span > 0.0 {
                    samples as f64 / span
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        QueueStats {
            total_tasks: state.tasks.len(),
            queue_depth: state.queued_len(),
            by_status,
            by_priority,
            avg_processing_time_ms,
            throughput_per_sec,
            cache_entries: state.cache.len(),
            cache_hits: state.cache.hits(),
            cache_misses: state.cache.misses(),
            batches: state.batches.len(),
        }
    }

    /// Remove terminal tasks (and finished batches) older than `max_age`
    pub fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36500));
        let mut state = self.state.lock();

        let before = state.tasks.len();
        state.tasks.retain(|_, task| {
            !(task.is_terminal() && task.completed_at.is_some_and(|done| done < cutoff))
        });
        let removed = before - state.tasks.len();

        let QueueState { tasks, batches, .. } = &mut *state;
        batches.retain(|_, batch| {
            let finished_long_ago = batch.completed_at.is_some_and(|done| done < cutoff);
            let orphaned = batch.task_ids.iter().all(|id| !tasks.contains_key(id));
            !(finished_long_ago || orphaned)
        });

        if removed > 0 {
            info!(removed, "Cleaned up old tasks");
        }
        removed
    }

    /// Drop expired cache entries
    pub fn purge_expired_cache(&self) -> usize {
        self.state.lock().cache.purge_expired(Utc::now())
    }

    /// Agent types with at least one queued task
    pub fn queued_agent_types(&self) -> Vec<AgentType> {
        let state = self.state.lock();
        let mut agents: Vec<AgentType> = state
            .tiers
            .iter()
            .flatten()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| task.status == TaskStatus::Queued)
            .map(|task| task.agent_type)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        agents.sort();
        agents
    }

    /// Number of tasks waiting in the tiers
    pub fn queue_depth(&self) -> usize {
        self.state.lock().queued_len()
    }

    /// Wait until work may be available, or until `timeout` elapses
    pub async fn wait_for_work(&self, timeout: Duration) {
        if self.queue_depth() > 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
