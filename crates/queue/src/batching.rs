//! Batch formation with a configurable window
//!
//! The former samples same-agent-type tasks from the queue and claims them as
//! a batch. It waits up to the batching window for a full batch before
//! settling for whatever is available.

use crate::queue::TaskQueue;
use crate::task::TaskBatch;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use triage_common::{AgentType, Result, TriageError};

/// Claims are retried when a worker dequeues a sampled task first
const CLAIM_ATTEMPTS: usize = 3;

/// Forms batches of queued tasks
pub struct BatchFormer {
    queue: Arc<TaskQueue>,
    max_batch_size: usize,
    window: Duration,
}

impl BatchFormer {
    /// Create a new batch former
    pub fn new(queue: Arc<TaskQueue>, max_batch_size: usize, window: Duration) -> Self {
        Self {
            queue,
            max_batch_size: max_batch_size.max(1),
            window,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Claim whatever is available for `agent_type` right now
    pub fn form_batch(&self, agent_type: AgentType, model_name: &str) -> Result<Option<TaskBatch>> {
        for attempt in 1..=CLAIM_ATTEMPTS {
            let sampled = self.queue.get_tasks_for_batch(agent_type, self.max_batch_size);
            if sampled.is_empty() {
                return Ok(None);
            }

            match self.queue.create_batch(&sampled, model_name) {
                Ok(batch) => return Ok(Some(batch)),
                // A worker dequeued one of the sampled tasks in between
                Err(TriageError::InvalidState(reason)) => {
                    trace!(attempt, %reason, "Batch claim raced with a worker, resampling");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Wait up to the batching window for a full batch, then claim what is there
    pub async fn next_batch(
        &self,
        agent_type: AgentType,
        model_name: &str,
    ) -> Result<Option<TaskBatch>> {
        let available = self
            .queue
            .get_tasks_for_batch(agent_type, self.max_batch_size)
            .len();

        if available == 0 {
            return Ok(None);
        }

        if available < self.max_batch_size && !self.window.is_zero() {
            tokio::time::sleep(self.window).await;
        }

        let batch = self.form_batch(agent_type, model_name)?;
        if let Some(batch) = &batch {
            debug!(
                batch_id = %batch.batch_id,
                agent_type = %agent_type,
                size = batch.len(),
                "Formed batch"
            );
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{InferenceTask, TaskStatus};
    use triage_common::config::QueueConfig;
    use triage_common::{ChatMessage, Priority};

    fn queue() -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(QueueConfig::default()))
    }

    fn add(queue: &TaskQueue, agent_type: AgentType, priority: Priority) -> String {
        queue
            .add_task(
                InferenceTask::new(agent_type, vec![ChatMessage::user("codes please")])
                    .with_priority(priority),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_next_batch_collects_same_agent_tasks() {
        let queue = queue();
        add(&queue, AgentType::Billing, Priority::High);
        add(&queue, AgentType::Billing, Priority::Normal);
        add(&queue, AgentType::Clinical, Priority::Critical);

        let former = BatchFormer::new(queue.clone(), 4, Duration::from_millis(1));
        let batch = former
            .next_batch(AgentType::Billing, "billing-3b")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.agent_type, AgentType::Billing);
        assert_eq!(batch.model_name, "billing-3b");
        for id in &batch.task_ids {
            assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Batched);
        }
        assert_eq!(queue.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_next_batch_empty_queue() {
        let former = BatchFormer::new(queue(), 4, Duration::from_millis(1));
        assert!(former
            .next_batch(AgentType::Pharmacy, "pharma-7b")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_form_batch_respects_max_size() {
        let queue = queue();
        for priority in Priority::descending() {
            add(&queue, AgentType::Claims, priority);
        }

        let former = BatchFormer::new(queue.clone(), 2, Duration::ZERO);
        let batch = former.form_batch(AgentType::Claims, "billing-3b").unwrap().unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(queue.queue_depth(), 2);
    }
}
