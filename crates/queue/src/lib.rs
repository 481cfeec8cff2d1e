//! Triage task queue
//!
//! Priority admission, response caching, batching and lifecycle tracking for
//! inference tasks. The queue is the single owner of task state; workers and
//! the batch former only ever see snapshots.

pub mod batching;
pub mod cache;
pub mod queue;
pub mod task;

pub use batching::BatchFormer;
pub use cache::{cache_key, ResponseCache};
pub use queue::{QueueStats, Submission, TaskQueue};
pub use task::{BatchResults, InferenceTask, TaskBatch, TaskStatus};
