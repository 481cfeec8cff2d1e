//! Metrics collection for Triage
//!
//! This module provides Prometheus metrics for observability, grouped by the
//! component that records them.

use lazy_static::lazy_static;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Triage
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub queue: QueueMetrics,
    pub routing: RoutingMetrics,
    pub monitor: MonitorMetrics,
    pub workflow: WorkflowMetrics,
}

/// Task queue metrics
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    /// Tasks admitted to the queue
    pub tasks_submitted: IntCounter,

    /// Tasks rejected by admission control
    pub tasks_rejected: IntCounter,

    /// Tasks completed successfully
    pub tasks_completed: IntCounter,

    /// Tasks that reached terminal FAILED
    pub tasks_failed: IntCounter,

    /// Failures that were re-queued for another attempt
    pub tasks_retried: IntCounter,

    /// Tasks marked TIMEOUT
    pub tasks_timed_out: IntCounter,

    /// Response cache hits
    pub cache_hits: IntCounter,

    /// Response cache misses
    pub cache_misses: IntCounter,

    /// Batches formed
    pub batches_created: IntCounter,

    /// Current number of queued tasks
    pub queue_depth: IntGauge,

    /// Time from dequeue to completion
    pub processing_time: Histogram,
}

/// Model routing and decision metrics
#[derive(Debug, Clone)]
pub struct RoutingMetrics {
    /// Load balancing decisions
    pub decisions: IntCounter,

    /// Decisions that took the smallest-model safety valve
    pub fallback_decisions: IntCounter,

    /// Decisions rejected because no model fits
    pub resource_exhausted: IntCounter,

    /// Backend attempts that were retried
    pub backend_retries: IntCounter,

    /// Generations answered with a degraded stub
    pub degraded_responses: IntCounter,

    /// Backend call duration
    pub backend_latency: Histogram,
}

/// GPU telemetry metrics
#[derive(Debug, Clone)]
pub struct MonitorMetrics {
    pub memory_used_gb: Gauge,
    pub memory_total_gb: Gauge,
    pub temperature_c: Gauge,
    pub power_draw_w: Gauge,

    /// Queries that fell back to the conservative default
    pub telemetry_failures: IntCounter,
}

/// Workflow orchestration metrics
#[derive(Debug, Clone)]
pub struct WorkflowMetrics {
    pub workflows_executed: IntCounter,
    pub workflows_failed: IntCounter,
    pub agent_tasks_failed: IntCounter,
    pub workflow_duration: Histogram,
    pub parallel_efficiency: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("metric definitions are static and valid");
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let metric = IntCounter::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let metric = IntGauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let metric = Gauge::new(name, help)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> prometheus::Result<Histogram> {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());
        let r = registry.as_ref();

        let latency_buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

        let queue = QueueMetrics {
            tasks_submitted: counter(r, "queue_tasks_submitted_total", "Tasks admitted to the queue")?,
            tasks_rejected: counter(r, "queue_tasks_rejected_total", "Tasks rejected by admission control")?,
            tasks_completed: counter(r, "queue_tasks_completed_total", "Tasks completed successfully")?,
            tasks_failed: counter(r, "queue_tasks_failed_total", "Tasks that exhausted their retries")?,
            tasks_retried: counter(r, "queue_tasks_retried_total", "Failed attempts re-queued for retry")?,
            tasks_timed_out: counter(r, "queue_tasks_timed_out_total", "Tasks marked as timed out")?,
            cache_hits: counter(r, "queue_cache_hits_total", "Response cache hits")?,
            cache_misses: counter(r, "queue_cache_misses_total", "Response cache misses")?,
            batches_created: counter(r, "queue_batches_created_total", "Batches formed")?,
            queue_depth: int_gauge(r, "queue_depth", "Current number of queued tasks")?,
            processing_time: histogram(
                r,
                "queue_processing_time_seconds",
                "Time from dequeue to completion",
                latency_buckets.clone(),
            )?,
        };

        let routing = RoutingMetrics {
            decisions: counter(r, "routing_decisions_total", "Load balancing decisions")?,
            fallback_decisions: counter(
                r,
                "routing_fallback_decisions_total",
                "Decisions that fell back to the smallest model",
            )?,
            resource_exhausted: counter(
                r,
                "routing_resource_exhausted_total",
                "Decisions rejected because no model fits",
            )?,
            backend_retries: counter(r, "routing_backend_retries_total", "Backend attempts retried")?,
            degraded_responses: counter(
                r,
                "routing_degraded_responses_total",
                "Generations answered with a degraded stub",
            )?,
            backend_latency: histogram(
                r,
                "routing_backend_latency_seconds",
                "Backend chat completion latency",
                latency_buckets.clone(),
            )?,
        };

        let monitor = MonitorMetrics {
            memory_used_gb: gauge(r, "gpu_memory_used_gb", "GPU memory in use")?,
            memory_total_gb: gauge(r, "gpu_memory_total_gb", "GPU memory capacity")?,
            temperature_c: gauge(r, "gpu_temperature_celsius", "GPU temperature")?,
            power_draw_w: gauge(r, "gpu_power_draw_watts", "GPU power draw")?,
            telemetry_failures: counter(
                r,
                "gpu_telemetry_failures_total",
                "Telemetry queries answered with the conservative default",
            )?,
        };

        let workflow = WorkflowMetrics {
            workflows_executed: counter(r, "workflow_executions_total", "Workflows executed")?,
            workflows_failed: counter(
                r,
                "workflow_failures_total",
                "Workflows with at least one failed task or an unsatisfiable graph",
            )?,
            agent_tasks_failed: counter(
                r,
                "workflow_agent_task_failures_total",
                "Individual workflow tasks that failed",
            )?,
            workflow_duration: histogram(
                r,
                "workflow_duration_seconds",
                "Wall-clock workflow duration",
                latency_buckets,
            )?,
            parallel_efficiency: histogram(
                r,
                "workflow_parallel_efficiency",
                "Sum of task latencies over wall-clock duration, capped at 1",
                vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0],
            )?,
        };

        Ok(MetricsRegistry {
            registry,
            queue,
            routing,
            monitor,
            workflow,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
