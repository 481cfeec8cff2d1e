//! GPU resource monitoring
//!
//! Samples memory, temperature and power from the GPU query tool in the
//! background and keeps a bounded history for smoothing. Telemetry failures
//! never reach callers: a conservative default state is reported instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use triage_common::config::{MonitorConfig, StaticStateConfig, TelemetrySourceKind};
use triage_common::{Result, TriageError, METRICS};

/// Fields requested from the GPU query tool, in output order
pub const GPU_QUERY_FIELDS: &str = "memory.total,memory.used,temperature.gpu,power.draw";

const MIB_PER_GB: f64 = 1024.0;

/// Floor for the sampling period; a zero period would panic the sampler
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Share of total memory assumed in use when telemetry is unavailable
const FALLBACK_USED_FRACTION: f64 = 0.7;
const FALLBACK_TEMPERATURE_C: f64 = 70.0;
const FALLBACK_POWER_W: f64 = 200.0;

/// A single GPU telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuMemoryState {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub temperature_c: f64,
    pub power_draw_w: f64,
    pub timestamp: DateTime<Utc>,
}

impl GpuMemoryState {
    pub fn new(total_gb: f64, used_gb: f64, temperature_c: f64, power_draw_w: f64) -> Self {
        Self {
            total_gb,
            used_gb,
            available_gb: (total_gb - used_gb).max(0.0),
            temperature_c,
            power_draw_w,
            timestamp: Utc::now(),
        }
    }

    /// State assumed when the GPU cannot be queried
    pub fn conservative_default(total_gb: f64) -> Self {
        Self::new(
            total_gb,
            total_gb * FALLBACK_USED_FRACTION,
            FALLBACK_TEMPERATURE_C,
            FALLBACK_POWER_W,
        )
    }

    /// Memory utilization in percent
    pub fn utilization_percent(&self) -> f64 {
        if self.total_gb <= 0.0 {
            return 100.0;
        }
        self.used_gb / self.total_gb * 100.0
    }

    /// Parse one `memory.total,memory.used,temperature.gpu,power.draw` line (MiB/MiB/C/W)
    pub fn from_csv_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(TriageError::telemetry(format!(
                "expected 4 fields, got {}: {:?}",
                fields.len(),
                line
            )));
        }

        let number = |name: &str, raw: &str| {
            raw.parse::<f64>()
                .map_err(|_| TriageError::telemetry(format!("unparseable {}: {:?}", name, raw)))
        };

        let total_mib = number("memory.total", fields[0])?;
        let used_mib = number("memory.used", fields[1])?;
        let temperature_c = number("temperature.gpu", fields[2])?;
        // Some boards do not report power
        let power_draw_w = if fields[3].contains("N/A") {
            0.0
        } else {
            number("power.draw", fields[3])?
        };

        if total_mib <= 0.0 {
            return Err(TriageError::telemetry("GPU reported zero total memory"));
        }

        Ok(Self::new(
            total_mib / MIB_PER_GB,
            used_mib / MIB_PER_GB,
            temperature_c,
            power_draw_w,
        ))
    }
}

/// Where GPU telemetry comes from
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn query(&self) -> Result<GpuMemoryState>;
}

/// Queries the GPU by shelling out to `nvidia-smi`
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    command: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TelemetrySource for NvidiaSmi {
    async fn query(&self) -> Result<GpuMemoryState> {
        let query = format!("--query-gpu={}", GPU_QUERY_FIELDS);
        let child = Command::new(&self.command)
            .args([query.as_str(), "--format=csv,noheader,nounits"])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                TriageError::telemetry(format!("{} timed out after {:?}", self.command, self.timeout))
            })?
            .map_err(|e| TriageError::telemetry(format!("failed to run {}: {}", self.command, e)))?;

        if !output.status.success() {
            return Err(TriageError::telemetry(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        // One line per GPU; the first device is the one we schedule on
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| TriageError::telemetry("empty telemetry output"))?;

        GpuMemoryState::from_csv_line(line)
    }
}

/// Reports a fixed, adjustable state
#[derive(Debug)]
pub struct StaticTelemetry {
    state: Mutex<GpuMemoryState>,
}

impl StaticTelemetry {
    pub fn new(state: GpuMemoryState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn from_config(config: &StaticStateConfig) -> Self {
        Self::new(GpuMemoryState::new(
            config.total_gb,
            config.used_gb,
            config.temperature_c,
            config.power_draw_w,
        ))
    }

    /// Replace the reported state
    pub fn set(&self, state: GpuMemoryState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn query(&self) -> Result<GpuMemoryState> {
        let mut state = self.state.lock().clone();
        state.timestamp = Utc::now();
        Ok(state)
    }
}

/// Background GPU sampler with a bounded history
pub struct ResourceMonitor {
    source: Arc<dyn TelemetrySource>,
    history: RwLock<VecDeque<GpuMemoryState>>,
    capacity: usize,
    interval: Duration,
    fallback_total_gb: f64,
}

impl ResourceMonitor {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        interval: Duration,
        capacity: usize,
        fallback_total_gb: f64,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            history: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            interval,
            fallback_total_gb,
        }
    }

    /// Build the monitor and its telemetry source from configuration
    pub fn from_config(config: &MonitorConfig) -> Self {
        let source: Arc<dyn TelemetrySource> = match config.source {
            TelemetrySourceKind::NvidiaSmi => Arc::new(NvidiaSmi::new(
                config.gpu_query_command.clone(),
                Duration::from_secs(config.query_timeout_secs),
            )),
            TelemetrySourceKind::Static => Arc::new(StaticTelemetry::from_config(&config.static_state)),
        };

        Self::new(
            source,
            Duration::from_secs(config.sample_interval_secs),
            config.history_size,
            config.fallback_total_gb,
        )
    }

    /// Query the GPU, falling back to the conservative default on any failure
    pub async fn get_current_state(&self) -> GpuMemoryState {
        match self.source.query().await {
            Ok(state) => state,
            Err(e) => {
                METRICS.monitor.telemetry_failures.inc();
                warn!(error = %e, "GPU telemetry unavailable, assuming conservative state");
                GpuMemoryState::conservative_default(self.fallback_total_gb)
            }
        }
    }

    /// Latest sample if it is recent enough, otherwise a live query
    ///
    /// Decisions read this so the request path normally never waits on the
    /// query tool.
    pub async fn current_or_latest(&self) -> GpuMemoryState {
        if let Some(latest) = self.latest() {
            let max_age = chrono::Duration::from_std(self.interval * 2)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
            if Utc::now() - latest.timestamp <= max_age {
                return latest;
            }
        }
        self.sample().await
    }

    /// Query and record one sample
    pub async fn sample(&self) -> GpuMemoryState {
        let state = self.get_current_state().await;
        self.record(state.clone());
        state
    }

    /// Append a sample, evicting the oldest once the buffer is full
    pub fn record(&self, state: GpuMemoryState) {
        METRICS.monitor.memory_used_gb.set(state.used_gb);
        METRICS.monitor.memory_total_gb.set(state.total_gb);
        METRICS.monitor.temperature_c.set(state.temperature_c);
        METRICS.monitor.power_draw_w.set(state.power_draw_w);

        let mut history = self.history.write();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(state);
    }

    pub fn latest(&self) -> Option<GpuMemoryState> {
        self.history.read().back().cloned()
    }

    pub fn history(&self) -> Vec<GpuMemoryState> {
        self.history.read().iter().cloned().collect()
    }

    /// Mean used memory over samples from the trailing `seconds`
    pub fn get_average_memory_usage_gb(&self, seconds: u64) -> Option<f64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(seconds as i64);
        let history = self.history.read();

        let (sum, count) = history
            .iter()
            .filter(|state| state.timestamp >= cutoff)
            .fold((0.0, 0usize), |(sum, count), state| (sum + state.used_gb, count + 1));

        (count > 0).then(|| sum / count as f64)
    }

    /// Start the background sampling loop
    pub fn start_monitoring(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(interval = ?self.interval, capacity = self.capacity, "Starting GPU monitoring");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval.max(MIN_SAMPLE_INTERVAL));

            loop {
                interval.tick().await;
                let state = self.sample().await;
                debug!(
                    used_gb = state.used_gb,
                    total_gb = state.total_gb,
                    temperature_c = state.temperature_c,
                    "GPU sample"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenTelemetry;

    #[async_trait]
    impl TelemetrySource for BrokenTelemetry {
        async fn query(&self) -> Result<GpuMemoryState> {
            Err(TriageError::telemetry("driver not loaded"))
        }
    }

    fn static_monitor(state: GpuMemoryState, capacity: usize) -> ResourceMonitor {
        ResourceMonitor::new(
            Arc::new(StaticTelemetry::new(state)),
            Duration::from_millis(10),
            capacity,
            24.0,
        )
    }

    #[test]
    fn test_parse_csv_line() {
        let state = GpuMemoryState::from_csv_line("24576, 12288, 65, 180.50").unwrap();

        assert_eq!(state.total_gb, 24.0);
        assert_eq!(state.used_gb, 12.0);
        assert_eq!(state.available_gb, 12.0);
        assert_eq!(state.temperature_c, 65.0);
        assert_eq!(state.power_draw_w, 180.5);
        assert_eq!(state.utilization_percent(), 50.0);
    }

    #[test]
    fn test_parse_csv_line_tolerates_missing_power() {
        let state = GpuMemoryState::from_csv_line("8192, 1024, 40, [N/A]").unwrap();
        assert_eq!(state.power_draw_w, 0.0);
    }

    #[test]
    fn test_parse_csv_line_rejects_garbage() {
        assert!(GpuMemoryState::from_csv_line("").is_err());
        assert!(GpuMemoryState::from_csv_line("24576, 12288, 65").is_err());
        assert!(GpuMemoryState::from_csv_line("lots, 12288, 65, 100").is_err());
        assert!(GpuMemoryState::from_csv_line("0, 0, 30, 10").is_err());
    }

    #[tokio::test]
    async fn test_telemetry_failure_yields_conservative_default() {
        let monitor = ResourceMonitor::new(Arc::new(BrokenTelemetry), Duration::from_secs(1), 10, 24.0);
        let state = monitor.get_current_state().await;

        assert_eq!(state.total_gb, 24.0);
        assert!(state.utilization_percent() >= 50.0 && state.utilization_percent() <= 75.0);
        assert!(state.temperature_c < 80.0);
    }

    #[tokio::test]
    async fn test_missing_query_tool_is_absorbed() {
        let monitor = ResourceMonitor::new(
            Arc::new(NvidiaSmi::new("definitely-not-a-gpu-tool", Duration::from_secs(1))),
            Duration::from_secs(1),
            10,
            16.0,
        );

        let state = monitor.get_current_state().await;
        assert_eq!(state.total_gb, 16.0);
    }

    #[tokio::test]
    async fn test_unparseable_tool_output_is_an_error() {
        // echo prints its arguments, which are not a CSV telemetry line
        let source = NvidiaSmi::new("echo", Duration::from_secs(5));
        assert!(matches!(
            source.query().await,
            Err(TriageError::TelemetryUnavailable(_))
        ));
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = static_monitor(GpuMemoryState::new(24.0, 4.0, 50.0, 100.0), 3);
        for used in 1..=5 {
            monitor.record(GpuMemoryState::new(24.0, used as f64, 50.0, 100.0));
        }

        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].used_gb, 3.0);
        assert_eq!(monitor.latest().unwrap().used_gb, 5.0);
    }

    #[test]
    fn test_average_memory_usage_window() {
        let monitor = static_monitor(GpuMemoryState::new(24.0, 4.0, 50.0, 100.0), 10);
        assert_eq!(monitor.get_average_memory_usage_gb(60), None);

        let mut old = GpuMemoryState::new(24.0, 20.0, 50.0, 100.0);
        old.timestamp = Utc::now() - chrono::Duration::seconds(300);
        monitor.record(old);
        monitor.record(GpuMemoryState::new(24.0, 6.0, 50.0, 100.0));
        monitor.record(GpuMemoryState::new(24.0, 10.0, 50.0, 100.0));

        assert_eq!(monitor.get_average_memory_usage_gb(60), Some(8.0));
        assert_eq!(
            monitor.get_average_memory_usage_gb(600).map(|v| (v * 100.0).round() / 100.0),
            Some(12.0)
        );
    }

    #[tokio::test]
    async fn test_background_sampling_fills_history() {
        let monitor = Arc::new(static_monitor(GpuMemoryState::new(24.0, 4.0, 50.0, 100.0), 100));
        let handle = monitor.clone().start_monitoring();

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.abort();

        assert!(monitor.history().len() >= 2);
    }

    #[tokio::test]
    async fn test_zero_interval_sampler_keeps_running() {
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(StaticTelemetry::new(GpuMemoryState::new(24.0, 4.0, 50.0, 100.0))),
            Duration::ZERO,
            100,
            24.0,
        ));
        let handle = monitor.clone().start_monitoring();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.abort();

        assert!(!monitor.history().is_empty());
    }

    #[tokio::test]
    async fn test_current_or_latest_prefers_fresh_sample() {
        let telemetry = Arc::new(StaticTelemetry::new(GpuMemoryState::new(24.0, 4.0, 50.0, 100.0)));
        let monitor = ResourceMonitor::new(telemetry.clone(), Duration::from_secs(60), 10, 24.0);

        monitor.sample().await;
        telemetry.set(GpuMemoryState::new(24.0, 20.0, 50.0, 100.0));

        assert_eq!(monitor.current_or_latest().await.used_gb, 4.0);
        assert_eq!(monitor.get_current_state().await.used_gb, 20.0);
    }
}
