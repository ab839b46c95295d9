//! Execution time tracking: §4.9.
//!
//! Grounded on `core/observability/execution_tracker.py`'s `ExecutionTracker`:
//! a stage/substage timing tree keyed by `thread_id`, with deterministic
//! hash-based sampling so that either all stages of a request are recorded or
//! none are (never a partial trace). The Python original hashes with MD5; we
//! use blake3 instead, consistent with the blake3 fingerprinting already used
//! for cache keys in `model.rs`, since the sampling decision only needs a
//! uniform, deterministic digest rather than MD5 specifically.

use crate::model::StageExecution;
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Hash-based deterministic sampling: same `thread_id` always yields the same
/// decision, so a tracked request gets every one of its stages recorded.
fn sampling_bucket(thread_id: &str) -> u64 {
    let hash = blake3::hash(thread_id.as_bytes());
    let bytes = hash.as_bytes();
    let mut value: u64 = 0;
    for b in &bytes[..8] {
        value = (value << 8) | u64::from(*b);
    }
    value % 100
}

/// A stage in progress, tracked while its guard is alive.
pub struct StageGuard<'a> {
    tracker: &'a ExecutionTracker,
    thread_id: String,
    execution: Option<StageExecution>,
    start: std::time::Instant,
}

impl<'a> StageGuard<'a> {
    /// Mark the stage as failed with the given error before it ends. If never
    /// called, the stage is recorded as successful.
    pub fn fail(&mut self, error: impl Into<String>) {
        if let Some(exec) = self.execution.as_mut() {
            exec.success = Some(false);
            exec.error = Some(error.into());
        }
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        let Some(mut execution) = self.execution.take() else { return };
        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        execution.ended_at = Some(now_secs());
        execution.duration_ms = Some((duration_ms * 100.0).round() / 100.0);
        if execution.success.is_none() {
            execution.success = Some(true);
        }
        self.tracker.finish_stage(&self.thread_id, execution);
    }
}

/// Centralized stage timing for all in-flight requests, keyed by `thread_id`.
/// Samples a configurable percentage of requests; errors are always recorded
/// for the requests that are sampled (sampling never suppresses error info
/// within a tracked trace, it only decides whether a trace exists at all).
pub struct ExecutionTracker {
    executions: DashMap<String, Vec<StageExecution>>,
    stack: DashMap<String, Vec<StageExecution>>,
    enabled: bool,
    sample_rate: f64,
}

impl ExecutionTracker {
    #[must_use]
    pub fn new(enabled: bool, sample_rate: f64) -> Self {
        Self {
            executions: DashMap::new(),
            stack: DashMap::new(),
            enabled,
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }

    /// Whether `thread_id` should have its stages recorded this request.
    #[must_use]
    pub fn should_track(&self, thread_id: &str, force: bool) -> bool {
        if force {
            return true;
        }
        if !self.enabled {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        (sampling_bucket(thread_id) as f64) < self.sample_rate * 100.0
    }

    /// Begin tracking a stage. Returns `None` if this thread isn't sampled;
    /// callers should treat a `None` guard as a no-op (drop does nothing).
    pub fn track_stage(&self, stage_id: &str, stage_name: &str, thread_id: &str, force: bool) -> Option<StageGuard<'_>> {
        if !self.should_track(thread_id, force) {
            return None;
        }

        let execution = StageExecution {
            stage_id: stage_id.to_string(),
            stage_name: stage_name.to_string(),
            thread_id: thread_id.to_string(),
            started_at: now_secs(),
            ended_at: None,
            duration_ms: None,
            success: None,
            error: None,
            substages: Vec::new(),
        };

        self.executions.entry(thread_id.to_string()).or_default();
        self.stack.entry(thread_id.to_string()).or_default().push(execution.clone());

        debug!(stage_id, stage_name, thread_id, "stage started");

        Some(StageGuard {
            tracker: self,
            thread_id: thread_id.to_string(),
            execution: Some(execution),
            start: std::time::Instant::now(),
        })
    }

    fn finish_stage(&self, thread_id: &str, execution: StageExecution) {
        let mut stack = match self.stack.get_mut(thread_id) {
            Some(s) => s,
            None => {
                warn!(thread_id, "finish_stage called with no active stack");
                return;
            }
        };
        stack.pop();

        debug!(
            stage_id = %execution.stage_id,
            thread_id,
            duration_ms = execution.duration_ms,
            success = execution.success,
            "stage completed"
        );

        if let Some(parent) = stack.last_mut() {
            parent.substages.push(execution);
        } else {
            drop(stack);
            if let Some(mut executions) = self.executions.get_mut(thread_id) {
                executions.push(execution);
            }
        }
    }

    /// Summary for one thread: total duration, stage count, and any failures.
    #[must_use]
    pub fn get_execution_summary(&self, thread_id: &str) -> ExecutionSummary {
        let Some(executions) = self.executions.get(thread_id) else {
            return ExecutionSummary::empty(thread_id);
        };

        let total_duration_ms: f64 = executions.iter().filter_map(|e| e.duration_ms).sum();
        let failed_stages: Vec<FailedStage> = executions
            .iter()
            .filter(|e| e.success == Some(false))
            .map(|e| FailedStage {
                stage_id: e.stage_id.clone(),
                stage_name: e.stage_name.clone(),
                error: e.error.clone(),
            })
            .collect();

        ExecutionSummary {
            thread_id: thread_id.to_string(),
            total_duration_ms: (total_duration_ms * 100.0).round() / 100.0,
            stage_count: executions.len(),
            stages: executions.clone(),
            success: failed_stages.is_empty(),
            failed_stages,
        }
    }

    /// Percentile/latency statistics for one `stage_id` across all tracked
    /// threads (top-level stages only, matching the Python original).
    #[must_use]
    pub fn get_stage_statistics(&self, stage_id: &str) -> StageStatistics {
        let mut durations: Vec<f64> = Vec::new();
        let mut total_count = 0usize;
        let mut success_count = 0usize;

        for entry in &self.executions {
            for execution in entry.value() {
                if execution.stage_id == stage_id {
                    if let Some(duration) = execution.duration_ms {
                        durations.push(duration);
                        total_count += 1;
                        if execution.success == Some(true) {
                            success_count += 1;
                        }
                    }
                }
            }
        }

        if durations.is_empty() {
            return StageStatistics::empty(stage_id);
        }

        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let len = durations.len();
        let avg = durations.iter().sum::<f64>() / len as f64;
        let percentile = |p: f64| -> f64 {
            if len == 1 {
                durations[0]
            } else {
                let idx = ((len as f64) * p) as usize;
                durations[idx.min(len - 1)]
            }
        };

        StageStatistics {
            stage_id: stage_id.to_string(),
            execution_count: len,
            avg_duration_ms: round2(avg),
            p50_duration_ms: round2(percentile(0.50)),
            p95_duration_ms: round2(percentile(0.95)),
            p99_duration_ms: round2(percentile(0.99)),
            min_duration_ms: round2(durations[0]),
            max_duration_ms: round2(durations[len - 1]),
            success_rate: if total_count > 0 { round3(success_count as f64 / total_count as f64) } else { 0.0 },
        }
    }

    /// Free the tracking data for a thread; call after a request completes.
    pub fn clear_thread_data(&self, thread_id: &str) {
        self.executions.remove(thread_id);
        self.stack.remove(thread_id);
        debug!(thread_id, "cleared execution data");
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedStage {
    pub stage_id: String,
    pub stage_name: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutionSummary {
    pub thread_id: String,
    pub total_duration_ms: f64,
    pub stage_count: usize,
    pub stages: Vec<StageExecution>,
    pub success: bool,
    pub failed_stages: Vec<FailedStage>,
}

impl ExecutionSummary {
    fn empty(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            total_duration_ms: 0.0,
            stage_count: 0,
            stages: Vec::new(),
            success: true,
            failed_stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StageStatistics {
    pub stage_id: String,
    pub execution_count: usize,
    pub avg_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub success_rate: f64,
}

impl StageStatistics {
    fn empty(stage_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            execution_count: 0,
            avg_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p95_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            min_duration_ms: 0.0,
            max_duration_ms: 0.0,
            success_rate: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_is_deterministic_per_thread_id() {
        let tracker = ExecutionTracker::new(true, 0.1);
        let first = tracker.should_track("req-001", false);
        let second = tracker.should_track("req-001", false);
        assert_eq!(first, second);
    }

    #[test]
    fn full_sample_rate_tracks_everything() {
        let tracker = ExecutionTracker::new(true, 1.0);
        assert!(tracker.should_track("any-thread", false));
    }

    #[test]
    fn disabled_tracker_never_tracks_unless_forced() {
        let tracker = ExecutionTracker::new(false, 1.0);
        assert!(!tracker.should_track("t1", false));
        assert!(tracker.should_track("t1", true));
    }

    #[test]
    fn nested_stages_build_a_tree_and_clear_removes_it() {
        let tracker = ExecutionTracker::new(true, 1.0);
        {
            let _outer = tracker.track_stage("2", "cache lookup", "t1", false);
            {
                let _inner = tracker.track_stage("2.1", "l1 lookup", "t1", false);
            }
        }

        let summary = tracker.get_execution_summary("t1");
        assert_eq!(summary.stage_count, 1);
        assert_eq!(summary.stages[0].substages.len(), 1);
        assert!(summary.success);

        tracker.clear_thread_data("t1");
        let summary = tracker.get_execution_summary("t1");
        assert_eq!(summary.stage_count, 0);
    }

    #[test]
    fn failed_stage_is_reported() {
        let tracker = ExecutionTracker::new(true, 1.0);
        {
            let mut guard = tracker.track_stage("3", "provider call", "t2", false).unwrap();
            guard.fail("boom");
        }
        let summary = tracker.get_execution_summary("t2");
        assert!(!summary.success);
        assert_eq!(summary.failed_stages.len(), 1);
        assert_eq!(summary.failed_stages[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn stage_statistics_compute_percentiles() {
        let tracker = ExecutionTracker::new(true, 1.0);
        for i in 0..10 {
            let guard = tracker.track_stage("2", "lookup", &format!("t-{i}"), false);
            drop(guard);
        }
        let stats = tracker.get_stage_statistics("2");
        assert_eq!(stats.execution_count, 10);
        assert_eq!(stats.success_rate, 1.0);
    }
}
