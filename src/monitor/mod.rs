//! Runtime behavior classification.
//!
//! The monitor consumes genuine telemetry (CPU ticks, resident memory,
//! syscall counters) sampled on the policy cadence while a session is
//! Running, and classifies the window of recent samples in priority order:
//!
//! 1. sustained hot CPU with no output progress  ⇒ Malicious (infinite loop)
//! 2. exponential memory growth                  ⇒ Malicious (fork bomb)
//! 3. steady linear memory growth                ⇒ Inefficient (heap growth)
//! 4. otherwise                                  ⇒ Normal
//!
//! Each observation replaces the session's profile; the monitor never touches
//! limits or status — reacting is the governor's job.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::{Policy, RuleCategory};
use crate::telemetry::TelemetrySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorDecision {
    Normal,
    Inefficient,
    Malicious,
}

/// Current classification of a session's runtime behavior. Monotonically
/// recomputed per sample; last value wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub decision: BehaviorDecision,
    pub detected_pattern: Option<String>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub syscall_rate: f64,
    pub sampled_at: DateTime<Utc>,
}

impl BehaviorProfile {
    pub fn normal_sample(cpu_percent: f64, memory_bytes: u64, syscall_rate: f64) -> Self {
        Self {
            decision: BehaviorDecision::Normal,
            detected_pattern: None,
            cpu_percent,
            memory_bytes,
            syscall_rate,
            sampled_at: Utc::now(),
        }
    }
}

struct WindowEntry {
    cpu_percent: f64,
    memory_bytes: u64,
    syscall_count: u64,
    output_len: usize,
}

/// Per-session monitor state: a bounded window of recent samples plus the
/// policy snapshot the session was started with.
pub struct RuntimeMonitor {
    policy: Arc<Policy>,
    window: VecDeque<WindowEntry>,
}

impl RuntimeMonitor {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self {
            policy,
            window: VecDeque::new(),
        }
    }

    /// Fold one telemetry sample into the window and classify. `output_len`
    /// is the current length of the session's output log — progress evidence
    /// for the busy-loop check.
    pub fn observe(&mut self, sample: TelemetrySample, output_len: usize) -> BehaviorProfile {
        let window_size = self.policy.monitor.window_samples;

        let syscall_rate = {
            let cadence_secs = self.policy.monitor.cadence_ms as f64 / 1000.0;
            match self.window.back() {
                Some(prev) if cadence_secs > 0.0 => {
                    sample.syscall_count.saturating_sub(prev.syscall_count) as f64 / cadence_secs
                }
                _ => 0.0,
            }
        };

        self.window.push_back(WindowEntry {
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            syscall_count: sample.syscall_count,
            output_len,
        });
        while self.window.len() > window_size {
            self.window.pop_front();
        }

        let (decision, detected_pattern) = self.classify();

        BehaviorProfile {
            decision,
            detected_pattern,
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            syscall_rate,
            sampled_at: Utc::now(),
        }
    }

    fn classify(&self) -> (BehaviorDecision, Option<String>) {
        if self.sustained_busy_cpu() {
            return (
                BehaviorDecision::Malicious,
                Some("infinite loop-like behavior".to_string()),
            );
        }
        if self.exponential_memory_growth() {
            return (
                BehaviorDecision::Malicious,
                Some("fork-bomb-like behavior".to_string()),
            );
        }
        if self.linear_memory_growth() {
            return (
                BehaviorDecision::Inefficient,
                Some("heap growth without bound".to_string()),
            );
        }
        (BehaviorDecision::Normal, None)
    }

    /// Hot CPU across the whole window with zero output progress.
    fn sustained_busy_cpu(&self) -> bool {
        if !self.policy.category_enabled(RuleCategory::InfiniteLoop) {
            return false;
        }
        if self.window.len() < self.policy.monitor.window_samples {
            return false;
        }
        let hot = self.policy.monitor.hot_cpu_percent;
        let all_hot = self.window.iter().all(|e| e.cpu_percent >= hot);
        let first_len = self.window.front().map(|e| e.output_len).unwrap_or(0);
        let last_len = self.window.back().map(|e| e.output_len).unwrap_or(0);
        all_hot && first_len == last_len
    }

    /// Every consecutive sample multiplies memory by at least the configured
    /// ratio. Needs three samples so one allocation spike does not trip it.
    fn exponential_memory_growth(&self) -> bool {
        if !self.policy.category_enabled(RuleCategory::ForkBomb) {
            return false;
        }
        if self.window.len() < 3 {
            return false;
        }
        let ratio = self.policy.monitor.exponential_growth_ratio;
        self.window
            .iter()
            .zip(self.window.iter().skip(1))
            .all(|(a, b)| a.memory_bytes > 0 && b.memory_bytes as f64 >= a.memory_bytes as f64 * ratio)
    }

    /// Memory strictly climbing by at least the configured step each sample,
    /// without reaching the exponential ratio.
    fn linear_memory_growth(&self) -> bool {
        if !self.policy.category_enabled(RuleCategory::HeapAbuse) {
            return false;
        }
        if self.window.len() < 3 {
            return false;
        }
        let step = self.policy.monitor.linear_growth_min_bytes;
        self.window
            .iter()
            .zip(self.window.iter().skip(1))
            .all(|(a, b)| b.memory_bytes >= a.memory_bytes.saturating_add(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;

    const MB: u64 = 1024 * 1024;

    fn monitor() -> RuntimeMonitor {
        RuntimeMonitor::new(Arc::new(Policy::builtin()))
    }

    fn sample(cpu: f64, memory: u64, syscalls: u64) -> TelemetrySample {
        TelemetrySample {
            cpu_percent: cpu,
            memory_bytes: memory,
            syscall_count: syscalls,
        }
    }

    #[test]
    fn idle_workload_stays_normal() {
        let mut monitor = monitor();
        for i in 0..6 {
            let profile = monitor.observe(sample(12.0, 64 * MB, i * 10), i as usize);
            assert_eq!(profile.decision, BehaviorDecision::Normal);
            assert!(profile.detected_pattern.is_none());
        }
    }

    #[test]
    fn sustained_hot_cpu_without_output_is_malicious() {
        let mut monitor = monitor();
        let window = Policy::builtin().monitor.window_samples;

        let mut last = None;
        for _ in 0..window {
            last = Some(monitor.observe(sample(97.0, 64 * MB, 100), 3));
        }
        let profile = last.unwrap();
        assert_eq!(profile.decision, BehaviorDecision::Malicious);
        assert_eq!(
            profile.detected_pattern.as_deref(),
            Some("infinite loop-like behavior")
        );
    }

    #[test]
    fn hot_cpu_with_output_progress_is_not_an_infinite_loop() {
        let mut monitor = monitor();
        let window = Policy::builtin().monitor.window_samples;

        let mut last = None;
        for i in 0..window {
            last = Some(monitor.observe(sample(97.0, 64 * MB, 100), i));
        }
        assert_eq!(last.unwrap().decision, BehaviorDecision::Normal);
    }

    #[test]
    fn exponential_memory_growth_is_fork_bomb_like() {
        let mut monitor = monitor();
        monitor.observe(sample(40.0, 50 * MB, 0), 0);
        monitor.observe(sample(40.0, 100 * MB, 0), 1);
        let profile = monitor.observe(sample(40.0, 200 * MB, 0), 2);

        assert_eq!(profile.decision, BehaviorDecision::Malicious);
        assert_eq!(
            profile.detected_pattern.as_deref(),
            Some("fork-bomb-like behavior")
        );
    }

    #[test]
    fn linear_memory_growth_is_inefficient() {
        let mut monitor = monitor();
        monitor.observe(sample(30.0, 100 * MB, 0), 0);
        monitor.observe(sample(30.0, 102 * MB, 0), 1);
        let profile = monitor.observe(sample(30.0, 104 * MB, 0), 2);

        assert_eq!(profile.decision, BehaviorDecision::Inefficient);
        assert_eq!(
            profile.detected_pattern.as_deref(),
            Some("heap growth without bound")
        );
    }

    #[test]
    fn sub_threshold_growth_stays_normal() {
        let mut monitor = monitor();
        monitor.observe(sample(30.0, 100 * MB, 0), 0);
        monitor.observe(sample(30.0, 100 * MB + 1024, 0), 1);
        let profile = monitor.observe(sample(30.0, 100 * MB + 2048, 0), 2);
        assert_eq!(profile.decision, BehaviorDecision::Normal);
    }

    #[test]
    fn busy_cpu_outranks_memory_growth() {
        let mut monitor = monitor();
        let window = Policy::builtin().monitor.window_samples;

        let mut last = None;
        let mut memory = 50 * MB;
        for _ in 0..window.max(3) {
            last = Some(monitor.observe(sample(99.0, memory, 0), 0));
            memory *= 2;
        }
        let profile = last.unwrap();
        assert_eq!(profile.decision, BehaviorDecision::Malicious);
        assert_eq!(
            profile.detected_pattern.as_deref(),
            Some("infinite loop-like behavior")
        );
    }

    #[test]
    fn disabled_detection_category_is_skipped() {
        let mut policy = Policy::builtin();
        policy
            .categories
            .get_mut(&RuleCategory::ForkBomb)
            .unwrap()
            .enabled = false;
        let mut monitor = RuntimeMonitor::new(Arc::new(policy));

        monitor.observe(sample(40.0, 50 * MB, 0), 0);
        monitor.observe(sample(40.0, 150 * MB, 0), 1);
        let profile = monitor.observe(sample(40.0, 450 * MB, 0), 2);

        // With fork-bomb detection off, tripling memory still counts as
        // linear growth for the heap-abuse check.
        assert_ne!(
            profile.detected_pattern.as_deref(),
            Some("fork-bomb-like behavior")
        );
    }

    #[test]
    fn syscall_rate_reflects_delta_over_cadence() {
        let policy = Policy::builtin();
        let cadence_secs = policy.monitor.cadence_ms as f64 / 1000.0;
        let mut monitor = RuntimeMonitor::new(Arc::new(policy));

        monitor.observe(sample(10.0, 64 * MB, 1000), 0);
        let profile = monitor.observe(sample(10.0, 64 * MB, 1500), 1);
        let expected = 500.0 / cadence_secs;
        assert!((profile.syscall_rate - expected).abs() < f64::EPSILON * expected);
    }
}
