//! Adaptive resource governance.
//!
//! The governor is the only component that reacts to behavior
//! classifications: it terminates on Malicious, tightens memory on
//! Inefficient, and boosts CPU once per transition into sustained-normal
//! behavior. The boost is edge-triggered — repeated Normal windows must not
//! compound the multiplier past the ceiling, so a latch arms on every exit
//! from Normal and fires at most once per entry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::monitor::{BehaviorDecision, BehaviorProfile};
use crate::policy::Policy;
use crate::sandbox::SandboxControl;

pub struct AdaptiveGovernor {
    policy: Arc<Policy>,
    normal_streak: usize,
    boost_applied: bool,
}

impl AdaptiveGovernor {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self {
            policy,
            normal_streak: 0,
            boost_applied: false,
        }
    }

    /// React to one behavior profile. Malicious classification is terminal
    /// and not reversible within a session.
    pub async fn react(&mut self, control: &dyn SandboxControl, profile: &BehaviorProfile) {
        match profile.decision {
            BehaviorDecision::Malicious => {
                self.normal_streak = 0;
                let reason = profile
                    .detected_pattern
                    .clone()
                    .unwrap_or_else(|| "malicious behavior detected".to_string());
                info!(session = %control.session().id(), %reason, "terminating session");
                control.terminate(&reason).await;
            }
            BehaviorDecision::Inefficient => {
                self.normal_streak = 0;
                self.boost_applied = false;
                if let Err(e) = self.penalize(control, profile).await {
                    self.report_skipped("memory penalty", e);
                }
            }
            BehaviorDecision::Normal => {
                self.normal_streak += 1;
                if self.normal_streak >= self.policy.monitor.window_samples && !self.boost_applied {
                    match self.boost(control).await {
                        Ok(()) => self.boost_applied = true,
                        Err(e) => self.report_skipped("cpu boost", e),
                    }
                }
            }
        }
    }

    async fn penalize(&self, control: &dyn SandboxControl, profile: &BehaviorProfile) -> Result<()> {
        let adaptive = self.policy.adaptive_limits;
        if !adaptive.enabled {
            return Ok(());
        }
        let session = control.session();
        let limits = session.limits();
        let target = (limits.memory_mb as f64 * adaptive.penalty_factor).floor() as u32;
        let effective = control.set_limits(limits.cpu_percent, target).await?;
        let note = format!(
            "resource governor: memory limit reduced to {} MB ({})",
            effective.memory_mb,
            profile
                .detected_pattern
                .as_deref()
                .unwrap_or("inefficient behavior"),
        );
        session.append_output(note)?;
        Ok(())
    }

    async fn boost(&self, control: &dyn SandboxControl) -> Result<()> {
        let adaptive = self.policy.adaptive_limits;
        if !adaptive.enabled {
            return Ok(());
        }
        let session = control.session();
        let limits = session.limits();
        let target = (limits.cpu_percent as f64 * adaptive.boost_factor).floor() as u32;
        let effective = control.set_limits(target, limits.memory_mb).await?;
        if effective.cpu_percent != limits.cpu_percent {
            session.append_output(format!(
                "resource governor: cpu limit raised to {}% after sustained normal behavior",
                effective.cpu_percent
            ))?;
        }
        Ok(())
    }

    /// A governor action racing the terminal transition loses cleanly; any
    /// other failure is worth a warning.
    fn report_skipped(&self, action: &str, err: SandboxError) {
        match err {
            SandboxError::InvalidState { .. } => {
                debug!(action, "adjustment skipped: session already ended")
            }
            other => warn!(action, error = %other, "governor adjustment failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::session::{LimitBounds, ResourceLimits, SandboxSession};

    struct FakeControl {
        session: Arc<SandboxSession>,
        terminations: Mutex<Vec<String>>,
    }

    impl FakeControl {
        fn new(cpu: u32, memory: u32, bounds: LimitBounds) -> Self {
            let session = Arc::new(SandboxSession::new(
                "fp".to_string(),
                ResourceLimits {
                    cpu_percent: cpu,
                    memory_mb: memory,
                },
                bounds,
            ));
            session.mark_running().unwrap();
            Self {
                session,
                terminations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxControl for FakeControl {
        fn session(&self) -> &Arc<SandboxSession> {
            &self.session
        }

        async fn set_limits(&self, cpu_percent: u32, memory_mb: u32) -> Result<ResourceLimits> {
            self.session.set_limits(cpu_percent, memory_mb)
        }

        async fn terminate(&self, reason: &str) {
            self.terminations.lock().unwrap().push(reason.to_string());
            self.session.terminate(reason);
        }
    }

    fn bounds() -> LimitBounds {
        LimitBounds {
            cpu_floor_percent: 10,
            cpu_ceiling_percent: 100,
            memory_floor_mb: 32,
            memory_ceiling_mb: 2048,
        }
    }

    fn inefficient() -> BehaviorProfile {
        BehaviorProfile {
            decision: BehaviorDecision::Inefficient,
            detected_pattern: Some("heap growth without bound".to_string()),
            cpu_percent: 40.0,
            memory_bytes: 0,
            syscall_rate: 0.0,
            sampled_at: chrono::Utc::now(),
        }
    }

    fn normal() -> BehaviorProfile {
        BehaviorProfile::normal_sample(20.0, 0, 0.0)
    }

    fn malicious(pattern: &str) -> BehaviorProfile {
        BehaviorProfile {
            decision: BehaviorDecision::Malicious,
            detected_pattern: Some(pattern.to_string()),
            cpu_percent: 99.0,
            memory_bytes: 0,
            syscall_rate: 0.0,
            sampled_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn inefficient_applies_memory_penalty() {
        let control = FakeControl::new(50, 256, bounds());
        let mut governor = AdaptiveGovernor::new(Arc::new(Policy::builtin()));

        governor.react(&control, &inefficient()).await;

        // 256 * 0.8 = 204.8, floored to 204.
        assert_eq!(control.session.limits().memory_mb, 204);
        let log = control.session.output_snapshot();
        assert!(log.iter().any(|l| l.text.contains("204 MB")));
    }

    #[tokio::test]
    async fn repeated_penalties_reduce_monotonically_but_respect_floor() {
        let control = FakeControl::new(50, 256, bounds());
        let mut governor = AdaptiveGovernor::new(Arc::new(Policy::builtin()));

        let mut previous = control.session.limits().memory_mb;
        for _ in 0..40 {
            governor.react(&control, &inefficient()).await;
            let current = control.session.limits().memory_mb;
            assert!(current <= previous);
            assert!(current >= bounds().memory_floor_mb);
            previous = current;
        }
        assert_eq!(previous, bounds().memory_floor_mb);
    }

    #[tokio::test]
    async fn sustained_normal_boosts_cpu_once_per_transition() {
        let policy = Arc::new(Policy::builtin());
        let window = policy.monitor.window_samples;
        let control = FakeControl::new(50, 256, bounds());
        let mut governor = AdaptiveGovernor::new(policy);

        // One full window of Normal: 50 * 1.2 = 60.
        for _ in 0..window {
            governor.react(&control, &normal()).await;
        }
        assert_eq!(control.session.limits().cpu_percent, 60);

        // A second consecutive window must NOT push it to 72.
        for _ in 0..window {
            governor.react(&control, &normal()).await;
        }
        assert_eq!(control.session.limits().cpu_percent, 60);
    }

    #[tokio::test]
    async fn boost_rearms_after_leaving_normal() {
        let policy = Arc::new(Policy::builtin());
        let window = policy.monitor.window_samples;
        let control = FakeControl::new(50, 256, bounds());
        let mut governor = AdaptiveGovernor::new(policy);

        for _ in 0..window {
            governor.react(&control, &normal()).await;
        }
        assert_eq!(control.session.limits().cpu_percent, 60);

        governor.react(&control, &inefficient()).await;

        for _ in 0..window {
            governor.react(&control, &normal()).await;
        }
        // 60 * 1.2 = 72: a genuine re-entry into Normal boosts again.
        assert_eq!(control.session.limits().cpu_percent, 72);
    }

    #[tokio::test]
    async fn boost_is_capped_at_ceiling() {
        let policy = Arc::new(Policy::builtin());
        let window = policy.monitor.window_samples;
        let control = FakeControl::new(90, 256, bounds());
        let mut governor = AdaptiveGovernor::new(policy);

        for _ in 0..window {
            governor.react(&control, &normal()).await;
        }
        assert_eq!(control.session.limits().cpu_percent, 100);
    }

    #[tokio::test]
    async fn malicious_terminates_with_detected_pattern() {
        let control = FakeControl::new(50, 256, bounds());
        let mut governor = AdaptiveGovernor::new(Arc::new(Policy::builtin()));

        governor
            .react(&control, &malicious("infinite loop-like behavior"))
            .await;

        let terminations = control.terminations.lock().unwrap();
        assert_eq!(terminations.as_slice(), ["infinite loop-like behavior"]);
        assert_eq!(
            control.session.termination_reason().unwrap(),
            "infinite loop-like behavior"
        );
    }

    #[tokio::test]
    async fn adaptive_disabled_leaves_limits_untouched() {
        let mut policy = Policy::builtin();
        policy.adaptive_limits.enabled = false;
        let window = policy.monitor.window_samples;
        let control = FakeControl::new(50, 256, bounds());
        let mut governor = AdaptiveGovernor::new(Arc::new(policy));

        governor.react(&control, &inefficient()).await;
        for _ in 0..window {
            governor.react(&control, &normal()).await;
        }

        let limits = control.session.limits();
        assert_eq!(limits.cpu_percent, 50);
        assert_eq!(limits.memory_mb, 256);
    }
}
