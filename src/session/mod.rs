//! Sandbox session lifecycle and shared state.
//!
//! A `SandboxSession` is one isolated, resource-bounded execution instance.
//! Status transitions are one-directional (Pending → Running → one of
//! Completed / Terminated / Failed) and serialize through a single mutex —
//! the executor's output loop, the monitor task, and the governor all share
//! the session through an `Arc`, and whoever wins the lock performs the
//! terminal transition exactly once. The losers see a no-op.
//!
//! The output log is append-only and never reordered; a broadcast channel
//! mirrors appended lines to presentation-layer subscribers.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::monitor::BehaviorProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Terminated | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Live resource limits of a session. Mutable while Running, via
/// [`SandboxSession::set_limits`] only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_percent: u32,
    pub memory_mb: u32,
}

/// Floor/ceiling clamps for limit adjustments. Floors guarantee a governor
/// penalty can never starve a session to zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitBounds {
    pub cpu_floor_percent: u32,
    pub cpu_ceiling_percent: u32,
    pub memory_floor_mb: u32,
    pub memory_ceiling_mb: u32,
}

impl LimitBounds {
    pub fn clamp(&self, limits: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_percent: limits
                .cpu_percent
                .clamp(self.cpu_floor_percent, self.cpu_ceiling_percent),
            memory_mb: limits
                .memory_mb
                .clamp(self.memory_floor_mb, self.memory_ceiling_mb),
        }
    }
}

/// One line of the append-only output log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub text: String,
}

struct SessionState {
    status: SessionStatus,
    limits: ResourceLimits,
    output: Vec<OutputLine>,
    profile: Option<BehaviorProfile>,
    termination_reason: Option<String>,
    failure_cause: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

pub struct SandboxSession {
    id: Uuid,
    fingerprint: String,
    created_at: DateTime<Utc>,
    bounds: LimitBounds,
    state: Mutex<SessionState>,
    output_tx: broadcast::Sender<OutputLine>,
    stop_tx: watch::Sender<bool>,
}

impl SandboxSession {
    pub fn new(fingerprint: String, initial: ResourceLimits, bounds: LimitBounds) -> Self {
        let (output_tx, _) = broadcast::channel(256);
        let (stop_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            created_at: Utc::now(),
            bounds,
            state: Mutex::new(SessionState {
                status: SessionStatus::Pending,
                limits: bounds.clamp(initial),
                output: Vec::new(),
                profile: None,
                termination_reason: None,
                failure_cause: None,
                finished_at: None,
            }),
            output_tx,
            stop_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn bounds(&self) -> LimitBounds {
        self.bounds
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn limits(&self) -> ResourceLimits {
        self.lock().limits
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().finished_at
    }

    pub fn termination_reason(&self) -> Option<String> {
        self.lock().termination_reason.clone()
    }

    pub fn failure_cause(&self) -> Option<String> {
        self.lock().failure_cause.clone()
    }

    /// Copy of the output log, in append order.
    pub fn output_snapshot(&self) -> Vec<OutputLine> {
        self.lock().output.clone()
    }

    pub fn output_len(&self) -> usize {
        self.lock().output.len()
    }

    /// Subscribe to output lines as they are appended. Slow consumers may
    /// lag; the log itself is the source of truth.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output_tx.subscribe()
    }

    /// Receiver that flips to `true` on any terminal transition. The
    /// execution path selects on this so a terminate call propagates within
    /// one scheduling quantum.
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn last_profile(&self) -> Option<BehaviorProfile> {
        self.lock().profile.clone()
    }

    /// Replace the behavior profile. Last value wins; samples arriving after
    /// a terminal transition are dropped.
    pub fn set_profile(&self, profile: BehaviorProfile) {
        let mut state = self.lock();
        if state.status == SessionStatus::Running {
            state.profile = Some(profile);
        }
    }

    /// Pending → Running, once resources are reserved.
    pub fn mark_running(&self) -> Result<()> {
        let mut state = self.lock();
        if state.status != SessionStatus::Pending {
            return Err(SandboxError::InvalidState {
                operation: "mark_running",
                status: state.status,
            });
        }
        state.status = SessionStatus::Running;
        Ok(())
    }

    /// Append one line to the output log. The only way output is added.
    pub fn append_output(&self, text: impl Into<String>) -> Result<u64> {
        let mut state = self.lock();
        if state.status != SessionStatus::Running {
            return Err(SandboxError::InvalidState {
                operation: "append_output",
                status: state.status,
            });
        }
        let line = OutputLine {
            seq: state.output.len() as u64,
            at: Utc::now(),
            text: text.into(),
        };
        state.output.push(line.clone());
        let _ = self.output_tx.send(line.clone());
        Ok(line.seq)
    }

    /// Adjust live limits, clamped to the configured floor/ceiling. Takes
    /// effect on the next scheduling quantum; never kills in-flight work.
    pub fn set_limits(&self, cpu_percent: u32, memory_mb: u32) -> Result<ResourceLimits> {
        let mut state = self.lock();
        if state.status != SessionStatus::Running {
            return Err(SandboxError::InvalidState {
                operation: "set_limits",
                status: state.status,
            });
        }
        let effective = self.bounds.clamp(ResourceLimits {
            cpu_percent,
            memory_mb,
        });
        state.limits = effective;
        Ok(effective)
    }

    /// Running (or Pending) → Terminated. Idempotent: the first call wins and
    /// keeps its reason and timestamp; later calls — including a terminate
    /// racing natural completion — are no-ops and return `false`.
    pub fn terminate(&self, reason: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = SessionStatus::Terminated;
        state.termination_reason = Some(reason.into());
        state.finished_at = Some(Utc::now());
        drop(state);
        self.stop_tx.send_replace(true);
        true
    }

    /// Running → Completed on natural completion. First terminal transition
    /// wins; returns `false` if the session already ended.
    pub fn complete(&self) -> bool {
        let mut state = self.lock();
        if state.status != SessionStatus::Running {
            return false;
        }
        state.status = SessionStatus::Completed;
        state.finished_at = Some(Utc::now());
        drop(state);
        self.stop_tx.send_replace(true);
        true
    }

    /// Any non-terminal state → Failed, with a recorded cause. Used for
    /// infrastructure faults (telemetry loss, spawn errors), never for the
    /// workload's own exit status.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = SessionStatus::Failed;
        state.failure_cause = Some(cause.into());
        state.finished_at = Some(Utc::now());
        drop(state);
        self.stop_tx.send_replace(true);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> LimitBounds {
        LimitBounds {
            cpu_floor_percent: 10,
            cpu_ceiling_percent: 100,
            memory_floor_mb: 32,
            memory_ceiling_mb: 2048,
        }
    }

    fn running_session() -> SandboxSession {
        let session = SandboxSession::new(
            "fp".to_string(),
            ResourceLimits {
                cpu_percent: 50,
                memory_mb: 256,
            },
            bounds(),
        );
        session.mark_running().unwrap();
        session
    }

    #[test]
    fn lifecycle_pending_running_completed() {
        let session = SandboxSession::new(
            "fp".to_string(),
            ResourceLimits {
                cpu_percent: 50,
                memory_mb: 256,
            },
            bounds(),
        );
        assert_eq!(session.status(), SessionStatus::Pending);
        session.mark_running().unwrap();
        assert_eq!(session.status(), SessionStatus::Running);
        assert!(session.complete());
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.finished_at().is_some());
    }

    #[test]
    fn append_output_requires_running() {
        let session = SandboxSession::new(
            "fp".to_string(),
            ResourceLimits {
                cpu_percent: 50,
                memory_mb: 256,
            },
            bounds(),
        );
        assert!(matches!(
            session.append_output("early"),
            Err(SandboxError::InvalidState { operation, .. }) if operation == "append_output"
        ));

        session.mark_running().unwrap();
        session.append_output("line 0").unwrap();
        session.append_output("line 1").unwrap();
        session.terminate("done");

        assert!(session.append_output("late").is_err());
        let log = session.output_snapshot();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].seq, 1);
        assert_eq!(log[1].text, "line 1");
    }

    #[test]
    fn set_limits_clamps_to_floor_and_ceiling() {
        let session = running_session();
        let effective = session.set_limits(200, 1).unwrap();
        assert_eq!(effective.cpu_percent, 100);
        assert_eq!(effective.memory_mb, 32);
        assert_eq!(session.limits(), effective);
    }

    #[test]
    fn set_limits_rejected_after_terminal_state() {
        let session = running_session();
        session.terminate("stop");
        assert!(matches!(
            session.set_limits(60, 128),
            Err(SandboxError::InvalidState { .. })
        ));
    }

    #[test]
    fn terminate_is_idempotent_first_reason_wins() {
        let session = running_session();
        assert!(session.terminate("first reason"));
        let first_finished = session.finished_at().unwrap();

        assert!(!session.terminate("second reason"));
        assert_eq!(session.termination_reason().unwrap(), "first reason");
        assert_eq!(session.finished_at().unwrap(), first_finished);
    }

    #[test]
    fn completion_racing_terminate_keeps_first_transition() {
        let session = running_session();
        assert!(session.terminate("killed"));
        assert!(!session.complete());
        assert_eq!(session.status(), SessionStatus::Terminated);

        let session = running_session();
        assert!(session.complete());
        assert!(!session.terminate("too late"));
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.termination_reason().is_none());
    }

    #[test]
    fn fail_records_cause_once() {
        let session = running_session();
        assert!(session.fail("telemetry lost"));
        assert!(!session.fail("second cause"));
        assert_eq!(session.failure_cause().unwrap(), "telemetry lost");
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[test]
    fn stop_signal_fires_on_terminal_transition() {
        let session = running_session();
        let rx = session.stopped();
        assert!(!*rx.borrow());
        session.terminate("stop");
        assert!(*rx.borrow());
    }

    #[test]
    fn profile_updates_dropped_after_termination() {
        use crate::monitor::{BehaviorDecision, BehaviorProfile};

        let session = running_session();
        session.set_profile(BehaviorProfile::normal_sample(12.0, 64 * 1024 * 1024, 0.0));
        assert!(session.last_profile().is_some());

        session.terminate("stop");
        session.set_profile(BehaviorProfile {
            decision: BehaviorDecision::Malicious,
            detected_pattern: Some("late".to_string()),
            cpu_percent: 99.0,
            memory_bytes: 0,
            syscall_rate: 0.0,
            sampled_at: Utc::now(),
        });
        let profile = session.last_profile().unwrap();
        assert_eq!(profile.decision, BehaviorDecision::Normal);
    }
}
