//! End-to-end orchestration for one submission.
//!
//! Pipeline: static screening → advisory safety check (fail closed) →
//! sandbox launch → concurrent monitoring/governance until the session
//! reaches a terminal state. The runner owns the wiring, not the decisions:
//! screening verdicts come from the policy, behavior classification from the
//! monitor, and every limit mutation or kill goes through the sandbox's own
//! control surface.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::advisory::{AdvisoryCheck, AdvisoryVerdict};
use crate::config::Config;
use crate::error::Result;
use crate::governor::AdaptiveGovernor;
use crate::monitor::{BehaviorProfile, RuntimeMonitor};
use crate::policy::Policy;
use crate::sandbox::{SandboxControl, SandboxExecutor};
use crate::screen::{Screener, ScreeningVerdict};
use crate::session::{OutputLine, ResourceLimits, SessionStatus};
use crate::submission::Submission;
use crate::telemetry::TelemetrySource;

/// Everything the presentation layer needs to render one run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub verdict: ScreeningVerdict,
    pub advisory: Option<AdvisoryVerdict>,
    pub session_id: Option<uuid::Uuid>,
    pub final_status: Option<SessionStatus>,
    pub termination_reason: Option<String>,
    pub failure_cause: Option<String>,
    pub final_limits: Option<ResourceLimits>,
    pub profile: Option<BehaviorProfile>,
    pub output: Vec<OutputLine>,
}

impl RunReport {
    fn blocked(verdict: ScreeningVerdict, advisory: Option<AdvisoryVerdict>) -> Self {
        Self {
            verdict,
            advisory,
            session_id: None,
            final_status: None,
            termination_reason: None,
            failure_cause: None,
            final_limits: None,
            profile: None,
            output: Vec::new(),
        }
    }
}

pub struct SessionRunner {
    config: Arc<Config>,
    executor: SandboxExecutor,
}

impl SessionRunner {
    pub fn new(config: Arc<Config>) -> Self {
        let executor = SandboxExecutor::new(config.clone());
        Self { config, executor }
    }

    /// Run one submission to its terminal state.
    pub async fn run(
        &self,
        submission: Submission,
        policy: Arc<Policy>,
        advisory: Option<Arc<dyn AdvisoryCheck>>,
    ) -> Result<RunReport> {
        let verdict = Screener::compile(&policy)?.screen(&submission);
        if !verdict.allowed {
            info!(reason = %verdict.reason, "submission blocked by static screening");
            return Ok(RunReport::blocked(verdict, None));
        }

        let advisory_verdict = match advisory {
            Some(check) => match check.assess(&submission.source).await {
                Ok(result) if result.is_safe => Some(result),
                Ok(result) => {
                    info!(reason = %result.reason, "submission blocked by advisory check");
                    let verdict = ScreeningVerdict {
                        allowed: false,
                        reason: format!("advisory safety check rejected the code: {}", result.reason),
                        matched_rule: None,
                    };
                    return Ok(RunReport::blocked(verdict, Some(result)));
                }
                Err(e) => {
                    // Fail closed: an unavailable safety check blocks the
                    // run; it never degrades to "assume safe".
                    warn!(error = %e, "advisory check unavailable; failing closed");
                    let verdict = ScreeningVerdict {
                        allowed: false,
                        reason: format!("could not verify code safety: {}", e),
                        matched_rule: None,
                    };
                    return Ok(RunReport::blocked(verdict, None));
                }
            },
            None => None,
        };

        let (handle, supervision) = self.executor.start(&submission).await?;
        let session = handle.session().clone();
        info!(session = %session.id(), fingerprint = %session.fingerprint(), "session started");

        let telemetry = default_telemetry(handle.pid());
        let grace = Duration::from_millis(self.config.telemetry.grace_ms);

        let monitor_loop = monitor_session(handle.as_ref(), telemetry.as_ref(), policy.clone(), grace);
        let (supervision_result, _) = tokio::join!(supervision, monitor_loop);
        if let Err(e) = supervision_result {
            warn!(error = %e, "supervision task aborted");
        }

        Ok(RunReport {
            verdict,
            advisory: advisory_verdict,
            session_id: Some(session.id()),
            final_status: Some(session.status()),
            termination_reason: session.termination_reason(),
            failure_cause: session.failure_cause(),
            final_limits: Some(session.limits()),
            profile: session.last_profile(),
            output: session.output_snapshot(),
        })
    }
}

fn default_telemetry(pid: u32) -> Arc<dyn TelemetrySource> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(crate::telemetry::ProcTelemetry::new(pid as i32))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        warn!("no /proc on this platform; runtime telemetry degraded to idle samples");
        Arc::new(crate::telemetry::NullTelemetry)
    }
}

/// Sample telemetry on the policy cadence while the session is Running,
/// classify, and let the governor react. Telemetry silence past the grace
/// period is an anomaly that fails the session.
pub(crate) async fn monitor_session(
    control: &dyn SandboxControl,
    telemetry: &dyn TelemetrySource,
    policy: Arc<Policy>,
    grace: Duration,
) {
    let session = control.session().clone();
    let mut stopped = session.stopped();
    if *stopped.borrow() {
        return;
    }

    let mut monitor = RuntimeMonitor::new(policy.clone());
    let mut governor = AdaptiveGovernor::new(policy.clone());
    let mut interval = tokio::time::interval(Duration::from_millis(policy.monitor.cadence_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sample = Instant::now();

    loop {
        tokio::select! {
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow_and_update() {
                    break;
                }
            }
            _ = interval.tick() => {
                if session.status() != SessionStatus::Running {
                    break;
                }
                match telemetry.sample().await {
                    Ok(sample) => {
                        last_sample = Instant::now();
                        let profile = monitor.observe(sample, session.output_len());
                        session.set_profile(profile.clone());
                        governor.react(control, &profile).await;
                    }
                    Err(e) => {
                        let silent_for = last_sample.elapsed();
                        if silent_for >= grace {
                            warn!(error = %e, ?silent_for, "telemetry lost; failing session");
                            session.fail(format!(
                                "telemetry unavailable for {:?}: {}",
                                silent_for, e
                            ));
                            break;
                        }
                    }
                }
            }
        }
    }
}
