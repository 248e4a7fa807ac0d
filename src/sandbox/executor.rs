//! Parent-side execution orchestration.
//!
//! `SandboxExecutor::start` validates the declared budget against host caps,
//! creates the session, spawns the re-exec'd child, and hands back an
//! [`ExecutionHandle`] plus a supervision task. The supervision task is the
//! only place the child is waited on or killed: it enforces the wall-clock
//! budget as a last-resort backstop (independent of monitor and governor)
//! and reacts to the session's stop signal within one scheduling quantum.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::child::{CHILD_SENTINEL, ChildSpec};
use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::session::{ResourceLimits, SandboxSession, SessionStatus};
use crate::submission::Submission;

/// Bound on post-exit output draining.
const COLLECTION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SandboxExecutor {
    config: Arc<Config>,
}

/// Live control surface for one running sandbox. Shared with the governor
/// and the presentation layer; the session inside is the single source of
/// lifecycle truth.
pub struct ExecutionHandle {
    session: Arc<SandboxSession>,
    pid: u32,
    kill_grace: Duration,
    #[cfg(target_os = "linux")]
    cgroup: Option<super::cgroup::CgroupLimiter>,
}

impl SandboxExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Validate the declared budget, reserve resources, and launch. Returns
    /// `ResourceError` without creating any session when the request exceeds
    /// host capacity.
    pub async fn start(
        &self,
        submission: &Submission,
    ) -> Result<(Arc<ExecutionHandle>, JoinHandle<()>)> {
        let requested = submission.requested;
        let host = &self.config.host;

        if requested.cpu_percent == 0 || requested.memory_mb == 0 {
            return Err(SandboxError::Resource(
                "requested cpu and memory must be positive".to_string(),
            ));
        }
        if requested.cpu_percent > host.cpu_ceiling_percent {
            return Err(SandboxError::Resource(format!(
                "requested cpu {}% exceeds host cap {}%",
                requested.cpu_percent, host.cpu_ceiling_percent
            )));
        }
        if requested.memory_mb > host.memory_ceiling_mb {
            return Err(SandboxError::Resource(format!(
                "requested memory {} MB exceeds host cap {} MB",
                requested.memory_mb, host.memory_ceiling_mb
            )));
        }
        let time_limit = requested.time_limit;
        if time_limit.is_zero()
            || time_limit > Duration::from_secs(self.config.sandbox.max_time_limit_secs)
        {
            return Err(SandboxError::Resource(format!(
                "time limit {:?} outside the accepted range (0, {}s]",
                time_limit, self.config.sandbox.max_time_limit_secs
            )));
        }

        let session = Arc::new(SandboxSession::new(
            submission.fingerprint(),
            ResourceLimits {
                cpu_percent: requested.cpu_percent,
                memory_mb: requested.memory_mb,
            },
            self.config.bounds(),
        ));

        let workdir = self.config.workdir_root().join(session.id().to_string());
        if let Err(e) = self.prepare_workdir(&workdir, submission) {
            session.fail(format!("workspace setup failed: {}", e));
            return Err(e);
        }

        #[cfg(target_os = "linux")]
        let cgroup = match super::cgroup::CgroupLimiter::create(session.id()) {
            Ok(limiter) => {
                if let Err(e) = limiter.apply(session.limits()) {
                    warn!(error = %e, "cgroup limits not applied; degrading to rlimits");
                    None
                } else {
                    Some(limiter)
                }
            }
            Err(e) => {
                debug!(error = %e, "cgroup hierarchy unavailable; degrading to rlimits");
                None
            }
        };

        let spec = ChildSpec {
            interpreter: self.config.sandbox.interpreter.clone(),
            script_path: workdir.join("script"),
            workdir: workdir.clone(),
            memory_mb: session.limits().memory_mb,
            cpu_time_secs: time_limit.as_secs().max(1),
            max_processes: self.config.sandbox.max_processes,
            max_file_size_bytes: self.config.sandbox.max_file_size_bytes,
            harden: self.config.sandbox.harden,
        };

        let mut child = match spawn_child(&spec).await {
            Ok(child) => child,
            Err(e) => {
                session.fail(format!("spawn failed: {}", e));
                let _ = std::fs::remove_dir_all(&workdir);
                return Err(e);
            }
        };
        let pid = child.id().unwrap_or_default();

        #[cfg(target_os = "linux")]
        if let Some(ref limiter) = cgroup
            && let Err(e) = limiter.attach(pid)
        {
            warn!(error = %e, "cgroup attach failed; limits stay rlimit-only");
        }

        session.mark_running()?;
        let _ = session.append_output(format!("process started (pid {})", pid));

        let handle = Arc::new(ExecutionHandle {
            session: session.clone(),
            pid,
            kill_grace: Duration::from_millis(self.config.sandbox.kill_grace_ms),
            #[cfg(target_os = "linux")]
            cgroup,
        });

        let output_budget = Arc::new(OutputBudget::new(self.config.sandbox.max_output_bytes));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|stream| {
            tokio::spawn(copy_lines(stream, session.clone(), output_budget.clone(), ""))
        });
        let err_task = stderr.map(|stream| {
            tokio::spawn(copy_lines(
                stream,
                session.clone(),
                output_budget.clone(),
                "[stderr] ",
            ))
        });

        let supervision = tokio::spawn(supervise(
            child,
            handle.clone(),
            workdir,
            time_limit,
            out_task,
            err_task,
        ));

        Ok((handle, supervision))
    }

    fn prepare_workdir(&self, workdir: &PathBuf, submission: &Submission) -> Result<()> {
        std::fs::create_dir_all(workdir)?;
        std::fs::write(workdir.join("script"), &submission.source)?;
        Ok(())
    }
}

impl ExecutionHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[async_trait]
impl super::SandboxControl for ExecutionHandle {
    fn session(&self) -> &Arc<SandboxSession> {
        &self.session
    }

    async fn set_limits(&self, cpu_percent: u32, memory_mb: u32) -> Result<ResourceLimits> {
        let effective = self.session.set_limits(cpu_percent, memory_mb)?;
        #[cfg(target_os = "linux")]
        if let Some(ref limiter) = self.cgroup
            && let Err(e) = limiter.apply(effective)
        {
            warn!(error = %e, "cgroup update failed; recorded limits still clamp the governor");
        }
        Ok(effective)
    }

    async fn terminate(&self, reason: &str) {
        if self.session.terminate(reason) {
            debug!(session = %self.session.id(), reason, "termination requested");
        }
    }
}

async fn spawn_child(spec: &ChildSpec) -> Result<Child> {
    let spec_json = serde_json::to_string(spec)
        .map_err(|e| SandboxError::Process(format!("serialize launch spec: {}", e)))?;
    let exe = std::env::current_exe()
        .map_err(|e| SandboxError::Process(format!("resolve current exe: {}", e)))?;

    let mut cmd = Command::new(&exe);
    cmd.arg(&spec_json)
        .current_dir(&spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // argv[0] sentinel dispatches into sandbox_child_main before any
        // runtime initialization; own process group so teardown signals the
        // whole tree.
        cmd.as_std_mut().arg0(CHILD_SENTINEL).process_group(0);
    }

    cmd.spawn()
        .map_err(|e| SandboxError::Process(format!("spawn sandbox child: {}", e)))
}

/// Shared byte budget across stdout and stderr. The truncation marker is
/// appended exactly once.
struct OutputBudget {
    remaining: AtomicU64,
    truncated: AtomicBool,
}

impl OutputBudget {
    fn new(limit: u64) -> Self {
        Self {
            remaining: AtomicU64::new(limit),
            truncated: AtomicBool::new(false),
        }
    }

    /// Returns false once the budget is exhausted.
    fn consume(&self, bytes: u64) -> bool {
        let mut current = self.remaining.load(Ordering::Relaxed);
        loop {
            if current < bytes {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                current,
                current - bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn mark_truncated(&self) -> bool {
        !self.truncated.swap(true, Ordering::Relaxed)
    }
}

/// Drain one child stream into the session log. Draining continues past a
/// terminal state or an exhausted budget so the child never blocks on a full
/// pipe; only the appends stop.
async fn copy_lines<R>(
    stream: R,
    session: Arc<SandboxSession>,
    budget: Arc<OutputBudget>,
    prefix: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if budget.consume(line.len() as u64 + prefix.len() as u64) {
                    let _ = session.append_output(format!("{}{}", prefix, line));
                } else if budget.mark_truncated() {
                    let _ = session.append_output("[output truncated: byte limit reached]");
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// Supervise one run: wall-clock backstop, stop-signal reaction, teardown.
async fn supervise(
    mut child: Child,
    handle: Arc<ExecutionHandle>,
    workdir: PathBuf,
    time_limit: Duration,
    out_task: Option<JoinHandle<()>>,
    err_task: Option<JoinHandle<()>>,
) {
    let session = handle.session.clone();
    let mut stopped = session.stopped();
    let mut out_task = out_task;
    let mut err_task = err_task;
    let deadline = tokio::time::sleep(time_limit);
    tokio::pin!(deadline);

    // A terminate racing the spawn may have landed already.
    if *stopped.borrow() {
        kill_child(&mut child, handle.pid, handle.kill_grace).await;
    } else {
        loop {
            tokio::select! {
                status = child.wait() => {
                    // Natural completion. Let the readers drain the tail of
                    // the pipes, then record the exit and transition. The
                    // drain is bounded: a detached grandchild can keep the
                    // pipe open indefinitely.
                    let _ = tokio::time::timeout(
                        COLLECTION_TIMEOUT,
                        join_readers(&mut out_task, &mut err_task),
                    )
                    .await;
                    let line = match status {
                        Ok(st) => match st.code() {
                            Some(code) => format!("process exited with code {}", code),
                            None => "process stopped by signal".to_string(),
                        },
                        Err(e) => format!("wait failed: {}", e),
                    };
                    let _ = session.append_output(line);
                    session.complete();
                    break;
                }
                _ = &mut deadline => {
                    // Declared budget exhausted with no natural completion:
                    // this is a Terminated case, enforced by the sandbox
                    // itself regardless of monitor or governor health.
                    session.terminate("time limit exceeded");
                    kill_child(&mut child, handle.pid, handle.kill_grace).await;
                    break;
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow_and_update() {
                        kill_child(&mut child, handle.pid, handle.kill_grace).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = child.wait().await;
    let _ = tokio::time::timeout(
        COLLECTION_TIMEOUT,
        join_readers(&mut out_task, &mut err_task),
    )
    .await;

    // Teardown is hygiene, not the safety boundary: the child is reaped
    // before the cgroup and workspace go away.
    #[cfg(target_os = "linux")]
    if let Some(ref limiter) = handle.cgroup
        && let Err(e) = limiter.cleanup()
    {
        debug!(error = %e, "cgroup cleanup deferred");
    }
    if let Err(e) = std::fs::remove_dir_all(&workdir) {
        debug!(error = %e, workdir = %workdir.display(), "workspace cleanup failed");
    }

    // A session still Running here means the loop exited abnormally.
    if session.status() == SessionStatus::Running {
        session.fail("supervision ended without a terminal transition");
    }
}

async fn join_readers(out: &mut Option<JoinHandle<()>>, err: &mut Option<JoinHandle<()>>) {
    if let Some(task) = out.take() {
        let _ = task.await;
    }
    if let Some(task) = err.take() {
        let _ = task.await;
    }
}

/// Cooperative stop, then forced reclamation after the grace period.
async fn kill_child(child: &mut Child, pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if pid == 0 {
            let _ = child.start_kill();
            return;
        }

        let pgid = Pid::from_raw(pid as i32);
        if killpg(pgid, Signal::SIGTERM).is_err() {
            // Group may be gone already; fall through to the direct kill.
            let _ = child.start_kill();
        }

        tokio::time::sleep(grace).await;

        if child.try_wait().ok().flatten().is_none() {
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.start_kill();
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = grace;
        let _ = child.start_kill();
    }
}
