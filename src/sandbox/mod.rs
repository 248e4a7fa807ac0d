//! Execution sandbox — kernel-enforced isolation for one untrusted script.
//!
//! Uses the argv[0] re-exec pattern: the binary re-executes itself with
//! argv[0]="watchbox-sandbox", applies resource limits and platform hardening
//! in the clean single-threaded child, then execs the interpreter. The parent
//! side owns the session lifecycle: wall-clock backstop, output collection,
//! SIGTERM → grace → SIGKILL teardown, and live limit adjustment through a
//! per-session cgroup where available.

pub mod child;
pub mod detect;
pub mod executor;

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(target_os = "linux")]
pub mod linux;

pub use child::{CHILD_SENTINEL, ChildSpec, sandbox_child_main};
pub use detect::{SandboxCapabilities, detect_capabilities};
pub use executor::{ExecutionHandle, SandboxExecutor};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::{ResourceLimits, SandboxSession};

/// Control surface the governor (and the presentation layer) uses to act on
/// a running sandbox. The sandbox remains the sole owner of lifecycle state;
/// callers request, never assign.
#[async_trait]
pub trait SandboxControl: Send + Sync {
    fn session(&self) -> &Arc<SandboxSession>;

    /// Adjust live limits. Clamped to the configured floor/ceiling; takes
    /// effect on the next scheduling quantum and never kills in-flight work.
    async fn set_limits(&self, cpu_percent: u32, memory_mb: u32) -> Result<ResourceLimits>;

    /// Request termination. Idempotent; the first caller's reason wins.
    async fn terminate(&self, reason: &str);
}
