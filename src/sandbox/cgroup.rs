//! Per-session cgroup v2 limiter.
//!
//! CPU percentage maps to `cpu.max` (quota/period), memory to `memory.max`,
//! so governor adjustments land in the kernel and take effect on the next
//! scheduling quantum. Everything here is best-effort: on hosts without a
//! writable unified hierarchy the caller degrades to rlimits and logs it.

use std::fs;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::session::ResourceLimits;

const CPU_PERIOD_USEC: u64 = 100_000;

pub struct CgroupLimiter {
    path: PathBuf,
}

impl CgroupLimiter {
    /// Create `/sys/fs/cgroup/watchbox/<session>` and enable the cpu/memory
    /// controllers for it.
    pub fn create(session_id: Uuid) -> Result<Self> {
        let base = PathBuf::from("/sys/fs/cgroup/watchbox");
        fs::create_dir_all(&base)
            .map_err(|e| SandboxError::Cgroup(format!("create {}: {}", base.display(), e)))?;

        // Delegation: controllers must be enabled in the parent before child
        // groups can use them. Ignore EBUSY-style failures; apply() will
        // surface anything that actually matters.
        let _ = fs::write(base.join("cgroup.subtree_control"), "+cpu +memory");

        let path = base.join(session_id.to_string());
        fs::create_dir_all(&path)
            .map_err(|e| SandboxError::Cgroup(format!("create {}: {}", path.display(), e)))?;
        Ok(Self { path })
    }

    /// Move a process into the group.
    pub fn attach(&self, pid: u32) -> Result<()> {
        fs::write(self.path.join("cgroup.procs"), pid.to_string())
            .map_err(|e| SandboxError::Cgroup(format!("attach pid {}: {}", pid, e)))
    }

    /// Write the current limits into the kernel.
    pub fn apply(&self, limits: ResourceLimits) -> Result<()> {
        let quota = limits.cpu_percent as u64 * CPU_PERIOD_USEC / 100;
        fs::write(
            self.path.join("cpu.max"),
            format!("{} {}", quota, CPU_PERIOD_USEC),
        )
        .map_err(|e| SandboxError::Cgroup(format!("cpu.max: {}", e)))?;

        let bytes = limits.memory_mb as u64 * 1024 * 1024;
        fs::write(self.path.join("memory.max"), bytes.to_string())
            .map_err(|e| SandboxError::Cgroup(format!("memory.max: {}", e)))?;
        Ok(())
    }

    /// Peak resident memory, `memory.peak` (kernel 5.19+) with a
    /// `memory.current` fallback.
    pub fn memory_peak(&self) -> Result<u64> {
        let peak = self.path.join("memory.peak");
        let source = if peak.exists() {
            peak
        } else {
            self.path.join("memory.current")
        };
        let raw = fs::read_to_string(&source)
            .map_err(|e| SandboxError::Cgroup(format!("read {}: {}", source.display(), e)))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| SandboxError::Cgroup(format!("parse {}: {}", source.display(), e)))
    }

    /// Remove the group. Fails while processes are still attached, so call
    /// after the child has been reaped.
    pub fn cleanup(&self) -> Result<()> {
        fs::remove_dir(&self.path)
            .map_err(|e| SandboxError::Cgroup(format!("remove {}: {}", self.path.display(), e)))
    }
}
