//! Telemetry source feeding the runtime monitor.
//!
//! On Linux the real source reads `/proc/<pid>/stat`, `/proc/<pid>/status`,
//! and `/proc/<pid>/io` — actual kernel counters, not inferences from the
//! program's source text. Elsewhere (and in tests) the trait is implemented
//! by stand-ins; absence of samples past the configured grace period is
//! handled by the caller as an anomaly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One periodic resource/syscall sample for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// CPU usage since the previous sample, as a percentage of one core.
    pub cpu_percent: f64,

    /// Resident set size in bytes.
    pub memory_bytes: u64,

    /// Cumulative read+write syscall count for the process.
    pub syscall_count: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample(&self) -> Result<TelemetrySample>;
}

#[cfg(target_os = "linux")]
pub use proc::ProcTelemetry;

#[cfg(target_os = "linux")]
mod proc {
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;

    use super::{TelemetrySample, TelemetrySource};
    use crate::error::{Result, SandboxError};

    struct CpuBaseline {
        ticks: u64,
        at: Instant,
    }

    /// `/proc`-backed telemetry for one child process.
    pub struct ProcTelemetry {
        pid: i32,
        ticks_per_sec: f64,
        baseline: Mutex<Option<CpuBaseline>>,
    }

    impl ProcTelemetry {
        pub fn new(pid: i32) -> Self {
            let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as f64;
            Self {
                pid,
                ticks_per_sec: if ticks_per_sec > 0.0 {
                    ticks_per_sec
                } else {
                    100.0
                },
                baseline: Mutex::new(None),
            }
        }

        fn read_cpu_ticks(&self) -> Result<u64> {
            let stat = std::fs::read_to_string(format!("/proc/{}/stat", self.pid))
                .map_err(|e| SandboxError::Telemetry(format!("read stat: {}", e)))?;
            // comm can contain spaces; fields are positioned after the
            // closing paren. utime and stime are fields 14 and 15 (1-based).
            let after_comm = stat
                .rsplit_once(')')
                .map(|(_, rest)| rest)
                .ok_or_else(|| SandboxError::Telemetry("malformed stat line".to_string()))?;
            let fields: Vec<&str> = after_comm.split_whitespace().collect();
            // after_comm starts at field 3 ("state"), so utime/stime are at
            // offsets 11 and 12.
            let utime: u64 = fields
                .get(11)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| SandboxError::Telemetry("missing utime".to_string()))?;
            let stime: u64 = fields
                .get(12)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| SandboxError::Telemetry("missing stime".to_string()))?;
            Ok(utime + stime)
        }

        fn read_rss_bytes(&self) -> Result<u64> {
            let status = std::fs::read_to_string(format!("/proc/{}/status", self.pid))
                .map_err(|e| SandboxError::Telemetry(format!("read status: {}", e)))?;
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .map_err(|e| SandboxError::Telemetry(format!("parse VmRSS: {}", e)))?;
                    return Ok(kb * 1024);
                }
            }
            Err(SandboxError::Telemetry("VmRSS not present".to_string()))
        }

        fn read_syscall_count(&self) -> Result<u64> {
            let io = std::fs::read_to_string(format!("/proc/{}/io", self.pid))
                .map_err(|e| SandboxError::Telemetry(format!("read io: {}", e)))?;
            let mut total = 0u64;
            for line in io.lines() {
                if let Some(rest) = line
                    .strip_prefix("syscr:")
                    .or_else(|| line.strip_prefix("syscw:"))
                {
                    total += rest.trim().parse::<u64>().unwrap_or(0);
                }
            }
            Ok(total)
        }
    }

    #[async_trait]
    impl TelemetrySource for ProcTelemetry {
        async fn sample(&self) -> Result<TelemetrySample> {
            let ticks = self.read_cpu_ticks()?;
            let now = Instant::now();

            let cpu_percent = {
                let mut baseline = self.baseline.lock().expect("telemetry baseline poisoned");
                let percent = match baseline.as_ref() {
                    Some(prev) => {
                        let elapsed = now.duration_since(prev.at).as_secs_f64();
                        if elapsed > 0.0 {
                            let delta = ticks.saturating_sub(prev.ticks) as f64;
                            (delta / self.ticks_per_sec / elapsed) * 100.0
                        } else {
                            0.0
                        }
                    }
                    None => 0.0,
                };
                *baseline = Some(CpuBaseline { ticks, at: now });
                percent
            };

            Ok(TelemetrySample {
                cpu_percent,
                memory_bytes: self.read_rss_bytes()?,
                syscall_count: self.read_syscall_count().unwrap_or(0),
            })
        }
    }
}

/// Fallback source for platforms without `/proc`. Reports an idle sample so
/// the monitor keeps running; enforcement degrades to the sandbox's own
/// rlimits and wall-clock backstop.
pub struct NullTelemetry;

#[async_trait]
impl TelemetrySource for NullTelemetry {
    async fn sample(&self) -> Result<TelemetrySample> {
        Ok(TelemetrySample {
            cpu_percent: 0.0,
            memory_bytes: 0,
            syscall_count: 0,
        })
    }
}
