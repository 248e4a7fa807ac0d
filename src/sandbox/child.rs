//! Sandbox child entry point.
//!
//! Runs when the binary detects argv[0] ends with "watchbox-sandbox". The
//! child applies rlimits first (all Unix platforms), then platform hardening,
//! then execs the interpreter — it never returns.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const CHILD_SENTINEL: &str = "watchbox-sandbox";

/// Serializable launch spec passed to the re-exec'd child as argv[1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Interpreter binary, e.g. `/bin/sh`.
    pub interpreter: String,

    /// Script file the interpreter runs.
    pub script_path: PathBuf,

    /// Working directory for the run; the only writable tree.
    pub workdir: PathBuf,

    /// RLIMIT_AS, in megabytes.
    pub memory_mb: u32,

    /// RLIMIT_CPU, in seconds. Kernel-side backstop under the wall clock.
    pub cpu_time_secs: u64,

    /// RLIMIT_NPROC.
    pub max_processes: u32,

    /// RLIMIT_FSIZE, in bytes.
    pub max_file_size_bytes: u64,

    /// Apply Landlock/seccomp hardening (Linux).
    pub harden: bool,
}

/// Entry point for the sandbox child process. This function never returns —
/// it either execs the interpreter or exits.
pub fn sandbox_child_main() -> ! {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("watchbox-sandbox: expected launch spec argument");
        std::process::exit(1);
    }

    let spec: ChildSpec = match serde_json::from_str(&args[1]) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("watchbox-sandbox: failed to parse launch spec: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(unix)]
    {
        if let Err(e) = apply_rlimits(&spec) {
            eprintln!("watchbox-sandbox: failed to apply rlimits: {}", e);
            std::process::exit(1);
        }

        #[cfg(target_os = "linux")]
        if spec.harden {
            if let Err(e) = super::linux::apply_hardening(&spec) {
                eprintln!("watchbox-sandbox: failed to apply hardening: {}", e);
                std::process::exit(1);
            }
        }

        exec_interpreter(&spec);
    }

    #[cfg(not(unix))]
    {
        eprintln!("watchbox-sandbox: unsupported platform");
        std::process::exit(1);
    }
}

/// Apply resource limits with setrlimit. RLIMIT_AS carries the memory
/// budget; RLIMIT_CPU backstops CPU time at the kernel even if every
/// userspace watchdog dies.
#[cfg(unix)]
fn apply_rlimits(spec: &ChildSpec) -> Result<(), String> {
    use nix::sys::resource::{Resource, setrlimit};

    let memory_bytes = spec.memory_mb as u64 * 1024 * 1024;
    setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)
        .map_err(|e| format!("RLIMIT_AS: {}", e))?;

    setrlimit(Resource::RLIMIT_CPU, spec.cpu_time_secs, spec.cpu_time_secs)
        .map_err(|e| format!("RLIMIT_CPU: {}", e))?;

    setrlimit(
        Resource::RLIMIT_FSIZE,
        spec.max_file_size_bytes,
        spec.max_file_size_bytes,
    )
    .map_err(|e| format!("RLIMIT_FSIZE: {}", e))?;

    #[cfg(target_os = "linux")]
    {
        let nproc = spec.max_processes as u64;
        setrlimit(Resource::RLIMIT_NPROC, nproc, nproc)
            .map_err(|e| format!("RLIMIT_NPROC: {}", e))?;
    }

    setrlimit(Resource::RLIMIT_NOFILE, 256, 256).map_err(|e| format!("RLIMIT_NOFILE: {}", e))?;

    Ok(())
}

/// Exec the interpreter on the script, replacing the current process.
#[cfg(unix)]
fn exec_interpreter(spec: &ChildSpec) -> ! {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(&spec.interpreter)
        .arg(&spec.script_path)
        .current_dir(&spec.workdir)
        .exec();

    // exec() only returns on error
    eprintln!(
        "watchbox-sandbox: failed to exec {}: {}",
        spec.interpreter, err
    );
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_spec_round_trips_through_json() {
        let spec = ChildSpec {
            interpreter: "/bin/sh".to_string(),
            script_path: PathBuf::from("/tmp/run/script.sh"),
            workdir: PathBuf::from("/tmp/run"),
            memory_mb: 256,
            cpu_time_secs: 30,
            max_processes: 64,
            max_file_size_bytes: 50 * 1024 * 1024,
            harden: true,
        };

        let json = serde_json::to_string(&spec).unwrap();
        let parsed: ChildSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.interpreter, spec.interpreter);
        assert_eq!(parsed.script_path, spec.script_path);
        assert_eq!(parsed.memory_mb, 256);
        assert_eq!(parsed.cpu_time_secs, 30);
        assert!(parsed.harden);
    }
}
