//! Linux hardening for the sandbox child: NO_NEW_PRIVS → Landlock → seccomp.
//!
//! Order matters: seccomp must be last because it blocks syscalls that
//! Landlock setup requires.

use nix::libc;

use super::child::ChildSpec;

pub fn apply_hardening(spec: &ChildSpec) -> Result<(), String> {
    set_no_new_privs()?;

    if let Err(e) = apply_landlock(spec) {
        // Landlock may not be available on this kernel — degrade, don't die.
        eprintln!("watchbox-sandbox: landlock not applied: {}", e);
    }

    if let Err(e) = apply_seccomp_network_deny() {
        eprintln!("watchbox-sandbox: seccomp not applied: {}", e);
    }

    Ok(())
}

fn set_no_new_privs() -> Result<(), String> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Landlock filesystem rules: read+execute on system directories, read+write
/// only inside the run's working directory. Everything else is denied by
/// omission once the ruleset is active.
fn apply_landlock(spec: &ChildSpec) -> Result<(), String> {
    use landlock::{
        ABI, Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
        RulesetStatus,
    };

    let abi = ABI::V5;

    let read_access = AccessFs::ReadFile | AccessFs::ReadDir | AccessFs::Execute;
    let write_access = read_access
        | AccessFs::WriteFile
        | AccessFs::RemoveFile
        | AccessFs::RemoveDir
        | AccessFs::MakeReg
        | AccessFs::MakeDir;

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    let system_paths = [
        "/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc", "/dev/null", "/dev/urandom",
        "/proc/self",
    ];
    for path in system_paths {
        let path = std::path::Path::new(path);
        if path.exists()
            && let Ok(fd) = PathFd::new(path)
        {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, read_access));
        }
    }

    if spec.workdir.exists()
        && let Ok(fd) = PathFd::new(&spec.workdir)
    {
        let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, write_access));
    }

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {}
        RulesetStatus::PartiallyEnforced => {
            eprintln!("watchbox-sandbox: Landlock partially enforced (ABI downgrade)");
        }
        RulesetStatus::NotEnforced => {
            return Err("Landlock not enforced by kernel".to_string());
        }
    }

    Ok(())
}

/// seccomp-bpf filter denying network-related syscalls with EPERM. The
/// workload has no business opening sockets; the advisory check runs in the
/// parent, before the child exists.
fn apply_seccomp_network_deny() -> Result<(), String> {
    use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
    use std::collections::BTreeMap;

    let denied_syscalls: Vec<i64> = vec![
        libc::SYS_socket,
        libc::SYS_connect,
        libc::SYS_accept,
        libc::SYS_accept4,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_sendto,
        libc::SYS_sendmsg,
        libc::SYS_sendmmsg,
        libc::SYS_recvfrom,
        libc::SYS_recvmsg,
        libc::SYS_recvmmsg,
        libc::SYS_ptrace,
    ];

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for syscall in denied_syscalls {
        rules.insert(syscall, vec![]);
    }

    let target_arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp unsupported arch: {}", e))?;

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch,
    )
    .map_err(|e| format!("seccomp filter creation: {}", e))?;

    let bpf: BpfProgram = filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp BPF compilation: {}", e))?;

    seccompiler::apply_filter(&bpf).map_err(|e| format!("seccomp apply_filter: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    // Enforcement itself cannot be unit-tested here — it would restrict the
    // test process. These verify the construction inputs.

    #[test]
    fn denied_syscall_numbers_are_valid() {
        use nix::libc;
        let syscalls = [
            libc::SYS_socket,
            libc::SYS_connect,
            libc::SYS_bind,
            libc::SYS_listen,
            libc::SYS_ptrace,
        ];
        for syscall in syscalls {
            assert!(syscall > 0, "invalid syscall number: {}", syscall);
        }
    }
}
