//! Atomic policy snapshot management.
//!
//! The store hands out `Arc<Policy>` snapshots. `reload` parses and validates
//! the new document fully before swapping it in, so a bad file never replaces
//! a good policy, and sessions holding the old snapshot are untouched.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::info;

use super::Policy;
use crate::error::{Result, SandboxError};

pub struct PolicyStore {
    path: Option<PathBuf>,
    active: RwLock<Arc<Policy>>,
}

impl PolicyStore {
    /// Load the policy from a file and keep the path for later reloads.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let policy = Policy::load(&path)?;
        info!(
            version = policy.version,
            path = %path.display(),
            "policy loaded"
        );
        Ok(Self {
            path: Some(path),
            active: RwLock::new(Arc::new(policy)),
        })
    }

    /// Store backed by the built-in rule set; `reload` is rejected.
    pub fn builtin() -> Self {
        Self {
            path: None,
            active: RwLock::new(Arc::new(Policy::builtin())),
        }
    }

    /// Current snapshot. Callers keep the returned `Arc` for the lifetime of
    /// a run; a concurrent reload never invalidates it.
    pub fn snapshot(&self) -> Arc<Policy> {
        self.active.read().expect("policy lock poisoned").clone()
    }

    /// Re-read the backing file and atomically swap the active snapshot.
    pub fn reload(&self) -> Result<u32> {
        let path = self.path.as_ref().ok_or_else(|| {
            SandboxError::Config("cannot reload: store uses the built-in policy".to_string())
        })?;
        let policy = Policy::load(path)?;
        let version = policy.version;
        *self.active.write().expect("policy lock poisoned") = Arc::new(policy);
        info!(version, "policy reloaded");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_policy(dir: &std::path::Path, version: u32) -> PathBuf {
        let mut policy = Policy::builtin();
        policy.version = version;
        let path = dir.join("policy.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(policy.to_json().unwrap().as_bytes()).unwrap();
        path
    }

    #[test]
    fn reload_swaps_snapshot_without_touching_old_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_policy(tmp.path(), 1);

        let store = PolicyStore::load(&path).unwrap();
        let old = store.snapshot();
        assert_eq!(old.version, 1);

        write_policy(tmp.path(), 2);
        store.reload().unwrap();

        // The in-flight snapshot is unchanged; new callers see the new one.
        assert_eq!(old.version, 1);
        assert_eq!(store.snapshot().version, 2);
    }

    #[test]
    fn reload_keeps_old_policy_when_new_one_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_policy(tmp.path(), 1);
        let store = PolicyStore::load(&path).unwrap();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn builtin_store_rejects_reload() {
        let store = PolicyStore::builtin();
        assert!(store.reload().is_err());
    }
}
