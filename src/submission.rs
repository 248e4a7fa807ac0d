//! A submission is one unit of untrusted code proposed for sandboxed
//! execution, together with the resource budget the caller declared for it.
//! Immutable once created.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Resource budget declared by the caller at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU cap as a percentage of one core.
    pub cpu_percent: u32,

    /// Memory cap in megabytes.
    pub memory_mb: u32,

    /// Wall-clock budget for the whole run.
    pub time_limit: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub source: String,
    pub requested: ResourceRequest,
}

impl Submission {
    pub fn new(source: impl Into<String>, requested: ResourceRequest) -> Self {
        Self {
            source: source.into(),
            requested,
        }
    }

    /// SHA-256 digest of the source text, for audit correlation.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
