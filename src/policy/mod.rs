//! Versioned rule set governing static screening signatures, runtime
//! classification thresholds, and adaptive-limit behavior.
//!
//! A `Policy` is immutable once loaded. Hot reload goes through
//! [`store::PolicyStore`], which swaps the active `Arc<Policy>` snapshot
//! atomically — sessions already holding a snapshot keep it for their whole
//! run.

mod store;

pub use store::PolicyStore;

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Detection categories, declared in screening priority order: a fork-bomb
/// signature outranks an infinite-loop signature, which outranks heap abuse.
/// The derived `Ord` is what the screener sorts by — keep declaration order
/// authoritative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    ForkBomb,
    InfiniteLoop,
    HeapAbuse,
}

impl RuleCategory {
    pub fn label(&self) -> &'static str {
        match self {
            RuleCategory::ForkBomb => "fork bomb",
            RuleCategory::InfiniteLoop => "infinite loop",
            RuleCategory::HeapAbuse => "heap abuse",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            RuleCategory::ForkBomb => "fork_bomb",
            RuleCategory::InfiniteLoop => "infinite_loop",
            RuleCategory::HeapAbuse => "heap_abuse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

/// One detection category: its toggle, severity, and signature patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub severity: Severity,

    /// Regex signatures matched against the submission source.
    pub signatures: Vec<String>,
}

/// Adaptive-limit parameters consumed by the governor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveLimits {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// CPU multiplier applied once per transition into sustained-normal
    /// behavior. Must exceed 1.0.
    pub boost_factor: f64,

    /// Memory multiplier applied on each Inefficient classification. Must be
    /// strictly between 0 and 1.
    pub penalty_factor: f64,
}

/// Runtime-classification thresholds and sampling cadence. Cadence lives in
/// the policy, not the presentation layer: sampling rate is decoupled from
/// output-emission rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorPolicy {
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,

    /// Consecutive samples that make up one monitoring window.
    #[serde(default = "default_window_samples")]
    pub window_samples: usize,

    /// CPU percentage considered "hot" for the busy-loop check.
    #[serde(default = "default_hot_cpu")]
    pub hot_cpu_percent: f64,

    /// Sample-over-sample memory ratio at or above which growth is treated as
    /// exponential (fork-bomb-like).
    #[serde(default = "default_exp_ratio")]
    pub exponential_growth_ratio: f64,

    /// Minimum per-sample byte growth for the linear heap-growth check.
    #[serde(default = "default_linear_growth")]
    pub linear_growth_min_bytes: u64,
}

/// The immutable-per-run rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: u32,

    /// Keyed by category; `BTreeMap` iteration order is the screening
    /// priority order.
    pub categories: BTreeMap<RuleCategory, CategoryPolicy>,

    pub adaptive_limits: AdaptiveLimits,

    #[serde(default)]
    pub monitor: MonitorPolicy,
}

/// One signature rule flattened out of the category table, in screening
/// priority order. `id` is stable for a given policy document.
#[derive(Debug, Clone)]
pub struct SignatureRule<'a> {
    pub id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub pattern: &'a str,
}

impl Policy {
    pub fn from_json(raw: &str) -> Result<Self> {
        let policy: Policy = serde_json::from_str(raw)
            .map_err(|e| SandboxError::Config(format!("malformed policy document: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("cannot read policy {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SandboxError::Config(format!("cannot serialize policy: {}", e)))
    }

    /// Built-in rule set, used when no policy file is given.
    pub fn builtin() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            RuleCategory::ForkBomb,
            CategoryPolicy {
                enabled: true,
                severity: Severity::Critical,
                signatures: vec![
                    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:".to_string(),
                    r"\bfork\s*\(\s*\)".to_string(),
                    r"\bos\.fork\b".to_string(),
                    r"while\s+true\s*;?\s*do.*&\s*done".to_string(),
                ],
            },
        );
        categories.insert(
            RuleCategory::InfiniteLoop,
            CategoryPolicy {
                enabled: true,
                severity: Severity::High,
                signatures: vec![
                    r"while\s*\(\s*(?:true|1)\s*\)".to_string(),
                    r"while\s+(?:true|True|:)\s*(?::|$|\n)".to_string(),
                    r"for\s*\(\s*;\s*;\s*\)".to_string(),
                    r"loop\s*\{\s*\}".to_string(),
                ],
            },
        );
        categories.insert(
            RuleCategory::HeapAbuse,
            CategoryPolicy {
                enabled: true,
                severity: Severity::Medium,
                signatures: vec![
                    r"new\s+Array\s*\(\s*1e[89]\d*\s*\)".to_string(),
                    r"\.push\s*\(.*\)\s*;?\s*\}\s*while\s*\(\s*(?:true|1)\s*\)".to_string(),
                    r"malloc\s*\(\s*\d{9,}\s*\)".to_string(),
                    r"bytearray\s*\(\s*\d{9,}\s*\)".to_string(),
                ],
            },
        );

        let policy = Policy {
            version: 1,
            categories,
            adaptive_limits: AdaptiveLimits {
                enabled: true,
                boost_factor: 1.2,
                penalty_factor: 0.8,
            },
            monitor: MonitorPolicy::default(),
        };
        debug_assert!(policy.validate().is_ok());
        policy
    }

    /// Flatten the category table into an ordered rule list. Category order
    /// is the screening priority; within a category, document order wins.
    pub fn rules(&self) -> Vec<SignatureRule<'_>> {
        let mut rules = Vec::new();
        for (category, cat) in &self.categories {
            if !cat.enabled {
                continue;
            }
            for (idx, pattern) in cat.signatures.iter().enumerate() {
                rules.push(SignatureRule {
                    id: format!("{}:{}", category.key(), idx),
                    category: *category,
                    severity: cat.severity,
                    pattern,
                });
            }
        }
        rules
    }

    pub fn category_enabled(&self, category: RuleCategory) -> bool {
        self.categories
            .get(&category)
            .map(|c| c.enabled)
            .unwrap_or(false)
    }

    fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(SandboxError::Config(
                "policy version must be at least 1".to_string(),
            ));
        }

        let adaptive = &self.adaptive_limits;
        if adaptive.boost_factor <= 1.0 || !adaptive.boost_factor.is_finite() {
            return Err(SandboxError::Config(format!(
                "boost_factor {} would not increase limits; it must be greater than 1.0",
                adaptive.boost_factor
            )));
        }
        if adaptive.penalty_factor <= 0.0
            || adaptive.penalty_factor >= 1.0
            || !adaptive.penalty_factor.is_finite()
        {
            return Err(SandboxError::Config(format!(
                "penalty_factor {} would not reduce limits; it must be strictly between 0 and 1",
                adaptive.penalty_factor
            )));
        }

        for (category, cat) in &self.categories {
            for (idx, pattern) in cat.signatures.iter().enumerate() {
                if pattern.trim().is_empty() {
                    return Err(SandboxError::Config(format!(
                        "category {} signature {} is empty",
                        category.key(),
                        idx
                    )));
                }
                Regex::new(pattern).map_err(|e| {
                    SandboxError::Config(format!(
                        "category {} signature {} is not a valid regex: {}",
                        category.key(),
                        idx,
                        e
                    ))
                })?;
            }
        }

        let monitor = &self.monitor;
        if monitor.cadence_ms == 0 {
            return Err(SandboxError::Config(
                "monitor cadence_ms must be positive".to_string(),
            ));
        }
        if monitor.window_samples < 2 {
            return Err(SandboxError::Config(
                "monitor window_samples must be at least 2".to_string(),
            ));
        }
        if monitor.hot_cpu_percent <= 0.0 || monitor.hot_cpu_percent > 100.0 {
            return Err(SandboxError::Config(format!(
                "monitor hot_cpu_percent {} out of range (0, 100]",
                monitor.hot_cpu_percent
            )));
        }
        if monitor.exponential_growth_ratio <= 1.0 {
            return Err(SandboxError::Config(format!(
                "monitor exponential_growth_ratio {} must exceed 1.0",
                monitor.exponential_growth_ratio
            )));
        }
        if monitor.linear_growth_min_bytes == 0 {
            return Err(SandboxError::Config(
                "monitor linear_growth_min_bytes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            cadence_ms: default_cadence_ms(),
            window_samples: default_window_samples(),
            hot_cpu_percent: default_hot_cpu(),
            exponential_growth_ratio: default_exp_ratio(),
            linear_growth_min_bytes: default_linear_growth(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cadence_ms() -> u64 {
    250
}

fn default_window_samples() -> usize {
    4
}

fn default_hot_cpu() -> f64 {
    85.0
}

fn default_exp_ratio() -> f64 {
    1.5
}

fn default_linear_growth() -> u64 {
    1024 * 1024
}
