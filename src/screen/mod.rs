//! Pre-execution static screening.
//!
//! Signatures are matched against the submission source in fixed category
//! priority order (fork bomb, then infinite loop, then heap abuse); the first
//! match wins. The screener is deterministic and never touches the network,
//! so it can run synchronously and be unit-tested without mocks. It produces
//! a verdict only — starting or stopping a session is someone else's job.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::policy::{Policy, RuleCategory, Severity};
use crate::submission::Submission;

/// Outcome of static screening. Derived once per submission; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningVerdict {
    pub allowed: bool,
    pub reason: String,
    pub matched_rule: Option<String>,
}

impl ScreeningVerdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            matched_rule: None,
        }
    }

    pub fn deny(reason: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            matched_rule: Some(rule_id.into()),
        }
    }
}

struct CompiledRule {
    id: String,
    category: RuleCategory,
    severity: Severity,
    regex: Regex,
}

/// Screener with signatures compiled from one policy snapshot.
pub struct Screener {
    rules: Vec<CompiledRule>,
}

impl Screener {
    /// Compile the enabled signatures of a policy. Patterns were validated at
    /// policy load, so a compile failure here means the policy was mutated
    /// after validation and is reported as a config error.
    pub fn compile(policy: &Policy) -> Result<Self> {
        let mut rules = Vec::new();
        for rule in policy.rules() {
            let regex = Regex::new(rule.pattern).map_err(|e| {
                SandboxError::Config(format!("signature {} failed to compile: {}", rule.id, e))
            })?;
            rules.push(CompiledRule {
                id: rule.id,
                category: rule.category,
                severity: rule.severity,
                regex,
            });
        }
        Ok(Self { rules })
    }

    /// Match the submission source against the compiled signatures, first
    /// match wins.
    pub fn screen(&self, submission: &Submission) -> ScreeningVerdict {
        for rule in &self.rules {
            if rule.regex.is_match(&submission.source) {
                return ScreeningVerdict::deny(
                    format!(
                        "static signature matched: {} pattern detected (severity {:?})",
                        rule.category.label(),
                        rule.severity,
                    ),
                    rule.id.clone(),
                );
            }
        }
        ScreeningVerdict::allow("no static signature matched")
    }
}

/// Convenience wrapper for one-shot screening.
pub fn screen(submission: &Submission, policy: &Policy) -> Result<ScreeningVerdict> {
    Ok(Screener::compile(policy)?.screen(submission))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::ResourceRequest;
    use std::time::Duration;

    fn submission(source: &str) -> Submission {
        Submission::new(
            source,
            ResourceRequest {
                cpu_percent: 50,
                memory_mb: 256,
                time_limit: Duration::from_secs(10),
            },
        )
    }

    #[test]
    fn benign_code_is_allowed() {
        let verdict = screen(
            &submission("function greet(name) { console.log(name); }"),
            &Policy::builtin(),
        )
        .unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, "no static signature matched");
        assert!(verdict.matched_rule.is_none());
    }

    #[test]
    fn busy_wait_is_denied_as_infinite_loop() {
        let verdict = screen(
            &submission("while (true) { /* spin */ }"),
            &Policy::builtin(),
        )
        .unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("infinite loop"));
        assert!(verdict.matched_rule.unwrap().starts_with("infinite_loop:"));
    }

    #[test]
    fn shell_fork_bomb_is_denied() {
        let verdict = screen(&submission(":(){ :|:& };:"), &Policy::builtin()).unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.contains("fork bomb"));
    }

    #[test]
    fn fork_bomb_outranks_infinite_loop_on_combined_source() {
        // Contains both a busy loop and a fork call; category priority says
        // the fork-bomb rule must be the one reported.
        let source = "while (true) { fork() }";
        let verdict = screen(&submission(source), &Policy::builtin()).unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.matched_rule.unwrap().starts_with("fork_bomb:"));
    }

    #[test]
    fn disabled_category_is_not_applied() {
        let mut policy = Policy::builtin();
        policy
            .categories
            .get_mut(&RuleCategory::InfiniteLoop)
            .unwrap()
            .enabled = false;
        let verdict = screen(&submission("while (true) {}"), &policy).unwrap();
        assert!(verdict.allowed);
    }

    #[test]
    fn screening_is_deterministic_for_identical_input() {
        let policy = Policy::builtin();
        let sub = submission("for (;;) {}");
        let a = screen(&sub, &policy).unwrap();
        let b = screen(&sub, &policy).unwrap();
        assert_eq!(a.allowed, b.allowed);
        assert_eq!(a.matched_rule, b.matched_rule);
        assert_eq!(a.reason, b.reason);
    }

    #[test]
    fn round_tripped_policy_screens_identically() {
        let policy = Policy::builtin();
        let reloaded = Policy::from_json(&policy.to_json().unwrap()).unwrap();

        let corpus = [
            "while (true) {}",
            ":(){ :|:& };:",
            "new Array(1e9)",
            "console.log('hello')",
            "for (;;) { work(); }",
        ];
        for source in corpus {
            let a = screen(&submission(source), &policy).unwrap();
            let b = screen(&submission(source), &reloaded).unwrap();
            assert_eq!(a.allowed, b.allowed, "divergence on {:?}", source);
            assert_eq!(a.matched_rule, b.matched_rule);
        }
    }
}
