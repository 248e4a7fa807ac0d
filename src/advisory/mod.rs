//! External advisory safety check.
//!
//! The advisory is an untrusted collaborator — typically a remote model that
//! returns `{is_safe, reason}` for a piece of code. It is never the sole
//! safety boundary: the screener and the sandbox do not depend on it, and an
//! advisory that errors or times out fails closed (the caller blocks the run
//! with a "could not verify" verdict rather than proceeding).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::AdvisoryConfig;
use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryVerdict {
    pub is_safe: bool,
    pub reason: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdvisoryCheck: Send + Sync {
    async fn assess(&self, code: &str) -> Result<AdvisoryVerdict>;
}

/// HTTP-backed advisory client. POSTs `{"code": ...}` and expects an
/// `{"is_safe": bool, "reason": string}` response within the configured
/// timeout.
pub struct HttpAdvisory {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpAdvisory {
    pub fn new(config: &AdvisoryConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(SandboxError::Config(
                "advisory endpoint not configured".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SandboxError::Advisory(format!("client setup: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl AdvisoryCheck for HttpAdvisory {
    async fn assess(&self, code: &str) -> Result<AdvisoryVerdict> {
        let mut request = self.client.post(&self.endpoint).json(&json!({ "code": code }));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SandboxError::Advisory(format!("request failed: {}", e)))?;
        let response = response
            .error_for_status()
            .map_err(|e| SandboxError::Advisory(format!("advisory returned {}", e)))?;

        let verdict: AdvisoryVerdict = response
            .json()
            .await
            .map_err(|e| SandboxError::Advisory(format!("malformed advisory response: {}", e)))?;
        debug!(is_safe = verdict.is_safe, "advisory verdict received");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_advisory_requires_endpoint() {
        let config = AdvisoryConfig {
            enabled: true,
            endpoint: String::new(),
            timeout_ms: 1000,
            api_key: None,
        };
        assert!(matches!(
            HttpAdvisory::new(&config),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn verdict_deserializes_from_wire_shape() {
        let verdict: AdvisoryVerdict =
            serde_json::from_str(r#"{"is_safe": false, "reason": "spawns processes in a loop"}"#)
                .unwrap();
        assert!(!verdict.is_safe);
        assert_eq!(verdict.reason, "spawns processes in a loop");
    }
}
