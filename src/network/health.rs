//! Backend health probe

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConnectionError;

/// Body of the backend's `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub model_loaded: Option<bool>,
    #[serde(default)]
    pub clients_connected: Option<u64>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Asks the backend's HTTP side whether it is up
pub struct HealthProbe {
    client: reqwest::Client,
    endpoint: String,
}

impl HealthProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("stem-relay health probe")
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint: format!("{}/health", base_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn check(&self) -> Result<HealthReport, ConnectionError> {
        tracing::debug!("Probing backend health at {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| ConnectionError::OpenFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConnectionError::OpenFailed(format!(
                "health check returned {}",
                response.status()
            )));
        }

        response
            .json::<HealthReport>()
            .await
            .map_err(|e| ConnectionError::OpenFailed(format!("invalid health response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_fields() {
        let report: HealthReport =
            serde_json::from_str(r#"{"status":"healthy","model_loaded":false,"clients_connected":2}"#).unwrap();
        assert!(report.is_healthy());
        assert_eq!(report.model_loaded, Some(false));
        assert_eq!(report.clients_connected, Some(2));

        let report: HealthReport = serde_json::from_str(r#"{"status":"starting"}"#).unwrap();
        assert!(!report.is_healthy());
        assert_eq!(report.model_loaded, None);
    }

    #[test]
    fn test_endpoint_joins_path() {
        let probe = HealthProbe::new("http://localhost:8766/", Duration::from_secs(1));
        assert_eq!(probe.endpoint(), "http://localhost:8766/health");
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let probe = HealthProbe::new("http://127.0.0.1:1", Duration::from_secs(2));
        assert!(matches!(probe.check().await, Err(ConnectionError::OpenFailed(_))));
    }
}
