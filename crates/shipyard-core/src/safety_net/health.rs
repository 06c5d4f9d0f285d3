//! Health check contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A replica is healthy when `GET {endpoint}{path}` answers
/// `healthy_status_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub healthy_status_code: u16,
}

impl HealthCheck {
    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), self.path)
    }

    pub fn is_healthy(&self, status: u16) -> bool {
        status == self.healthy_status_code
    }
}

/// Checks a single replica endpoint.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `true` iff the endpoint currently satisfies `check`. Transport errors
    /// count as unhealthy.
    async fn is_healthy(&self, endpoint: &str, check: &HealthCheck) -> bool;
}

/// [`HealthChecker`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    client: reqwest::Client,
}

impl HttpHealthChecker {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn is_healthy(&self, endpoint: &str, check: &HealthCheck) -> bool {
        let url = check.url_for(endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(url = %url, status, "health check");
                check.is_healthy(status)
            }
            Err(err) => {
                debug!(url = %url, error = %err, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check() -> HealthCheck {
        HealthCheck {
            path: "/health".to_string(),
            healthy_status_code: 200,
        }
    }

    #[test]
    fn url_joins_endpoint_and_path() {
        assert_eq!(
            check().url_for("http://10.0.0.5:3000/"),
            "http://10.0.0.5:3000/health"
        );
    }

    #[test]
    fn only_the_configured_code_is_healthy() {
        assert!(check().is_healthy(200));
        assert!(!check().is_healthy(204));
        assert!(!check().is_healthy(503));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unhealthy() {
        let checker = HttpHealthChecker::new(Duration::from_millis(200)).unwrap();
        assert!(!checker.is_healthy("http://127.0.0.1:1", &check()).await);
    }
}
