use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: None,
        }
    }

    pub fn unhealthy(message: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message),
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// The name of this component in the health report.
    fn name(&self) -> &str;

    async fn check(&self) -> HealthCheckResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallHealth {
    pub status: HealthStatus,
    pub service: String,
    pub checks: HashMap<String, HealthCheckResult>,
}

impl OverallHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Registry of per-component health checks, populated at server init.
pub struct HealthService {
    checkers: RwLock<HashMap<String, Arc<dyn HealthChecker>>>,
}

impl HealthService {
    pub fn new() -> Self {
        Self {
            checkers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        let name = checker.name().to_string();
        self.checkers.write().await.insert(name, checker);
    }

    /// Run every registered check; overall status is healthy only when all
    /// components are.
    pub async fn check_all(&self) -> OverallHealth {
        let checkers = self.checkers.read().await;
        let mut checks = HashMap::new();
        let mut status = HealthStatus::Healthy;

        for (name, checker) in checkers.iter() {
            let started = Instant::now();
            let result = checker
                .check()
                .await
                .with_duration(started.elapsed().as_millis() as u64);
            if result.status != HealthStatus::Healthy {
                status = HealthStatus::Unhealthy;
            }
            checks.insert(name.clone(), result);
        }

        OverallHealth {
            status,
            service: env!("CARGO_PKG_NAME").to_string(),
            checks,
        }
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}
