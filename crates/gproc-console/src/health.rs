use crate::gateway::ActionGateway;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub version: String,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: false,
            version: String::new(),
            last_check: None,
        }
    }
}

/// Polls `GET /api/v1/health` on a fixed interval until dropped.
pub struct HealthMonitor {
    status: watch::Receiver<HealthStatus>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(gateway: ActionGateway, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(HealthStatus::default());
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let previous = tx.borrow().clone();
                let next = check_health(&gateway, &previous).await;
                if tx.send(next).is_err() {
                    break;
                }
            }
        });
        Self { status: rx, task }
    }

    pub fn current(&self) -> HealthStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HealthStatus> {
        self.status.clone()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One probe. A failure marks the backend unhealthy and keeps the last
/// known version and check time.
pub async fn check_health(gateway: &ActionGateway, previous: &HealthStatus) -> HealthStatus {
    match gateway.health().await {
        Ok(body) => {
            let version = version_from_body(&body);
            debug!(event = "health_check", healthy = true, version = %version);
            HealthStatus {
                healthy: true,
                version,
                last_check: Some(Utc::now()),
            }
        }
        Err(err) => {
            warn!(event = "health_check", healthy = false, error = %err);
            HealthStatus {
                healthy: false,
                ..previous.clone()
            }
        }
    }
}

fn version_from_body(body: &Value) -> String {
    body.get("version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .unwrap_or(UNKNOWN_VERSION)
        .to_string()
}
