//! Liveness monitoring independent of RPC traffic.
//!
//! Each probe is a WebSocket ping when the client is connected, falling back
//! to a plain TCP dial against the gateway port. After `max_fails`
//! consecutive failures the restart hook runs once, the counter resets and
//! the notify hook learns the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::net::TcpStream;

use gatewatch_core::prelude::*;

use crate::config::HealthConfig;

/// Restart action invoked after sustained probe failures.
pub type RestartCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Receives the outcome of every restart attempt.
pub type NotifyCallback = Arc<dyn Fn(HealthNotice) + Send + Sync>;

/// Outcome reported to the notify hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthNotice {
    RestartSucceeded { failures: u32 },
    RestartFailed { failures: u32, error: String },
}

impl std::fmt::Display for HealthNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthNotice::RestartSucceeded { failures } => write!(
                f,
                "gateway restarted after {failures} consecutive failed health checks"
            ),
            HealthNotice::RestartFailed { failures, error } => write!(
                f,
                "gateway restart after {failures} failed health checks did not succeed: {error}"
            ),
        }
    }
}

/// How the most recent probe reached the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    /// WebSocket ping over the authenticated connection.
    Ping,
    /// Plain TCP dial to the gateway port.
    Tcp,
}

/// Snapshot returned by [`crate::GatewayClient::health_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub enabled: bool,
    pub fail_count: u32,
    pub max_fails: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_probe: Option<ProbeMethod>,
}

/// Mutable health counters. Lives behind its own mutex in the client.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub enabled: bool,
    pub fail_count: u32,
    pub max_fails: u32,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_probe: Option<ProbeMethod>,
}

impl HealthState {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            enabled: false,
            fail_count: 0,
            max_fails: config.max_fails.max(1),
            interval: Duration::from_secs(config.interval_secs),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            last_success_at: None,
            last_probe: None,
        }
    }

    /// Apply new thresholds without touching the counters.
    pub fn apply_config(&mut self, config: &HealthConfig) {
        self.max_fails = config.max_fails.max(1);
        self.interval = Duration::from_secs(config.interval_secs);
        self.probe_timeout = Duration::from_millis(config.probe_timeout_ms);
    }

    pub fn record_success(&mut self) {
        self.fail_count = 0;
        self.last_success_at = Some(Utc::now());
    }

    /// Count a failed probe. At the threshold the counter resets and the
    /// number of failures that triggered escalation is returned.
    pub fn record_failure(&mut self) -> Option<u32> {
        self.fail_count += 1;
        if self.fail_count >= self.max_fails {
            let failures = self.fail_count;
            self.fail_count = 0;
            Some(failures)
        } else {
            None
        }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            enabled: self.enabled,
            fail_count: self.fail_count,
            max_fails: self.max_fails,
            last_success_at: self.last_success_at,
            last_probe: self.last_probe,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

/// Dial `host:port` and hang up, within `timeout`.
pub async fn tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(Error::transport(format!("probe {host}:{port}: {e}"))),
        Err(_) => Err(Error::timeout("tcp probe", timeout)),
    }
}

/// Run the restart hook (if any) and turn the outcome into a notice.
pub async fn escalate(failures: u32, restart: Option<RestartCallback>) -> HealthNotice {
    let Some(restart) = restart else {
        warn!(
            "Gateway failed {} health checks but no restart action is configured",
            failures
        );
        return HealthNotice::RestartFailed {
            failures,
            error: "no restart callback configured".to_string(),
        };
    };

    warn!(
        "Gateway failed {} consecutive health checks, restarting",
        failures
    );
    match restart().await {
        Ok(()) => {
            info!("Gateway restart succeeded");
            HealthNotice::RestartSucceeded { failures }
        }
        Err(e) => {
            error!("Gateway restart failed: {}", e);
            HealthNotice::RestartFailed {
                failures,
                error: e.to_string(),
            }
        }
    }
}
