//! Client configuration.
//!
//! [`ClientConfig`] is supplied when a [`crate::GatewayClient`] is built and
//! can be swapped at runtime through [`crate::GatewayClient::reconnect`].
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! host = "10.0.0.12"
//! port = 18789
//! token = ""              # empty = read gateway.auth.token from openclaw.json
//!
//! [backoff]
//! initial_ms = 1000
//! max_ms = 30000
//!
//! [health]
//! interval_secs = 30
//! max_fails = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gatewatch_core::prelude::*;

/// Environment variable overriding the gateway state directory.
pub const STATE_DIR_ENV: &str = "OPENCLAW_STATE_DIR";

/// File name of the gateway's own configuration inside the state directory.
pub const GATEWAY_CONFIG_FILENAME: &str = "openclaw.json";

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 18789;

/// Resolve the gateway state directory: `$OPENCLAW_STATE_DIR` or `~/.openclaw`.
pub fn state_dir() -> PathBuf {
    match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".openclaw"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config sections
// ─────────────────────────────────────────────────────────────────────────────

/// Reconnect backoff bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failure (the floor the backoff resets to).
    pub initial_ms: u64,
    /// Maximum delay between attempts.
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between probes.
    pub interval_secs: u64,
    /// Consecutive failures before the restart hook fires.
    pub max_fails: u32,
    /// Deadline for a single probe (ping or TCP dial).
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_fails: 3,
            probe_timeout_ms: 3_000,
        }
    }
}

/// How this client describes itself in the connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfoConfig {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientInfoConfig {
    fn default() -> Self {
        Self {
            id: "gateway-client".to_string(),
            display_name: "gatewatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "backend".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ClientConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Connection settings for a [`crate::GatewayClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token. Blank means "discover from the gateway config file".
    pub token: Option<String>,
    /// Default timeout for [`crate::GatewayClient::request`].
    pub request_timeout_ms: u64,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    /// Device identity location; `None` uses the state directory default.
    pub identity_path: Option<PathBuf>,
    pub client: ClientInfoConfig,
    pub backoff: BackoffConfig,
    pub health: HealthConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            token: None,
            request_timeout_ms: 30_000,
            role: "operator".to_string(),
            scopes: vec!["operator.admin".to_string()],
            caps: Vec::new(),
            identity_path: None,
            client: ClientInfoConfig::default(),
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Convenience constructor for a host/port pair with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Load settings from a TOML file.
    ///
    /// Returns default settings if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] when the file exists but cannot be parsed or
    /// fails validation, [`Error::Io`] when it cannot be read.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::config_invalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!("Loaded client config from {:?}", path);
        Ok(config)
    }

    /// Reject settings the supervisor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config_invalid("host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config_invalid("port must be non-zero"));
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(Error::config_invalid(
                "backoff.initial_ms must be > 0 and <= backoff.max_ms",
            ));
        }
        if self.health.max_fails == 0 {
            return Err(Error::config_invalid("health.max_fails must be > 0"));
        }
        if self.health.interval_secs == 0 {
            return Err(Error::config_invalid("health.interval_secs must be > 0"));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(Error::config_invalid("health.probe_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// WebSocket URL this config points at (for display and logging).
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    /// Identity file location, falling back to the state directory default.
    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(crate::identity::default_identity_path)
    }

    /// The bearer token to present: the explicit one when non-blank, else
    /// `gateway.auth.token` from the local gateway config, else none.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(token) = self.token.as_deref().map(str::trim) {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        discover_gateway_token(&state_dir().join(GATEWAY_CONFIG_FILENAME))
    }
}

/// Read `gateway.auth.token` from the gateway's JSON config at `path`.
///
/// Absence of the file, the field, or a parse failure all mean "no token".
pub fn discover_gateway_token(path: &Path) -> Option<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No gateway config at {:?}: {}", path, e);
            return None;
        }
    };
    let value: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse gateway config {:?}: {}", path, e);
            return None;
        }
    };
    value
        .pointer("/gateway/auth/token")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
