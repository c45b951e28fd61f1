//! Operator settings shared by every request.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 3000;

/// Gateway configuration, mutable by the operator at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Bind to loopback only.
    pub isolation: bool,
    /// API key; empty disables authentication.
    pub api_key: String,
    /// Sandbox root; empty rejects every tool call.
    pub allowed_path: String,
    /// Listen port.
    pub port: u16,
    /// Require operator approval for each tool call.
    pub approve_requests: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            isolation: true,
            api_key: String::new(),
            allowed_path: String::new(),
            port: DEFAULT_PORT,
            approve_requests: true,
        }
    }
}

impl GatewayConfig {
    /// Host the gateway binds to.
    pub fn bind_host(&self) -> &'static str {
        if self.isolation {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        }
    }

    /// Configured sandbox root, if any.
    pub fn allowed_root(&self) -> Option<PathBuf> {
        if self.allowed_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.allowed_path))
        }
    }

    /// Check a presented credential against the configured key.
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        if self.api_key.is_empty() {
            return true;
        }
        presented == Some(self.api_key.as_str())
    }

    /// Merge a partial update into this configuration.
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(isolation) = update.isolation {
            self.isolation = isolation;
        }
        if let Some(api_key) = update.api_key {
            self.api_key = api_key;
        }
        if let Some(allowed_path) = update.allowed_path {
            self.allowed_path = allowed_path;
        }
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(approve_requests) = update.approve_requests {
            self.approve_requests = approve_requests;
        }
    }
}

/// Partial configuration update sent by the host UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    /// New isolation flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<bool>,
    /// New API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// New sandbox root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_path: Option<String>,
    /// New port (applies on restart).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// New approval flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_requests: Option<bool>,
}

/// Single shared configuration instance.
///
/// Readers take a snapshot at the moment of use and never hold the lock
/// across an await point.
#[derive(Debug, Default)]
pub struct SharedConfig {
    inner: RwLock<GatewayConfig>,
}

impl SharedConfig {
    /// Wrap an initial configuration.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Copy of the current configuration.
    pub async fn snapshot(&self) -> GatewayConfig {
        self.inner.read().await.clone()
    }

    /// Current sandbox root.
    pub async fn allowed_root(&self) -> Option<PathBuf> {
        self.inner.read().await.allowed_root()
    }

    /// Current approval flag.
    pub async fn approve_requests(&self) -> bool {
        self.inner.read().await.approve_requests
    }

    /// Apply a partial update and return the resulting configuration.
    pub async fn update(&self, update: ConfigUpdate) -> GatewayConfig {
        let mut config = self.inner.write().await;
        config.apply(update);
        config.clone()
    }
}
