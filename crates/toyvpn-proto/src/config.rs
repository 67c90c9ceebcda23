//! Connection configuration

use crate::messages::ProtoError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which applications are routed through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "packages", rename_all = "snake_case")]
pub enum AppRouting {
    /// Only the listed applications use the tunnel (all of them when empty)
    Allow(BTreeSet<String>),
    /// Every application except the listed ones uses the tunnel
    Disallow(BTreeSet<String>),
}

impl AppRouting {
    /// Whether traffic from `app` goes through the tunnel
    pub fn routes(&self, app: &str) -> bool {
        match self {
            AppRouting::Allow(packages) => packages.is_empty() || packages.contains(app),
            AppRouting::Disallow(packages) => !packages.contains(app),
        }
    }

    pub fn packages(&self) -> &BTreeSet<String> {
        match self {
            AppRouting::Allow(packages) | AppRouting::Disallow(packages) => packages,
        }
    }

    pub fn is_allow_list(&self) -> bool {
        matches!(self, AppRouting::Allow(_))
    }
}

impl Default for AppRouting {
    fn default() -> Self {
        AppRouting::Allow(BTreeSet::new())
    }
}

/// HTTP proxy used to reach the VPN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// `host:port` form of the proxy address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Everything a worker needs to negotiate one tunnel
///
/// Immutable once handed to the supervisor; every attempt gets its own copy.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub server_address: String,
    pub server_port: u16,
    #[serde(with = "secret_base64")]
    pub shared_secret: Vec<u8>,
    #[serde(default)]
    pub routing: AppRouting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

/// Helper module for serializing the shared secret as base64
mod secret_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(secret))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// Keep the secret out of logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("server_address", &self.server_address)
            .field("server_port", &self.server_port)
            .field("shared_secret", &"<redacted>")
            .field("routing", &self.routing)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// `host:port` form of the VPN server address
    pub fn server_endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// Check the invariants the builder enforces (used after deserializing)
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.server_address.trim().is_empty() {
            return Err(ProtoError::InvalidConfig(
                "server address is required".to_string(),
            ));
        }
        if self.server_port == 0 {
            return Err(ProtoError::InvalidConfig(
                "server port must be non-zero".to_string(),
            ));
        }
        if self.shared_secret.is_empty() {
            return Err(ProtoError::InvalidConfig(
                "shared secret is required".to_string(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.trim().is_empty() || proxy.port == 0 {
                return Err(ProtoError::InvalidConfig(format!(
                    "invalid proxy address '{}'",
                    proxy.address()
                )));
            }
        }
        Ok(())
    }
}

/// Builder for ConnectionConfig
#[derive(Default)]
pub struct ConnectionConfigBuilder {
    server_address: String,
    server_port: u16,
    shared_secret: Vec<u8>,
    routing: AppRouting,
    proxy: Option<ProxyConfig>,
}

impl ConnectionConfigBuilder {
    pub fn server(mut self, address: impl Into<String>, port: u16) -> Self {
        self.server_address = address.into();
        self.server_port = port;
        self
    }

    pub fn shared_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.shared_secret = secret.into();
        self
    }

    pub fn routing(mut self, routing: AppRouting) -> Self {
        self.routing = routing;
        self
    }

    /// An empty host or a zero port means "no proxy".
    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        self.proxy = if host.is_empty() || port == 0 {
            None
        } else {
            Some(ProxyConfig { host, port })
        };
        self
    }

    pub fn build(self) -> Result<ConnectionConfig, ProtoError> {
        let config = ConnectionConfig {
            server_address: self.server_address,
            server_port: self.server_port,
            shared_secret: self.shared_secret,
            routing: self.routing,
            proxy: self.proxy,
        };
        config.validate()?;
        Ok(config)
    }
}
