use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

// =============================================================================
// File config (figment-deserialized from defaults / gateway.toml / env vars)
// =============================================================================
//
//   gateway.toml:    [broker]
//                    url = "redis://127.0.0.1:6379"
//
//   env var:         GATEWAY_BROKER__URL=redis://127.0.0.1:6379   (double underscore = nesting)

pub const DEFAULT_CONFIG_FILE: &str = "gateway.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub broker: BrokerFileConfig,
    #[serde(default)]
    pub gateway: GatewayFileConfig,
}

/// Listener tunables (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The single origin allowed by CORS.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Broker connection tunables (lives under `[broker]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerFileConfig {
    /// Required. `redis://...` or `memory://`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
}

impl Default for BrokerFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
        }
    }
}

/// Per-instance behavior (lives under `[gateway]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    /// Stamped on relayed messages as `origin`. Defaults to the listen port.
    #[serde(default)]
    pub instance_tag: Option<String>,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            instance_tag: None,
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_initial_backoff_ms() -> u64 {
    50
}
fn default_retry_max_backoff_ms() -> u64 {
    1000
}
fn default_outbound_queue_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → gateway.toml → GATEWAY_* env vars.
///
/// `path` replaces `gateway.toml` in the working directory. A missing file is skipped.
///
/// Env vars use double-underscore for nesting into sections:
///   `GATEWAY_SERVER__PORT=3002`  →  `server.port = 3002`
///   `GATEWAY_GATEWAY__INSTANCE_TAG=eu-1`  →  `gateway.instance_tag = "eu-1"`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("GATEWAY_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, validated once at startup)
// =============================================================================

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub cors_origin: HeaderValue,
    /// Upper bound on shutdown reconciliation.
    pub shutdown_grace: Duration,
    pub broker_url: String,
    pub instance: InstanceSettings,
}

/// What a single gateway instance needs besides its broker.
#[derive(Clone, Debug)]
pub struct InstanceSettings {
    pub origin: String,
    pub retry: RetryPolicy,
    pub outbound_capacity: usize,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            origin: default_port().to_string(),
            retry: RetryPolicy::default(),
            outbound_capacity: default_outbound_queue_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self, ConfigError> {
        let broker_url = fc
            .broker
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingBrokerUrl)?
            .to_string();

        let addr = format!("{}:{}", fc.server.host, fc.server.port);
        let listen_addr = addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidListenAddress {
                addr,
                reason: e.to_string(),
            })?;

        let cors_origin = HeaderValue::from_str(&fc.server.cors_origin)
            .map_err(|_| ConfigError::InvalidCorsOrigin(fc.server.cors_origin.clone()))?;

        let origin = fc
            .gateway
            .instance_tag
            .clone()
            .filter(|tag| !tag.is_empty())
            .unwrap_or_else(|| fc.server.port.to_string());

        Ok(Self {
            listen_addr,
            cors_origin,
            shutdown_grace: Duration::from_millis(fc.server.shutdown_grace_ms),
            broker_url,
            instance: InstanceSettings {
                origin,
                retry: RetryPolicy {
                    max_attempts: fc.broker.retry_attempts,
                    initial_backoff: Duration::from_millis(fc.broker.retry_initial_backoff_ms),
                    max_backoff: Duration::from_millis(fc.broker.retry_max_backoff_ms),
                },
                outbound_capacity: fc.gateway.outbound_queue_capacity,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_url(url: &str) -> FileConfig {
        FileConfig {
            broker: BrokerFileConfig {
                url: Some(url.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let d = FileConfig::default();
        assert_eq!(d.server.host, "0.0.0.0");
        assert_eq!(d.server.port, 3001);
        assert_eq!(d.server.cors_origin, "http://localhost:3000");
        assert_eq!(d.server.shutdown_grace_ms, 2000);
        assert!(d.broker.url.is_none());
        assert_eq!(d.broker.retry_attempts, 3);
        assert_eq!(d.gateway.outbound_queue_capacity, 256);
    }

    // ── GatewayConfig::from_file ────────────────────────────────────────

    #[test]
    fn test_missing_broker_url_is_fatal() {
        let err = GatewayConfig::from_file(&FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBrokerUrl));

        let err = GatewayConfig::from_file(&with_url("   ")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBrokerUrl));
    }

    #[test]
    fn test_from_file_defaults() {
        let gc = GatewayConfig::from_file(&with_url("redis://127.0.0.1:6379")).unwrap();
        assert_eq!(gc.listen_addr, "0.0.0.0:3001".parse().unwrap());
        assert_eq!(gc.broker_url, "redis://127.0.0.1:6379");
        assert_eq!(gc.shutdown_grace, Duration::from_millis(2000));
        assert_eq!(gc.instance.origin, "3001");
        assert_eq!(gc.instance.retry, RetryPolicy::default());
        assert_eq!(gc.instance.outbound_capacity, 256);
    }

    #[test]
    fn test_instance_tag_overrides_port() {
        let mut fc = with_url("memory://");
        fc.server.port = 4000;
        assert_eq!(GatewayConfig::from_file(&fc).unwrap().instance.origin, "4000");

        fc.gateway.instance_tag = Some("eu-west".into());
        assert_eq!(GatewayConfig::from_file(&fc).unwrap().instance.origin, "eu-west");
    }

    #[test]
    fn test_invalid_cors_origin_is_rejected() {
        let mut fc = with_url("memory://");
        fc.server.cors_origin = "http://bad\norigin".into();
        let err = GatewayConfig::from_file(&fc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCorsOrigin(_)));
    }

    #[test]
    fn test_invalid_host_is_rejected() {
        let mut fc = with_url("memory://");
        fc.server.host = "not a host".into();
        let err = GatewayConfig::from_file(&fc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListenAddress { .. }));
    }

    // ── load_config ─────────────────────────────────────────────────────

    // Jail serializes env access across tests.

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        figment::Jail::expect_with(|jail| {
            let missing = jail.directory().join("absent.toml");
            let fc: FileConfig = load_config(Some(&missing)).extract()?;
            assert_eq!(fc.server.port, 3001);
            assert!(fc.broker.url.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                "[server]\nport = 3002\n\n[broker]\nurl = \"redis://cache:6379\"\nretry_attempts = 5\n\n[gateway]\ninstance_tag = \"b\"\n",
            )?;

            let fc: FileConfig = load_config(Some(Path::new("custom.toml"))).extract()?;
            assert_eq!(fc.server.port, 3002);
            assert_eq!(fc.server.host, "0.0.0.0");
            assert_eq!(fc.broker.url.as_deref(), Some("redis://cache:6379"));
            assert_eq!(fc.broker.retry_attempts, 5);
            assert_eq!(fc.gateway.instance_tag.as_deref(), Some("b"));
            Ok(())
        });
    }

    #[test]
    fn test_load_config_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("gateway.toml", "[server]\nport = 3002\n")?;
            jail.set_env("GATEWAY_SERVER__PORT", "3005");
            jail.set_env("GATEWAY_BROKER__URL", "memory://");

            let fc: FileConfig = load_config(None).extract()?;
            assert_eq!(fc.server.port, 3005);
            assert_eq!(fc.broker.url.as_deref(), Some("memory://"));
            Ok(())
        });
    }
}
