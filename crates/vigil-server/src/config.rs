use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use vigil_registry::PortRange;

use crate::connector::ConnectorConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Server settings, read from the environment (and `.env`).
///
/// | Variable | Default |
/// |----------|---------|
/// | `VIGIL_HOST` | `127.0.0.1` |
/// | `VIGIL_PORT_RANGE` | `5801-6000` |
/// | `VIGIL_SERVICE_NAME` | `vigil` |
/// | `VIGIL_PASSWORD_FILE` | `vigil.password` |
/// | `VIGIL_POLICY_FILE` | `vigil.policy` |
/// | `JWT_SECRET` | random per process |
/// | `VIGIL_HANDSHAKE_TIMEOUT_SECS` | `10` |
/// | `VIGIL_NOTIFICATION_QUEUE` | `64` |
/// | `VIGIL_OUTBOUND_QUEUE` | `256` |
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port_range: PortRange,
    pub service_name: String,
    pub password_file: PathBuf,
    pub policy_file: PathBuf,
    pub jwt_secret: String,
    pub handshake_timeout: Duration,
    pub notification_queue: usize,
    pub outbound_queue: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port_range = get("VIGIL_PORT_RANGE", "5801-6000")
            .parse::<PortRange>()
            .map_err(|e| ConfigError::Invalid {
                key: "VIGIL_PORT_RANGE",
                reason: e.to_string(),
            })?;

        let handshake_secs: u64 = get("VIGIL_HANDSHAKE_TIMEOUT_SECS", "10")
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                key: "VIGIL_HANDSHAKE_TIMEOUT_SECS",
                reason: e.to_string(),
            })?;

        let positive = |key: &'static str, default: &str| {
            get(key, default)
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    key,
                    reason: "expected a positive integer".to_string(),
                })
        };
        let notification_queue = positive("VIGIL_NOTIFICATION_QUEUE", "64")?;
        let outbound_queue = positive("VIGIL_OUTBOUND_QUEUE", "256")?;

        Ok(Self {
            host: get("VIGIL_HOST", "127.0.0.1"),
            port_range,
            service_name: get("VIGIL_SERVICE_NAME", "vigil"),
            password_file: get("VIGIL_PASSWORD_FILE", "vigil.password").into(),
            policy_file: get("VIGIL_POLICY_FILE", "vigil.policy").into(),
            jwt_secret: lookup("JWT_SECRET").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            handshake_timeout: Duration::from_secs(handshake_secs),
            notification_queue,
            outbound_queue,
        })
    }

    pub fn connector(&self) -> ConnectorConfig {
        ConnectorConfig {
            service_name: self.service_name.clone(),
            handshake_timeout: self.handshake_timeout,
            token_secret: self.jwt_secret.clone(),
            outbound_queue: self.outbound_queue,
        }
    }
}
