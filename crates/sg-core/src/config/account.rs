//! Account configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::{BackoffConfig, LivenessConfig, StreamConfig};
use crate::error::ConfigError;
use crate::types::AccountId;

/// Top-level agent configuration: one entry per chat-service account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Accounts to connect
    pub accounts: Vec<AccountConfig>,
}

/// Configuration for one account and its connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Account identifier, used in logs
    pub account_id: AccountId,

    /// Websocket endpoint (`ws://` or `wss://`)
    pub endpoint: String,

    /// Bearer credential, inline
    pub credential: Option<String>,

    /// Environment variable holding the bearer credential
    pub credential_env: Option<String>,

    /// Handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Reconnect backoff
    pub backoff: BackoffConfig,

    /// Liveness probes
    pub liveness: LivenessConfig,

    /// Response streams
    pub stream: StreamConfig,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: AccountId::new("default"),
            endpoint: String::new(),
            credential: None,
            credential_env: None,
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            liveness: LivenessConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl AccountConfig {
    /// Check the configuration for values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingField("endpoint".to_string()));
        }
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }
        if self.backoff.base.is_zero() || self.backoff.base > self.backoff.max {
            return Err(ConfigError::Invalid(
                "backoff.base_ms must be non-zero and not exceed backoff.max_ms".to_string(),
            ));
        }
        if self.liveness.ping_interval.is_zero()
            || self.liveness.probe_interval.is_zero()
            || self.liveness.pong_tolerance == 0
        {
            return Err(ConfigError::Invalid(
                "liveness intervals and pong_tolerance must be non-zero".to_string(),
            ));
        }
        if self.stream.ack_timeout.is_zero() || self.stream.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "stream.ack_timeout_ms and stream.sweep_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the bearer credential, preferring the inline value
    pub fn resolve_credential(&self) -> Result<String, ConfigError> {
        if let Some(credential) = self.credential.as_ref().filter(|c| !c.is_empty()) {
            return Ok(credential.clone());
        }
        if let Some(var) = &self.credential_env {
            return std::env::var(var).map_err(|_| {
                ConfigError::Invalid(format!("credential variable {} is not set", var))
            });
        }
        Err(ConfigError::MissingField("credential".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AccountConfig {
        AccountConfig {
            endpoint: "wss://chat.example.com/agent".to_string(),
            credential: Some("token".to_string()),
            ..AccountConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_endpoint() {
        let config = AccountConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(field)) if field == "endpoint"
        ));
    }

    #[test]
    fn test_http_endpoint_is_rejected() {
        let config = AccountConfig {
            endpoint: "https://chat.example.com".to_string(),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_backoff_base_above_max_is_rejected() {
        let mut config = valid();
        config.backoff.base = Duration::from_secs(60);
        config.backoff.max = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inline_credential_wins() {
        let config = AccountConfig {
            credential_env: Some("SG_TEST_UNUSED_VAR".to_string()),
            ..valid()
        };
        assert_eq!(config.resolve_credential().unwrap(), "token");
    }

    #[test]
    fn test_missing_credential() {
        let config = AccountConfig {
            credential: None,
            ..valid()
        };
        assert!(matches!(
            config.resolve_credential(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_unset_credential_variable() {
        let config = AccountConfig {
            credential: None,
            credential_env: Some("SG_TEST_CREDENTIAL_THAT_IS_NEVER_SET".to_string()),
            ..valid()
        };
        assert!(matches!(
            config.resolve_credential(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
