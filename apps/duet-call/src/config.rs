use std::env;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::bitrate::BitratePolicy;

pub const SIGNALING_URL_ENV: &str = "DUET_SIGNALING_URL";
pub const ICE_SERVERS_ENV: &str = "DUET_ICE_SERVERS";
pub const BITRATE_POLICY_ENV: &str = "DUET_BITRATE_POLICY";

const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// One STUN/TURN entry handed to the peer connection.
///
/// TURN credentials here are long-lived and readable by anything that can
/// read the client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid url: {source}")]
    Url {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{var} is not valid json: {source}")]
    Json {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallConfig {
    pub signaling_url: Url,
    pub ice_servers: Vec<IceServer>,
    pub bitrate: BitratePolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: Url::parse(DEFAULT_SIGNALING_URL)
                .unwrap_or_else(|_| unreachable!("default signaling url is valid")),
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN.to_string()],
                username: None,
                credential: None,
            }],
            bitrate: BitratePolicy::default(),
        }
    }
}

impl CallConfig {
    /// Defaults overridden by whichever `DUET_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = non_empty_var(SIGNALING_URL_ENV) {
            config.signaling_url = Url::parse(&raw).map_err(|source| ConfigError::Url {
                var: SIGNALING_URL_ENV,
                source,
            })?;
        }
        if let Some(raw) = non_empty_var(ICE_SERVERS_ENV) {
            config.ice_servers = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                var: ICE_SERVERS_ENV,
                source,
            })?;
        }
        if let Some(raw) = non_empty_var(BITRATE_POLICY_ENV) {
            config.bitrate = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                var: BITRATE_POLICY_ENV,
                source,
            })?;
        }
        if config
            .ice_servers
            .iter()
            .any(|server| server.credential.is_some())
        {
            tracing::warn!(
                target = "duet::config",
                "static TURN credentials configured; they are visible to every client"
            );
        }
        Ok(config)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for var in [SIGNALING_URL_ENV, ICE_SERVERS_ENV, BITRATE_POLICY_ENV] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear();
        let config = CallConfig::from_env().unwrap();
        assert_eq!(config, CallConfig::default());
        assert_eq!(config.bitrate.start_bps, 3_500_000);
    }

    #[test]
    #[serial]
    fn environment_overrides_each_field() {
        clear();
        env::set_var(SIGNALING_URL_ENV, "https://relay.example.com");
        env::set_var(
            ICE_SERVERS_ENV,
            r#"[{"urls":["turn:turn.example.com:3478"],"username":"u","credential":"c"}]"#,
        );
        env::set_var(BITRATE_POLICY_ENV, r#"{"goodBps": 4000000}"#);

        let config = CallConfig::from_env().unwrap();
        assert_eq!(config.signaling_url.host_str(), Some("relay.example.com"));
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.bitrate.good_bps, 4_000_000);
        assert_eq!(config.bitrate.medium_bps, 2_000_000);
        clear();
    }

    #[test]
    #[serial]
    fn malformed_json_names_the_variable() {
        clear();
        env::set_var(ICE_SERVERS_ENV, "not json");
        let err = CallConfig::from_env().unwrap_err();
        assert!(err.to_string().contains(ICE_SERVERS_ENV));
        clear();
    }
}
