//! Call configuration: relay endpoint, ICE resource tiers, tuning knobs.
//!
//! Configuration is fetched once from the web server at startup and falls
//! back to hardcoded defaults when the fetch fails. A failed fetch is never
//! fatal to call startup.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tiers::IceResourceSet;

/// Signaling endpoint used when no configuration could be loaded.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8081/room";

/// Server-provided call configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConfig {
    /// Base websocket endpoint of the signaling relay; the room id is
    /// appended as a path segment when connecting.
    pub signaling_url: String,
    /// Primary STUN endpoints, used for the first connection attempt.
    #[serde(default)]
    pub stun_servers: Vec<String>,
    /// Alternate endpoint sets tried on later attempts, in order.
    #[serde(default)]
    pub stun_fallbacks: Vec<Vec<String>>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: Vec::new(),
            stun_fallbacks: Vec::new(),
        }
    }
}

impl CallConfig {
    /// Fetch the configuration from `config_url`, falling back to defaults
    /// on any failure.
    pub async fn load(config_url: &str) -> Self {
        match Self::try_fetch(config_url).await {
            Ok(config) => {
                debug!(signaling_url = %config.signaling_url, "loaded call configuration");
                config
            }
            Err(err) => {
                warn!(%err, "could not load call configuration, using defaults");
                Self::default()
            }
        }
    }

    async fn try_fetch(config_url: &str) -> Result<Self> {
        let response = reqwest::get(config_url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| Error::Config(err.to_string()))?;
        response
            .json::<CallConfig>()
            .await
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// The ordered ICE tier list: configured primary servers first, then
    /// any configured alternates. When nothing but the primary tier exists,
    /// the hardcoded STUN set is appended as a last resort (unless it
    /// already is the primary tier).
    pub fn resource_tiers(&self) -> Vec<IceResourceSet> {
        let primary = if self.stun_servers.is_empty() {
            IceResourceSet::default_stun()
        } else {
            IceResourceSet::new(self.stun_servers.clone())
        };
        let mut tiers = vec![primary];
        for alternate in &self.stun_fallbacks {
            if !alternate.is_empty() {
                tiers.push(IceResourceSet::new(alternate.clone()));
            }
        }
        if tiers.len() == 1 && tiers[0] != IceResourceSet::default_stun() {
            tiers.push(IceResourceSet::default_stun());
        }
        tiers
    }
}

/// Orchestration tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSettings {
    /// Connection attempts per peer beyond the first.
    pub max_retries: u32,
    /// How long a non-connected session may stay pending before it is
    /// considered timed out.
    pub connection_deadline: Duration,
    /// Pause between releasing a failed attempt and starting the next one.
    pub retry_delay: Duration,
    /// How long to wait for the signaling channel to open.
    pub connect_timeout: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connection_deadline: Duration::from_secs(15),
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_server_payload() {
        let config: CallConfig = serde_json::from_str(
            r#"{
                "signalingUrl": "ws://relay.example.com/room",
                "stunServers": ["stun:stun.example.com:3478"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.signaling_url, "ws://relay.example.com/room");
        assert_eq!(config.stun_servers, vec!["stun:stun.example.com:3478"]);
        assert!(config.stun_fallbacks.is_empty());
    }

    #[test]
    fn test_default_config_uses_hardcoded_endpoint() {
        let config = CallConfig::default();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        let tiers = config.resource_tiers();
        assert_eq!(tiers, vec![IceResourceSet::default_stun()]);
    }

    #[test]
    fn test_configured_servers_get_default_fallback_tier() {
        let config = CallConfig {
            stun_servers: vec!["stun:stun.example.com:3478".to_string()],
            ..CallConfig::default()
        };
        let tiers = config.resource_tiers();
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(tiers[1], IceResourceSet::default_stun());
    }

    #[test]
    fn test_explicit_fallback_tiers_are_kept_in_order() {
        let config = CallConfig {
            stun_servers: vec!["stun:a.example.com:3478".to_string()],
            stun_fallbacks: vec![
                vec!["stun:b.example.com:3478".to_string()],
                vec![],
                vec!["turn:c.example.com:3478".to_string()],
            ],
            ..CallConfig::default()
        };
        let tiers = config.resource_tiers();
        assert_eq!(tiers.len(), 3);
        assert_eq!(tiers[1].urls, vec!["stun:b.example.com:3478"]);
        assert_eq!(tiers[2].urls, vec!["turn:c.example.com:3478"]);
    }
}
