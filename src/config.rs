//! Konfiguration aus Umgebungsvariablen
//!
//! Alle Werte haben Defaults, nur ungültige Werte führen zu einem Fehler.

use crate::call_engine::{LocalIdentity, MediaConstraints};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Relay, falls `SIGNALING_URL` nicht gesetzt ist
pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:8787";

/// Google STUN Server (kostenlos, für ~90% der Verbindungen)
pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// POLICIES
// ============================================================================

/// Wann fehlgeschlagene Links neu aufgebaut werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fehlgeschlagene Links bleiben bis zum nächsten Join/Leave liegen
    Never,
    /// Bei jedem Roster-Resync, höchstens `max_attempts` mal pro Teilnehmer
    OnResync { max_attempts: u32 },
}

/// Zeitlimit und Wiederholungen für die Verbindungsaushandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// `None` schaltet das Zeitlimit ab
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::OnResync { max_attempts: 3 },
        }
    }
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub server_url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_backoff: Duration,
    /// Kapazität des ausgehenden Puffers einer Verbindung
    pub outbound_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SIGNALING_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            outbound_capacity: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<String>,
    pub negotiation: NegotiationPolicy,
    pub capture: MediaConstraints,
    /// RMS-Pegel ab dem ein Teilnehmer als sprechend gilt
    pub speaking_threshold: f32,
    /// Takt für Timeouts und Indikator-Abgleich
    pub tick_interval: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            negotiation: NegotiationPolicy::default(),
            capture: MediaConstraints::default(),
            speaking_threshold: 0.02,
            tick_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub identity: LocalIdentity,
    pub signaling: SignalingConfig,
    pub call: CallConfig,
}

impl ClientConfig {
    /// Liest die Konfiguration aus den Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut signaling = SignalingConfig::default();
        if let Some(server_url) = get("SIGNALING_URL") {
            Url::parse(&server_url).map_err(|e| ConfigError::Invalid {
                key: "SIGNALING_URL",
                reason: e.to_string(),
            })?;
            signaling.server_url = server_url;
        }
        if let Some(secs) = parse::<u64>(&get, "MESH_HEARTBEAT_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: "MESH_HEARTBEAT_SECS",
                    reason: "must be greater than zero".to_string(),
                });
            }
            signaling.heartbeat_interval = Duration::from_secs(secs);
        }

        let participant_id =
            get("MESH_PARTICIPANT_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let display_name = get("MESH_DISPLAY_NAME").unwrap_or_else(|| "Guest".to_string());
        let is_elevated = parse_bool(&get, "MESH_ELEVATED")?.unwrap_or(false);
        let identity = LocalIdentity::new(participant_id, display_name, is_elevated);

        let mut call = CallConfig::default();
        if let Some(urls) = get("MESH_STUN_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
            if urls.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "MESH_STUN_URLS",
                    reason: "no server given".to_string(),
                });
            }
            call.ice_servers = urls;
        }
        // 0 schaltet das Zeitlimit ab
        if let Some(secs) = parse::<u64>(&get, "MESH_NEGOTIATION_TIMEOUT_SECS")? {
            call.negotiation.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(attempts) = parse::<u32>(&get, "MESH_RETRY_ATTEMPTS")? {
            call.negotiation.retry = if attempts == 0 {
                RetryPolicy::Never
            } else {
                RetryPolicy::OnResync {
                    max_attempts: attempts,
                }
            };
        }
        if let Some(video) = parse_bool(&get, "MESH_VIDEO")? {
            call.capture.video = video;
        }
        if let Some(threshold) = parse::<f32>(&get, "MESH_SPEAKING_THRESHOLD")? {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::Invalid {
                    key: "MESH_SPEAKING_THRESHOLD",
                    reason: "must be between 0.0 and 1.0".to_string(),
                });
            }
            call.speaking_threshold = threshold;
        }

        Ok(Self {
            identity,
            signaling,
            call,
        })
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid {
                key,
                reason: format!("'{}' is not a boolean", raw),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.signaling.server_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.signaling.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.signaling.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.call.ice_servers.len(), 3);
        assert_eq!(config.call.negotiation, NegotiationPolicy::default());
        assert!(!config.identity.is_elevated);
        assert!(!config.identity.participant_id.is_empty());
        assert!(config.call.capture.audio);
        assert!(!config.call.capture.video);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("SIGNALING_URL", "wss://relay.example.com/room/7"),
            ("MESH_PARTICIPANT_ID", "host-1"),
            ("MESH_DISPLAY_NAME", "Ms. Ada"),
            ("MESH_ELEVATED", "true"),
            ("MESH_STUN_URLS", "stun:a.example:3478, stun:b.example:3478"),
            ("MESH_NEGOTIATION_TIMEOUT_SECS", "0"),
            ("MESH_RETRY_ATTEMPTS", "0"),
            ("MESH_VIDEO", "on"),
        ])
        .unwrap();

        assert_eq!(config.signaling.server_url, "wss://relay.example.com/room/7");
        assert_eq!(config.identity.participant_id, "host-1");
        assert_eq!(config.identity.display_name, "Ms. Ada");
        assert!(config.identity.is_elevated);
        assert_eq!(
            config.call.ice_servers,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
        assert_eq!(config.call.negotiation.timeout, None);
        assert_eq!(config.call.negotiation.retry, RetryPolicy::Never);
        assert!(config.call.capture.video);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            config_from(&[("SIGNALING_URL", "not a url")]),
            Err(ConfigError::Invalid {
                key: "SIGNALING_URL",
                ..
            })
        ));
        assert!(matches!(
            config_from(&[("MESH_ELEVATED", "maybe")]),
            Err(ConfigError::Invalid {
                key: "MESH_ELEVATED",
                ..
            })
        ));
        assert!(matches!(
            config_from(&[("MESH_SPEAKING_THRESHOLD", "3.5")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            config_from(&[("MESH_HEARTBEAT_SECS", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
