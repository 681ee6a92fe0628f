//! Environment configuration for the `collab-tail` client.

use std::time::Duration;
use tracing::info;

use crate::sync::presence::color_for;
use crate::sync::{CurrentUser, SyncConfig};

/// Errors raised while reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the assessment collaboration channel
    pub ws_url: String,
    pub user: CurrentUser,
    pub sync: SyncConfig,
}

impl ClientConfig {
    /// Load from a `.env` file (if present) and the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ws_url = lookup("COLLAB_WS_URL").ok_or(ConfigError::Missing("COLLAB_WS_URL"))?;

        let user_id = lookup("COLLAB_USER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let full_name = lookup("COLLAB_USER_NAME").unwrap_or_else(|| "Anonymous".to_string());
        let email = lookup("COLLAB_USER_EMAIL").unwrap_or_default();
        let color = color_for(&user_id).to_string();

        let mut sync = SyncConfig::default();
        if let Some(capacity) = parse(&lookup, "COLLAB_EDIT_LOG_CAPACITY")? {
            sync = sync.with_edit_log_capacity(capacity);
        }
        if let Some(capacity) = parse(&lookup, "COLLAB_TRANSCRIPT_CAPACITY")? {
            sync = sync.with_transcript_capacity(capacity);
        }
        if let Some(secs) = parse(&lookup, "COLLAB_IDLE_AFTER_SECS")? {
            sync = sync.with_idle_after(Duration::from_secs(secs as u64));
        }
        if let Some(secs) = parse(&lookup, "COLLAB_AWAY_AFTER_SECS")? {
            sync = sync.with_away_after(Duration::from_secs(secs as u64));
        }
        if sync.idle_after >= sync.away_after {
            return Err(ConfigError::Invalid {
                key: "COLLAB_IDLE_AFTER_SECS",
                value: format!(
                    "{} (must be below away threshold {})",
                    sync.idle_after.as_secs(),
                    sync.away_after.as_secs()
                ),
            });
        }

        info!("Configuration loaded for user {} ({})", full_name, user_id);

        Ok(Self {
            ws_url,
            user: CurrentUser::new(user_id, full_name, email, color),
            sync,
        })
    }
}

fn parse<F>(lookup: &F, key: &'static str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_requires_ws_url() {
        let result = ClientConfig::from_lookup(lookup(&[]));
        assert!(matches!(result, Err(ConfigError::Missing("COLLAB_WS_URL"))));
    }

    #[test]
    fn test_defaults_and_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("COLLAB_WS_URL", "ws://localhost:8000/ws/assessments/7"),
            ("COLLAB_USER_ID", "u-7"),
            ("COLLAB_USER_NAME", "Riley"),
            ("COLLAB_EDIT_LOG_CAPACITY", "20"),
        ]))
        .unwrap();

        assert_eq!(config.user.id, "u-7");
        assert_eq!(config.user.full_name, "Riley");
        assert_eq!(config.user.color, color_for("u-7"));
        assert_eq!(config.sync.edit_log_capacity, 20);
        assert_eq!(config.sync.transcript_capacity, 100);
    }

    #[test]
    fn test_invalid_number() {
        let result = ClientConfig::from_lookup(lookup(&[
            ("COLLAB_WS_URL", "ws://localhost"),
            ("COLLAB_TRANSCRIPT_CAPACITY", "lots"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "COLLAB_TRANSCRIPT_CAPACITY", .. })
        ));
    }

    #[test]
    fn test_presence_threshold_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("COLLAB_WS_URL", "ws://localhost"),
            ("COLLAB_IDLE_AFTER_SECS", "30"),
            ("COLLAB_AWAY_AFTER_SECS", "90"),
        ]))
        .unwrap();

        assert_eq!(config.sync.idle_after, Duration::from_secs(30));
        assert_eq!(config.sync.away_after, Duration::from_secs(90));
    }

    #[test]
    fn test_idle_must_precede_away() {
        let result = ClientConfig::from_lookup(lookup(&[
            ("COLLAB_WS_URL", "ws://localhost"),
            ("COLLAB_IDLE_AFTER_SECS", "600"),
        ]));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "COLLAB_IDLE_AFTER_SECS", .. })
        ));
    }
}
