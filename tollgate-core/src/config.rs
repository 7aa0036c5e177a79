//! Runtime configuration and JSON config file loading.
//!
//! ```json
//! {
//!   "rules": [
//!     {"permission": "*", "pattern": "*", "action": "allow"},
//!     {"permission": "bash", "pattern": "rm *", "action": "ask"}
//!   ],
//!   "hitl": {"default_timeout_secs": 120, "env_var_timeout_secs": 600},
//!   "permission": {"ask_timeout_secs": 900}
//! }
//! ```
//!
//! Rule order in the file is evaluation order: later rules win.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::hitl::InteractionType;
use crate::rules::Ruleset;

/// Default wait for clarification, decision and permission requests (5 minutes)
pub const DEFAULT_HITL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wait for environment-value collection (10 minutes)
pub const DEFAULT_ENV_VAR_TIMEOUT: Duration = Duration::from_secs(600);

/// Consumer group shared by every coordinator process
pub const DEFAULT_CONSUMER_GROUP: &str = "hitl-coordinators";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON or has the wrong shape.
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Permission manager settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionConfig {
    /// How long an ask waits for a reply. `None` waits until replied or cancelled.
    pub ask_timeout: Option<Duration>,
}

/// Message bus listener settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    /// Consumer group name
    pub consumer_group: String,
    /// Consumer name within the group, unique per process
    pub consumer_name: String,
    /// Long-poll duration per read
    pub block: Duration,
    /// Maximum messages per read
    pub batch_size: usize,
    /// Pending messages idle this long are claimed from crashed consumers
    pub claim_min_idle: Duration,
}

impl ListenerConfig {
    /// Consumer name unique to this process.
    pub fn generated_consumer_name() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("coordinator-{}-{}", std::process::id(), &suffix[..8])
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: Self::generated_consumer_name(),
            block: Duration::from_secs(1),
            batch_size: 10,
            claim_min_idle: Duration::from_secs(30),
        }
    }
}

/// HITL coordinator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct HitlConfig {
    /// Wait used by clarification, decision and permission requests
    pub default_timeout: Duration,
    /// Wait used by environment-value requests
    pub env_var_timeout: Duration,
    /// Bus listener settings
    pub listener: ListenerConfig,
}

impl HitlConfig {
    /// Default wait for an interaction type.
    pub fn timeout_for(&self, interaction_type: InteractionType) -> Duration {
        match interaction_type {
            InteractionType::EnvVar => self.env_var_timeout,
            _ => self.default_timeout,
        }
    }
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_HITL_TIMEOUT,
            env_var_timeout: DEFAULT_ENV_VAR_TIMEOUT,
            listener: ListenerConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    rules: Ruleset,
    #[serde(default)]
    hitl: HitlSection,
    #[serde(default)]
    permission: PermissionSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HitlSection {
    default_timeout_secs: Option<f64>,
    env_var_timeout_secs: Option<f64>,
    consumer_group: Option<String>,
    consumer_name: Option<String>,
    block_secs: Option<f64>,
    batch_size: Option<usize>,
    claim_min_idle_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PermissionSection {
    ask_timeout_secs: Option<f64>,
}

/// Complete configuration: base rules plus component settings.
#[derive(Debug, Clone, Default)]
pub struct TollgateConfig {
    /// Base rule layer. Empty means [`Ruleset::default_base`].
    pub rules: Ruleset,
    /// Coordinator settings
    pub hitl: HitlConfig,
    /// Permission manager settings
    pub permission: PermissionConfig,
}

impl TollgateConfig {
    /// Parse a JSON config document.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(content)?;
        file.try_into()
    }

    /// Base rules to install, falling back to the default ruleset.
    pub fn base_rules(&self) -> Ruleset {
        if self.rules.is_empty() {
            Ruleset::default_base()
        } else {
            self.rules.clone()
        }
    }
}

impl TryFrom<ConfigFile> for TollgateConfig {
    type Error = ConfigError;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let defaults = HitlConfig::default();
        let section = file.hitl;

        let listener = ListenerConfig {
            consumer_group: section
                .consumer_group
                .unwrap_or(defaults.listener.consumer_group),
            consumer_name: section
                .consumer_name
                .unwrap_or(defaults.listener.consumer_name),
            block: secs("hitl.block_secs", section.block_secs)?
                .unwrap_or(defaults.listener.block),
            batch_size: match section.batch_size {
                Some(0) => {
                    return Err(ConfigError::Invalid(
                        "hitl.batch_size must be at least 1".to_string(),
                    ))
                }
                Some(n) => n,
                None => defaults.listener.batch_size,
            },
            claim_min_idle: secs("hitl.claim_min_idle_secs", section.claim_min_idle_secs)?
                .unwrap_or(defaults.listener.claim_min_idle),
        };

        Ok(Self {
            rules: file.rules,
            hitl: HitlConfig {
                default_timeout: secs("hitl.default_timeout_secs", section.default_timeout_secs)?
                    .unwrap_or(defaults.default_timeout),
                env_var_timeout: secs("hitl.env_var_timeout_secs", section.env_var_timeout_secs)?
                    .unwrap_or(defaults.env_var_timeout),
                listener,
            },
            permission: PermissionConfig {
                ask_timeout: secs("permission.ask_timeout_secs", file.permission.ask_timeout_secs)?,
            },
        })
    }
}

fn secs(field: &str, value: Option<f64>) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| {
            Duration::try_from_secs_f64(v)
                .map_err(|e| ConfigError::Invalid(format!("{}: {}", field, e)))
        })
        .transpose()
}

/// Load configuration from a JSON file.
pub async fn load_config_file(path: impl AsRef<Path>) -> Result<TollgateConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    TollgateConfig::from_json(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{evaluate, Action};

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.hitl.default_timeout, Duration::from_secs(300));
        assert_eq!(config.hitl.env_var_timeout, Duration::from_secs(600));
        assert_eq!(config.hitl.listener.consumer_group, "hitl-coordinators");
        assert_eq!(config.hitl.listener.batch_size, 10);
        assert!(config.permission.ask_timeout.is_none());
        assert_eq!(config.base_rules(), Ruleset::default_base());
    }

    #[test]
    fn test_timeout_per_type() {
        let config = HitlConfig::default();
        assert_eq!(
            config.timeout_for(InteractionType::EnvVar),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.timeout_for(InteractionType::Decision),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_consumer_names_are_unique() {
        assert_ne!(
            ListenerConfig::generated_consumer_name(),
            ListenerConfig::generated_consumer_name()
        );
    }

    #[test]
    fn test_from_json() {
        let config = TollgateConfig::from_json(
            r#"{
                "rules": [
                    {"permission": "*", "pattern": "*", "action": "allow"},
                    {"permission": "bash", "pattern": "rm *", "action": "deny"}
                ],
                "hitl": {"default_timeout_secs": 1.5, "consumer_group": "g"},
                "permission": {"ask_timeout_secs": 60}
            }"#,
        )
        .unwrap();

        assert_eq!(config.rules.len(), 2);
        let base = config.base_rules();
        assert_eq!(evaluate("bash", "rm -rf /", &[&base]).action(), Action::Deny);
        assert_eq!(evaluate("bash", "ls", &[&base]).action(), Action::Allow);
        assert_eq!(config.hitl.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.hitl.env_var_timeout, DEFAULT_ENV_VAR_TIMEOUT);
        assert_eq!(config.hitl.listener.consumer_group, "g");
        assert_eq!(config.permission.ask_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            TollgateConfig::from_json(r#"{"hitl": {"default_timeout_secs": -1}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TollgateConfig::from_json(r#"{"hitl": {"batch_size": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TollgateConfig::from_json(r#"{"rules": [{"permission": "x", "pattern": "[a", "action": "allow"}]}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            TollgateConfig::from_json(r#"{"unknown": true}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tollgate.json");
        tokio::fs::write(&path, r#"{"permission": {"ask_timeout_secs": 5}}"#)
            .await
            .unwrap();

        let config = load_config_file(&path).await.unwrap();
        assert_eq!(config.permission.ask_timeout, Some(Duration::from_secs(5)));

        let missing = load_config_file(dir.path().join("absent.json")).await;
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
