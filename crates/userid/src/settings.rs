use config::{Config, Environment, File, FileFormat};
use error_stack::{Report, ResultExt};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::constants::MAX_SYNC_DELAY_MS;
use crate::error::UserIdError;

/// `[user_sync]` section: the same shape the config processor consumes.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UserSyncSettings {
    /// Delay in milliseconds before deferred ID fetches start.
    #[serde(default)]
    #[validate(range(max = MAX_SYNC_DELAY_MS))]
    pub sync_delay: u64,

    /// Raw per-submodule configs, validated later by the config processor.
    #[serde(default)]
    pub user_ids: Vec<Value>,
}

/// `[storage]` section: how written cookies are rendered as `Set-Cookie`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StorageSettings {
    #[serde(default)]
    pub cookie_domain: Option<String>,

    #[serde(default = "default_cookie_path")]
    #[validate(length(min = 1))]
    pub cookie_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cookie_domain: None,
            cookie_path: default_cookie_path(),
        }
    }
}

fn default_cookie_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate(nested)]
    pub user_sync: Option<UserSyncSettings>,

    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageSettings,
}

impl Settings {
    /// Load settings from TOML, with `USERID__SECTION__KEY` environment
    /// variables taking precedence.
    ///
    /// # Errors
    ///
    /// Returns [`UserIdError::Configuration`] when the TOML is invalid or the
    /// resulting settings fail validation.
    pub fn from_toml(toml_str: &str) -> Result<Self, Report<UserIdError>> {
        let environment = Environment::default().prefix("USERID").separator("__");

        let toml = File::from_str(toml_str, FileFormat::Toml);
        let config = Config::builder()
            .add_source(toml)
            .add_source(environment)
            .build()
            .change_context(UserIdError::Configuration {
                message: "Failed to build configuration".to_string(),
            })?;

        let settings: Self =
            config
                .try_deserialize()
                .change_context(UserIdError::Configuration {
                    message: "Failed to deserialize settings".to_string(),
                })?;

        settings
            .validate()
            .change_context(UserIdError::Configuration {
                message: "Settings failed validation".to_string(),
            })?;

        Ok(settings)
    }

    /// Render the `{ usersync: { syncDelay, userIds } }` object accepted by
    /// [`crate::engine::UserIdEngine::set_config`].
    #[must_use]
    pub fn user_sync_value(&self) -> Value {
        match &self.user_sync {
            Some(user_sync) => json!({
                "usersync": {
                    "syncDelay": user_sync.sync_delay,
                    "userIds": user_sync.user_ids,
                }
            }),
            None => json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TOML: &str = include_str!("../../../userid.toml");

    #[test]
    fn test_settings_from_sample_file() {
        let settings = Settings::from_toml(SAMPLE_TOML).expect("sample config should load");

        let user_sync = settings.user_sync.expect("sample has a user_sync section");
        assert_eq!(user_sync.user_ids.len(), 3);
        assert_eq!(user_sync.user_ids[0]["name"], "pubCommonId");
        assert_eq!(
            settings.storage.cookie_domain.as_deref(),
            Some(".test-publisher.com")
        );
    }

    #[test]
    fn test_settings_from_valid_toml() {
        let toml_str = r#"
            [user_sync]
            sync_delay = 250

            [[user_sync.user_ids]]
            name = "unifiedId"
            params = { partner = "prebid" }
            storage = { name = "unifiedid", type = "cookie", expires = 60 }
            "#;

        let settings = Settings::from_toml(toml_str).expect("should load");
        let user_sync = settings.user_sync.expect("should have user_sync");
        assert_eq!(user_sync.sync_delay, 250);
        assert_eq!(user_sync.user_ids[0]["storage"]["expires"], 60);
        assert_eq!(settings.storage.cookie_path, "/");
    }

    #[test]
    fn test_settings_empty_toml() {
        let settings = Settings::from_toml("").expect("empty config is allowed");

        assert!(settings.user_sync.is_none());
        assert_eq!(settings.user_sync_value(), json!({}));
    }

    #[test]
    fn test_settings_invalid_toml_syntax() {
        let toml_str = r#"
            [user_sync
            sync_delay = 0
            "#;

        assert!(Settings::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_settings_sync_delay_out_of_range() {
        let toml_str = r#"
            [user_sync]
            sync_delay = 3600000
            "#;

        let err = Settings::from_toml(toml_str).expect_err("should fail validation");
        assert!(matches!(
            err.current_context(),
            UserIdError::Configuration { .. }
        ));
    }

    #[test]
    fn test_settings_empty_cookie_path_rejected() {
        let toml_str = r#"
            [storage]
            cookie_path = ""
            "#;

        assert!(Settings::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_user_sync_value_shape() {
        let settings = Settings {
            user_sync: Some(UserSyncSettings {
                sync_delay: 99,
                user_ids: vec![json!({"name": "pubCommonId", "value": {"pubcid": "1"}})],
            }),
            storage: StorageSettings::default(),
        };

        assert_eq!(
            settings.user_sync_value(),
            json!({
                "usersync": {
                    "syncDelay": 99,
                    "userIds": [{"name": "pubCommonId", "value": {"pubcid": "1"}}]
                }
            })
        );
    }

    #[test]
    fn test_set_env() {
        let toml_str = r#"
            [user_sync]
            sync_delay = 0
            "#;

        temp_env::with_var("USERID__USER_SYNC__SYNC_DELAY", Some("99"), || {
            let settings = Settings::from_toml(toml_str).expect("should load");
            assert_eq!(
                settings.user_sync.expect("should have user_sync").sync_delay,
                99
            );
        });
    }
}
