//! Config processor: turns the raw `usersync` configuration into validated
//! per-submodule resolution configs.
//!
//! Entries that fail structural validation are dropped with a warning; they
//! never fail the whole configuration.

use chrono::{DateTime, Duration, Utc};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::constants::{
    DEFAULT_EXPIRES_DAYS, DEFAULT_SYNC_DELAY_MS, LOG_PREFIX, MAX_EXPIRES_DAYS, MAX_SYNC_DELAY_MS,
};
use crate::error::UserIdError;
use crate::storage::StorageKind;

const USER_SYNC_KEYS: [&str; 3] = ["usersync", "userSync", "user_sync"];
const SYNC_DELAY_KEYS: [&str; 2] = ["syncDelay", "sync_delay"];
const USER_IDS_KEYS: [&str; 2] = ["userIds", "user_ids"];

/// Where a submodule's identity is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    /// Cookie name or local storage key.
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(rename = "type")]
    pub kind: StorageKind,

    /// Lifetime in days.
    #[serde(default = "default_expires")]
    #[validate(range(max = MAX_EXPIRES_DAYS))]
    pub expires: u32,
}

fn default_expires() -> u32 {
    DEFAULT_EXPIRES_DAYS
}

impl StorageConfig {
    /// Absolute expiry for a value written at `now`.
    #[must_use]
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(i64::from(self.expires))
    }
}

/// One submodule bound to its resolution policy for this session.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmoduleConfig {
    pub name: String,
    /// Literal identity; skips storage and fetch entirely.
    pub value: Option<Value>,
    pub storage: Option<StorageConfig>,
    /// Free-form provider parameters (partner ids, endpoints, ...).
    pub params: Option<Map<String, Value>>,
}

impl SubmoduleConfig {
    /// Whether the config names a resolution source of its own.
    #[must_use]
    pub fn has_source(&self) -> bool {
        self.value.is_some() || self.storage.is_some()
    }

    /// Look up a provider parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|params| params.get(key))
    }

    /// Key identifying the slot this config resolves into. Two configs sharing
    /// a storage slot share the key.
    #[must_use]
    pub fn slot_key(&self) -> String {
        match &self.storage {
            Some(storage) => format!("{}:{}", storage.kind, storage.name),
            None => format!("submodule:{}", self.name),
        }
    }
}

/// Validated `usersync` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSyncConfig {
    /// Milliseconds to wait before starting deferred fetches.
    pub sync_delay: u64,
    /// Accepted configs, in input order.
    pub submodules: Vec<SubmoduleConfig>,
}

/// Process a full configuration object.
///
/// Returns `None` when there is no `usersync` section, so callers can leave
/// their current configuration untouched.
pub fn process_config(raw: &Value) -> Option<UserSyncConfig> {
    let section = first_key(raw.as_object()?, &USER_SYNC_KEYS)?;
    let Some(section) = section.as_object() else {
        log::warn!("{LOG_PREFIX} - usersync config must be an object, ignoring");
        return None;
    };

    let sync_delay = first_key(section, &SYNC_DELAY_KEYS)
        .map_or(DEFAULT_SYNC_DELAY_MS, parse_sync_delay);

    let submodules = match first_key(section, &USER_IDS_KEYS) {
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match parse_submodule_config(entry) {
                Ok(config) => Some(config),
                Err(err) => {
                    log::warn!("{LOG_PREFIX} - dropping userIds[{index}]: {err:?}");
                    None
                }
            })
            .collect(),
        Some(_) => {
            log::warn!("{LOG_PREFIX} - userIds must be an array, ignoring");
            Vec::new()
        }
        None => Vec::new(),
    };

    Some(UserSyncConfig {
        sync_delay,
        submodules,
    })
}

/// Validate one raw `userIds[]` entry.
///
/// # Errors
///
/// Returns [`UserIdError::Configuration`] when the name is missing, empty or
/// not a string, or when the storage descriptor is malformed.
pub fn parse_submodule_config(raw: &Value) -> Result<SubmoduleConfig, Report<UserIdError>> {
    let entry = raw.as_object().ok_or_else(|| {
        Report::new(UserIdError::Configuration {
            message: "submodule config must be an object".to_string(),
        })
    })?;

    let name = match entry.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
        _ => {
            return Err(Report::new(UserIdError::Configuration {
                message: "missing or non-string name".to_string(),
            }))
        }
    };

    let storage = match entry.get("storage") {
        None | Some(Value::Null) => None,
        Some(storage) => {
            let storage: StorageConfig = serde_json::from_value(storage.clone())
                .change_context(UserIdError::Configuration {
                    message: format!("invalid storage descriptor for {name}"),
                })?;
            storage
                .validate()
                .change_context(UserIdError::Configuration {
                    message: format!("invalid storage descriptor for {name}"),
                })?;
            Some(storage)
        }
    };

    let value = entry.get("value").filter(|v| !v.is_null()).cloned();
    let params = entry
        .get("params")
        .and_then(Value::as_object)
        .cloned();

    Ok(SubmoduleConfig {
        name,
        value,
        storage,
        params,
    })
}

fn first_key<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn parse_sync_delay(raw: &Value) -> u64 {
    match raw.as_u64() {
        Some(delay) if delay > MAX_SYNC_DELAY_MS => {
            log::warn!(
                "{LOG_PREFIX} - syncDelay {delay} exceeds {MAX_SYNC_DELAY_MS}ms, clamping"
            );
            MAX_SYNC_DELAY_MS
        }
        Some(delay) => delay,
        None => {
            log::warn!("{LOG_PREFIX} - syncDelay must be a non-negative integer, using default");
            DEFAULT_SYNC_DELAY_MS
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_no_usersync_section() {
        assert_eq!(process_config(&json!({})), None);
        assert_eq!(process_config(&json!({"other": true})), None);
        assert_eq!(process_config(&json!("not an object")), None);
    }

    #[test]
    fn test_empty_usersync_section() {
        let config = process_config(&json!({"usersync": {}})).expect("section present");

        assert_eq!(config, UserSyncConfig::default());
    }

    #[test]
    fn test_entries_keep_input_order() {
        let config = process_config(&json!({
            "usersync": {
                "syncDelay": 0,
                "userIds": [
                    {"name": "unifiedId", "storage": {"name": "unifiedid", "type": "cookie"}},
                    {"name": "pubCommonId", "value": {"pubcid": "11111"}}
                ]
            }
        }))
        .expect("section present");

        let names: Vec<_> = config.submodules.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["unifiedId", "pubCommonId"]);
        assert_eq!(
            config.submodules[0].storage,
            Some(StorageConfig {
                name: "unifiedid".to_string(),
                kind: StorageKind::Cookie,
                expires: DEFAULT_EXPIRES_DAYS,
            })
        );
        assert_eq!(config.submodules[1].value, Some(json!({"pubcid": "11111"})));
    }

    #[test]
    fn test_malformed_entries_dropped() {
        let config = process_config(&json!({
            "usersync": {
                "userIds": [
                    {},
                    {"name": "", "value": {"test": "1"}},
                    {"name": 7, "value": {"test": "1"}},
                    "pubCommonId",
                    {"name": "bad", "storage": {"name": "x", "type": "indexeddb"}},
                    {"name": "empty", "storage": {"name": "", "type": "cookie"}},
                    {"name": "long", "storage": {"name": "x", "type": "html5", "expires": 99999}},
                    {"name": "foo", "value": {"test": "1"}}
                ]
            }
        }))
        .expect("section present");

        let names: Vec<_> = config.submodules.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["foo"]);
    }

    #[test]
    fn test_sourceless_entry_is_kept_for_submodule_to_decide() {
        let config = process_config(&json!({
            "usersync": {"userIds": [{"name": "serverSideId"}]}
        }))
        .expect("section present");

        assert_eq!(config.submodules.len(), 1);
        assert!(!config.submodules[0].has_source());
    }

    #[test]
    fn test_sync_delay_variants() {
        let delay = |raw: Value| {
            process_config(&json!({"usersync": {"syncDelay": raw}}))
                .expect("section present")
                .sync_delay
        };

        assert_eq!(delay(json!(99)), 99);
        assert_eq!(delay(json!(-5)), DEFAULT_SYNC_DELAY_MS);
        assert_eq!(delay(json!("100")), DEFAULT_SYNC_DELAY_MS);
        assert_eq!(delay(json!(1.5)), DEFAULT_SYNC_DELAY_MS);
        assert_eq!(delay(json!(10_000_000)), MAX_SYNC_DELAY_MS);
    }

    #[test]
    fn test_key_aliases() {
        let config = process_config(&json!({
            "userSync": {"sync_delay": 5, "user_ids": [{"name": "a", "value": "x"}]}
        }))
        .expect("section present");

        assert_eq!(config.sync_delay, 5);
        assert_eq!(config.submodules.len(), 1);
    }

    #[test]
    fn test_params_and_slot_key() {
        let config = parse_submodule_config(&json!({
            "name": "unifiedId",
            "params": {"partner": "prebid"},
            "storage": {"name": "unifiedid", "type": "html5", "expires": 60}
        }))
        .expect("should parse");

        assert_eq!(config.param("partner"), Some(&json!("prebid")));
        assert_eq!(config.slot_key(), "html5:unifiedid");

        let bare = parse_submodule_config(&json!({"name": "x"})).expect("should parse");
        assert_eq!(bare.slot_key(), "submodule:x");
        assert_eq!(bare.param("partner"), None);
    }

    #[test]
    fn test_expires_at() {
        let storage = StorageConfig {
            name: "pubcid".to_string(),
            kind: StorageKind::Cookie,
            expires: 30,
        };
        let now = Utc::now();

        assert_eq!(storage.expires_at(now) - now, Duration::days(30));
    }
}
