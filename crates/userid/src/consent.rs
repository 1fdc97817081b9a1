//! Consent gate: opt-out markers and regulatory consent signals.

use serde::{Deserialize, Serialize};

use crate::constants::{LOG_PREFIX, OPT_OUT_MARKERS};
use crate::storage::StorageBackend;

/// Regulatory consent signals for the current user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentData {
    /// Whether GDPR applies to this user.
    #[serde(default)]
    pub gdpr_applies: bool,
    /// TCF consent string, when one was collected.
    #[serde(default)]
    pub consent_string: Option<String>,
    /// CCPA `us_privacy` string.
    #[serde(default)]
    pub us_privacy: Option<String>,
}

impl ConsentData {
    /// Consent data for a user under GDPR.
    #[must_use]
    pub fn gdpr(consent_string: Option<&str>) -> Self {
        Self {
            gdpr_applies: true,
            consent_string: consent_string.map(str::to_string),
            us_privacy: None,
        }
    }

    /// Consent string when present and non-empty.
    #[must_use]
    pub fn consent_string(&self) -> Option<&str> {
        self.consent_string.as_deref().filter(|s| !s.is_empty())
    }
}

/// Whether identity resolution may run under the given consent signals.
///
/// Without consent data, or when GDPR does not apply, resolution is allowed.
/// When GDPR applies a consent string is required.
#[must_use]
pub fn has_gdpr_consent(consent: Option<&ConsentData>) -> bool {
    match consent {
        Some(consent) if consent.gdpr_applies => consent.consent_string().is_some(),
        _ => true,
    }
}

/// The first opt-out marker present in storage, if any.
///
/// A storage failure is logged and reads as "not opted out".
pub fn find_opt_out_marker(storage: &dyn StorageBackend) -> Option<&'static str> {
    OPT_OUT_MARKERS
        .into_iter()
        .find(|marker| match storage.has_marker(marker) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("{LOG_PREFIX} - unable to read opt-out marker {marker}: {err:?}");
                false
            }
        })
}

/// Whether either opt-out marker is set.
pub fn is_opted_out(storage: &dyn StorageBackend) -> bool {
    find_opt_out_marker(storage).is_some()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_gdpr_consent_rules() {
        assert!(has_gdpr_consent(None));
        assert!(has_gdpr_consent(Some(&ConsentData::default())));
        assert!(has_gdpr_consent(Some(&ConsentData::gdpr(Some("BOJ8RZsOJ8RZsABAB")))));
        assert!(!has_gdpr_consent(Some(&ConsentData::gdpr(None))));
        assert!(!has_gdpr_consent(Some(&ConsentData::gdpr(Some("")))));
    }

    #[test]
    fn test_consent_data_deserializes_camel_case() {
        let consent: ConsentData =
            serde_json::from_str(r#"{"gdprApplies":true,"consentString":"abc"}"#)
                .expect("should deserialize");

        assert!(consent.gdpr_applies);
        assert_eq!(consent.consent_string(), Some("abc"));
        assert_eq!(consent.us_privacy, None);
    }

    #[test]
    fn test_no_markers() {
        let storage = MemoryStorage::new();

        assert!(!is_opted_out(&storage));
    }

    #[test]
    fn test_id_sync_cookie_marker() {
        let storage = MemoryStorage::new();
        storage.set_cookie("_pbjs_id_optout", "1", Some(Utc::now() + Duration::seconds(5)));

        assert_eq!(find_opt_out_marker(&storage), Some("_pbjs_id_optout"));
    }

    #[test]
    fn test_module_local_storage_marker() {
        let storage = MemoryStorage::new();
        storage.set_local_item("_pubcid_optout", "1");

        assert_eq!(find_opt_out_marker(&storage), Some("_pubcid_optout"));
    }

    #[test]
    fn test_expired_marker_ignored() {
        let storage = MemoryStorage::new();
        storage.set_cookie("_pbjs_id_optout", "", Some(Utc::now() - Duration::days(1)));

        assert!(!is_opted_out(&storage));
    }

    #[test]
    fn test_unavailable_storage_is_not_opt_out() {
        let storage = MemoryStorage::new();
        storage.set_local_item("_pbjs_id_optout", "1");
        storage.set_cookies_enabled(false);
        storage.set_local_storage_enabled(false);

        assert!(!is_opted_out(&storage));
    }
}
