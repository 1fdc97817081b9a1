//! Storage backends for cached identities.
//!
//! Two physical stores sit behind one [`StorageBackend`] trait selected by
//! [`StorageKind`]: first-party cookies and persistent local key/value
//! storage. Expiry crosses the trait as an absolute UTC timestamp; each store
//! keeps its own representation (a cookie `Expires` date, or a companion
//! `<key>_exp` entry for local storage).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use cookie::Cookie;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{EXPIRY_DATE_FORMAT, LOCAL_STORAGE_EXP_SUFFIX};
use crate::error::UserIdError;
use crate::settings::StorageSettings;

/// Physical store a cached identity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Cookie,
    Html5,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Cookie => write!(f, "cookie"),
            StorageKind::Html5 => write!(f, "html5"),
        }
    }
}

/// Uniform access to the cookie and local storage slots.
pub trait StorageBackend: Send + Sync {
    /// Read a non-expired value. `Ok(None)` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`UserIdError::Storage`] when the store is unavailable.
    fn read(&self, key: &str, kind: StorageKind) -> Result<Option<String>, Report<UserIdError>>;

    /// Write `value` so that it expires at `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns [`UserIdError::Storage`] when the store is unavailable.
    fn write(
        &self,
        key: &str,
        value: &str,
        kind: StorageKind,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Report<UserIdError>>;

    /// Remove a value. Cookies are expired rather than dropped.
    ///
    /// # Errors
    ///
    /// Returns [`UserIdError::Storage`] when the store is unavailable.
    fn remove(&self, key: &str, kind: StorageKind) -> Result<(), Report<UserIdError>>;

    /// Whether a marker entry is set in either store.
    ///
    /// # Errors
    ///
    /// Returns [`UserIdError::Storage`] only when both stores fail.
    fn has_marker(&self, key: &str) -> Result<bool, Report<UserIdError>> {
        let cookie = self.read(key, StorageKind::Cookie);
        let local = self.read(key, StorageKind::Html5);
        match (cookie, local) {
            (Err(err), Err(_)) => Err(err),
            (cookie, local) => Ok(matches!(cookie, Ok(Some(_))) || matches!(local, Ok(Some(_)))),
        }
    }
}

/// Serialize a raw identity for storage: strings as-is, anything else as JSON.
pub fn encode_stored_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a stored identity. Object-looking text is parsed as JSON and falls
/// back to the raw string when it is not valid JSON.
pub fn decode_stored_value(raw: &str) -> Value {
    if raw.trim_start().starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            return value;
        }
        log::debug!("Stored value looks like JSON but failed to parse, using raw string");
    }
    Value::String(raw.to_string())
}

/// Render an expiry the way cookies and local storage companions carry it.
pub fn format_expiry(expires_at: DateTime<Utc>) -> String {
    expires_at.format(EXPIRY_DATE_FORMAT).to_string()
}

/// Parse an expiry written by [`format_expiry`] or an RFC 3339 timestamp.
pub fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    NaiveDateTime::parse_from_str(trimmed, EXPIRY_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

/// A date in the past, used to expire cookies.
fn expired_date() -> DateTime<Utc> {
    DateTime::from_timestamp(1, 0).unwrap_or_default()
}

#[derive(Debug, Clone)]
struct StoredCookie {
    value: String,
    expires: Option<DateTime<Utc>>,
}

impl StoredCookie {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|exp| exp > now)
    }
}

#[derive(Debug, Default)]
struct MemoryStores {
    cookies: HashMap<String, StoredCookie>,
    local: HashMap<String, String>,
    /// Cookie names written during this session, in first-write order.
    dirty_cookies: Vec<String>,
}

/// In-process storage backend.
///
/// Mirrors a browser's cookie jar and local storage for one user session.
/// Seed it from an incoming request's `Cookie` header and turn the writes
/// back into `Set-Cookie` headers with [`MemoryStorage::set_cookie_headers`].
#[derive(Debug)]
pub struct MemoryStorage {
    stores: Mutex<MemoryStores>,
    cookies_enabled: AtomicBool,
    local_storage_enabled: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(MemoryStores::default()),
            cookies_enabled: AtomicBool::new(true),
            local_storage_enabled: AtomicBool::new(true),
        }
    }

    /// Build a store seeded with the cookies of a request `Cookie` header.
    ///
    /// Unparsable pairs are skipped; values are percent-decoded. Request
    /// cookies carry no expiry and are treated as live.
    #[must_use]
    pub fn from_cookie_header(header_value: &str) -> Self {
        let storage = Self::new();
        let mut stores = storage
            .stores
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for cookie in Cookie::split_parse(header_value.trim().to_owned()).filter_map(Result::ok) {
            let value = urlencoding::decode(cookie.value())
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| cookie.value().to_string());
            stores.cookies.insert(
                cookie.name().to_string(),
                StoredCookie {
                    value,
                    expires: None,
                },
            );
        }
        drop(stores);
        storage
    }

    /// Enable or disable the cookie store.
    pub fn set_cookies_enabled(&self, enabled: bool) {
        self.cookies_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Enable or disable the local storage store.
    pub fn set_local_storage_enabled(&self, enabled: bool) {
        self.local_storage_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Set a raw local storage item, bypassing the expiry companion.
    pub fn set_local_item(&self, key: &str, value: &str) {
        if let Ok(mut stores) = self.stores() {
            stores.local.insert(key.to_string(), value.to_string());
        }
    }

    /// Raw local storage item, ignoring expiry.
    #[must_use]
    pub fn local_item(&self, key: &str) -> Option<String> {
        self.stores().ok()?.local.get(key).cloned()
    }

    /// Set a cookie directly. `None` expiry means a session cookie.
    pub fn set_cookie(&self, name: &str, value: &str, expires: Option<DateTime<Utc>>) {
        if let Ok(mut stores) = self.stores() {
            stores.cookies.insert(
                name.to_string(),
                StoredCookie {
                    value: value.to_string(),
                    expires,
                },
            );
        }
    }

    /// Live cookie value, as a page script would see it.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        let now = Utc::now();
        self.stores()
            .ok()?
            .cookies
            .get(name)
            .filter(|c| c.is_live(now))
            .map(|c| c.value.clone())
    }

    /// `Set-Cookie` header values for every cookie written in this session.
    #[must_use]
    pub fn set_cookie_headers(&self, settings: &StorageSettings) -> Vec<String> {
        let Ok(stores) = self.stores() else {
            return Vec::new();
        };
        stores
            .dirty_cookies
            .iter()
            .filter_map(|name| stores.cookies.get(name).map(|c| (name, c)))
            .map(|(name, stored)| {
                let mut header = format!(
                    "{}={}; Path={}",
                    name,
                    urlencoding::encode(&stored.value),
                    settings.cookie_path
                );
                if let Some(domain) = &settings.cookie_domain {
                    header.push_str(&format!("; Domain={domain}"));
                }
                if let Some(expires) = stored.expires {
                    header.push_str(&format!("; Expires={}", format_expiry(expires)));
                }
                header.push_str("; SameSite=Lax");
                header
            })
            .collect()
    }

    fn stores(&self) -> Result<MutexGuard<'_, MemoryStores>, Report<UserIdError>> {
        self.stores.lock().map_err(|_| {
            Report::new(UserIdError::Storage {
                message: "storage lock poisoned".to_string(),
            })
        })
    }

    fn ensure_enabled(&self, kind: StorageKind) -> Result<(), Report<UserIdError>> {
        let enabled = match kind {
            StorageKind::Cookie => self.cookies_enabled.load(Ordering::SeqCst),
            StorageKind::Html5 => self.local_storage_enabled.load(Ordering::SeqCst),
        };
        if enabled {
            Ok(())
        } else {
            Err(Report::new(UserIdError::Storage {
                message: format!("{kind} storage is not available"),
            }))
        }
    }

    fn read_local(stores: &MemoryStores, key: &str, now: DateTime<Utc>) -> Option<String> {
        let exp_key = format!("{key}{LOCAL_STORAGE_EXP_SUFFIX}");
        let exp = stores.local.get(&exp_key)?;
        if exp.is_empty() {
            return stores.local.get(key).cloned();
        }
        match parse_expiry(exp) {
            Some(expires_at) if expires_at > now => stores.local.get(key).cloned(),
            _ => None,
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, key: &str, kind: StorageKind) -> Result<Option<String>, Report<UserIdError>> {
        self.ensure_enabled(kind)?;
        let stores = self.stores()?;
        let now = Utc::now();
        Ok(match kind {
            StorageKind::Cookie => stores
                .cookies
                .get(key)
                .filter(|c| c.is_live(now))
                .map(|c| c.value.clone()),
            StorageKind::Html5 => Self::read_local(&stores, key, now),
        })
    }

    fn write(
        &self,
        key: &str,
        value: &str,
        kind: StorageKind,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Report<UserIdError>> {
        self.ensure_enabled(kind)?;
        let mut stores = self.stores()?;
        match kind {
            StorageKind::Cookie => {
                stores.cookies.insert(
                    key.to_string(),
                    StoredCookie {
                        value: value.to_string(),
                        expires: Some(expires_at),
                    },
                );
                if !stores.dirty_cookies.iter().any(|name| name == key) {
                    stores.dirty_cookies.push(key.to_string());
                }
            }
            StorageKind::Html5 => {
                stores.local.insert(key.to_string(), value.to_string());
                stores.local.insert(
                    format!("{key}{LOCAL_STORAGE_EXP_SUFFIX}"),
                    format_expiry(expires_at),
                );
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str, kind: StorageKind) -> Result<(), Report<UserIdError>> {
        match kind {
            StorageKind::Cookie => self.write(key, "", kind, expired_date()),
            StorageKind::Html5 => {
                self.ensure_enabled(kind)?;
                let mut stores = self.stores()?;
                stores.local.remove(key);
                stores
                    .local
                    .remove(&format!("{key}{LOCAL_STORAGE_EXP_SUFFIX}"));
                Ok(())
            }
        }
    }

    fn has_marker(&self, key: &str) -> Result<bool, Report<UserIdError>> {
        let now = Utc::now();
        let stores = self.stores()?;
        let in_cookie = self.cookies_enabled.load(Ordering::SeqCst)
            && stores.cookies.get(key).is_some_and(|c| c.is_live(now));
        // Markers are often set without an expiry companion; a bare item counts.
        let in_local = self.local_storage_enabled.load(Ordering::SeqCst)
            && stores.local.contains_key(key)
            && (!stores
                .local
                .contains_key(&format!("{key}{LOCAL_STORAGE_EXP_SUFFIX}"))
                || Self::read_local(&stores, key, now).is_some());
        Ok(in_cookie || in_local)
    }
}
