//! Resolution engine.
//!
//! A [`UserIdEngine`] is an explicit instance with a lifecycle: construct
//! (opt-out markers are checked once, here), configure with
//! [`UserIdEngine::set_config`], run any number of resolution cycles, then
//! [`UserIdEngine::dispose`].
//!
//! Each cycle walks the configured submodules and, per config, uses a literal
//! value, a live cached value, or the submodule's `get_id`. Immediate results
//! are persisted and merged into the cycle. Deferred results are queued and
//! started by [`UserIdEngine::sync_ids`] after the configured sync delay; their
//! completions persist the identity so the next cycle finds it cached.
//!
//! Fragments are merged in registration order, then config order. On a key
//! collision the later fragment wins, independent of completion timing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use crate::config::{process_config, SubmoduleConfig, UserSyncConfig};
use crate::consent::{self, ConsentData};
use crate::constants::{DEFAULT_EXPIRES_DAYS, LOG_PREFIX};
use crate::registry::{
    DeferredFetch, IdCallback, IdResult, IdSubmodule, IdentifierMap, SubmoduleRegistry,
};
use crate::storage::{decode_stored_value, encode_stored_value, StorageBackend};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Resolving identities.
    Active,
    /// An opt-out marker was found; terminal for this instance.
    OptedOut,
    /// [`UserIdEngine::dispose`] was called.
    Disposed,
}

struct PendingFetch {
    slot: String,
    config: SubmoduleConfig,
    fetch: DeferredFetch,
}

/// Deferred result kept in memory because it could not be persisted.
struct CompletedId {
    value: Value,
    expires_at: DateTime<Utc>,
}

impl CompletedId {
    /// Expires with the config's storage lifetime, or the default lifetime
    /// when the config has no storage.
    fn new(value: Value, config: &SubmoduleConfig, now: DateTime<Utc>) -> Self {
        let expires_at = match &config.storage {
            Some(storage) => storage.expires_at(now),
            None => now + ChronoDuration::days(i64::from(DEFAULT_EXPIRES_DAYS)),
        };
        Self { value, expires_at }
    }
}

struct EngineState {
    status: EngineStatus,
    config: UserSyncConfig,
    consent: Option<ConsentData>,
    /// Merged map of the latest cycle.
    identifiers: IdentifierMap,
    /// Deferred results with nowhere to persist, by slot key.
    completed: HashMap<String, CompletedId>,
    in_flight: HashSet<String>,
    pending: Vec<PendingFetch>,
    /// Bumped whenever configuration is replaced so stale completions can be
    /// recognised.
    generation: u64,
}

impl EngineState {
    fn new(status: EngineStatus) -> Self {
        Self {
            status,
            config: UserSyncConfig::default(),
            consent: None,
            identifiers: IdentifierMap::new(),
            completed: HashMap::new(),
            in_flight: HashSet::new(),
            pending: Vec::new(),
            generation: 0,
        }
    }

    fn reset_resolution(&mut self) {
        self.identifiers.clear();
        self.completed.clear();
        self.in_flight.clear();
        self.pending.clear();
        self.generation += 1;
    }
}

/// A config paired with the submodule that serves it.
struct MatchedConfig {
    registration_index: usize,
    config_index: usize,
    submodule: Arc<dyn IdSubmodule>,
    config: SubmoduleConfig,
}

/// Resolves, caches and merges user identifiers.
pub struct UserIdEngine {
    registry: SubmoduleRegistry,
    storage: Arc<dyn StorageBackend>,
    state: Arc<Mutex<EngineState>>,
}

impl UserIdEngine {
    /// Create an engine over `registry` and `storage`.
    ///
    /// If an opt-out marker is present the engine is created in
    /// [`EngineStatus::OptedOut`] and never resolves anything.
    #[must_use]
    pub fn new(registry: SubmoduleRegistry, storage: Arc<dyn StorageBackend>) -> Self {
        let status = if consent::is_opted_out(storage.as_ref()) {
            log::info!("{LOG_PREFIX} - opt-out cookie found, exit module");
            EngineStatus::OptedOut
        } else {
            EngineStatus::Active
        };

        Self {
            registry,
            storage,
            state: Arc::new(Mutex::new(EngineState::new(status))),
        }
    }

    /// Apply a configuration object (`{ usersync: { syncDelay, userIds } }`).
    ///
    /// A configuration without a `usersync` section is ignored. Otherwise the
    /// previous submodule configs are replaced wholesale. Returns how many
    /// configs currently match a registered submodule.
    pub fn set_config(&self, raw: &Value) -> usize {
        if self.status() != EngineStatus::Active {
            log::debug!("{LOG_PREFIX} - engine inactive, ignoring config");
            return 0;
        }
        let Some(config) = process_config(raw) else {
            return 0;
        };

        let matched = self.match_configs(&config).len();
        {
            let mut state = self.lock();
            state.reset_resolution();
            state.config = config;
        }

        if matched > 0 {
            log::info!("{LOG_PREFIX} - usersync config updated for {matched} submodules");
        }
        matched
    }

    /// Set the consent signals passed to submodules on every cycle.
    pub fn set_consent(&self, consent: Option<ConsentData>) {
        self.lock().consent = consent;
    }

    /// Register a submodule; picked up by the next cycle.
    pub fn attach(&self, submodule: Arc<dyn IdSubmodule>) {
        self.registry.register(submodule);
    }

    #[must_use]
    pub fn registry(&self) -> &SubmoduleRegistry {
        &self.registry
    }

    /// Configured sync delay in milliseconds.
    #[must_use]
    pub fn sync_delay(&self) -> u64 {
        self.lock().config.sync_delay
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        self.lock().status
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status() == EngineStatus::Active
    }

    /// Merged identifiers of the latest cycle.
    #[must_use]
    pub fn identifiers(&self) -> IdentifierMap {
        self.lock().identifiers.clone()
    }

    /// Number of deferred fetches waiting for [`UserIdEngine::sync_ids`].
    #[must_use]
    pub fn pending_fetches(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drop all configuration and resolved state. Later cycles resolve
    /// nothing and outstanding completions are discarded.
    pub fn dispose(&self) {
        let mut state = self.lock();
        state.reset_resolution();
        state.config = UserSyncConfig::default();
        state.status = EngineStatus::Disposed;
        log::debug!("{LOG_PREFIX} - engine disposed");
    }

    /// Run one resolution cycle and return the merged identifiers.
    pub fn resolve(&self) -> IdentifierMap {
        let (config, consent) = {
            let state = self.lock();
            if state.status != EngineStatus::Active {
                return IdentifierMap::new();
            }
            (state.config.clone(), state.consent.clone())
        };

        if !consent::has_gdpr_consent(consent.as_ref()) {
            log::info!("{LOG_PREFIX} - gdpr permission not valid, skipping resolution");
            self.lock().identifiers.clear();
            return IdentifierMap::new();
        }

        let mut merged = IdentifierMap::new();
        for matched in self.match_configs(&config) {
            let Some(fragment) = self.resolve_one(&matched, consent.as_ref()) else {
                continue;
            };
            matched.submodule.on_id_resolved(&fragment);
            for (key, value) in fragment {
                if merged.contains_key(&key) {
                    log::debug!(
                        "{LOG_PREFIX} - {} overrides identifier key {key}",
                        matched.config.name
                    );
                }
                merged.insert(key, value);
            }
        }

        let mut state = self.lock();
        if state.status != EngineStatus::Active {
            return IdentifierMap::new();
        }
        state.identifiers = merged.clone();
        merged
    }

    /// Wait for the sync delay, then start every queued deferred fetch.
    ///
    /// Returns the number of fetches started.
    pub async fn sync_ids(&self) -> usize {
        let delay = self.sync_delay();
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.start_deferred()
    }

    /// Start every queued deferred fetch now, ignoring the sync delay.
    pub fn start_deferred(&self) -> usize {
        let (pending, generation) = {
            let mut state = self.lock();
            if state.status != EngineStatus::Active {
                state.pending.clear();
                return 0;
            }
            (std::mem::take(&mut state.pending), state.generation)
        };

        let started = pending.len();
        for fetch in pending {
            log::debug!("{LOG_PREFIX} - starting deferred fetch for {}", fetch.config.name);
            let callback = self.completion(fetch.slot, fetch.config, generation);
            (fetch.fetch)(callback);
        }
        started
    }

    fn resolve_one(
        &self,
        matched: &MatchedConfig,
        consent: Option<&ConsentData>,
    ) -> Option<IdentifierMap> {
        let submodule = matched.submodule.as_ref();
        let config = &matched.config;

        if let Some(value) = &config.value {
            return match value {
                Value::Object(fragment) => Some(fragment.clone()),
                other => decode(submodule, other),
            };
        }

        let slot = config.slot_key();
        if let Some(stored) = self.read_cached(config, &slot) {
            log::debug!("{LOG_PREFIX} - cache hit for {}", config.name);
            let value = match submodule.extend_id(config, &stored) {
                Some(extended) => {
                    persist(self.storage.as_ref(), config, &extended);
                    extended
                }
                None => stored,
            };
            return decode(submodule, &value);
        }

        if self.lock().in_flight.contains(&slot) {
            log::debug!("{LOG_PREFIX} - fetch already in flight for {}", config.name);
            return None;
        }

        match submodule.get_id(config, consent, None) {
            Ok(Some(IdResult::Immediate(value))) => {
                persist(self.storage.as_ref(), config, &value);
                decode(submodule, &value)
            }
            Ok(Some(IdResult::Deferred(fetch))) => {
                let mut state = self.lock();
                state.in_flight.insert(slot.clone());
                state.pending.push(PendingFetch {
                    slot,
                    config: config.clone(),
                    fetch,
                });
                None
            }
            Ok(None) => {
                log::debug!("{LOG_PREFIX} - {} returned no identifier", config.name);
                None
            }
            Err(err) => {
                log::warn!("{LOG_PREFIX} - {} failed to get id: {err:?}", config.name);
                None
            }
        }
    }

    fn read_cached(&self, config: &SubmoduleConfig, slot: &str) -> Option<Value> {
        if let Some(storage) = &config.storage {
            match self.storage.read(&storage.name, storage.kind) {
                Ok(Some(raw)) => return Some(decode_stored_value(&raw)),
                Ok(None) => {}
                Err(err) => {
                    log::warn!(
                        "{LOG_PREFIX} - unable to read {} {}, treating as miss: {err:?}",
                        storage.kind,
                        storage.name
                    );
                }
            }
        }
        let now = Utc::now();
        let mut state = self.lock();
        match state.completed.get(slot) {
            Some(completed) if completed.expires_at > now => Some(completed.value.clone()),
            Some(_) => {
                log::debug!("{LOG_PREFIX} - in-memory identifier for {} expired", config.name);
                state.completed.remove(slot);
                None
            }
            None => None,
        }
    }

    fn completion(&self, slot: String, config: SubmoduleConfig, generation: u64) -> IdCallback {
        let state = Arc::clone(&self.state);
        let storage = Arc::clone(&self.storage);

        Box::new(move |value: Option<Value>| {
            let mut state = lock_state(&state);
            // The slot may already be in flight again for a newer generation.
            if state.status != EngineStatus::Active || state.generation != generation {
                log::debug!("{LOG_PREFIX} - discarding stale identifier for {}", config.name);
                return;
            }
            state.in_flight.remove(&slot);
            if consent::is_opted_out(storage.as_ref()) {
                log::info!("{LOG_PREFIX} - opt-out found, discarding identifier for {}", config.name);
                state.status = EngineStatus::OptedOut;
                state.reset_resolution();
                return;
            }
            let Some(value) = value else {
                log::debug!("{LOG_PREFIX} - {} completed without identifier", config.name);
                return;
            };

            if !persist(storage.as_ref(), &config, &value) {
                let completed = CompletedId::new(value, &config, Utc::now());
                state.completed.insert(slot, completed);
            }
        })
    }

    fn match_configs(&self, config: &UserSyncConfig) -> Vec<MatchedConfig> {
        let submodules = self.registry.list();
        let mut matched: Vec<MatchedConfig> = config
            .submodules
            .iter()
            .enumerate()
            .filter_map(|(config_index, submodule_config)| {
                let Some((registration_index, submodule)) = submodules
                    .iter()
                    .enumerate()
                    .find(|(_, s)| s.name() == submodule_config.name)
                else {
                    log::debug!(
                        "{LOG_PREFIX} - no submodule registered for {}",
                        submodule_config.name
                    );
                    return None;
                };
                if !submodule_config.has_source() && !submodule.resolves_without_storage() {
                    log::debug!(
                        "{LOG_PREFIX} - {} needs a value or storage config",
                        submodule_config.name
                    );
                    return None;
                }
                Some(MatchedConfig {
                    registration_index,
                    config_index,
                    submodule: Arc::clone(submodule),
                    config: submodule_config.clone(),
                })
            })
            .collect();
        matched.sort_by_key(|m| (m.registration_index, m.config_index));
        matched
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write a value to the config's storage slot. Returns whether it was stored.
fn persist(storage: &dyn StorageBackend, config: &SubmoduleConfig, value: &Value) -> bool {
    let Some(slot) = &config.storage else {
        return false;
    };
    match storage.write(
        &slot.name,
        &encode_stored_value(value),
        slot.kind,
        slot.expires_at(Utc::now()),
    ) {
        Ok(()) => true,
        Err(err) => {
            log::warn!(
                "{LOG_PREFIX} - unable to store {} in {} {}: {err:?}",
                config.name,
                slot.kind,
                slot.name
            );
            false
        }
    }
}

fn decode(submodule: &dyn IdSubmodule, value: &Value) -> Option<IdentifierMap> {
    match submodule.decode(value) {
        Ok(Some(fragment)) if !fragment.is_empty() => Some(fragment),
        Ok(_) => None,
        Err(err) => {
            log::warn!("{LOG_PREFIX} - {} failed to decode: {err:?}", submodule.name());
            None
        }
    }
}
