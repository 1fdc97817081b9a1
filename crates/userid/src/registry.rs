//! Submodule plugin contract and registry.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use error_stack::Report;
use serde_json::{Map, Value};

use crate::config::SubmoduleConfig;
use crate::consent::ConsentData;
use crate::error::UserIdError;

/// Decoded identifier fragment(s), keyed by provider key (`pubcid`, `tdid`, ...).
pub type IdentifierMap = Map<String, Value>;

/// Completion handed to a deferred fetch. `None` means "no identifier".
pub type IdCallback = Box<dyn FnOnce(Option<Value>) + Send>;

/// A fetch the engine starts later by passing it an [`IdCallback`].
pub type DeferredFetch = Box<dyn FnOnce(IdCallback) + Send>;

/// Outcome of [`IdSubmodule::get_id`].
pub enum IdResult {
    /// The raw value is available now.
    Immediate(Value),
    /// The raw value arrives later through the completion callback.
    Deferred(DeferredFetch),
}

impl fmt::Debug for IdResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdResult::Immediate(value) => f.debug_tuple("Immediate").field(value).finish(),
            IdResult::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Trait implemented by every identity provider.
///
/// Submodules are stateless: everything they need arrives through the
/// config, the consent data and the cached value.
pub trait IdSubmodule: Send + Sync {
    /// Unique name matched against `userIds[].name`.
    fn name(&self) -> &str;

    /// Produce a raw identifier, now or through a deferred fetch.
    ///
    /// `Ok(None)` means the provider has nothing for this user.
    ///
    /// # Errors
    ///
    /// Returns an error when the config is unusable for this provider.
    fn get_id(
        &self,
        config: &SubmoduleConfig,
        consent: Option<&ConsentData>,
        cached: Option<&Value>,
    ) -> Result<Option<IdResult>, Report<UserIdError>>;

    /// Turn a raw stored or fetched value into the fragment written onto bids.
    ///
    /// # Errors
    ///
    /// Returns [`UserIdError::InvalidValue`] when the raw value has the wrong shape.
    fn decode(&self, value: &Value) -> Result<Option<IdentifierMap>, Report<UserIdError>>;

    /// Offered every cache hit. Returning a value re-persists it with a fresh
    /// expiry and uses it in place of the stored one.
    fn extend_id(&self, _config: &SubmoduleConfig, _stored: &Value) -> Option<Value> {
        None
    }

    /// Whether configs without `value` or `storage` can still resolve.
    fn resolves_without_storage(&self) -> bool {
        false
    }

    /// Called after this submodule contributed a fragment to a cycle.
    fn on_id_resolved(&self, _fragment: &IdentifierMap) {}
}

/// Registered submodules in registration order.
///
/// Cloning the registry shares it, so a submodule attached through any clone
/// is visible to every engine holding the registry.
#[derive(Clone, Default)]
pub struct SubmoduleRegistry {
    submodules: Arc<RwLock<Vec<Arc<dyn IdSubmodule>>>>,
}

impl fmt::Debug for SubmoduleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmoduleRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl SubmoduleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry holding `submodules`, in order.
    #[must_use]
    pub fn with_submodules(submodules: Vec<Arc<dyn IdSubmodule>>) -> Self {
        let registry = Self::new();
        registry.set_submodules(submodules);
        registry
    }

    /// Add a submodule, replacing one with the same name in place.
    pub fn register(&self, submodule: Arc<dyn IdSubmodule>) {
        let mut submodules = self
            .submodules
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match submodules
            .iter()
            .position(|existing| existing.name() == submodule.name())
        {
            Some(index) => {
                log::debug!("Replacing registered ID submodule: {}", submodule.name());
                submodules[index] = submodule;
            }
            None => {
                log::debug!("Registering ID submodule: {}", submodule.name());
                submodules.push(submodule);
            }
        }
    }

    /// Replace the whole registry, applying the same de-duplication as
    /// [`SubmoduleRegistry::register`].
    pub fn set_submodules(&self, submodules: Vec<Arc<dyn IdSubmodule>>) {
        self.submodules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for submodule in submodules {
            self.register(submodule);
        }
    }

    /// Snapshot of the registered submodules in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<dyn IdSubmodule>> {
        self.submodules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn IdSubmodule>> {
        self.list().into_iter().find(|s| s.name() == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.list().iter().map(|s| s.name().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.submodules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::tests::MockSubmodule;

    #[test]
    fn test_register_keeps_registration_order() {
        let registry = SubmoduleRegistry::new();
        registry.register(Arc::new(MockSubmodule::immediate("b", "b_id", json!("1"))));
        registry.register(Arc::new(MockSubmodule::immediate("a", "a_id", json!("2"))));

        assert_eq!(registry.names(), vec!["b", "a"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_register_duplicate_replaces_in_place() {
        let registry = SubmoduleRegistry::new();
        registry.register(Arc::new(MockSubmodule::immediate("a", "first", json!("1"))));
        registry.register(Arc::new(MockSubmodule::immediate("b", "b_id", json!("2"))));
        registry.register(Arc::new(MockSubmodule::immediate("a", "second", json!("3"))));

        assert_eq!(registry.names(), vec!["a", "b"]);
        let replaced = registry.get("a").expect("a should be registered");
        let fragment = replaced
            .decode(&json!("x"))
            .expect("decode should succeed")
            .expect("fragment should exist");
        assert!(fragment.contains_key("second"));
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = SubmoduleRegistry::new();
        let clone = registry.clone();
        clone.register(Arc::new(MockSubmodule::immediate("late", "late_id", json!("1"))));

        assert!(registry.get("late").is_some());
    }

    #[test]
    fn test_set_submodules_replaces_everything() {
        let registry = SubmoduleRegistry::with_submodules(vec![Arc::new(
            MockSubmodule::immediate("a", "a_id", json!("1")),
        )]);
        registry.set_submodules(Vec::new());

        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_id_result_debug() {
        let immediate = IdResult::Immediate(json!("abc"));
        let deferred = IdResult::Deferred(Box::new(|done: IdCallback| done(None)));

        assert_eq!(format!("{immediate:?}"), r#"Immediate(String("abc"))"#);
        assert_eq!(format!("{deferred:?}"), "Deferred(..)");
    }
}
