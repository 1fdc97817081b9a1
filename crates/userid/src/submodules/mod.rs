//! Built-in identity providers and the transport they fetch through.
//!
//! Network access belongs to the host: providers that call out to an
//! endpoint do so through an [`IdTransport`] the host supplies.

use std::sync::Arc;

use error_stack::Report;

use crate::error::UserIdError;
use crate::registry::IdSubmodule;

pub mod id_link;
pub mod pub_common_id;
pub mod unified_id;

pub use id_link::IdLinkSubmodule;
pub use pub_common_id::PubCommonIdSubmodule;
pub use unified_id::UnifiedIdSubmodule;

/// Completion for a transport call: the response body, or why it failed.
pub type FetchCallback = Box<dyn FnOnce(Result<String, Report<UserIdError>>) + Send>;

/// Host-provided HTTP transport for identity provider endpoints.
pub trait IdTransport: Send + Sync {
    /// Issue a GET to `url` and eventually invoke `on_complete` exactly once.
    fn get(&self, url: &str, on_complete: FetchCallback);
}

/// The built-in submodules, in the order they should be registered.
#[must_use]
pub fn default_submodules(transport: &Arc<dyn IdTransport>) -> Vec<Arc<dyn IdSubmodule>> {
    vec![
        Arc::new(PubCommonIdSubmodule),
        Arc::new(UnifiedIdSubmodule::new(Arc::clone(transport))),
        Arc::new(IdLinkSubmodule::new(Arc::clone(transport))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tests::RecordingTransport;

    #[test]
    fn test_default_submodules_order() {
        let transport: Arc<dyn IdTransport> = Arc::new(RecordingTransport::default());
        let names: Vec<_> = default_submodules(&transport)
            .iter()
            .map(|s| s.name().to_string())
            .collect();

        assert_eq!(names, vec!["pubCommonId", "unifiedId", "idLink"]);
    }
}
