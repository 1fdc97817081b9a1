//! The Trade Desk Unified ID.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use serde_json::Value;
use url::Url;

use super::IdTransport;
use crate::config::SubmoduleConfig;
use crate::consent::ConsentData;
use crate::constants::LOG_PREFIX;
use crate::error::UserIdError;
use crate::registry::{IdCallback, IdResult, IdSubmodule, IdentifierMap};

pub const UNIFIED_ID_NAME: &str = "unifiedId";
const UNIFIED_ID_KEY: &str = "tdid";
const TDID_FIELD: &str = "TDID";
const MATCH_URL: &str = "https://match.adsrvr.org/track/rid";

/// Fetches the TDID from the match endpoint, keyed by partner id.
pub struct UnifiedIdSubmodule {
    transport: Arc<dyn IdTransport>,
}

impl UnifiedIdSubmodule {
    #[must_use]
    pub fn new(transport: Arc<dyn IdTransport>) -> Self {
        Self { transport }
    }

    fn error(message: impl Into<String>) -> UserIdError {
        UserIdError::submodule(UNIFIED_ID_NAME, message)
    }

    /// `params.url` when set, otherwise the match endpoint for `params.partner`.
    fn endpoint(config: &SubmoduleConfig) -> Result<String, Report<UserIdError>> {
        if let Some(url) = config.param("url").and_then(Value::as_str) {
            return Ok(url.to_string());
        }
        let partner = config
            .param("partner")
            .and_then(|p| match p {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| Report::new(Self::error("requires a partner or url param")))?;

        let url = Url::parse_with_params(MATCH_URL, &[("ttd_pid", partner.as_str()), ("fmt", "json")])
            .change_context(Self::error("failed to build match url"))?;
        Ok(url.to_string())
    }
}

/// Keep the response object when it carries a TDID.
fn parse_response(body: &str) -> Result<Option<Value>, Report<UserIdError>> {
    let response: Value = serde_json::from_str(body)
        .change_context(UnifiedIdSubmodule::error("response is not JSON"))?;
    Ok(response
        .get(TDID_FIELD)
        .and_then(Value::as_str)
        .filter(|tdid| !tdid.is_empty())
        .map(|_| response.clone()))
}

impl IdSubmodule for UnifiedIdSubmodule {
    fn name(&self) -> &str {
        UNIFIED_ID_NAME
    }

    fn get_id(
        &self,
        config: &SubmoduleConfig,
        _consent: Option<&ConsentData>,
        _cached: Option<&Value>,
    ) -> Result<Option<IdResult>, Report<UserIdError>> {
        let url = Self::endpoint(config)?;
        let transport = Arc::clone(&self.transport);

        Ok(Some(IdResult::Deferred(Box::new(move |done: IdCallback| {
            transport.get(
                &url,
                Box::new(move |result: Result<String, Report<UserIdError>>| {
                    let value = result.and_then(|body| parse_response(&body)).unwrap_or_else(|err| {
                        log::warn!("{LOG_PREFIX} - {UNIFIED_ID_NAME} fetch failed: {err:?}");
                        None
                    });
                    done(value);
                }),
            );
        }))))
    }

    fn decode(&self, value: &Value) -> Result<Option<IdentifierMap>, Report<UserIdError>> {
        let tdid = match value {
            Value::Object(object) => object.get(TDID_FIELD).and_then(Value::as_str),
            _ => None,
        };
        Ok(tdid.filter(|t| !t.is_empty()).map(|tdid| {
            let mut fragment = IdentifierMap::new();
            fragment.insert(UNIFIED_ID_KEY.to_string(), Value::String(tdid.to_string()));
            fragment
        }))
    }
}
