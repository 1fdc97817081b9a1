//! LiveRamp IdentityLink envelope.

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

pub const ID_LINK_NAME: &str = "idLink";
const ID_LINK_KEY: &str = "idl_env";
const ENVELOPE_URL: &str = "https://api.rlcdn.com/api/identity/envelope";

pub struct IdLinkSubmodule {
    transport: Arc<dyn IdTransport>,
}

impl IdLinkSubmodule {
    #[must_use]
    pub fn new(transport: Arc<dyn IdTransport>) -> Self {
        Self { transport }
    }

    fn error(message: impl Into<String>) -> UserIdError {
        UserIdError::submodule(ID_LINK_NAME, message)
    }

    fn endpoint(
        config: &SubmoduleConfig,
        consent: Option<&ConsentData>,
    ) -> Result<String, Report<UserIdError>> {
        let pid = config
            .param("pid")
            .and_then(|p| match p {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| Report::new(Self::error("requires a pid param")))?;

        let mut url = Url::parse(ENVELOPE_URL).change_context(Self::error("invalid envelope url"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pid", &pid);
            if let Some(consent) = consent.filter(|c| c.gdpr_applies) {
                query.append_pair("ct", "1");
                query.append_pair("cv", consent.consent_string().unwrap_or_default());
            }
        }
        Ok(url.to_string())
    }
}

fn parse_envelope(body: &str) -> Result<Option<Value>, Report<UserIdError>> {
    let response: Value =
        serde_json::from_str(body).change_context(IdLinkSubmodule::error("response is not JSON"))?;
    Ok(response
        .get("envelope")
        .and_then(Value::as_str)
        .filter(|envelope| !envelope.is_empty())
        .map(|envelope| Value::String(envelope.to_string())))
}

impl IdSubmodule for IdLinkSubmodule {
    fn name(&self) -> &str {
        ID_LINK_NAME
    }

    fn get_id(
        &self,
        config: &SubmoduleConfig,
        consent: Option<&ConsentData>,
        _cached: Option<&Value>,
    ) -> Result<Option<IdResult>, Report<UserIdError>> {
        let url = Self::endpoint(config, consent)?;
        let transport = Arc::clone(&self.transport);

        Ok(Some(IdResult::Deferred(Box::new(move |done: IdCallback| {
            transport.get(
                &url,
                Box::new(move |result: Result<String, Report<UserIdError>>| {
                    let envelope = result
                        .and_then(|body| parse_envelope(&body))
                        .unwrap_or_else(|err| {
                            log::warn!("{LOG_PREFIX} - {ID_LINK_NAME} fetch failed: {err:?}");
                            None
                        });
                    done(envelope);
                }),
            );
        }))))
    }

    fn decode(&self, value: &Value) -> Result<Option<IdentifierMap>, Report<UserIdError>> {
        match value {
            Value::String(envelope) if !envelope.is_empty() => {
                let mut fragment = IdentifierMap::new();
                fragment.insert(ID_LINK_KEY.to_string(), Value::String(envelope.clone()));
                Ok(Some(fragment))
            }
            Value::String(_) | Value::Null => Ok(None),
            other => Err(Report::new(UserIdError::InvalidValue {
                message: format!("idl_env must be a string, got {other}"),
            })),
        }
    }
}
