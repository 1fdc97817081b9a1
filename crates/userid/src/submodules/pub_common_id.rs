//! Publisher common ID: a first-party UUID minted on first visit.

use error_stack::Report;
use serde_json::Value;

use crate::config::SubmoduleConfig;
use crate::consent::ConsentData;
use crate::error::UserIdError;
use crate::registry::{IdResult, IdSubmodule, IdentifierMap};

pub const PUB_COMMON_ID_NAME: &str = "pubCommonId";
const PUB_COMMON_ID_KEY: &str = "pubcid";

/// Generates the id locally; no network involved.
#[derive(Debug, Default)]
pub struct PubCommonIdSubmodule;

impl IdSubmodule for PubCommonIdSubmodule {
    fn name(&self) -> &str {
        PUB_COMMON_ID_NAME
    }

    fn get_id(
        &self,
        _config: &SubmoduleConfig,
        _consent: Option<&ConsentData>,
        _cached: Option<&Value>,
    ) -> Result<Option<IdResult>, Report<UserIdError>> {
        Ok(Some(IdResult::Immediate(Value::String(
            uuid::Uuid::new_v4().to_string(),
        ))))
    }

    fn decode(&self, value: &Value) -> Result<Option<IdentifierMap>, Report<UserIdError>> {
        match value {
            Value::String(id) if !id.is_empty() => {
                let mut fragment = IdentifierMap::new();
                fragment.insert(PUB_COMMON_ID_KEY.to_string(), Value::String(id.clone()));
                Ok(Some(fragment))
            }
            Value::String(_) | Value::Null => Ok(None),
            other => Err(Report::new(UserIdError::InvalidValue {
                message: format!("pubcid must be a string, got {other}"),
            })),
        }
    }

    /// With `params.extend = true` the stored id is re-written on every hit,
    /// pushing its expiry forward.
    fn extend_id(&self, config: &SubmoduleConfig, stored: &Value) -> Option<Value> {
        let extend = config
            .param("extend")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        extend.then(|| stored.clone())
    }
}
