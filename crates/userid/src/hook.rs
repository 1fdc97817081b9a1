//! Bid decoration hook.
//!
//! Sits in the auction pipeline right before bid requests are dispatched and
//! attaches the merged identifiers to every bid of every ad unit under
//! `userId`. Bid adapters read them from there.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::LOG_PREFIX;
use crate::engine::UserIdEngine;
use crate::registry::IdentifierMap;

/// One bidder's entry within an ad unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BidSpec {
    pub bidder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<IdentifierMap>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// An ad slot with the bidders competing for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdUnit {
    pub code: String,
    #[serde(default)]
    pub bids: Vec<BidSpec>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// The request object travelling through the auction pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
    #[serde(rename = "adUnits", default)]
    pub ad_units: Vec<AdUnit>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

/// Shallow-merge `ids` into every bid's `userId`, creating it when absent.
///
/// Existing keys not present in `ids` are kept. Returns the number of bids
/// decorated; nothing is touched when `ids` is empty.
pub fn decorate_ad_units(ad_units: &mut [AdUnit], ids: &IdentifierMap) -> usize {
    if ids.is_empty() {
        return 0;
    }

    let mut decorated = 0;
    for bid in ad_units.iter_mut().flat_map(|unit| unit.bids.iter_mut()) {
        let user_id = bid.user_id.get_or_insert_with(IdentifierMap::new);
        for (key, value) in ids {
            user_id.insert(key.clone(), value.clone());
        }
        decorated += 1;
    }
    decorated
}

impl UserIdEngine {
    /// Run one resolution cycle, decorate `request`, then hand it to `next`.
    ///
    /// When the engine is opted out or disposed the request is passed on
    /// untouched.
    ///
    /// Deferred fetches found during the cycle are only queued. The host
    /// starts them after the auction with [`UserIdEngine::sync_ids`], which
    /// waits out `syncDelay`, or with [`UserIdEngine::start_deferred`];
    /// their identifiers reach bids from the next cycle on.
    pub fn request_bids_hook<F, R>(&self, mut request: BidRequest, next: F) -> R
    where
        F: FnOnce(BidRequest) -> R,
    {
        if self.is_enabled() {
            let ids = self.resolve();
            let decorated = decorate_ad_units(&mut request.ad_units, &ids);
            log::debug!(
                "{LOG_PREFIX} - attached {} identifiers to {decorated} bids",
                ids.len()
            );
        }
        next(request)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::tests::ad_unit_mock;

    fn ids(value: Value) -> IdentifierMap {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn test_decorates_every_bid() {
        let mut units = vec![ad_unit_mock("a"), ad_unit_mock("b")];
        units[1].bids.push(BidSpec {
            bidder: "second".to_string(),
            ..BidSpec::default()
        });

        let decorated = decorate_ad_units(&mut units, &ids(json!({"pubcid": "x"})));

        assert_eq!(decorated, 3);
        for bid in units.iter().flat_map(|u| &u.bids) {
            assert_eq!(bid.user_id.as_ref().expect("userId")["pubcid"], "x");
        }
    }

    #[test]
    fn test_shallow_merges_existing_user_id() {
        let mut units = vec![ad_unit_mock("a")];
        units[0].bids[0].user_id = Some(ids(json!({"pubcid": "old", "other": "kept"})));

        decorate_ad_units(&mut units, &ids(json!({"pubcid": "new", "tdid": "t"})));

        assert_eq!(
            units[0].bids[0].user_id,
            Some(ids(json!({"pubcid": "new", "other": "kept", "tdid": "t"})))
        );
    }

    #[test]
    fn test_empty_ids_leave_bids_untouched() {
        let mut units = vec![ad_unit_mock("a")];
        let before = units.clone();

        assert_eq!(decorate_ad_units(&mut units, &IdentifierMap::new()), 0);
        assert_eq!(units, before);
    }

    #[test]
    fn test_decoration_is_idempotent() {
        let mut units = vec![ad_unit_mock("a")];
        let map = ids(json!({"pubcid": "x", "tdid": "y"}));

        decorate_ad_units(&mut units, &map);
        let once = units.clone();
        decorate_ad_units(&mut units, &map);

        assert_eq!(units, once);
    }

    #[test]
    fn test_request_round_trips_unknown_fields() {
        let raw = json!({
            "timeout": 1000,
            "adUnits": [{
                "code": "adUnit-code",
                "mediaTypes": {"banner": {}, "native": {}},
                "sizes": [[300, 200], [300, 600]],
                "bids": [{"bidder": "sampleBidder", "params": {"placementId": "banner-only-bidder"}}]
            }]
        });

        let mut request: BidRequest = serde_json::from_value(raw.clone()).expect("should parse");
        assert_eq!(request.extra["timeout"], 1000);
        assert_eq!(serde_json::to_value(&request).expect("serialize"), raw);

        decorate_ad_units(&mut request.ad_units, &ids(json!({"tdid": "t"})));
        let out = serde_json::to_value(&request).expect("serialize");
        assert_eq!(out["adUnits"][0]["bids"][0]["userId"]["tdid"], "t");
        assert_eq!(out["adUnits"][0]["sizes"], json!([[300, 200], [300, 600]]));
    }
}
