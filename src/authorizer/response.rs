//! Decision response model and matcher synthesis.
//!
//! The wire shape is a single-field envelope `{"result": <value>}` compatible
//! with a generic policy-data protocol. The value is either a bare boolean
//! (the minimal form, used when no matcher applies) or an allowed/denied pair
//! carrying a stringified matcher payload for the gateway to splice into the
//! downstream query.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::matcher::{Matcher, MatcherOp};

/// Matcher type tag understood by the downstream query engine: regex-equal.
const MATCH_REGEXP: u8 = 2;

/// A single label constraint appended to downstream queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatcher {
    /// Match type; only regex-equal is emitted.
    #[serde(rename = "Type")]
    pub match_type: u8,
    /// Label name to constrain.
    #[serde(rename = "Name")]
    pub name: String,
    /// Regex alternation over the permitted namespaces.
    #[serde(rename = "Value")]
    pub value: String,
}

/// The payload nested (stringified) inside a matcher-carrying decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    /// One matcher per configured label key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<LabelMatcher>,
    /// How the matchers combine; omitted when a single bare key is configured.
    #[serde(rename = "matcherOp", default, skip_serializing_if = "Option::is_none")]
    pub matcher_op: Option<MatcherOp>,
}

/// Allowed/denied pair with the stringified matcher payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherDecision {
    /// `"true"` or `"false"`.
    pub allowed: String,
    /// JSON-encoded [`ResponseData`].
    pub data: String,
}

/// A decided policy value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decision {
    /// Bare allow/deny without namespace constraints.
    Minimal(bool),
    /// Allow/deny plus matcher payload for query rewriting.
    WithMatchers(MatcherDecision),
}

/// The policy-data envelope returned to the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    /// The decided value.
    pub result: Decision,
}

impl DataResponse {
    /// The minimal boolean response.
    pub fn minimal(allowed: bool) -> Self {
        Self {
            result: Decision::Minimal(allowed),
        }
    }

    /// Synthesize a matcher-carrying response over a non-empty namespace set.
    ///
    /// One regex matcher per configured key, each matching the alternation of
    /// the permitted namespaces. The set ordering makes the emitted value
    /// independent of review order.
    pub fn with_matchers(
        allowed: bool,
        namespaces: &BTreeSet<String>,
        matcher: &Matcher,
    ) -> Result<Self, serde_json::Error> {
        let value = namespaces
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("|");

        let matchers = matcher
            .keys()
            .iter()
            .map(|key| LabelMatcher {
                match_type: MATCH_REGEXP,
                name: key.clone(),
                value: value.clone(),
            })
            .collect();

        let data = serde_json::to_string(&ResponseData {
            matchers,
            matcher_op: matcher.op(),
        })?;

        Ok(Self {
            result: Decision::WithMatchers(MatcherDecision {
                allowed: allowed.to_string(),
                data,
            }),
        })
    }
}
