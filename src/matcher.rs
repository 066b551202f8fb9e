//! Label matcher configuration and per-request specialization.
//!
//! A [`Matcher`] describes which label keys the gateway must constrain on
//! behalf of a caller and how several keys combine. It is built once from the
//! startup flags and specialized per request: exempt tenants and members of
//! admin groups get the empty matcher, so downstream logic treats "no
//! constraint" uniformly.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CSV_SEPARATOR: char = ',';

/// Logical operation combining several label matchers in a downstream query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherOp {
    /// Any matcher may select a stream.
    Or,
    /// Every matcher must select a stream.
    And,
}

impl MatcherOp {
    /// The operator as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Or => "or",
            Self::And => "and",
        }
    }
}

impl std::str::FromStr for MatcherOp {
    type Err = MatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "or" => Ok(Self::Or),
            "and" => Ok(Self::And),
            other => Err(MatcherError::UnknownOp(other.to_string())),
        }
    }
}

/// Errors raised while building a [`Matcher`] from configuration.
#[derive(Debug, Error)]
pub enum MatcherError {
    /// The operator flag held something other than `and`/`or`.
    #[error("unknown matcher operator: {0}")]
    UnknownOp(String),

    /// Several keys were configured without an operator to combine them.
    #[error("multiple matcher keys require a matcher operator")]
    MissingOp,
}

/// Configured label-key set with tenant and group exemptions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Matcher {
    keys: Vec<String>,
    op: Option<MatcherOp>,
    skip_tenants: HashSet<String>,
    admin_groups: HashSet<String>,
}

impl Matcher {
    /// Build a matcher from the raw flag values.
    ///
    /// `keys`, `skip_tenants` and `admin_groups` are comma-separated; empty
    /// tokens are dropped. Several keys are only valid together with an
    /// operator.
    pub fn from_config(
        keys: &str,
        op: Option<MatcherOp>,
        skip_tenants: &str,
        admin_groups: &str,
    ) -> Result<Self, MatcherError> {
        let keys = split_csv(keys);
        if op.is_none() && keys.len() > 1 {
            return Err(MatcherError::MissingOp);
        }

        Ok(Self {
            keys,
            op,
            skip_tenants: split_csv(skip_tenants).into_iter().collect(),
            admin_groups: split_csv(admin_groups).into_iter().collect(),
        })
    }

    /// The matcher that constrains nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True iff no label keys are configured.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The configured label keys.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The configured combining operator, if any.
    pub fn op(&self) -> Option<MatcherOp> {
        self.op
    }

    /// Specialize the matcher for one request.
    ///
    /// Exempt tenants and callers in an admin group are not constrained and
    /// get the empty matcher; everyone else gets the configured matcher.
    pub fn for_request(&self, tenant: &str, groups: &[String]) -> Matcher {
        if self.is_empty() {
            return self.clone();
        }

        if self.skip_tenants.contains(tenant) {
            return Self::empty();
        }

        if groups.iter().any(|g| self.admin_groups.contains(g)) {
            return Self::empty();
        }

        self.clone()
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(CSV_SEPARATOR)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn single_key_without_op() {
        let m = Matcher::from_config("kubernetes_namespace_name", None, "", "").unwrap();
        assert!(!m.is_empty());
        assert_eq!(m.keys(), ["kubernetes_namespace_name"]);
        assert_eq!(m.op(), None);
    }

    #[test]
    fn multiple_keys_require_op() {
        let err = Matcher::from_config("a,b", None, "", "").unwrap_err();
        assert!(matches!(err, MatcherError::MissingOp));

        let m = Matcher::from_config("a,b", Some(MatcherOp::Or), "", "").unwrap();
        assert_eq!(m.keys(), ["a", "b"]);
        assert_eq!(m.op(), Some(MatcherOp::Or));
    }

    #[test]
    fn empty_tokens_are_dropped() {
        let m = Matcher::from_config(",a,,b,", Some(MatcherOp::And), ",t1,", ",g1,").unwrap();
        assert_eq!(m.keys(), ["a", "b"]);

        // An all-empty CSV means no keys at all.
        let m = Matcher::from_config("", None, "", "").unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn skip_tenant_gets_empty_matcher() {
        let m = Matcher::from_config("ns", None, "ops,infra", "").unwrap();

        assert!(m.for_request("ops", &[]).is_empty());
        assert!(m.for_request("infra", &[]).is_empty());
        assert!(!m.for_request("application", &[]).is_empty());
    }

    #[test]
    fn admin_group_gets_empty_matcher() {
        let m = Matcher::from_config("ns", None, "", "cluster-admin").unwrap();

        assert!(m
            .for_request("application", &groups(&["dev", "cluster-admin"]))
            .is_empty());
        assert!(!m.for_request("application", &groups(&["dev"])).is_empty());
    }

    #[test]
    fn empty_matcher_stays_empty_for_every_request() {
        let m = Matcher::empty();
        assert!(m.for_request("any", &groups(&["any"])).is_empty());
    }

    #[test]
    fn op_round_trips_through_serde() {
        let json = serde_json::to_string(&MatcherOp::Or).unwrap();
        assert_eq!(json, r#""or""#);
        let op: MatcherOp = serde_json::from_str(r#""and""#).unwrap();
        assert_eq!(op, MatcherOp::And);
    }

    #[test]
    fn op_parses_from_flag_values() {
        assert_eq!("or".parse::<MatcherOp>().unwrap(), MatcherOp::Or);
        assert_eq!("and".parse::<MatcherOp>().unwrap(), MatcherOp::And);
        assert!("xor".parse::<MatcherOp>().is_err());
    }
}
