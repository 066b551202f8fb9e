//! Cache-guarded authorization decisions.
//!
//! The engine combines cluster access reviews with the caller's visible
//! namespace list to decide a request and synthesize the namespace matchers
//! the gateway injects into the downstream query.
//!
//! Per request the flow is: cache lookup, then on a miss one cluster-scoped
//! review; writers get the bare verdict, cluster-wide readers get a matcher
//! over their (possibly constrained) visible namespaces, everyone else goes
//! through a per-namespace review fan-out. Decisions are cached so an
//! identical request costs at most one evaluation per TTL window.

pub mod response;

mod key;

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::http::StatusCode;
use futures::stream::{self, StreamExt, TryStreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheError};
use crate::cluster::{AccessReview, ClusterError};
use crate::matcher::Matcher;
use key::decision_cache_key;
use response::DataResponse;

/// Verb a read request is reviewed with.
pub const GET_VERB: &str = "get";
/// Verb a write request is reviewed with.
pub const CREATE_VERB: &str = "create";

/// Bound on concurrent namespaced reviews during fan-out.
const REVIEW_CONCURRENCY: usize = 8;

/// The caller on whose behalf a decision is made.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Opaque bearer token, forwarded unchanged to the cluster API.
    pub token: String,
    /// Display name of the subject.
    pub subject: String,
    /// Unordered group memberships.
    pub groups: Vec<String>,
}

/// Errors produced while deciding a request, classified by HTTP status.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// The verb was neither `get` nor `create`.
    #[error("unexpected verb: {0}")]
    UnexpectedVerb(String),

    /// The cache lookup failed; treated as hard because it usually means a
    /// corrupt payload, and silently falling through would double traffic.
    #[error("failed to fetch authorization response from cache: {0}")]
    CacheGet(#[source] CacheError),

    /// The cluster-scoped review failed.
    #[error("failed to authorize subject for auth backend role: {0}")]
    ClusterReview(#[source] ClusterError),

    /// A namespaced review failed. Dropping the failing namespace instead
    /// would silently narrow the caller's view.
    #[error("failed to review namespace access: {0}")]
    NamespaceReview(#[source] ClusterError),

    /// The visible namespace listing failed.
    #[error("failed to access api server: {0}")]
    NamespaceList(#[source] ClusterError),

    /// The decided response could not be assembled.
    #[error("failed to create a new authorization response: {0}")]
    Synthesis(#[source] serde_json::Error),
}

impl AuthzError {
    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnexpectedVerb(_) => StatusCode::BAD_REQUEST,
            Self::CacheGet(_) | Self::Synthesis(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ClusterReview(_) | Self::NamespaceReview(_) | Self::NamespaceList(_) => {
                StatusCode::UNAUTHORIZED
            }
        }
    }
}

/// Decision engine for one request.
///
/// Holds the per-request reviewer and request matcher next to the process-wide
/// cache; construction is cheap and happens in the endpoint handler.
pub struct Authorizer {
    reviewer: Arc<dyn AccessReview>,
    cache: Arc<dyn Cache>,
    matcher: Matcher,
}

impl Authorizer {
    /// Create an engine around a token-bound reviewer, the shared cache and
    /// the request matcher.
    pub fn new(reviewer: Arc<dyn AccessReview>, cache: Arc<dyn Cache>, matcher: Matcher) -> Self {
        Self {
            reviewer,
            cache,
            matcher,
        }
    }

    /// Decide a request.
    ///
    /// Returns the decided response or an error carrying its HTTP status. A
    /// failure to store the decision is logged and does not fail the request.
    #[allow(clippy::too_many_arguments)]
    pub async fn authorize(
        &self,
        identity: &Identity,
        verb: &str,
        resource: &str,
        resource_name: &str,
        api_group: &str,
        namespaces: &BTreeSet<String>,
        metadata_only: bool,
    ) -> Result<DataResponse, AuthzError> {
        if verb != GET_VERB && verb != CREATE_VERB {
            return Err(AuthzError::UnexpectedVerb(verb.to_string()));
        }

        let key = decision_cache_key(
            &identity.token,
            &identity.subject,
            &identity.groups,
            verb,
            resource,
            resource_name,
            api_group,
            namespaces,
            metadata_only,
        );

        if let Some(cached) = self.cache.get(&key).await.map_err(AuthzError::CacheGet)? {
            debug!(subject = %identity.subject, verb, "serving decision from cache");
            return Ok(cached);
        }

        let response = self
            .evaluate(
                identity,
                verb,
                resource,
                resource_name,
                api_group,
                namespaces,
                metadata_only,
            )
            .await?;

        if let Err(e) = self.cache.set(&key, &response).await {
            warn!(error = %e, "failed to store decision in cache");
        }

        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate(
        &self,
        identity: &Identity,
        verb: &str,
        resource: &str,
        resource_name: &str,
        api_group: &str,
        namespaces: &BTreeSet<String>,
        metadata_only: bool,
    ) -> Result<DataResponse, AuthzError> {
        let cluster_wide = self
            .reviewer
            .subject_access_review(
                &identity.subject,
                &identity.groups,
                verb,
                resource,
                resource_name,
                api_group,
                "",
            )
            .await
            .map_err(AuthzError::ClusterReview)?;

        debug!(
            subject = %identity.subject,
            groups = ?identity.groups,
            verb,
            resource,
            name = resource_name,
            api = api_group,
            allowed = cluster_wide,
            "executed cluster-scoped subject access review"
        );

        // Ingestion is single-stream; writers are never namespace-constrained.
        if verb == CREATE_VERB {
            return Ok(DataResponse::minimal(cluster_wide));
        }

        if cluster_wide {
            self.resolve_cluster_wide(namespaces).await
        } else {
            self.fan_out(
                identity,
                verb,
                resource,
                resource_name,
                api_group,
                namespaces,
                metadata_only,
            )
            .await
        }
    }

    /// Read path for a caller whose cluster-scoped review allowed.
    async fn resolve_cluster_wide(
        &self,
        namespaces: &BTreeSet<String>,
    ) -> Result<DataResponse, AuthzError> {
        // An empty matcher short-circuits regardless of namespace context;
        // no label injection is needed.
        if self.matcher.is_empty() {
            return Ok(DataResponse::minimal(true));
        }

        let visible: BTreeSet<String> = self
            .reviewer
            .list_namespaces()
            .await
            .map_err(AuthzError::NamespaceList)?
            .into_iter()
            .collect();

        let constrained: BTreeSet<String> = if namespaces.is_empty() {
            visible
        } else {
            namespaces.intersection(&visible).cloned().collect()
        };

        if constrained.is_empty() {
            return Ok(DataResponse::minimal(false));
        }

        DataResponse::with_matchers(true, &constrained, &self.matcher).map_err(AuthzError::Synthesis)
    }

    /// Read path for a caller without cluster-wide read: review each
    /// candidate namespace and constrain to the allowed subset.
    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        identity: &Identity,
        verb: &str,
        resource: &str,
        resource_name: &str,
        api_group: &str,
        namespaces: &BTreeSet<String>,
        metadata_only: bool,
    ) -> Result<DataResponse, AuthzError> {
        let candidates: BTreeSet<String> = if metadata_only && namespaces.is_empty() {
            // Label-name and label-value reads carry no namespace selectors;
            // the caller's visible namespaces are the candidate set.
            let visible: BTreeSet<String> = self
                .reviewer
                .list_namespaces()
                .await
                .map_err(AuthzError::NamespaceList)?
                .into_iter()
                .collect();
            if visible.is_empty() {
                return Ok(DataResponse::minimal(false));
            }
            visible
        } else {
            namespaces.clone()
        };

        let reviews: Vec<(String, bool)> = stream::iter(candidates)
            .map(|namespace| async move {
                let allowed = self
                    .reviewer
                    .subject_access_review(
                        &identity.subject,
                        &identity.groups,
                        verb,
                        resource,
                        resource_name,
                        api_group,
                        &namespace,
                    )
                    .await?;
                Ok::<_, ClusterError>((namespace, allowed))
            })
            .buffer_unordered(REVIEW_CONCURRENCY)
            .try_collect()
            .await
            .map_err(AuthzError::NamespaceReview)?;

        let allowed: BTreeSet<String> = reviews
            .into_iter()
            .filter_map(|(namespace, ok)| ok.then_some(namespace))
            .collect();

        if allowed.is_empty() {
            return Ok(DataResponse::minimal(false));
        }

        if self.matcher.is_empty() {
            return Ok(DataResponse::minimal(true));
        }

        DataResponse::with_matchers(true, &allowed, &self.matcher).map_err(AuthzError::Synthesis)
    }
}

#[cfg(test)]
mod tests {
    use super::response::{Decision, MatcherDecision};
    use super::*;
    use crate::cache::{MemoryCache, MockCache};
    use crate::cluster::MockAccessReview;
    use crate::matcher::MatcherOp;
    use std::time::Duration;

    fn identity() -> Identity {
        Identity {
            token: "test-token".to_string(),
            subject: "test-user".to_string(),
            groups: vec!["test-group-1".to_string()],
        }
    }

    fn namespace_matcher() -> Matcher {
        Matcher::from_config("kubernetes_namespace_name", Some(MatcherOp::Or), "", "").unwrap()
    }

    fn namespaces(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn memory_cache() -> Arc<dyn Cache> {
        Arc::new(MemoryCache::new(Duration::from_secs(60)))
    }

    async fn authorize(
        authorizer: &Authorizer,
        verb: &str,
        ns: &BTreeSet<String>,
        metadata_only: bool,
    ) -> Result<DataResponse, AuthzError> {
        authorizer
            .authorize(
                &identity(),
                verb,
                "logs",
                "application",
                "loki.grafana.com",
                ns,
                metadata_only,
            )
            .await
    }

    fn matcher_value(response: &DataResponse) -> String {
        let Decision::WithMatchers(MatcherDecision { allowed, data }) = &response.result else {
            panic!("expected a matcher-carrying decision, got {response:?}");
        };
        assert_eq!(allowed, "true");
        let data: response::ResponseData = serde_json::from_str(data).unwrap();
        data.matchers[0].value.clone()
    }

    #[tokio::test]
    async fn cluster_wide_read_without_matcher_is_minimal_allow() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .times(1)
            .returning(|_, _, _, _, _, _, ns| Ok(ns.is_empty()));
        // No namespace listing: the empty matcher short-circuits.

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), Matcher::empty());
        let res = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();
        assert_eq!(res, DataResponse::minimal(true));
    }

    #[tokio::test]
    async fn cluster_wide_read_with_matcher_covers_the_visible_list() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .times(1)
            .returning(|_, _, _, _, _, _, _| Ok(true));
        reviewer
            .expect_list_namespaces()
            .times(1)
            .returning(|| Ok(vec!["b".to_string(), "a".to_string()]));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();
        assert_eq!(matcher_value(&res), "a|b");
    }

    #[tokio::test]
    async fn cluster_wide_read_prunes_requested_namespaces_to_visibility() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, _| Ok(true));
        reviewer
            .expect_list_namespaces()
            .returning(|| Ok(vec!["a".to_string(), "b".to_string()]));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&["b", "c"]), false)
            .await
            .unwrap();
        assert_eq!(matcher_value(&res), "b");
    }

    #[tokio::test]
    async fn cluster_wide_read_with_no_visible_overlap_denies() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, _| Ok(true));
        reviewer
            .expect_list_namespaces()
            .returning(|| Ok(vec!["a".to_string()]));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&["z"]), false).await.unwrap();
        assert_eq!(res, DataResponse::minimal(false));
    }

    #[tokio::test]
    async fn write_gets_the_bare_cluster_verdict() {
        for verdict in [true, false] {
            let mut reviewer = MockAccessReview::new();
            reviewer
                .expect_subject_access_review()
                .times(1)
                .returning(move |_, _, verb, _, _, _, ns| {
                    assert_eq!(verb, CREATE_VERB);
                    assert!(ns.is_empty());
                    Ok(verdict)
                });

            let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
            let res = authorize(&a, CREATE_VERB, &namespaces(&[]), false).await.unwrap();
            assert_eq!(res, DataResponse::minimal(verdict));
        }
    }

    #[tokio::test]
    async fn namespaced_read_constrains_to_the_allowed_subset() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, ns| Ok(ns == "a"));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&["a", "b"]), false)
            .await
            .unwrap();
        assert_eq!(matcher_value(&res), "a");
    }

    #[tokio::test]
    async fn namespaced_read_with_nothing_allowed_denies() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, _| Ok(false));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&["a", "b"]), false)
            .await
            .unwrap();
        assert_eq!(res, DataResponse::minimal(false));
    }

    #[tokio::test]
    async fn namespaced_read_without_namespaces_denies() {
        // No selectors, not metadata-only: the candidate set is empty, so
        // nothing can be allowed.
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .times(1)
            .returning(|_, _, _, _, _, _, _| Ok(false));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();
        assert_eq!(res, DataResponse::minimal(false));
    }

    #[tokio::test]
    async fn metadata_read_uses_the_visible_list_as_candidates() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, ns| Ok(ns == "a" || ns == "b"));
        reviewer
            .expect_list_namespaces()
            .times(1)
            .returning(|| Ok(vec!["a".to_string(), "b".to_string(), "c".to_string()]));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&[]), true).await.unwrap();
        assert_eq!(matcher_value(&res), "a|b");
    }

    #[tokio::test]
    async fn metadata_read_with_empty_visible_list_denies() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .times(1)
            .returning(|_, _, _, _, _, _, _| Ok(false));
        reviewer.expect_list_namespaces().returning(|| Ok(vec![]));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let res = authorize(&a, GET_VERB, &namespaces(&[]), true).await.unwrap();
        assert_eq!(res, DataResponse::minimal(false));
    }

    #[tokio::test]
    async fn empty_matcher_short_circuits_the_namespaced_path() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, ns| Ok(ns == "a"));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), Matcher::empty());
        let res = authorize(&a, GET_VERB, &namespaces(&["a"]), false).await.unwrap();
        assert_eq!(res, DataResponse::minimal(true));
    }

    #[tokio::test]
    async fn unknown_verbs_are_rejected() {
        let a = Authorizer::new(
            Arc::new(MockAccessReview::new()),
            memory_cache(),
            Matcher::empty(),
        );
        let err = authorize(&a, "invalid", &namespaces(&[]), false).await.unwrap_err();
        assert!(matches!(err, AuthzError::UnexpectedVerb(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "unexpected verb: invalid");
    }

    #[tokio::test]
    async fn cluster_review_failures_surface_as_unauthorized() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, _| {
                Err(ClusterError::ClientConfig("boom".to_string()))
            });

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), Matcher::empty());
        let err = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap_err();
        assert!(matches!(err, AuthzError::ClusterReview(_)));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn a_single_namespaced_review_failure_fails_the_request() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, ns| match ns {
                "" => Ok(false),
                "a" => Ok(true),
                _ => Err(ClusterError::ClientConfig("broken".to_string())),
            });

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let err = authorize(&a, GET_VERB, &namespaces(&["a", "b"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::NamespaceReview(_)));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn namespace_listing_failures_surface_as_unauthorized() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, _| Ok(true));
        reviewer
            .expect_list_namespaces()
            .returning(|| Err(ClusterError::ClientConfig("down".to_string())));

        let a = Authorizer::new(Arc::new(reviewer), memory_cache(), namespace_matcher());
        let err = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap_err();
        assert!(matches!(err, AuthzError::NamespaceList(_)));
    }

    #[tokio::test]
    async fn cache_get_failures_are_hard_errors() {
        let mut cache = MockCache::new();
        cache
            .expect_get()
            .returning(|_| Err(CacheError::Backend("get-cache error".to_string())));

        let a = Authorizer::new(
            Arc::new(MockAccessReview::new()),
            Arc::new(cache),
            Matcher::empty(),
        );
        let err = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap_err();
        assert!(matches!(err, AuthzError::CacheGet(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn cache_set_failures_do_not_fail_the_request() {
        let mut cache = MockCache::new();
        cache.expect_get().returning(|_| Ok(None));
        cache
            .expect_set()
            .returning(|_, _| Err(CacheError::Backend("set-cache error".to_string())));

        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .returning(|_, _, _, _, _, _, _| Ok(true));

        let a = Authorizer::new(Arc::new(reviewer), Arc::new(cache), Matcher::empty());
        let res = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();
        assert_eq!(res, DataResponse::minimal(true));
    }

    #[tokio::test]
    async fn cached_decisions_are_served_without_cluster_calls() {
        let mut cache = MockCache::new();
        let cached = DataResponse::minimal(true);
        let stored = cached.clone();
        cache.expect_get().returning(move |_| Ok(Some(stored.clone())));

        // A reviewer with no expectations panics on any call, proving the
        // hit path never touches the cluster.
        let a = Authorizer::new(
            Arc::new(MockAccessReview::new()),
            Arc::new(cache),
            Matcher::empty(),
        );
        let res = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();
        assert_eq!(res, cached);
    }

    #[tokio::test]
    async fn repeated_requests_evaluate_once_and_reply_identically() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .times(1)
            .returning(|_, _, _, _, _, _, _| Ok(true));
        reviewer
            .expect_list_namespaces()
            .times(1)
            .returning(|| Ok(vec!["a".to_string(), "b".to_string()]));

        let cache = memory_cache();
        let reviewer = Arc::new(reviewer);
        let a = Authorizer::new(reviewer.clone(), cache.clone(), namespace_matcher());

        let first = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();
        let second = authorize(&a, GET_VERB, &namespaces(&[]), false).await.unwrap();

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn permuted_groups_hit_the_same_cache_entry() {
        let mut reviewer = MockAccessReview::new();
        reviewer
            .expect_subject_access_review()
            .times(1)
            .returning(|_, _, _, _, _, _, _| Ok(true));

        let cache = memory_cache();
        let a = Authorizer::new(Arc::new(reviewer), cache, Matcher::empty());

        let mut id = identity();
        id.groups = vec!["g1".to_string(), "g2".to_string()];
        a.authorize(&id, GET_VERB, "logs", "application", "loki.grafana.com", &namespaces(&[]), false)
            .await
            .unwrap();

        id.groups = vec!["g2".to_string(), "g1".to_string()];
        let res = a
            .authorize(&id, GET_VERB, "logs", "application", "loki.grafana.com", &namespaces(&[]), false)
            .await
            .unwrap();
        assert_eq!(res, DataResponse::minimal(true));
    }
}
