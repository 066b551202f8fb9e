//! Cluster access-review client.
//!
//! The decision engine needs exactly two capabilities from the cluster: a
//! subject access review and the list of namespace-equivalent scopes visible
//! to the caller. Both are expressed as the [`AccessReview`] trait so the
//! engine can be exercised without a cluster.
//!
//! The real implementation talks to the Kubernetes API with a client bound to
//! the forwarded bearer token. Because the token is part of the client's
//! transport, clients are built per request by a [`ReviewerFactory`] and never
//! shared between identities.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec, SubjectAccessReview,
    SubjectAccessReviewSpec,
};
use kube::api::{ApiResource, DynamicObject, ListParams, PostParams};
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::{Api, ResourceExt};
use secrecy::SecretString;
use thiserror::Error;

use crate::metrics;

/// Connection timeout for per-request clients; the API server is local.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout covering a single review or listing call.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by the cluster client.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The client configuration could not be assembled.
    #[error("failed to configure kubernetes client: {0}")]
    ClientConfig(String),

    /// The cluster API rejected or failed a call.
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

/// Which review resource the client creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewMode {
    /// `SubjectAccessReview` carrying the forwarded user and groups.
    SubjectAccessReview,
    /// `SelfSubjectAccessReview`; the token's own identity is reviewed and
    /// the passed user and groups are ignored.
    SelfSubjectAccessReview,
}

/// The two cluster capabilities the decision engine depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessReview: Send + Sync {
    /// Ask whether the subject may perform `verb` on the resource.
    ///
    /// An empty `namespace` denotes a cluster-scoped check.
    #[allow(clippy::too_many_arguments)]
    async fn subject_access_review(
        &self,
        user: &str,
        groups: &[String],
        verb: &str,
        resource: &str,
        resource_name: &str,
        api_group: &str,
        namespace: &str,
    ) -> Result<bool, ClusterError>;

    /// List the namespace-equivalent scopes visible to the bearer token.
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;
}

/// Builds an [`AccessReview`] bound to one forwarded token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReviewerFactory: Send + Sync {
    /// Construct a reviewer whose transport authenticates as `token`.
    async fn for_token(&self, token: &str) -> Result<Arc<dyn AccessReview>, ClusterError>;
}

/// [`AccessReview`] implementation on the Kubernetes API.
pub struct KubeAccessReview {
    client: kube::Client,
    mode: ReviewMode,
}

#[async_trait]
impl AccessReview for KubeAccessReview {
    async fn subject_access_review(
        &self,
        user: &str,
        groups: &[String],
        verb: &str,
        resource: &str,
        resource_name: &str,
        api_group: &str,
        namespace: &str,
    ) -> Result<bool, ClusterError> {
        let attributes = ResourceAttributes {
            group: Some(api_group.to_string()),
            resource: Some(resource.to_string()),
            name: Some(resource_name.to_string()),
            verb: Some(verb.to_string()),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            ..Default::default()
        };

        let started = Instant::now();
        let result = match self.mode {
            ReviewMode::SubjectAccessReview => {
                let review = SubjectAccessReview {
                    spec: SubjectAccessReviewSpec {
                        user: Some(user.to_string()),
                        groups: Some(groups.to_vec()),
                        resource_attributes: Some(attributes),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
                api.create(&PostParams::default(), &review)
                    .await
                    .map(|created| created.status.map(|s| s.allowed).unwrap_or(false))
            }
            ReviewMode::SelfSubjectAccessReview => {
                let review = SelfSubjectAccessReview {
                    spec: SelfSubjectAccessReviewSpec {
                        resource_attributes: Some(attributes),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
                api.create(&PostParams::default(), &review)
                    .await
                    .map(|created| created.status.map(|s| s.allowed).unwrap_or(false))
            }
        };
        metrics::record_cluster_api_call("subject_access_review", started, result.is_ok());

        Ok(result?)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        // The project list is the user-visibility-filtered namespace surface;
        // a plain namespace list would require cluster-wide read.
        let resource = ApiResource {
            group: "project.openshift.io".to_string(),
            version: "v1".to_string(),
            api_version: "project.openshift.io/v1".to_string(),
            kind: "Project".to_string(),
            plural: "projects".to_string(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let started = Instant::now();
        let result = api.list(&ListParams::default()).await;
        metrics::record_cluster_api_call("list_namespaces", started, result.is_ok());

        Ok(result?
            .items
            .into_iter()
            .map(|project| project.name_any())
            .collect())
    }
}

/// Factory producing kube-backed reviewers bound to forwarded tokens.
pub struct KubeReviewerFactory {
    kubeconfig: Option<PathBuf>,
    mode: ReviewMode,
}

impl KubeReviewerFactory {
    /// Create a factory using the kubeconfig at `kubeconfig`, or the ambient
    /// configuration (in-cluster or `$KUBECONFIG`) when absent.
    pub fn new(kubeconfig: Option<PathBuf>, mode: ReviewMode) -> Self {
        Self { kubeconfig, mode }
    }

    async fn base_config(&self) -> Result<kube::Config, ClusterError> {
        match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::ClientConfig(e.to_string()))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::ClientConfig(e.to_string()))
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| ClusterError::ClientConfig(e.to_string())),
        }
    }
}

#[async_trait]
impl ReviewerFactory for KubeReviewerFactory {
    async fn for_token(&self, token: &str) -> Result<Arc<dyn AccessReview>, ClusterError> {
        let mut config = self.base_config().await?;
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        // Strip the ambient credentials; the forwarded bearer token is the
        // caller's identity and must be the only authentication material.
        config.auth_info = AuthInfo {
            token: Some(SecretString::from(token.to_string())),
            ..AuthInfo::default()
        };

        let client = kube::Client::try_from(config)?;
        Ok(Arc::new(KubeAccessReview {
            client,
            mode: self.mode,
        }))
    }
}
