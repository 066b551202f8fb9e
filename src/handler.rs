//! OPA-compatible policy data endpoint.
//!
//! Accepts the gateway's policy query, validates and translates it into
//! engine inputs, and serializes the engine's decision as the response body.
//! Every decided request answers 200; malformed input answers 400, broken
//! collaborators 500, and cluster API failures 401.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::authorizer::{Authorizer, Identity, CREATE_VERB, GET_VERB};
use crate::cache::Cache;
use crate::cluster::ReviewerFactory;
use crate::matcher::Matcher;

/// Root of the policy data API.
pub const DATA_ENDPOINT: &str = "/v1/data";

/// Header carrying the caller's bearer token, set by the gateway.
const FORWARDED_TOKEN_HEADER: &str = "X-Forwarded-Access-Token";

/// Gateway RBAC permission granting reads from a tenant.
const PERMISSION_READ: &str = "read";
/// Gateway RBAC permission granting writes to a tenant.
const PERMISSION_WRITE: &str = "write";

/// Shared state handed to the endpoint by the supervisor.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide decision cache.
    pub cache: Arc<dyn Cache>,
    /// Builds per-request, token-bound cluster clients.
    pub factory: Arc<dyn ReviewerFactory>,
    /// Matcher configuration, immutable after startup.
    pub matcher: Matcher,
    /// Tenant to API-group mapping; an absent tenant is a malformed request.
    pub mappings: HashMap<String, String>,
    /// Substitute token when the forwarded header is absent.
    pub debug_token: Option<String>,
}

/// Query attributes beyond the core identity.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputExtras {
    /// Namespace selectors extracted from the query, keyed by label.
    pub selectors: HashMap<String, Vec<String>>,
    /// Whether the query used wildcard namespace selectors.
    pub wildcard_selectors: bool,
    /// Whether the query only reads label names or values.
    pub metadata_only: bool,
}

/// The policy query input.
#[derive(Clone, Debug, Deserialize)]
pub struct Input {
    /// Caller's group memberships.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Requested permission, `read` or `write`.
    #[serde(default)]
    pub permission: String,
    /// Resource the permission applies to, e.g. `logs`.
    #[serde(default)]
    pub resource: String,
    /// Caller's display name.
    #[serde(default)]
    pub subject: String,
    /// Tenant the request targets.
    #[serde(default)]
    pub tenant: String,
    /// Additional query attributes.
    #[serde(default)]
    pub extras: InputExtras,
}

#[derive(Deserialize)]
struct DataRequest {
    input: Input,
}

/// Build the public router serving the decision endpoint.
///
/// The path is `<data-endpoint>/<package-path>/<rule>` with the package dots
/// flattened to path segments.
pub fn decision_router(package: &str, rule: &str, state: AppState) -> Router {
    let path = decision_path(package, rule);
    info!(path = %path, "configuring the policy data endpoint");

    Router::new()
        .route(&path, post(decide).fallback(bad_method))
        .with_state(state)
}

/// The decision endpoint path for a package and rule.
pub fn decision_path(package: &str, rule: &str) -> String {
    format!("{DATA_ENDPOINT}/{}/{rule}", package.replace('.', "/"))
}

async fn bad_method() -> Response {
    (StatusCode::BAD_REQUEST, "request must be a POST\n").into_response()
}

fn reply(status: StatusCode, message: impl Into<String>) -> Response {
    let mut body = message.into();
    body.push('\n');
    (status, body).into_response()
}

async fn decide(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: DataRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return reply(StatusCode::INTERNAL_SERVER_ERROR, "failed to unmarshal JSON"),
    };
    let input = request.input;

    let Some(api_group) = state.mappings.get(&input.tenant) else {
        return reply(StatusCode::INTERNAL_SERVER_ERROR, "unknown tenant");
    };

    if input.resource.is_empty() {
        return reply(StatusCode::BAD_REQUEST, "unknown resource");
    }

    let verb = match input.permission.as_str() {
        PERMISSION_READ => GET_VERB,
        PERMISSION_WRITE => CREATE_VERB,
        _ => return reply(StatusCode::BAD_REQUEST, "unknown permission"),
    };

    let forwarded = headers
        .get(FORWARDED_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let token = if forwarded.is_empty() {
        match &state.debug_token {
            Some(token) => {
                warn!("using the debug token in production environments is not recommended");
                token.clone()
            }
            None => return reply(StatusCode::BAD_REQUEST, "missing forwarded access token"),
        }
    } else {
        forwarded.to_string()
    };

    let matcher = state.matcher.for_request(&input.tenant, &input.groups);

    // Callers that need an explicit namespace match may not wildcard it away.
    if input.extras.wildcard_selectors && !matcher.is_empty() {
        return reply(
            StatusCode::BAD_REQUEST,
            "wildcard in query namespaces not allowed",
        );
    }

    // Every selector value is treated as a namespace candidate, whatever
    // label it came from.
    let namespaces: BTreeSet<String> = input
        .extras
        .selectors
        .values()
        .flatten()
        .cloned()
        .collect();

    let reviewer = match state.factory.for_token(&token).await {
        Ok(reviewer) => reviewer,
        Err(e) => {
            error!(error = %e, "failed to build cluster client for request");
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to create kubernetes client",
            );
        }
    };

    let identity = Identity {
        token,
        subject: input.subject,
        groups: input.groups,
    };

    let authorizer = Authorizer::new(reviewer, state.cache.clone(), matcher);
    match authorizer
        .authorize(
            &identity,
            verb,
            &input.resource,
            &input.tenant,
            api_group,
            &namespaces,
            input.extras.metadata_only,
        )
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => reply(e.status_code(), e.to_string()),
    }
}
