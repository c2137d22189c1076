//! REST API layer using Axum.
//!
//! The route table is built once by [`create_router`]:
//! - public: `/signup/`, `/api-token-auth/`, `/health`, `/api-docs/openapi.json`
//! - authenticated (`Authorization: Token <key>`): the API root plus the
//!   `usage_type` and `usage` collections under `/carbon_usage/`.

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, OriginalUri, Request, State},
    http::{header, request::Parts},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use url::Url;
use utoipa::{OpenApi, ToSchema};

use crate::auth::{extract_key, Caller};
use crate::config::Settings;
use crate::error::{ApiError, INVALID_TOKEN};
use crate::storage::Storage;

pub mod accounts;
pub mod docs;
pub mod usage_types;
pub mod usages;

/// Shared app state for REST handlers (Arc-wrapped for concurrency)
pub struct AppState {
    pub storage: Storage,
    pub settings: Settings,
}

/// Create the Axum router with every carbon usage endpoint
pub fn create_router(storage: Storage, settings: Settings) -> Router {
    let state = Arc::new(AppState { storage, settings });

    let usage_type_collection = || get(usage_types::list).post(usage_types::create);
    let usage_type_item = || {
        get(usage_types::retrieve)
            .put(usage_types::replace)
            .patch(usage_types::partial_update)
            .delete(usage_types::destroy)
    };
    let usage_collection = || get(usages::list).post(usages::create);
    let usage_item = || {
        get(usages::retrieve)
            .put(usages::replace)
            .patch(usages::partial_update)
            .delete(usages::destroy)
    };

    let auth_routes = Router::new()
        .route("/carbon_usage/", get(api_root))
        .route("/carbon_usage", get(api_root));
    let auth_routes = with_optional_slash(auth_routes, "/carbon_usage/usage_type", usage_type_collection);
    let auth_routes = with_optional_slash(auth_routes, "/carbon_usage/usage_type/:id", usage_type_item);
    let auth_routes = with_optional_slash(auth_routes, "/carbon_usage/usage", usage_collection);
    let auth_routes = with_optional_slash(auth_routes, "/carbon_usage/usage/:id", usage_item)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/signup/", post(accounts::signup))
        .route("/signup", post(accounts::signup))
        .route("/api-token-auth/", post(accounts::obtain_token))
        .route("/api-token-auth", post(accounts::obtain_token))
        .route("/health", get(health_handler))
        .route("/api-docs/openapi.json", get(openapi_handler))
        .merge(auth_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Register `methods` at `path` and at `path/`.
fn with_optional_slash(
    router: Router<Arc<AppState>>,
    path: &str,
    methods: impl Fn() -> MethodRouter<Arc<AppState>>,
) -> Router<Arc<AppState>> {
    router
        .route(path, methods())
        .route(&format!("{path}/"), methods())
}

/// Resolve the API key to a user and hand it to handlers as [`Caller`].
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let key = extract_key(header).map_err(ApiError::AuthenticationRequired)?;

    let username = match state.storage.user_for_token(key)? {
        Some(username) => username,
        None => {
            tracing::debug!("rejected request with unknown API key");
            return Err(ApiError::AuthenticationRequired(INVALID_TOKEN));
        }
    };

    req.extensions_mut().insert(Caller { username });
    Ok(next.run(req).await)
}

/// Absolute URL of the current request, used to build pagination links.
pub struct RequestUrl(pub Url);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestUrl {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let uri = parts
            .extensions
            .get::<OriginalUri>()
            .map(|original| original.0.clone())
            .unwrap_or_else(|| parts.uri.clone());
        let path_and_query = uri
            .path_and_query()
            .map(|value| value.as_str())
            .unwrap_or("/");

        let base = match &state.settings.public_url {
            Some(public_url) => public_url.clone(),
            None => {
                let host = parts
                    .headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("localhost");
                format!("http://{host}")
            }
        };

        Url::parse(&format!("{base}{path_and_query}"))
            .map(RequestUrl)
            .map_err(|err| ApiError::Malformed(format!("Invalid request URL: {err}")))
    }
}

/// Ids are unsigned integers; anything else cannot name a record.
pub(crate) fn parse_id(raw: &str) -> Result<u64, ApiError> {
    raw.parse().map_err(|_| ApiError::NotFound)
}

#[derive(Serialize, ToSchema)]
pub struct ApiRoot {
    pub usage_type: String,
    pub usage: String,
}

async fn api_root(RequestUrl(url): RequestUrl) -> Result<Json<ApiRoot>, ApiError> {
    let collection = |name: &str| {
        url.join(&format!("/carbon_usage/{name}/"))
            .map(String::from)
            .map_err(|err| ApiError::Malformed(format!("Invalid request URL: {err}")))
    };
    Ok(Json(ApiRoot {
        usage_type: collection("usage_type")?,
        usage: collection("usage")?,
    }))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(docs::ApiDoc::openapi())
}
