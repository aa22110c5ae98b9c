use crate::api::auth::{master_auth, require_master, token_auth};
use crate::api::ApiState;
use crate::error::AppResult;
use crate::profile::NodeSpec;
use crate::provision::ProvisionRequest;
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Optional overrides for a client node
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub name: Option<String>,
    pub groups: Option<String>,
    /// Node public key PEM; a key pair is generated when absent
    pub public_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connection_config: String,
    pub address: String,
}

/// Provision a client node and return its profile as YAML
pub async fn connect(
    State(state): State<ApiState>,
    Query(query): Query<ConnectQuery>,
) -> AppResult<Json<ConnectResponse>> {
    let name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut spec = NodeSpec::client(&name);
    if let Some(groups) = query.groups {
        spec.groups = groups;
    }

    let node = state
        .provisioner
        .provision(ProvisionRequest {
            spec,
            public_key_pem: query.public_key.filter(|k| !k.trim().is_empty()),
            use_lighthouse: true,
        })
        .await?;

    Ok(Json(ConnectResponse {
        connection_config: node.profile.to_yaml()?,
        address: node.address,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub one_time_token: String,
}

/// Issue a one-time token
pub async fn issue_token(State(state): State<ApiState>) -> AppResult<Json<TokenResponse>> {
    let one_time_token = state.tokens.new_token().await?;
    Ok(Json(TokenResponse { one_time_token }))
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Create the API router
pub fn create_router(state: ApiState, cors_allow_origins: &[String]) -> Router {
    let provisioning = Router::new()
        .route("/connect", get(connect))
        .route_layer(from_fn_with_state(state.clone(), token_auth));

    let tokens = Router::new()
        .route("/token", get(issue_token))
        .route_layer(from_fn(require_master));

    Router::new()
        .route("/health", get(health))
        .merge(provisioning)
        .merge(tokens)
        .layer(from_fn_with_state(state.clone(), master_auth))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_allow_origins))
        .with_state(state)
}
