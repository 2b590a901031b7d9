//! Axum JSON API exposing the opportunity discovery pipeline.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fedscout_core::{OpportunityQuery, SetAside, SortDir, SortKey};
use fedscout_store::PgStore;
use fedscout_sync::{DiscoveryConfig, DiscoveryRequest, DiscoveryService};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "fedscout-web";

#[derive(Clone)]
pub struct AppState {
    /// `None` when the upstream API credential is not configured; every
    /// discovery request then fails fast with 503.
    pub service: Option<Arc<DiscoveryService>>,
    /// Optional inbound bearer token; the session gate at the boundary.
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(service: Option<Arc<DiscoveryService>>, api_token: Option<String>) -> Self {
        Self { service, api_token }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesParams {
    sort: Option<String>,
    order: Option<String>,
    set_aside: Option<String>,
    min_value: Option<f64>,
    refresh: Option<String>,
    q: Option<String>,
    all: Option<String>,
}

impl OpportunitiesParams {
    fn to_request(&self) -> DiscoveryRequest {
        DiscoveryRequest {
            query: OpportunityQuery {
                set_aside: self
                    .set_aside
                    .as_deref()
                    .and_then(SetAside::from_filter_param),
                min_value: self.min_value,
                search: self.q.clone().filter(|q| !q.trim().is_empty()),
                sort: self
                    .sort
                    .as_deref()
                    .map(SortKey::from_param)
                    .unwrap_or_default(),
                dir: self
                    .order
                    .as_deref()
                    .map(SortDir::from_param)
                    .unwrap_or_default(),
            },
            force_refresh: flag_is_set(self.refresh.as_deref()),
            include_all: flag_is_set(self.all.as_deref()),
        }
    }
}

fn flag_is_set(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "True"))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Build the state from environment configuration and serve forever.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FEDSCOUT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = DiscoveryConfig::from_env();

    let service = if config.sam_api_key.is_some() {
        let client = config.listings_client()?;
        let store = Arc::new(PgStore::connect(&config.database_url).await?);
        store.migrate().await?;
        Some(Arc::new(DiscoveryService::new(
            Arc::new(client),
            store.clone(),
            store,
        )))
    } else {
        None
    };

    let state = AppState::new(service, std::env::var("FEDSCOUT_API_TOKEN").ok());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<OpportunitiesParams>,
) -> Response {
    if !authorized(&state, &headers) {
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
    }

    let Some(service) = &state.service else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "SAM_API_KEY is not configured; opportunity discovery is unavailable",
        );
    };

    match service.discover(params.to_request()).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            error!(error = %err, "opportunity discovery failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "opportunity discovery failed")
        }
    }
}

/// The session gate: requests must carry the configured bearer token before
/// any discovery work begins. No token configured means an open endpoint.
fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.api_token.as_deref() else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}
